//! UDP tunnel server
//!
//! Binds the authoritative UDP socket, receives queries, and hands each
//! one to [`TunnelHandler`] on its own task. A single background reaper
//! scans the session table; shutdown stops the receive loop, aborts the
//! reaper, and evicts every session.
//!
//! ```text
//! UDP socket (default :53)
//!     |
//!     v
//! recv_from()
//!     |
//!     v  (one task per query)
//! TunnelHandler::handle_query()
//!     |
//!     v
//! send_to()
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, error, info, trace, warn};

use super::dial::{TcpDialer, UpstreamDialer};
use super::handler::TunnelHandler;
use super::session::{spawn_reaper, SessionTable};
use crate::config::ServerConfig;
use crate::error::{TunnelError, TunnelResult};

/// Maximum DNS message size accepted over UDP.
pub const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// Statistics for the UDP receive/send loop.
#[derive(Debug, Default)]
pub struct UdpServerStats {
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_dropped: AtomicU64,
}

impl UdpServerStats {
    /// Total packets received.
    #[must_use]
    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    /// Total replies sent.
    #[must_use]
    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    /// Packets that produced no reply or whose reply failed to send.
    #[must_use]
    pub fn packets_dropped(&self) -> u64 {
        self.packets_dropped.load(Ordering::Relaxed)
    }
}

/// The authoritative UDP endpoint of the tunnel.
pub struct UdpTunnelServer {
    socket: Arc<UdpSocket>,
    handler: Arc<TunnelHandler>,
    sessions: Arc<SessionTable>,
    stats: Arc<UdpServerStats>,
    shutdown: Arc<AtomicBool>,
    reaper: tokio::task::JoinHandle<()>,
    local_addr: SocketAddr,
}

impl UdpTunnelServer {
    /// Bind the server described by `config`, dialing upstream over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the socket
    /// cannot be bound.
    pub async fn bind(config: &ServerConfig) -> TunnelResult<Self> {
        config.validate()?;
        let dialer: Arc<dyn UpstreamDialer> = Arc::new(TcpDialer::new(config.target()));
        Self::bind_with_dialer(config, dialer).await
    }

    /// Bind with a caller-supplied dialer (tests substitute in-memory
    /// streams for the upstream target).
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or the socket
    /// cannot be bound.
    pub async fn bind_with_dialer(
        config: &ServerConfig,
        dialer: Arc<dyn UpstreamDialer>,
    ) -> TunnelResult<Self> {
        let addr = config.listen_addr()?;
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            TunnelError::network_io(format!("failed to bind UDP socket to {addr}"), e)
        })?;
        Self::from_socket(socket, config, dialer)
    }

    /// Create a server from an existing socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket's local address cannot be read.
    pub fn from_socket(
        socket: UdpSocket,
        config: &ServerConfig,
        dialer: Arc<dyn UpstreamDialer>,
    ) -> TunnelResult<Self> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| TunnelError::network_io("failed to get local address", e))?;

        let sessions = Arc::new(SessionTable::new(dialer, config.session_timeout()));
        let handler = Arc::new(TunnelHandler::new(&config.zone, Arc::clone(&sessions)));
        let reaper = spawn_reaper(Arc::clone(&sessions), config.reaper_interval());

        info!(addr = %local_addr, zone = %config.zone, "tunnel server bound");

        Ok(Self {
            socket: Arc::new(socket),
            handler,
            sessions,
            stats: Arc::new(UdpServerStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
            reaper,
            local_addr,
        })
    }

    /// The address this server is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive-loop statistics.
    #[must_use]
    pub fn stats(&self) -> &UdpServerStats {
        &self.stats
    }

    /// Query-pipeline statistics.
    #[must_use]
    pub fn handler_stats(&self) -> &super::handler::HandlerStats {
        self.handler.stats()
    }

    /// The session table (shared with the reaper).
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    /// Whether shutdown has been signaled.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Signal the receive loop to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run until shutdown is signaled or a fatal socket error occurs.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop; transient receive
    /// failures are logged and skipped.
    pub async fn run(&self) -> TunnelResult<()> {
        info!(addr = %self.local_addr, "tunnel server starting");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if let Err(e) = self.handle_one_packet().await {
                if e.is_fatal() {
                    error!(error = %e, "fatal socket error, shutting down");
                    self.teardown().await;
                    return Err(e);
                }
                debug!(error = %e, "transient receive error");
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Run until `shutdown_rx` fires or a fatal socket error occurs.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the loop.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> TunnelResult<()> {
        info!(addr = %self.local_addr, "tunnel server starting");

        loop {
            tokio::select! {
                result = self.handle_one_packet() => {
                    if let Err(e) = result {
                        if e.is_fatal() {
                            error!(error = %e, "fatal socket error, shutting down");
                            self.teardown().await;
                            return Err(e);
                        }
                        debug!(error = %e, "transient receive error");
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("shutdown signal received");
                    self.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Receive one datagram and spawn its handling task.
    async fn handle_one_packet(&self) -> TunnelResult<()> {
        let mut buf = vec![0_u8; MAX_UDP_MESSAGE_SIZE];
        let (len, src) = self
            .socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| TunnelError::network_io("UDP recv_from failed", e))?;
        buf.truncate(len);

        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        trace!(src = %src, len, "received datagram");

        let socket = Arc::clone(&self.socket);
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            match handler.handle_query(src, &buf).await {
                Some(reply) => match socket.send_to(&reply, src).await {
                    Ok(sent) => {
                        stats.packets_sent.fetch_add(1, Ordering::Relaxed);
                        trace!(dst = %src, len = sent, "sent reply");
                    }
                    Err(e) => {
                        stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(dst = %src, error = %e, "failed to send reply");
                    }
                },
                None => {
                    stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        });

        Ok(())
    }

    async fn teardown(&self) {
        self.reaper.abort();
        self.sessions.clear().await;
        info!(addr = %self.local_addr, "tunnel server stopped");
    }
}

impl Drop for UdpTunnelServer {
    fn drop(&mut self) {
        // A server dropped without running leaves no reaper behind.
        self.reaper.abort();
    }
}
