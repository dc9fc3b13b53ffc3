//! Client lifecycle
//!
//! [`TunnelClient`] owns everything one tunnel needs: the configuration,
//! the session id chosen at construction, and the sequence counter shared
//! by every local connection. `start()` binds the local listener and
//! returns a [`TunnelHandle`]; `stop()` consumes the handle, cancels all
//! tasks, and waits for the listener to wind down. There is no process
//! state: dropping the handle's token stops the tunnel, and a second
//! client is just a second value.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::exchange::DnsExchange;
use super::resolver::effective_resolver;
use super::socks::prepare_stream;
use super::tunnel::ClientTunnel;
use crate::codec::SessionId;
use crate::config::ClientConfig;
use crate::error::{TunnelError, TunnelResult};

/// An owned, not-yet-started tunnel client.
pub struct TunnelClient {
    config: ClientConfig,
    session: SessionId,
}

impl TunnelClient {
    /// Create a client for `config`, drawing the session id that will
    /// name this tunnel for its whole lifetime.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Config`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> TunnelResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            session: SessionId::random(),
        })
    }

    /// The session id this client tunnels under.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// Bind the local SOCKS5 listener and start accepting connections.
    ///
    /// Consumes the client; the returned handle is the only way to reach
    /// the running tunnel.
    ///
    /// # Errors
    ///
    /// Returns an error if the resolver cannot be determined or the local
    /// port cannot be bound.
    pub async fn start(self) -> TunnelResult<TunnelHandle> {
        let resolver = effective_resolver(&self.config.dns_server)?;
        let listen = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.socks_port));
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| TunnelError::network_io(format!("failed to bind {listen}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TunnelError::network_io("failed to get local address", e))?;

        info!(
            addr = %local_addr,
            resolver = %resolver,
            zone = %self.config.zone,
            session = %self.session,
            "tunnel client listening"
        );

        let cancel = CancellationToken::new();
        let exchange = Arc::new(DnsExchange::new(resolver, self.config.query_timeout()));
        let seq = Arc::new(parking_lot::Mutex::new(0_u16));

        let accept = {
            let cancel = cancel.clone();
            let zone: Arc<str> = Arc::from(self.config.zone.as_str());
            let poll_interval = self.config.poll_interval();
            let session = self.session;
            tokio::spawn(async move {
                accept_loop(listener, exchange, zone, session, seq, poll_interval, cancel).await;
            })
        };

        Ok(TunnelHandle {
            session: self.session,
            local_addr,
            cancel,
            accept,
        })
    }
}

/// Handle to a running tunnel client.
///
/// Carries the cancellation signal covering the listener and every
/// connection's upstream and downstream task.
pub struct TunnelHandle {
    session: SessionId,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept: tokio::task::JoinHandle<()>,
}

impl TunnelHandle {
    /// The bound local SOCKS5 address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The session id of the running tunnel.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session
    }

    /// A clone of the tunnel-wide cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the tunnel: cancel every task and wait for the listener.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.accept.await;
        info!(session = %self.session, "tunnel client stopped");
    }
}

#[allow(clippy::too_many_arguments)]
async fn accept_loop(
    listener: TcpListener,
    exchange: Arc<DnsExchange>,
    zone: Arc<str>,
    session: SessionId,
    seq: Arc<parking_lot::Mutex<u16>>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("listener cancelled");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted local connection");
                        let tunnel = ClientTunnel::new(
                            Arc::clone(&exchange),
                            Arc::clone(&zone),
                            session,
                            Arc::clone(&seq),
                            poll_interval,
                            cancel.child_token(),
                        );
                        tokio::spawn(handle_connection(stream, tunnel));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, tunnel: ClientTunnel) {
    match prepare_stream(&mut stream).await {
        Ok(initial) => tunnel.run(stream, initial).await,
        Err(e) => debug!(error = %e, "connection setup failed"),
    }
}
