//! Upstream dialer abstraction
//!
//! A session's upstream connection is only ever used for streaming reads,
//! streaming writes, and close, so it is modelled as a boxed async stream
//! behind a small dialer trait. Production uses [`TcpDialer`]; tests
//! substitute in-memory duplex streams.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{TunnelError, TunnelResult};

/// Default connect timeout for the upstream target.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// The capability set a session needs from its upstream connection.
pub trait UpstreamIo: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + std::fmt::Debug> UpstreamIo for T {}

/// An established upstream connection.
pub type BoxedUpstream = Box<dyn UpstreamIo>;

/// Dials the fixed upstream target a new session connects to.
#[async_trait]
pub trait UpstreamDialer: Send + Sync {
    /// Establish a fresh connection to the target.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Dial`] when the target is unreachable or the
    /// connect deadline expires.
    async fn dial(&self) -> TunnelResult<BoxedUpstream>;

    /// Human-readable target description for logging.
    fn target(&self) -> &str;
}

/// TCP dialer with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    target: String,
    connect_timeout: Duration,
}

impl TcpDialer {
    /// Create a dialer for `host:port` with the default connect timeout.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    /// Override the connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[async_trait]
impl UpstreamDialer for TcpDialer {
    async fn dial(&self) -> TunnelResult<BoxedUpstream> {
        match timeout(self.connect_timeout, TcpStream::connect(&self.target)).await {
            Ok(Ok(stream)) => {
                // Interactive payloads (TLS handshakes in 30-byte frames)
                // suffer badly under Nagle.
                let _ = stream.set_nodelay(true);
                Ok(Box::new(stream))
            }
            Ok(Err(e)) => Err(TunnelError::dial(&self.target, e)),
            Err(_) => Err(TunnelError::dial(
                &self.target,
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", self.connect_timeout),
                ),
            )),
        }
    }

    fn target(&self) -> &str {
        &self.target
    }
}
