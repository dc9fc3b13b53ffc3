//! Authoritative server endpoint
//!
//! The server answers every AAAA query in its zone as a tunnel frame: the
//! question name carries upstream bytes, the answer carries downstream
//! bytes. Each session owns one TCP connection to the configured upstream
//! target, created lazily on first use and destroyed by the reaper once
//! idle or broken.
//!
//! - [`udp`]: socket loop, per-query task spawn, shutdown
//! - [`handler`]: the per-query pipeline and RCODE mapping
//! - [`session`]: session table, locking discipline, reaper
//! - [`dial`]: the upstream connection seam

pub mod dial;
pub mod handler;
pub mod session;
pub mod udp;

pub use dial::{BoxedUpstream, TcpDialer, UpstreamDialer, UpstreamIo, CONNECT_TIMEOUT};
pub use handler::{HandlerStats, HandlerStatsSnapshot, TunnelHandler, READ_DEADLINE};
pub use session::{spawn_reaper, Session, SessionIo, SessionTable, SessionTableStats};
pub use udp::{UdpServerStats, UdpTunnelServer, MAX_UDP_MESSAGE_SIZE};
