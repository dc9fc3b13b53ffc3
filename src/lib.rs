//! dnspipe: a bidirectional byte-stream tunnel over DNS
//!
//! A client exposes a local SOCKS5 endpoint; bytes entering it are
//! base-32-encoded into the question names of AAAA queries. The server is
//! the authoritative responder for one zone: every query it receives is a
//! tunnel frame, answered with downstream bytes packed 16-per-record into
//! AAAA addresses. Each session pairs a client-chosen id with one TCP
//! connection from the server to a fixed upstream target.
//!
//! # Architecture
//!
//! ```text
//! app ──▶ SOCKS5 ──▶ chunker ──▶ AAAA query ──▶ recursive ──▶ server ──▶ target
//!  ▲                                             resolver        │
//!  └────────── poll replies (AAAA answers) ◀─────────────────────┘
//! ```
//!
//! The tunnel offers no reliability or confidentiality of its own; the
//! payload (typically TLS) is expected to provide both.
//!
//! # Quick start
//!
//! ```no_run
//! use dnspipe::client::TunnelClient;
//! use dnspipe::config::ClientConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ClientConfig::new("tunnel.example.com.").with_socks_port(1080);
//! let handle = TunnelClient::new(config)?.start().await?;
//! // ... point applications at the SOCKS5 port ...
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`codec`]: question-name grammar, base-32 labels, answer blocks
//! - [`client`]: SOCKS5 front-end, tunnel loops, lifecycle handle
//! - [`server`]: UDP listener, query pipeline, session table, reaper
//! - [`config`]: configuration types with env overrides
//! - [`error`]: shared error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod server;

// Re-export commonly used types at the crate root
pub use client::{ClientTunnel, DnsExchange, TunnelClient, TunnelHandle};
pub use codec::{CodecError, QueryName, SessionId};
pub use config::{ClientConfig, LogConfig, ServerConfig};
pub use error::{TunnelError, TunnelResult};
pub use server::{SessionTable, TcpDialer, TunnelHandler, UdpTunnelServer, UpstreamDialer};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
