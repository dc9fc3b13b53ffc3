//! dnspipe-client: local SOCKS5 endpoint of the tunnel
//!
//! # Usage
//!
//! ```bash
//! # Tunnel through the system resolver
//! dnspipe-client --zone tunnel.example.com.
//!
//! # Pin the recursive resolver and port
//! dnspipe-client --zone tunnel.example.com. --dns 1.1.1.1:53 --port 9050
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::info;

use dnspipe::client::TunnelClient;
use dnspipe::config::ClientConfig;

/// Command-line arguments
struct Args {
    /// Optional configuration file path
    config_path: Option<PathBuf>,
    /// Recursive DNS server override
    dns_server: Option<String>,
    /// Zone override
    zone: Option<String>,
    /// SOCKS5 port override
    socks_port: Option<u16>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            dns_server: None,
            zone: None,
            socks_port: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = args.next().map(PathBuf::from);
                }
                "-d" | "--dns" => {
                    parsed.dns_server = args.next();
                }
                "-z" | "--zone" => {
                    parsed.zone = args.next();
                }
                "-p" | "--port" => {
                    let value = args.next().context("--port needs a value")?;
                    parsed.socks_port =
                        Some(value.parse().context("--port must be a port number")?);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("dnspipe-client v{}", dnspipe::VERSION);
                    std::process::exit(0);
                }
                other => {
                    bail!("unknown argument: {other}");
                }
            }
        }

        Ok(parsed)
    }
}

fn print_help() {
    println!(
        r#"dnspipe-client v{}

Local SOCKS5 endpoint of the dnspipe tunnel. Bytes entering the SOCKS5
port are carried to the tunnel server inside AAAA queries for the zone.

USAGE:
    dnspipe-client [OPTIONS]

OPTIONS:
    -c, --config <PATH>     JSON configuration file
    -d, --dns <ADDR>        Recursive DNS server (empty = system resolver)
    -z, --zone <ZONE>       Tunnel zone, fully qualified (trailing '.')
    -p, --port <PORT>       Local SOCKS5 port [default: 1080]
    -h, --help              Print help information
    -v, --version           Print version information

ENVIRONMENT:
    DNSPIPE_DNS_SERVER      Override recursive DNS server
    DNSPIPE_ZONE            Override zone
    DNSPIPE_SOCKS_PORT      Override SOCKS5 port
    DNSPIPE_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
"#,
        dnspipe::VERSION
    );
}

/// Build the effective configuration from file, flags, and environment.
fn build_config(args: &Args) -> Result<ClientConfig> {
    let mut config = match &args.config_path {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => ClientConfig::new(args.zone.clone().unwrap_or_default()),
    };

    if let Some(dns_server) = &args.dns_server {
        config.dns_server.clone_from(dns_server);
    }
    if let Some(zone) = &args.zone {
        config.zone.clone_from(zone);
    }
    if let Some(port) = args.socks_port {
        config.socks_port = port;
    }

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &ClientConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log.level.clone()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    let config = build_config(&args)?;
    init_logging(&config);

    let client = TunnelClient::new(config)?;
    let handle = client.start().await?;
    info!(
        addr = %handle.local_addr(),
        session = %handle.session_id(),
        "dnspipe client running, press Ctrl+C to stop"
    );

    signal::ctrl_c().await.context("waiting for interrupt")?;
    info!("interrupt received, stopping");
    handle.stop().await;
    Ok(())
}
