//! dnspipe-server: authoritative DNS endpoint of the tunnel
//!
//! # Usage
//!
//! ```bash
//! # Answer for tunnel.example.com., forwarding sessions to 10.0.0.1:5222
//! dnspipe-server --zone tunnel.example.com. --target-host 10.0.0.1 --target-port 5222
//!
//! # Bind a non-default port
//! dnspipe-server -c /etc/dnspipe/server.json --listen :5353
//! ```

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::signal;
use tracing::info;

use dnspipe::config::ServerConfig;
use dnspipe::server::UdpTunnelServer;

/// Command-line arguments
struct Args {
    /// Optional configuration file path
    config_path: Option<PathBuf>,
    /// Listen address override
    listen: Option<String>,
    /// Zone override
    zone: Option<String>,
    /// Upstream target host override
    target_host: Option<String>,
    /// Upstream target port override
    target_port: Option<u16>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mut parsed = Self {
            config_path: None,
            listen: None,
            zone: None,
            target_host: None,
            target_port: None,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    parsed.config_path = args.next().map(PathBuf::from);
                }
                "-l" | "--listen" => {
                    parsed.listen = args.next();
                }
                "-z" | "--zone" => {
                    parsed.zone = args.next();
                }
                "--target-host" => {
                    parsed.target_host = args.next();
                }
                "--target-port" => {
                    let value = args.next().context("--target-port needs a value")?;
                    parsed.target_port =
                        Some(value.parse().context("--target-port must be a port number")?);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("dnspipe-server v{}", dnspipe::VERSION);
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
        r#"dnspipe-server v{}

Authoritative DNS endpoint of the dnspipe tunnel. Every AAAA query in the
zone is a tunnel frame; each session opens one TCP connection to the
configured upstream target.

USAGE:
    dnspipe-server [OPTIONS]

OPTIONS:
    -c, --config <PATH>      JSON configuration file
    -l, --listen <ADDR>      UDP listen address [default: :53]
    -z, --zone <ZONE>        Authoritative zone, fully qualified (trailing '.')
    --target-host <HOST>     Upstream target host
    --target-port <PORT>     Upstream target port
    -h, --help               Print help information
    -v, --version            Print version information

ENVIRONMENT:
    DNSPIPE_LISTEN_ADDR      Override listen address
    DNSPIPE_ZONE             Override zone
    DNSPIPE_TARGET_HOST      Override target host
    DNSPIPE_TARGET_PORT      Override target port
    DNSPIPE_LOG_LEVEL        Override log level (trace, debug, info, warn, error)
"#,
        dnspipe::VERSION
    );
}

/// Build the effective configuration from file, flags, and environment.
fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = match &args.config_path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => {
            let zone = args.zone.clone().unwrap_or_default();
            let host = args.target_host.clone().unwrap_or_default();
            let port = args.target_port.unwrap_or(0);
            ServerConfig::new(zone, host, port)
        }
    };

    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if let Some(zone) = &args.zone {
        config.zone.clone_from(zone);
    }
    if let Some(host) = &args.target_host {
        config.target_host.clone_from(host);
    }
    if let Some(port) = args.target_port {
        config.target_port = port;
    }

    config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

/// Initialize logging
///
/// `RUST_LOG` takes precedence over the configured level.
fn init_logging(config: &ServerConfig) {
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

    info!(
        zone = %config.zone,
        listen = %config.listen,
        target = %config.target(),
        "starting dnspipe server"
    );

    let server = UdpTunnelServer::bind(&config).await?;
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(());
        }
    });

    server.run_until_shutdown(shutdown_rx).await?;
    Ok(())
}
