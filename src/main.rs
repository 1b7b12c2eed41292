//! entrypoint for anyproxy

use anyproxy::config::{CaSubject, ListenerKind, ProxyConfig};
use anyproxy::error::ErrorWithExitCode;
use anyproxy::{ProxyLifecycle, ProxyStatus};
use clap::Parser;
use rama::error::BoxError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

mod trace {
    pub use anyproxy::trace::init_tracing;
}

#[derive(Debug, Parser)]
#[command(name = "anyproxy")]
#[command(bin_name = "anyproxy")]
#[command(version, about = "intercepting HTTP/HTTPS/WebSocket forward proxy")]
struct Cli {
    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Whether the outer listener terminates TLS itself.
    #[arg(long, value_enum, default_value = "http")]
    listener: CliListenerKind,

    /// Hostname for the proxy's own leaf certificate; required with `--listener https`.
    #[arg(long)]
    hostname: Option<String>,

    /// Base directory for the persisted root CA. Defaults to `$HOME/.anyproxy/certificates`.
    #[arg(long)]
    ca_dir: Option<PathBuf>,

    /// Intercept every CONNECT regardless of the Rule hook's decision.
    #[arg(long)]
    force_proxy_https: bool,

    /// Additional `host:port` values treated as the proxy's own address.
    #[arg(long)]
    local_host: Vec<String>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliListenerKind {
    Http,
    Https,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    trace::init_tracing();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<ErrorWithExitCode>() {
                eprintln!("exit with error ({}): {err}", err.exit_code());
                std::process::exit(err.exit_code());
            } else {
                eprintln!("exit with error: {err}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(cli: Cli) -> Result<(), BoxError> {
    let config = ProxyConfig {
        bind: cli.bind,
        kind: match cli.listener {
            CliListenerKind::Http => ListenerKind::Http,
            CliListenerKind::Https => ListenerKind::Https,
        },
        hostname: cli.hostname,
        ca_dir: cli.ca_dir.unwrap_or_else(ProxyConfig::default_ca_dir),
        ca_subject: CaSubject::default(),
        local_hosts: cli.local_host,
        force_proxy_https: cli.force_proxy_https,
        mitm_idle_timeout: Duration::from_secs(60),
        upstream_idle_timeout: Duration::from_secs(120),
        recorder_required: false,
    };

    let mut lifecycle = ProxyLifecycle::new(config);
    let shutdown = rama::graceful::Shutdown::default();

    if let Err(err) = lifecycle.start(&shutdown).await {
        return Err(Box::new(ErrorWithExitCode::new(1, err)));
    }

    shutdown
        .shutdown_with_limit(Duration::from_secs(30))
        .await
        .map_err(|err| Box::new(ErrorWithExitCode::new(2, err)) as BoxError)?;

    if lifecycle.status() == ProxyStatus::Ready {
        lifecycle
            .close()
            .map_err(|err| Box::new(ErrorWithExitCode::new(2, err)) as BoxError)?;
    }

    Ok(())
}
