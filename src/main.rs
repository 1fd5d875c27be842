use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use tapwire::capture::CapturedRequest;
use tapwire::{config, logging, CertificateAuthority, Config, Server};

#[derive(Parser, Debug)]
#[command(name = "tapwire")]
#[command(about = "HTTP/HTTPS proxy that records the traffic passing through it", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to configuration file (TOML/JSON/YAML)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(short, long, value_name = "ADDR", global = true)]
    listen: Option<String>,

    /// Decrypt and record HTTPS traffic
    #[arg(short, long, global = true)]
    intercept: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Run the proxy (default)
    Run,
    /// Write the CA certificate so clients can be told to trust it
    ExportCa {
        #[arg(short, long, value_name = "PATH")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config = config.with_listen_addr(listen);
    }
    if args.intercept {
        config = config.with_intercept_https(true);
    }
    if args.verbose {
        config = config.with_verbose(true);
    }

    logging::init(config.verbose);

    match args.command.unwrap_or(Command::Run) {
        Command::ExportCa { out } => export_ca(&config, out),
        Command::Run => run(config).await,
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let server = Server::new(config).context("Failed to initialise proxy")?;

    if let Some(ca) = server.certificate_authority() {
        info!(
            ca_cert = %server.config().ca_cert_path.display(),
            cached_hosts = ca.cached_hosts(),
            "HTTPS interception enabled; clients must trust the CA certificate"
        );
    }

    let handle = server.add_listener(Arc::new(|capture: Arc<CapturedRequest>| {
        info!(
            method = %capture.method,
            url = %capture.url,
            status = capture.status_code,
            duration_ms = capture.duration.as_millis() as u64,
            error = capture.error.as_deref().unwrap_or(""),
            "Captured"
        );
    }));

    let cancel = CancellationToken::new();
    let addr = server
        .start(cancel.clone())
        .await
        .context("Failed to start proxy")?;
    info!("Proxy listening on {addr}");

    shutdown_signal().await;
    cancel.cancel();
    server.stop().await;
    server.remove_listener(handle);

    let stats = server.stats().await;
    info!(captured = stats.total_count, "Shutdown complete");
    Ok(())
}

fn export_ca(config: &Config, out: PathBuf) -> anyhow::Result<()> {
    let ca = CertificateAuthority::load_or_generate(
        &config.ca_cert_path,
        &config.ca_key_path,
        config.auto_generate_ca,
    )
    .context("Failed to load certificate authority")?;
    ca.export_ca_cert(&out)
        .with_context(|| format!("Failed to write {}", out.display()))?;
    info!("CA certificate written to {}", out.display());
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
