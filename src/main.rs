use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docpacer::config::{DocpacerConfig, LoggingSettings};
use docpacer::document::Document;
use docpacer::transport::{DryRunTransport, HttpTransport, Transport};
use docpacer::Dispatcher;

#[derive(Parser, Debug)]
#[command(name = "docpacer", version, about = "Rate-limited document submission client")]
struct Cli {
    /// YAML configuration file; DOCPACER__* variables override it
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit JSON documents and wait until every one is delivered
    Submit {
        /// Bearer token sent with every document
        #[arg(long, env = "DOCPACER_CREDENTIAL")]
        credential: String,

        /// Send files as opaque JSON instead of validating the document model
        #[arg(long)]
        raw: bool,

        /// Log documents instead of sending them
        #[arg(long)]
        dry_run: bool,

        /// Fraction of dry-run sends answered with a failure status
        #[arg(long, default_value_t = 0.0)]
        failure_rate: f64,

        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Print the effective configuration
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = DocpacerConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting Docpacer");

    match cli.command {
        Command::CheckConfig => {
            config.dispatcher_config()?;
            config.transport.to_http_config()?;
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Submit {
            credential,
            raw,
            dry_run,
            failure_rate,
            files,
        } => {
            let transport: Arc<dyn Transport> = if dry_run {
                info!(failure_rate, "Dry run, nothing leaves this process");
                Arc::new(DryRunTransport::new(failure_rate, Duration::from_millis(20)))
            } else {
                let http = HttpTransport::new(config.transport.to_http_config()?)?;
                info!(url = http.url(), "Sending to remote service");
                Arc::new(http)
            };

            if raw {
                let payloads = read_files::<serde_json::Value>(&files)?;
                submit_all(&config, transport, payloads, &credential).await
            } else {
                let payloads = read_files::<Document>(&files)?;
                submit_all(&config, transport, payloads, &credential).await
            }
        }
    }
}

/// Initialize tracing from the logging section, letting `RUST_LOG` win.
fn init_tracing(logging: &LoggingSettings) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_files<P: serde::de::DeserializeOwned>(files: &[PathBuf]) -> anyhow::Result<Vec<P>> {
    files
        .iter()
        .map(|path| {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("parsing {}", path.display()))
        })
        .collect()
}

async fn submit_all<P>(
    config: &DocpacerConfig,
    transport: Arc<dyn Transport>,
    payloads: Vec<P>,
    credential: &str,
) -> anyhow::Result<()>
where
    P: serde::Serialize + Send + 'static,
{
    let dispatcher_config = config.dispatcher_config()?;
    info!(
        max_requests = dispatcher_config.rate_limit.max_requests(),
        window_ms = dispatcher_config.rate_limit.window().as_millis() as u64,
        documents = payloads.len(),
        "Configuration loaded"
    );

    let dispatcher = Dispatcher::new(dispatcher_config, transport)?;
    for payload in payloads {
        let id = dispatcher.submit(payload, credential);
        info!(item_id = %id, "Document queued");
    }

    tokio::select! {
        _ = dispatcher.wait_until_drained() => {
            let stats = dispatcher.stats();
            info!(
                delivered = stats.delivered,
                retried = stats.retried,
                dropped = stats.dropped_malformed,
                "All documents processed"
            );
        }
        _ = shutdown_signal() => {
            let stats = dispatcher.stats();
            warn!(
                queued = stats.queued,
                in_flight = stats.in_flight,
                "Interrupted before the queue drained"
            );
        }
    }

    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
