use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{fmt, EnvFilter};

use atsrelay::clock::Clock;
use atsrelay::config::Config;
use atsrelay::events::SparkEvent;
use atsrelay::extension::{ExtensionRegistry, ExtensionServices};
use atsrelay::metrics::ServiceMetrics;
use atsrelay::service::{ServiceBinding, TimelineService};
use atsrelay::session::SessionTracker;
use atsrelay::timeline::client::HttpTimelineClient;

/// Relay that forwards Spark history events to a YARN Timeline Server.
///
/// Events are read from stdin as JSON lines and posted as batched timeline
/// entities until EOF or a termination signal.
#[derive(Parser)]
#[command(name = "atsrelay", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Application id to forward events for.
    #[arg(long)]
    app_id: Option<String>,

    /// Attempt id, when the application has one.
    #[arg(long)]
    attempt_id: Option<String>,

    /// User the application runs as.
    #[arg(long, default_value = "unknown")]
    user: String,

    /// Host framework version recorded in posted entities.
    #[arg(long, default_value = "unknown")]
    spark_version: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("atsrelay {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting atsrelay");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli).await })
}

async fn run(cfg: Config, cli: Cli) -> Result<()> {
    // Signal handling.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let metrics =
        Arc::new(ServiceMetrics::new(&cfg.health.addr).context("creating service metrics")?);
    metrics.start().await.context("starting metrics server")?;

    let client = HttpTimelineClient::new(&cfg.timeline).context("creating timeline client")?;
    let clock = Arc::new(Clock::system());

    let tracker = SessionTracker::new(
        Arc::clone(&clock),
        cfg.retention.sessions,
        cfg.retention.executions,
    );

    let service = TimelineService::new(
        cfg.timeline.clone(),
        cfg.acls.clone(),
        client,
        clock,
        Arc::clone(&metrics),
    );

    let binding = ServiceBinding {
        app_id: cli
            .app_id
            .context("--app-id is required to bind the service")?,
        attempt_id: cli.attempt_id,
        group_id: None,
        user: cli.user,
        spark_version: cli.spark_version,
    };

    // The stock binary ships no extensions; embedding processes register
    // factories here before starting.
    let registry = ExtensionRegistry::new();
    let mut extensions = ExtensionServices::new();
    extensions
        .start(&registry, &cfg.extensions, &binding)
        .context("starting extension services")?;

    service.start(binding).await.context("starting service")?;

    if !cfg.timeline.listen {
        tracing::info!("event listening disabled, waiting for shutdown signal");
        let _ = shutdown_rx.await;
        service.stop().await.context("stopping service")?;
        extensions.stop();
        metrics.stop().await?;
        return Ok(());
    }

    // Feed JSON-line events from stdin until EOF or signal.
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut rejected = 0u64;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,

            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }

                        match serde_json::from_str::<SparkEvent>(line) {
                            Ok(event) => {
                                // The tracker observes the same bus as the
                                // forwarding sink.
                                if let SparkEvent::JobStart {
                                    job_id,
                                    group_id: Some(group_id),
                                    ..
                                } = &event
                                {
                                    tracker.on_job_start(*job_id, group_id);
                                }
                                if matches!(event, SparkEvent::ApplicationEnd { .. }) {
                                    tracker.on_application_end();
                                }

                                if !service.process(event) {
                                    rejected += 1;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "unparseable event line");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!("event stream ended");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "reading event stream");
                        break;
                    }
                }
            }
        }
    }

    if rejected > 0 {
        tracing::warn!(rejected, "events arrived while the service was not accepting");
    }

    service.stop().await.context("stopping service")?;
    extensions.stop();
    metrics.stop().await?;

    tracing::info!("atsrelay stopped");

    Ok(())
}
