//! Scrape-time metrics aggregation proxy.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use metric_gate::{GateConfig, HttpServer, Scraper, analyze_file};
use metric_gate_common::init_tracing;

/// Aggregate Prometheus metrics at scrape time.
#[derive(Parser, Debug)]
#[command(name = "metric-gate")]
#[command(about = "Aggregate Prometheus metrics at scrape time")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Source URL to get metrics from (overrides config).
    #[arg(short, long)]
    upstream: Option<String>,

    /// Scrape every address the upstream hostname resolves to.
    #[arg(long)]
    resolve: bool,

    /// Per-target fetch timeout in seconds (overrides config).
    #[arg(long)]
    timeout: Option<u64>,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Label to remove by aggregation. Repeatable.
    #[arg(short, long = "label")]
    labels: Vec<String>,

    /// Drop metrics whose name matches this regex.
    #[arg(short, long)]
    filter: Option<String>,

    /// Analyze a metrics file, print the report and exit.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut GateConfig) {
        if let Some(upstream) = &self.upstream {
            config.upstream.url = upstream.clone();
        }
        if self.resolve {
            config.upstream.resolve = true;
        }
        if let Some(timeout) = self.timeout {
            config.upstream.timeout_secs = timeout;
        }
        if let Some(listen) = &self.listen {
            config.server.listen = listen.clone();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(filter) = &self.filter {
            config.drop_metrics_matching(filter);
        }
        if !self.labels.is_empty() {
            config.drop_labels(&self.labels);
        }
    }
}

#[cfg(unix)]
async fn terminate() -> std::io::Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    sigterm.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> std::io::Result<()> {
    std::future::pending::<()>().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.file {
        let report = analyze_file(path)?;
        print!("{}", report);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => GateConfig::load_from_file(path)?,
        None => GateConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;

    info!("Starting metric-gate");

    let listen_addr: SocketAddr = config
        .server
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let scraper = Arc::new(Scraper::from_config(&config)?);
    info!(
        upstream = %scraper.upstream(),
        resolve = config.upstream.resolve,
        subsets = config.relabel.len(),
        "Scraper ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_server = HttpServer::new(scraper, listen_addr);
    let mut http_task = tokio::spawn(async move { http_server.run(shutdown_rx).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        result = terminate() => {
            result?;
            info!("Received SIGTERM, shutting down...");
        }
        joined = &mut http_task => {
            // The server only returns on its own when it failed to start.
            return match joined {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("HTTP server task failed: {}", e)),
            };
        }
    }

    shutdown_tx.send(true)?;

    match tokio::time::timeout(Duration::from_secs(5), http_task).await {
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => error!("HTTP server did not stop in time"),
        Ok(Ok(Ok(()))) => {}
    }

    info!("metric-gate stopped");
    Ok(())
}
