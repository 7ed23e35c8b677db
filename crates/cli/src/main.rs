use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use steward_core::{Reconcile, ReconcileError, ResourceKey, ResourceSnapshot};
use steward_runtime::{Controller, ControllerConfig};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stewardd", version, about = "Level-triggered reconciliation daemon")]
struct Cli {
    /// GVK key to watch, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(default_value = "v1/Pod")]
    gvk: String,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns")]
    namespace: Option<String>,

    /// Parallel reconcile workers (per-key work stays serialized)
    #[arg(long = "workers", default_value_t = 1)]
    workers: usize,

    /// Abort startup if the cache has not synced within this many seconds
    #[arg(long = "sync-timeout-secs", default_value_t = 60)]
    sync_timeout_secs: u64,

    /// List served resources (incl. CRDs) and exit
    #[arg(long = "discover", action = ArgAction::SetTrue)]
    discover: bool,
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

/// Demonstration action: logs what it sees. Trivially idempotent, which is
/// exactly what redundant level-triggered notifications require.
struct EchoReconciler;

#[async_trait::async_trait]
impl Reconcile for EchoReconciler {
    async fn reconcile(
        &self,
        key: &ResourceKey,
        obj: Option<Arc<ResourceSnapshot>>,
    ) -> Result<(), ReconcileError> {
        match obj {
            Some(snap) => info!(%key, rv = ?snap.resource_version, "resource observed"),
            None => info!(%key, "resource deleted"),
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};
        match unix_signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    if cli.discover {
        let resources = steward_kubefeed::discover().await?;
        for r in resources {
            let scope = if r.namespaced { "namespaced" } else { "cluster" };
            println!("{} • {}", r.gvk_key(), scope);
        }
        return Ok(());
    }

    let cfg = ControllerConfig {
        workers: cli.workers,
        sync_timeout: Duration::from_secs(cli.sync_timeout_secs),
        ..Default::default()
    };
    let (controller, feed_tx) = Controller::new(Arc::new(EchoReconciler), cfg);

    let watcher = tokio::spawn({
        let gvk = cli.gvk.clone();
        let ns = cli.namespace.clone();
        async move {
            if let Err(e) = steward_kubefeed::start_watcher(&gvk, ns.as_deref(), feed_tx).await {
                error!(error = ?e, "watcher failed");
            }
            // feed_tx drops here; the ingest loop flushes and exits.
        }
    });

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received; draining");
        let _ = stop_tx.send(true);
    });

    info!(gvk = %cli.gvk, ns = ?cli.namespace, workers = cli.workers, "starting controller");
    let res = controller.run(stop_rx).await;
    watcher.abort();
    res.map_err(anyhow::Error::from)
}
