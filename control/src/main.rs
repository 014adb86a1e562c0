use anyhow::{Context, Result};
use control::apis::metrics::serve_metrics;
use control::apis::pod_watcher::{KubePodEventSource, WatchLoop};
use control::apis::pods::KubePodResolver;
use control::cache::{spawn_refresher, ConfigCache};
use control::cloud::tencent::TencentClbClient;
use control::cloud::LoadBalancerApi;
use control::config::ControllerConfig;
use control::error::SyncError;
use control::reconciler::Reconciler;
use control::rules::FileRuleSource;
use control::shutdown::create_shutdown_token;
use control::sync::SyncEngine;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// lbsync - pod driven load balancer backend sync
///
/// Watches pods cluster-wide and registers/deregisters their IPs on the
/// cloud load balancer rules declared in the rules document.
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes and cloud TLS clients)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env().context("Failed to load configuration")?;

    info!("🦀 lbsync starting");
    info!("   Rules: {}", config.rules_path.display());
    info!("   Region: {}", config.cloud.region);
    info!("   Cache TTL: {}s", config.cache_ttl_secs);

    let api: Arc<dyn LoadBalancerApi> = Arc::new(
        TencentClbClient::from_env(&config.cloud)
            .context("Failed to create tencent client")?,
    );
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Initial load is fatal: no degraded mode without a parsed rules document
    let rules = Arc::new(FileRuleSource::new(&config.rules_path));
    let cache = Arc::new(ConfigCache::new(rules, api.clone(), config.cache_ttl()));
    cache
        .force_refresh()
        .await
        .context("Failed to load config")?;

    let shutdown = create_shutdown_token();
    let mut tasks = vec![spawn_refresher(cache.clone(), shutdown.clone())];

    if let Some(addr) = &config.metrics_addr {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind metrics endpoint to {}", addr))?;
        tasks.push(tokio::spawn(serve_metrics(listener, shutdown.clone())));
    }

    let reconciler = Reconciler::new(
        Arc::new(KubePodResolver::new(client.clone())),
        SyncEngine::new(cache, api),
    );
    let watch = WatchLoop::new(
        Arc::new(KubePodEventSource::new(client, config.watch_timeout_secs)),
        Arc::new(reconciler),
        config.reconnect_delay(),
        config.max_stream_lifetime(),
    );

    info!("Starting pod controller...");
    let result = watch.run(shutdown.clone()).await;

    shutdown.cancel();
    for task in tasks {
        let _ = task.await;
    }

    match result {
        Ok(()) | Err(SyncError::Cancelled) => {
            info!("Pod controller stopped");
            Ok(())
        }
        Err(e) => Err(e).context("Controller error"),
    }
}
