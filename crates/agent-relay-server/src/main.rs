use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tonic::transport::Server;
use tonic_reflection::server::Builder as ReflectionBuilder;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agent_relay_server::api::{RelayApi, TracingErrorTracker};
use agent_relay_server::config::Config;
use agent_relay_server::gitlab::GitLabClient;
use agent_relay_server::proto::agent_relay_server::AgentRelayServer;
use agent_relay_server::service::AgentRelayServiceImpl;
use agent_relay_server::snapshot::SnapshotTreeFetcher;
use agent_relay_server::stream::StreamContext;
use agent_relay_server::usage::{UsageReporter, UsageTracker, GITOPS_SYNC_COUNT};
use agent_relay_server::FILE_DESCRIPTOR_SET;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    let settings = config.relay_settings();

    info!("Starting agent-relay-server");
    info!("  Metadata API: {}", config.gitlab_url);
    info!("  Snapshot root: {}", config.snapshot_root.display());
    info!("  Config poll period: {:?}", settings.agent_config_poll_period);
    info!("  GitOps poll period: {:?}", settings.gitops_poll_period);
    info!("  Max connection age: {:?}", settings.max_connection_age);

    // Backends
    let gitlab = Arc::new(GitLabClient::new(config.gitlab_url.clone()));
    let fetcher = Arc::new(SnapshotTreeFetcher::new(config.snapshot_root.clone()));

    let api = Arc::new(RelayApi::new(
        gitlab.clone(),
        Arc::new(TracingErrorTracker),
        config.agent_info_cache(),
        config.project_info_cache(),
    ));

    let usage = Arc::new(UsageTracker::new());
    let sync_count = usage.register_counter(GITOPS_SYNC_COUNT)?;
    let reporter = UsageReporter::new(
        usage,
        gitlab,
        api.clone(),
        config.usage_reporting_period(),
    );
    if config.usage_reporting_period().is_zero() {
        warn!("Usage reporting is disabled");
    }

    // Create shutdown signal
    let shutdown_rx = create_shutdown_signal();
    let shutdown_ctx = StreamContext::from_signal(shutdown_rx.clone());

    // Background loops: cache eviction and usage reporting
    let background = tokio::spawn({
        let api = api.clone();
        let ctx = shutdown_ctx.clone();
        async move {
            tokio::join!(api.run(&ctx), reporter.run(&ctx));
        }
    });

    // Create gRPC service
    let relay_service =
        AgentRelayServiceImpl::new(api, fetcher, settings, sync_count, shutdown_ctx);
    let relay_svc = AgentRelayServer::new(relay_service);

    // Create reflection service
    let reflection_svc = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    // Start server
    let addr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Listening on tcp://{}", addr);

    let mut server_shutdown = shutdown_rx;
    let shutdown_future = async move {
        let _ = server_shutdown.wait_for(|&v| v).await;
    };

    Server::builder()
        .add_service(reflection_svc)
        .add_service(relay_svc)
        .serve_with_shutdown(addr, shutdown_future)
        .await?;

    background.await?;
    info!("Server shutdown complete");
    Ok(())
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, initiating shutdown");
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, initiating shutdown");
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}
