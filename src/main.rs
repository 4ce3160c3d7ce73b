use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_ingress::{
    ConfigStore, GlobalConfig, Handoff, Listener, ListenerConfig, PolicyHandle, ProtocolHandler,
    Registry,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Relays every handed-off stream to an upstream picked by affinity
struct ForwardHandler {
    upstreams: Vec<String>,
}

#[async_trait]
impl ProtocolHandler for ForwardHandler {
    async fn handle(&self, mut handoff: Handoff) -> Result<()> {
        let upstream = handoff
            .select_upstream(&self.upstreams)
            .context("no upstream configured (RELAY_UPSTREAMS)")?
            .clone();

        let mut conn = TcpStream::connect(&upstream)
            .await
            .with_context(|| format!("failed to connect to {}", upstream))?;
        if handoff.policy.no_delay {
            conn.set_nodelay(true)?;
        }

        debug!(upstream = %upstream, host = ?handoff.host(), "Forwarding");
        let (sent, received) = tokio::io::copy_bidirectional(&mut handoff.stream, &mut conn).await?;
        debug!(upstream = %upstream, sent, received, "Forwarding finished");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    info!(version = relay_ingress::VERSION, "Starting relay ingress");

    let config = ListenerConfig::from_env()?;

    let store = match &config.config_file {
        Some(path) => ConfigStore::open(path)?,
        None => ConfigStore::new(GlobalConfig::default()),
    };
    let registry = Arc::new(Registry::from_config(&store.snapshot().config)?);

    let options = config.load_options()?;
    let policy = Arc::new(PolicyHandle::resolve(&options, &registry)?);
    info!("Policy loaded; reload via SIGHUP");

    let handler = Arc::new(ForwardHandler {
        upstreams: config.upstreams.clone(),
    });
    let listener = Listener::bind(config.bind_addr(), Arc::clone(&policy), handler)
        .await?
        .multiplexed(config.multiplexed);

    tokio::spawn(reload_signal_handler(config, policy, registry));

    listener.serve(shutdown_signal()).await
}

/// Policy reload signal handler (SIGHUP)
async fn reload_signal_handler(
    config: ListenerConfig,
    policy: Arc<PolicyHandle>,
    registry: Arc<Registry>,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sighup = match signal(SignalKind::hangup()) {
            Ok(sighup) => sighup,
            Err(e) => {
                error!(error = %e, "Failed to install SIGHUP handler");
                return;
            }
        };

        while sighup.recv().await.is_some() {
            info!("SIGHUP received - reloading policy");

            let options = match config.load_options() {
                Ok(options) => options,
                Err(e) => {
                    error!(error = %e, "Failed to read policy, keeping current policy");
                    continue;
                }
            };
            if let Err(e) = policy.reload(options, Arc::clone(&registry)).await {
                error!(error = %e, "Policy reload failed");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (config, policy, registry);
        info!("Policy reload via SIGHUP not supported on this platform");
        std::future::pending::<()>().await;
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
