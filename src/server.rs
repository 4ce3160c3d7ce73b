use crate::idle_timeout::IdleTimeout;
use crate::pipeline::{AsyncStream, ConnectionInfo, ConnectionPipeline, Handoff};
use crate::policy::PolicySnapshot;
use crate::reload::PolicyHandle;
use crate::stats::{CountingStream, TrafficStats};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, ToSocketAddrs};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Consumer of classified connections (relay, SOCKS4, ...)
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    async fn handle(&self, handoff: Handoff) -> Result<()>;
}

/// Decrements the active connection gauge on every exit path
struct ActiveGuard(Arc<TrafficStats>);

impl ActiveGuard {
    fn new(stats: &Arc<TrafficStats>) -> Self {
        stats.connection_opened();
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.connection_closed();
    }
}

/// Run one accepted connection through the pipeline
///
/// Rate limiting happens before anything is read from the client. In
/// multiplexed mode the connection carries a mux session and every accepted
/// stream is admitted, classified and handed off on its own task. The read
/// timeout then applies to each stream; the session itself lives until mux
/// keepalive or the transport ends it.
pub async fn serve_connection<S>(
    stream: S,
    info: ConnectionInfo,
    policy: Arc<PolicySnapshot>,
    handler: Arc<dyn ProtocolHandler>,
    stats: Arc<TrafficStats>,
    multiplexed: bool,
) -> Result<()>
where
    S: AsyncStream + 'static,
{
    let _active = ActiveGuard::new(&stats);
    let pipeline = Arc::new(ConnectionPipeline::new(Arc::clone(&policy)));

    if let Err(e) = pipeline.admit(&info).await {
        stats.connection_rejected();
        debug!(error = %e, "Connection rejected");
        return Err(e.into());
    }

    let read_timeout = policy.read_timeout;

    if !multiplexed {
        let stream = CountingStream::new(IdleTimeout::new(stream, read_timeout), Arc::clone(&stats));
        let handoff = pipeline.classify(stream, info).await?;
        debug!(disposition = ?handoff.disposition, "Handing off connection");
        return handler.handle(handoff).await;
    }

    let session = pipeline
        .open_mux(CountingStream::new(stream, Arc::clone(&stats)))
        .await
        .context("mux session handshake failed")?;
    info!(version = session.config().version, "Mux session established");

    loop {
        let stream = match session.accept_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "Mux session ended");
                break;
            }
        };

        let info = info.with_stream(stream.id());
        let pipeline = Arc::clone(&pipeline);
        let handler = Arc::clone(&handler);
        let span = info_span!("stream", id = stream.id());

        tokio::spawn(
            async move {
                if let Err(e) = pipeline.admit(&info).await {
                    debug!(error = %e, "Stream rejected");
                    return;
                }
                let stream = IdleTimeout::new(stream, read_timeout);
                let handoff = match pipeline.classify(stream, info).await {
                    Ok(handoff) => handoff,
                    Err(e) => {
                        warn!(error = %e, "Stream classification failed");
                        return;
                    }
                };
                if let Err(e) = handler.handle(handoff).await {
                    debug!(error = %e, "Stream handler error");
                }
            }
            .instrument(span),
        );
    }

    Ok(())
}

/// TCP listener driving the ingress pipeline
pub struct Listener {
    listener: TcpListener,
    policy: Arc<PolicyHandle>,
    handler: Arc<dyn ProtocolHandler>,
    stats: Arc<TrafficStats>,
    multiplexed: bool,
}

impl Listener {
    pub async fn bind(
        addr: impl ToSocketAddrs,
        policy: Arc<PolicyHandle>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .context("failed to bind listener")?;
        Ok(Self::from_tcp(listener, policy, handler))
    }

    pub fn from_tcp(
        listener: TcpListener,
        policy: Arc<PolicyHandle>,
        handler: Arc<dyn ProtocolHandler>,
    ) -> Self {
        Self {
            listener,
            policy,
            handler,
            stats: Arc::new(TrafficStats::new()),
            multiplexed: false,
        }
    }

    /// Expect a mux session on every connection
    pub fn multiplexed(mut self, multiplexed: bool) -> Self {
        self.multiplexed = multiplexed;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> &Arc<TrafficStats> {
        &self.stats
    }

    /// Accept connections until `shutdown` resolves
    ///
    /// In-flight connections keep running on their own tasks.
    pub async fn serve(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let local = self.listener.local_addr().ok();
        info!(addr = ?local, multiplexed = self.multiplexed, "Listening");

        let observer = TrafficStats::start_observer(
            Arc::clone(&self.stats),
            self.policy.current().observe_period,
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let policy = self.policy.current();
                            if policy.no_delay {
                                if let Err(e) = stream.set_nodelay(true) {
                                    warn!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                                }
                            }

                            let info = ConnectionInfo::new(Some(peer), stream.local_addr().ok());
                            let handler = Arc::clone(&self.handler);
                            let stats = Arc::clone(&self.stats);
                            let multiplexed = self.multiplexed;
                            let span = info_span!("conn", peer = %peer);

                            tokio::spawn(
                                async move {
                                    debug!("Accepted connection");
                                    if let Err(e) = serve_connection(
                                        stream, info, policy, handler, stats, multiplexed,
                                    )
                                    .await
                                    {
                                        debug!(error = %e, "Connection closed with error");
                                    }
                                }
                                .instrument(span),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    break;
                }
            }
        }

        if let Some(observer) = observer {
            observer.abort();
        }
        Ok(())
    }
}
