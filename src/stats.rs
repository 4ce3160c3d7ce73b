//! Traffic counters and the periodic observer
//!
//! Counters are plain atomics updated on the data path. The observer task
//! wakes every `observePeriod`, logs the deltas since its last report and
//! goes back to sleep.

use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Listener-wide traffic totals
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    connections: AtomicU64,
    active: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of [`TrafficStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficReport {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub connections: u64,
    pub active: u64,
    pub rejected: u64,
}

impl TrafficStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Connection turned away by a rate limiter
    pub fn connection_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn report(&self) -> TrafficReport {
        TrafficReport {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic reporter; `None` when `period` is zero
    pub fn start_observer(stats: Arc<Self>, period: Duration) -> Option<JoinHandle<()>> {
        if period.is_zero() {
            debug!("Traffic observer disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;

            let mut last = stats.report();
            loop {
                tick.tick().await;
                let now = stats.report();
                info!(
                    bytes_in = now.bytes_in - last.bytes_in,
                    bytes_out = now.bytes_out - last.bytes_out,
                    connections = now.connections - last.connections,
                    rejected = now.rejected - last.rejected,
                    active = now.active,
                    "Traffic report"
                );
                last = now;
            }
        }))
    }
}

pin_project! {
    /// Stream wrapper that adds transferred bytes to a [`TrafficStats`]
    ///
    /// Reads count as inbound, writes as outbound.
    pub struct CountingStream<S> {
        #[pin]
        inner: S,
        stats: Arc<TrafficStats>,
    }
}

impl<S> CountingStream<S> {
    pub fn new(inner: S, stats: Arc<TrafficStats>) -> Self {
        Self { inner, stats }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead> AsyncRead for CountingStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        let poll = this.inner.poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = (buf.filled().len() - before) as u64;
            this.stats.bytes_in.fetch_add(n, Ordering::Relaxed);
        }
        poll
    }
}

impl<S: AsyncWrite> AsyncWrite for CountingStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let poll = this.inner.poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            this.stats.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_counting_stream() {
        let stats = Arc::new(TrafficStats::new());
        let (client, server) = tokio::io::duplex(64);
        let mut counted = CountingStream::new(server, Arc::clone(&stats));
        let mut client = client;

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        counted.read_exact(&mut buf).await.unwrap();
        counted.write_all(b"hi").await.unwrap();

        let report = stats.report();
        assert_eq!(report.bytes_in, 5);
        assert_eq!(report.bytes_out, 2);
    }

    #[test]
    fn test_connection_counters() {
        let stats = TrafficStats::new();
        stats.connection_opened();
        stats.connection_opened();
        stats.connection_closed();
        stats.connection_rejected();

        let report = stats.report();
        assert_eq!(report.connections, 2);
        assert_eq!(report.active, 1);
        assert_eq!(report.rejected, 1);
    }

    #[tokio::test]
    async fn test_observer_disabled_for_zero_period() {
        let stats = Arc::new(TrafficStats::new());
        assert!(TrafficStats::start_observer(stats, Duration::ZERO).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_runs_until_aborted() {
        let stats = Arc::new(TrafficStats::new());
        let handle = TrafficStats::start_observer(Arc::clone(&stats), Duration::from_secs(5))
            .unwrap();

        stats.connection_opened();
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!handle.is_finished());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
    }
}
