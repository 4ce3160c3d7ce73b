//! Idle timeout for connections and mux streams
//!
//! [`IdleTimeout`] fails pending reads and writes with `TimedOut` once the
//! stream has made no progress for the configured duration. Any successful
//! read or write resets the timer.

use pin_project_lite::pin_project;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{sleep, Instant, Sleep};

pin_project! {
    /// Stream wrapper enforcing an idle timeout
    #[derive(Debug)]
    pub struct IdleTimeout<S> {
        #[pin]
        inner: S,
        sleep: Pin<Box<Sleep>>,
        timeout: Duration,
    }
}

impl<S> IdleTimeout<S> {
    /// Wrap `inner`; a zero duration never expires
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self {
            inner,
            sleep: Box::pin(sleep(timeout)),
            timeout,
        }
    }

    /// Reference to the inner stream
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Unwrap the inner stream
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn poll_idle(
    sleep: Pin<&mut Sleep>,
    timeout: Duration,
    cx: &mut Context<'_>,
) -> Poll<io::Error> {
    if timeout.is_zero() {
        return Poll::Pending;
    }
    match sleep.poll(cx) {
        Poll::Ready(()) => Poll::Ready(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connection idle for {}", humantime::format_duration(timeout)),
        )),
        Poll::Pending => Poll::Pending,
    }
}

impl<S: AsyncRead> AsyncRead for IdleTimeout<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.sleep.as_mut().reset(Instant::now() + *this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => poll_idle(this.sleep.as_mut(), *this.timeout, cx).map(Err),
        }
    }
}

impl<S: AsyncWrite> AsyncWrite for IdleTimeout<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        match this.inner.poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.sleep.as_mut().reset(Instant::now() + *this.timeout);
                Poll::Ready(result)
            }
            Poll::Pending => poll_idle(this.sleep.as_mut(), *this.timeout, cx).map(Err),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        match this.inner.poll_flush(cx) {
            Poll::Ready(result) => Poll::Ready(result),
            Poll::Pending => poll_idle(this.sleep.as_mut(), *this.timeout, cx).map(Err),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
