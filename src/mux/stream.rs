use super::frame::{Cmd, Frame};
use super::session::Shared;
use super::MuxError;
use bytes::{Buf, Bytes};
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Per-stream buffers and flow control counters
pub(super) struct StreamState {
    recv_buf: VecDeque<Bytes>,
    pub(super) remote_fin: bool,
    local_fin: bool,
    /// Peer dropped the stream; nothing written now will be read
    reset: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
    /// Bytes written, wrapping
    sent: u32,
    /// Bytes the peer has acknowledged reading, wrapping
    pub(super) peer_consumed: u32,
    pub(super) peer_window: u32,
    /// Bytes read locally, wrapping
    consumed: u32,
    /// `consumed` value last sent in a window update
    acked: u32,
}

impl StreamState {
    pub(super) fn new(peer_window: u32) -> Self {
        Self {
            recv_buf: VecDeque::new(),
            remote_fin: false,
            local_fin: false,
            reset: false,
            read_waker: None,
            write_waker: None,
            sent: 0,
            peer_consumed: 0,
            peer_window,
            consumed: 0,
            acked: 0,
        }
    }

    pub(super) fn push(&mut self, data: Bytes) {
        if !data.is_empty() {
            self.recv_buf.push_back(data);
            self.wake_reader();
        }
    }

    fn buffered(&self) -> usize {
        self.recv_buf.iter().map(Bytes::len).sum()
    }

    fn write_allowance(&self) -> usize {
        let in_flight = self.sent.wrapping_sub(self.peer_consumed);
        self.peer_window.saturating_sub(in_flight) as usize
    }

    pub(super) fn wake_reader(&mut self) {
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    pub(super) fn wake_writer(&mut self) {
        if let Some(waker) = self.write_waker.take() {
            waker.wake();
        }
    }

    /// Peer is gone: reads drain what is buffered, writes fail
    pub(super) fn reset(&mut self) {
        self.reset = true;
        self.remote_fin = true;
        self.wake_all();
    }

    pub(super) fn wake_all(&mut self) {
        self.wake_reader();
        self.wake_writer();
    }
}

/// A logical stream within a mux [`Session`](super::Session)
///
/// Operations fail with [`MuxError::SessionTerminated`] (carried inside an
/// `io::Error`) once the session is closed.
pub struct Stream {
    id: u32,
    shared: Arc<Shared>,
}

impl Stream {
    pub(super) fn new(id: u32, shared: Arc<Shared>) -> Self {
        Self { id, shared }
    }

    /// Session-local stream identifier
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.id).finish()
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let window = this.shared.config.stream_window();

        let update = {
            let mut guard = this.shared.lock();
            if guard.close_reason.is_some() {
                return Poll::Ready(Err(MuxError::SessionTerminated.into_io()));
            }

            let state = &mut *guard;
            let Some(stream) = state.streams.get_mut(&this.id) else {
                return Poll::Ready(Err(MuxError::StreamClosed(this.id).into_io()));
            };

            if stream.recv_buf.is_empty() {
                if stream.remote_fin {
                    return Poll::Ready(Ok(()));
                }
                stream.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let mut read = 0;
            while buf.remaining() > 0 {
                let Some(chunk) = stream.recv_buf.front_mut() else {
                    break;
                };
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                chunk.advance(n);
                if chunk.is_empty() {
                    stream.recv_buf.pop_front();
                }
                read += n;
            }

            state.buffered = state.buffered.saturating_sub(read);
            stream.consumed = stream.consumed.wrapping_add(read as u32);

            if stream.consumed.wrapping_sub(stream.acked) >= window / 2 {
                stream.acked = stream.consumed;
                Some(stream.consumed)
            } else {
                None
            }
        };

        this.shared.recv_room.notify_one();
        if let Some(consumed) = update {
            let frame = Frame::update(this.shared.config.version, this.id, consumed, window);
            if let Err(e) = this.shared.send(frame) {
                return Poll::Ready(Err(e.into_io()));
            }
        }

        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let frame = {
            let mut state = this.shared.lock();
            if state.close_reason.is_some() {
                return Poll::Ready(Err(MuxError::SessionTerminated.into_io()));
            }

            let stream = match state.streams.get_mut(&this.id) {
                Some(stream) if !stream.local_fin && !stream.reset => stream,
                _ => return Poll::Ready(Err(MuxError::StreamClosed(this.id).into_io())),
            };

            let allowance = stream.write_allowance();
            if allowance == 0 {
                stream.write_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }

            let n = buf
                .len()
                .min(allowance)
                .min(this.shared.config.frame_size());
            stream.sent = stream.sent.wrapping_add(n as u32);

            Frame::new(
                this.shared.config.version,
                Cmd::Psh,
                this.id,
                Bytes::copy_from_slice(&buf[..n]),
            )
        };

        let n = frame.payload.len();
        match this.shared.send(frame) {
            Ok(()) => Poll::Ready(Ok(n)),
            Err(e) => Poll::Ready(Err(e.into_io())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.shared.is_closed() {
            return Poll::Ready(Err(MuxError::SessionTerminated.into_io()));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let send_fin = {
            let mut state = self.shared.lock();
            match state.streams.get_mut(&self.id) {
                Some(stream) if !stream.local_fin => {
                    stream.local_fin = true;
                    true
                }
                _ => false,
            }
        };

        if send_fin {
            let _ = self
                .shared
                .send(Frame::control(self.shared.config.version, Cmd::Fin, self.id));
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let removed = {
            let mut state = self.shared.lock();
            let Some(stream) = state.streams.remove(&self.id) else {
                return;
            };
            state.buffered = state.buffered.saturating_sub(stream.buffered());
            stream
        };

        self.shared.recv_room.notify_one();
        if removed.reset {
            return;
        }

        let version = self.shared.config.version;
        if !removed.local_fin {
            let _ = self.shared.send(Frame::control(version, Cmd::Fin, self.id));
        }
        // Zero window: the peer's writer must stop
        let _ = self
            .shared
            .send(Frame::update(version, self.id, removed.consumed, 0));
    }
}
