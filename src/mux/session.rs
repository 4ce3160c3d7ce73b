use super::config::MuxConfig;
use super::frame::{Cmd, Frame};
use super::stream::{Stream, StreamState};
use super::MuxError;
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

/// Framing state shared by the session tasks and its streams
pub(super) struct Shared {
    pub(super) config: MuxConfig,
    state: Mutex<State>,
    frames: mpsc::UnboundedSender<Frame>,
    closed: watch::Sender<bool>,
    /// Signalled when buffered data is consumed
    pub(super) recv_room: Notify,
}

pub(super) struct State {
    pub(super) streams: HashMap<u32, StreamState>,
    /// Unread bytes across all streams
    pub(super) buffered: usize,
    pub(super) close_reason: Option<String>,
    last_recv: Instant,
    recv_paused: bool,
    /// Window announced by the peer during the handshake
    peer_window: u32,
}

impl Shared {
    pub(super) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn send(&self, frame: Frame) -> Result<(), MuxError> {
        self.frames
            .send(frame)
            .map_err(|_| MuxError::SessionTerminated)
    }

    pub(super) fn is_closed(&self) -> bool {
        self.lock().close_reason.is_some()
    }

    /// Move to Closed: fail every stream and stop the session tasks
    pub(super) fn close(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let streams = {
            let mut state = self.lock();
            if state.close_reason.is_some() {
                return;
            }
            state.close_reason = Some(reason.clone());
            state.buffered = 0;
            std::mem::take(&mut state.streams)
        };

        let count = streams.len();
        for mut stream in streams.into_values() {
            stream.wake_all();
        }

        self.closed.send_replace(true);
        self.recv_room.notify_one();
        info!(reason = %reason, streams = count, "Mux session closed");
    }

    async fn wait_closed(&self) {
        let mut closed = self.closed.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

/// Multiplexed session over one physical connection
///
/// Dropping the session closes it and every stream it opened or accepted.
pub struct Session {
    shared: Arc<Shared>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Stream>>,
    next_id: AtomicU32,
}

impl Session {
    /// Open a session as the dialing side (odd stream ids)
    pub async fn client<C>(conn: C, config: MuxConfig) -> Result<Self, MuxError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open(conn, config, true).await
    }

    /// Open a session as the accepting side (even stream ids)
    pub async fn server<C>(conn: C, config: MuxConfig) -> Result<Self, MuxError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::open(conn, config, false).await
    }

    async fn open<C>(conn: C, config: MuxConfig, is_client: bool) -> Result<Self, MuxError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.verify()?;

        let version = config.version;
        let (mut reader, mut writer) = tokio::io::split(conn);

        let window = config.stream_window();
        Frame::new(
            version,
            Cmd::Nop,
            0,
            Bytes::copy_from_slice(&window.to_le_bytes()),
        )
        .write_to(&mut writer)
        .await?;
        writer.flush().await?;

        let hello = timeout(config.keepalive_timeout, Frame::read_from(&mut reader))
            .await
            .map_err(|_| MuxError::HandshakeTimeout)??;

        if hello.version != version {
            warn!(local = version, peer = hello.version, "Mux version mismatch");
            return Err(MuxError::VersionUnsupported {
                local: version,
                peer: Some(hello.version),
            });
        }
        if hello.cmd != Cmd::Nop || hello.payload.len() != 4 {
            return Err(MuxError::Protocol("unexpected handshake frame".to_string()));
        }
        let peer_window = hello.payload.clone().get_u32_le();

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let keepalive = !config.keepalive_disabled;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(State {
                streams: HashMap::new(),
                buffered: 0,
                close_reason: None,
                last_recv: Instant::now(),
                recv_paused: false,
                peer_window,
            }),
            frames: frames_tx,
            closed: closed_tx,
            recv_room: Notify::new(),
        });

        tokio::spawn(recv_loop(Arc::clone(&shared), reader, accept_tx));
        tokio::spawn(send_loop(Arc::clone(&shared), writer, frames_rx));
        if keepalive {
            tokio::spawn(keepalive_loop(Arc::clone(&shared)));
        }

        info!(
            version,
            client = is_client,
            window,
            peer_window,
            keepalive,
            "Mux session established"
        );

        Ok(Self {
            shared,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_id: AtomicU32::new(if is_client { 1 } else { 2 }),
        })
    }

    /// Open a new logical stream
    pub async fn open_stream(&self) -> Result<Stream, MuxError> {
        let id = self.next_id.fetch_add(2, Ordering::Relaxed);
        {
            let mut state = self.shared.lock();
            if state.close_reason.is_some() {
                return Err(MuxError::SessionTerminated);
            }
            let window = state.peer_window;
            state.streams.insert(id, StreamState::new(window));
        }

        let stream = Stream::new(id, Arc::clone(&self.shared));
        self.shared
            .send(Frame::control(self.shared.config.version, Cmd::Syn, id))?;

        debug!(stream_id = id, "Mux stream opened");
        Ok(stream)
    }

    /// Wait for the peer to open a stream
    pub async fn accept_stream(&self) -> Result<Stream, MuxError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.wait_closed() => Err(MuxError::SessionTerminated),
            stream = rx.recv() => stream.ok_or(MuxError::SessionTerminated),
        }
    }

    /// Close the session and every stream
    pub fn close(&self) {
        self.shared.close("closed locally");
    }

    /// Check if the session is closed
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Wait until the session is closed
    pub async fn closed(&self) {
        self.shared.wait_closed().await
    }

    /// Number of open streams
    pub fn num_streams(&self) -> usize {
        self.shared.lock().streams.len()
    }

    /// Session parameters
    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shared.close("session dropped");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("version", &self.shared.config.version)
            .field("streams", &self.num_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn recv_loop<R>(shared: Arc<Shared>, mut reader: R, accept: mpsc::UnboundedSender<Stream>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        // Stop reading the transport while too much data sits unread
        loop {
            {
                let mut state = shared.lock();
                if state.close_reason.is_some() {
                    return;
                }
                if state.buffered < shared.config.max_receive_buffer {
                    state.recv_paused = false;
                    break;
                }
                if !state.recv_paused {
                    debug!(buffered = state.buffered, "Mux receive buffer full");
                }
                state.recv_paused = true;
            }
            tokio::select! {
                _ = shared.recv_room.notified() => {}
                _ = shared.wait_closed() => return,
            }
        }

        let frame = tokio::select! {
            biased;
            _ = shared.wait_closed() => return,
            frame = Frame::read_from(&mut reader) => frame,
        };

        match frame.and_then(|frame| dispatch(&shared, frame, &accept)) {
            Ok(()) => {}
            Err(MuxError::Io(e)) => break format!("transport closed: {e}"),
            Err(e) => break e.to_string(),
        }
    };

    shared.close(reason);
}

fn dispatch(
    shared: &Arc<Shared>,
    frame: Frame,
    accept: &mpsc::UnboundedSender<Stream>,
) -> Result<(), MuxError> {
    if frame.version != shared.config.version {
        return Err(MuxError::VersionUnsupported {
            local: shared.config.version,
            peer: Some(frame.version),
        });
    }

    let mut guard = shared.lock();
    let state = &mut *guard;
    state.last_recv = Instant::now();
    let id = frame.stream_id;

    match frame.cmd {
        Cmd::Nop => {}
        Cmd::Syn => {
            if state.streams.contains_key(&id) {
                return Ok(());
            }
            let window = state.peer_window;
            state.streams.insert(id, StreamState::new(window));
            drop(guard);

            debug!(stream_id = id, "Mux stream accepted");
            let _ = accept.send(Stream::new(id, Arc::clone(shared)));
        }
        Cmd::Psh => match state.streams.get_mut(&id) {
            Some(stream) => {
                state.buffered += frame.payload.len();
                stream.push(frame.payload);
            }
            None => {
                drop(guard);
                debug!(stream_id = id, "Data for unknown mux stream, resetting");
                shared.send(Frame::update(shared.config.version, id, 0, 0))?;
            }
        },
        Cmd::Fin => {
            if let Some(stream) = state.streams.get_mut(&id) {
                stream.remote_fin = true;
                stream.wake_reader();
            }
        }
        Cmd::Upd => {
            if frame.payload.len() != 8 {
                return Err(MuxError::Protocol("malformed window update".to_string()));
            }
            let mut payload = frame.payload;
            let consumed = payload.get_u32_le();
            let window = payload.get_u32_le();
            if let Some(stream) = state.streams.get_mut(&id) {
                if window == 0 {
                    debug!(stream_id = id, "Mux stream reset by peer");
                    stream.reset();
                } else {
                    stream.peer_consumed = consumed;
                    stream.peer_window = window;
                    stream.wake_writer();
                }
            }
        }
    }

    Ok(())
}

async fn send_loop<W>(shared: Arc<Shared>, mut writer: W, mut frames: mpsc::UnboundedReceiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.wait_closed() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = write_batch(&mut writer, frame, &mut frames).await {
            shared.close(format!("transport write failed: {e}"));
            break;
        }
    }

    let _ = writer.shutdown().await;
}

/// Write `first` and whatever else is queued, then flush once
async fn write_batch<W>(
    writer: &mut W,
    first: Frame,
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    first.write_to(writer).await?;
    while let Ok(frame) = frames.try_recv() {
        frame.write_to(writer).await?;
    }
    writer.flush().await
}

async fn keepalive_loop(shared: Arc<Shared>) {
    let interval = shared.config.keepalive_interval;
    let timeout = shared.config.keepalive_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);

    loop {
        let deadline = shared.lock().last_recv + timeout;

        tokio::select! {
            _ = shared.wait_closed() => return,
            _ = ticker.tick() => {
                if shared.send(Frame::control(shared.config.version, Cmd::Nop, 0)).is_err() {
                    return;
                }
            }
            _ = sleep_until(deadline) => {
                let expired = {
                    let mut state = shared.lock();
                    if state.recv_paused {
                        // Peer frames are queued behind our own back-pressure
                        state.last_recv = Instant::now();
                        false
                    } else {
                        state.last_recv + timeout <= Instant::now()
                    }
                };
                if expired {
                    warn!(
                        timeout = %humantime::format_duration(timeout),
                        "Mux keepalive timeout"
                    );
                    shared.close("keepalive timeout");
                    return;
                }
            }
        }
    }
}
