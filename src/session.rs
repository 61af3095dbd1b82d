use crate::{
    Command,
    codec::Codec,
    config::Config,
    error::{Result, SmuxError},
    flow::{FlowMode, ReceiveBudget},
    frame::Frame,
    scheduler::{self, CONTROL_PRIORITY, WriteScheduler},
    stream::{Stream, StreamShared},
    stream_id::StreamIdGenerator,
};
use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::StreamExt;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::{codec::Framed, sync::CancellationToken};
use tracing::Instrument;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// A multiplexed session that manages multiple streams over a single connection
///
/// The session runs its own background tasks (frame receiver, write shaper,
/// frame sender and, unless disabled, keepalive ping and timeout checks).
/// They stop when the session closes, either through [`Session::close`], a
/// transport failure, or a keepalive timeout. Handles are cheap to clone and
/// all refer to the same session.
///
/// # Examples
///
/// ```rust,no_run
/// use smux::{Config, Session};
/// use tokio::net::TcpStream;
///
/// # async fn run() -> smux::Result<()> {
/// let tcp = TcpStream::connect("127.0.0.1:8080").await?;
/// let session = Session::client(tcp, Config::default()).await?;
///
/// let stream = session.open_stream().await?;
/// stream.write(b"ping").await?;
///
/// let mut buf = [0u8; 4];
/// let n = stream.read(&mut buf).await?;
/// assert_eq!(&buf[..n], b"pong");
///
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Internal session state shared between tasks
#[derive(Debug)]
pub(crate) struct SessionInner {
    config: Config,
    is_client: bool,
    mode: FlowMode,
    /// Active streams mapped by stream ID
    streams: DashMap<u32, Arc<StreamShared>>,
    ids: StreamIdGenerator,
    scheduler: WriteScheduler,
    /// v1 receive budget; never charged on v2 sessions
    budget: ReceiveBudget,
    /// Streams opened by the peer, waiting for `accept_stream`
    accept_tx: flume::Sender<Stream>,
    accept_rx: flume::Receiver<Stream>,
    /// Set by every received frame, cleared by each keepalive check
    data_ready: AtomicBool,
    state: AtomicU8,
    die: CancellationToken,
    torn_down: CancellationToken,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    /// Create a new client session
    pub async fn client<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, true, StreamIdGenerator::new(true)).await
    }

    /// Create a new server session
    pub async fn server<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, config, false, StreamIdGenerator::new(false)).await
    }

    async fn spawn<T>(
        transport: T,
        config: Config,
        is_client: bool,
        ids: StreamIdGenerator,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let (sink, frames) = Framed::new(transport, Codec::new(&config)).split();
        let (scheduler, requests) = WriteScheduler::new();
        let (writes_tx, writes_rx) = mpsc::channel(1);
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            mode: FlowMode::for_version(config.version),
            budget: ReceiveBudget::new(config.max_receive_buffer),
            config,
            is_client,
            streams: DashMap::new(),
            ids,
            scheduler,
            accept_tx,
            accept_rx,
            data_ready: AtomicBool::new(false),
            state: AtomicU8::new(OPEN),
            die: CancellationToken::new(),
            torn_down: CancellationToken::new(),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        let side = if is_client { "client" } else { "server" };
        let mut tasks = Vec::with_capacity(5);

        tasks.push(tokio::spawn(
            scheduler::shape_loop(requests, writes_tx, inner.die.clone())
                .instrument(tracing::debug_span!("shape_loop", side)),
        ));

        let send_inner = Arc::clone(&inner);
        tasks.push(tokio::spawn(
            async move {
                if let Err(e) =
                    scheduler::send_loop(sink, writes_rx, send_inner.die.clone()).await
                {
                    tracing::error!("send_loop error: {}", e);
                    send_inner.shutdown();
                }
            }
            .instrument(tracing::debug_span!("send_loop", side)),
        ));

        let recv_inner = Arc::clone(&inner);
        tasks.push(tokio::spawn(
            async move {
                if let Err(e) = recv_loop(frames, &recv_inner).await {
                    tracing::error!("recv_loop error: {}", e);
                }
                recv_inner.shutdown();
            }
            .instrument(tracing::debug_span!("recv_loop", side)),
        ));

        if inner.config.enable_keep_alive {
            tasks.push(tokio::spawn(
                ping_loop(Arc::clone(&inner)).instrument(tracing::debug_span!("ping_loop", side)),
            ));
            tasks.push(tokio::spawn(
                keepalive_loop(Arc::clone(&inner))
                    .instrument(tracing::debug_span!("keepalive_loop", side)),
            ));
        }

        *inner.tasks.lock().await = tasks;

        tracing::debug!(side, version = inner.config.version, "session started");
        Ok(Session { inner })
    }

    /// Open a new outgoing stream
    ///
    /// Fails with [`SmuxError::GoAway`] once this side has run out of stream
    /// IDs; the session stays usable for existing streams.
    pub async fn open_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(SmuxError::ClosedPipe);
        }

        let stream_id = inner.ids.next()?;
        let shared = inner.new_stream(stream_id);
        inner.streams.insert(stream_id, Arc::clone(&shared));

        // A close that started after the check above has either already
        // swept the table or will see this entry.
        if inner.is_closed() {
            inner.streams.remove(&stream_id);
            shared.session_closed();
            return Err(SmuxError::ClosedPipe);
        }

        let stream = Stream::new(shared);
        inner
            .write_frame(
                Frame::new_syn(inner.config.version, stream_id),
                CONTROL_PRIORITY,
                None,
            )
            .await?;

        tracing::debug!(stream_id, "stream opened");
        Ok(stream)
    }

    /// Accept an incoming stream initiated by the peer
    pub async fn accept_stream(&self) -> Result<Stream> {
        tokio::select! {
            biased;
            _ = self.inner.die.cancelled() => Err(SmuxError::ClosedPipe),
            stream = self.inner.accept_rx.recv_async() => {
                stream.map_err(|_| SmuxError::ClosedPipe)
            }
        }
    }

    /// Like [`accept_stream`](Session::accept_stream), failing with
    /// [`SmuxError::Timeout`] when no stream arrives within `timeout`.
    pub async fn accept_stream_timeout(&self, timeout: Duration) -> Result<Stream> {
        tokio::time::timeout(timeout, self.accept_stream())
            .await
            .map_err(|_| SmuxError::Timeout)?
    }

    /// Close the session and every stream on it
    ///
    /// Idempotent. Every caller returns only after the background tasks have
    /// stopped and the transport has been released.
    pub async fn close(&self) -> Result<()> {
        self.inner.shutdown();

        let mut tasks = self.inner.tasks.lock().await;
        for task in tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    tracing::error!("session task panicked: {}", e);
                }
            }
        }
        drop(tasks);

        self.inner.torn_down.cancelled().await;
        Ok(())
    }

    /// Check if the session is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    #[inline]
    pub fn is_client(&self) -> bool {
        self.inner.is_client
    }

    /// True once this side has exhausted its stream IDs.
    pub fn is_go_away(&self) -> bool {
        self.inner.ids.is_go_away()
    }

    /// Number of streams currently registered with the session.
    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl SessionInner {
    fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) != OPEN
    }

    fn new_stream(self: &Arc<Self>, stream_id: u32) -> Arc<StreamShared> {
        StreamShared::new(stream_id, Arc::downgrade(self), &self.config, self.mode)
    }

    /// Tears the session down once: stops every task and force-closes every
    /// stream. Later calls return immediately.
    fn shutdown(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.die.cancel();

        let streams: Vec<_> = self
            .streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for stream in &streams {
            stream.session_closed();
        }
        self.streams.clear();

        self.state.store(CLOSED, Ordering::Release);
        self.torn_down.cancel();
        tracing::debug!(streams = streams.len(), "session closed");
    }

    /// Queues a frame on the write scheduler and waits for it to be written.
    pub(crate) async fn write_frame(
        &self,
        frame: Frame,
        prio: u64,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(SmuxError::ClosedPipe),
            written = self.scheduler.write(prio, frame, timeout) => written,
        }
    }

    /// Queues a control frame without waiting for it to be written.
    pub(crate) fn post(&self, frame: Frame) {
        if !self.is_closed() {
            self.scheduler.post(frame);
        }
    }

    pub(crate) fn return_tokens(&self, n: usize) {
        if self.mode == FlowMode::BoundedBuffer {
            self.budget.give_back(n);
        }
    }

    /// Removes a stream from the table and recycles its undelivered bytes.
    pub(crate) fn stream_closed(&self, stream_id: u32) {
        if let Some((_, stream)) = self.streams.remove(&stream_id) {
            let discarded = stream.drain();
            self.return_tokens(discarded);
            tracing::debug!(stream_id, discarded, "stream closed");
        }
    }

    fn handle_frame(self: &Arc<Self>, frame: Frame) {
        let stream_id = frame.stream_id;

        match frame.cmd {
            Command::Nop => {}
            Command::Syn => self.accept_syn(stream_id),
            Command::Fin => {
                if let Some(stream) = self.streams.get(&stream_id) {
                    stream.fin_received();
                    tracing::trace!(stream_id, "peer half-closed stream");
                }
            }
            Command::Psh => self.route_data(stream_id, frame.data),
            Command::Upd { consumed, window } => {
                if let Some(stream) = self.streams.get(&stream_id) {
                    stream.window_update(consumed, window);
                }
            }
        }
    }

    fn accept_syn(self: &Arc<Self>, stream_id: u32) {
        if let Err(e) = self.ids.validate_peer_stream_id(stream_id) {
            tracing::warn!("ignoring SYN: {}", e);
            return;
        }

        let shared = match self.streams.entry(stream_id) {
            Entry::Occupied(_) => {
                tracing::trace!(stream_id, "duplicate SYN ignored");
                return;
            }
            Entry::Vacant(slot) => {
                let shared = self.new_stream(stream_id);
                slot.insert(Arc::clone(&shared));
                shared
            }
        };

        if self.is_closed() {
            self.streams.remove(&stream_id);
            shared.session_closed();
            return;
        }

        match self.accept_tx.try_send(Stream::new(shared)) {
            Ok(()) => tracing::debug!(stream_id, "stream accepted from peer"),
            Err(refused) => {
                // Dropping the stream unregisters it and answers with FIN.
                tracing::warn!(stream_id, "accept backlog full, refusing stream");
                drop(refused);
            }
        }
    }

    fn route_data(&self, stream_id: u32, data: Bytes) {
        if data.is_empty() {
            return;
        }

        // The table entry stays locked until the bytes are charged, so a
        // concurrent teardown recycles exactly what was delivered.
        match self.streams.get(&stream_id) {
            Some(stream) => {
                if self.mode == FlowMode::BoundedBuffer {
                    self.budget.consume(data.len());
                }
                stream.push(data);
            }
            None => {
                tracing::trace!(stream_id, len = data.len(), "data for unknown stream dropped");
            }
        }
    }
}

/// Reads frames from the transport and dispatches them to streams
///
/// Returns `Ok(())` on session shutdown or a clean end of the transport,
/// and the decode or I/O error otherwise. Either way the caller closes the
/// session.
async fn recv_loop<S>(mut frames: S, inner: &Arc<SessionInner>) -> Result<()>
where
    S: futures::Stream<Item = Result<Frame>> + Unpin,
{
    loop {
        if inner.mode == FlowMode::BoundedBuffer {
            while inner.budget.available() <= 0 {
                tokio::select! {
                    biased;
                    _ = inner.die.cancelled() => return Ok(()),
                    _ = inner.budget.returned() => {}
                }
            }
        }

        let frame = tokio::select! {
            biased;
            _ = inner.die.cancelled() => {
                tracing::info!("recv_loop shutting down");
                return Ok(());
            }
            frame = frames.next() => frame,
        };

        let frame = match frame {
            Some(frame) => frame?,
            None => {
                tracing::info!("Transport closed");
                return Ok(());
            }
        };

        inner.data_ready.store(true, Ordering::Release);
        inner.handle_frame(frame);
    }
}

/// Sends a NOP every keepalive interval.
async fn ping_loop(inner: Arc<SessionInner>) {
    let interval = inner.config.keep_alive_interval;
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.die.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let nop = Frame::new_nop(inner.config.version);
        match inner.write_frame(nop, CONTROL_PRIORITY, Some(interval)).await {
            Ok(_) => tracing::trace!("ping sent"),
            Err(SmuxError::Timeout) => tracing::debug!("ping still queued after {:?}", interval),
            Err(_) => break,
        }
    }
}

/// Closes the session when nothing arrived for a whole keepalive timeout.
///
/// A v1 session whose receive budget is exhausted stops reading on purpose,
/// so silence is only blamed on the peer while tokens are available.
async fn keepalive_loop(inner: Arc<SessionInner>) {
    let timeout = inner.config.keep_alive_timeout;
    let mut ticker = tokio::time::interval_at(Instant::now() + timeout, timeout);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = inner.die.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !inner.data_ready.swap(false, Ordering::AcqRel) && inner.budget.available() > 0 {
            tracing::info!("no frames received for {:?}, closing session", timeout);
            inner.shutdown();
            break;
        }
    }
}
