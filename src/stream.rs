use crate::{
    config::Config,
    error::{Result, SmuxError},
    flow::{FlowMode, RecvWindow, SendWindow},
    frame::Frame,
    io::StreamIo,
    scheduler::CONTROL_PRIORITY,
    session::SessionInner,
};
use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
enum FlowControl {
    /// v1: inbound bytes are charged to the session's receive budget.
    Bounded,
    /// v2: outbound bytes are limited by the peer's advertised window.
    Window(SendWindow),
}

/// Received chunks waiting for the application, plus the v2 read counters
/// that must change together with them.
#[derive(Debug, Default)]
struct Inbound {
    chunks: VecDeque<Bytes>,
    window: RecvWindow,
}

impl Inbound {
    fn copy_to(&mut self, buf: &mut [u8]) -> usize {
        let mut copied = 0;

        while copied < buf.len() {
            let Some(chunk) = self.chunks.front_mut() else {
                break;
            };

            let n = chunk.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            copied += n;

            if chunk.is_empty() {
                self.chunks.pop_front();
            }
        }

        copied
    }

    fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }
}

/// State shared between a [`Stream`] handle and the session that routes
/// frames to it.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u32,
    version: u8,
    max_frame_size: usize,
    advertised_window: u32,
    update_threshold: u32,
    session: Weak<SessionInner>,
    inbound: Mutex<Inbound>,
    readable: Notify,
    flow: FlowControl,
    /// Cumulative bytes written, used as the scheduling priority of data.
    bytes_written: AtomicU64,
    /// Nanoseconds, 0 when unset.
    read_timeout: AtomicU64,
    write_timeout: AtomicU64,
    read_lock: tokio::sync::Mutex<()>,
    write_lock: tokio::sync::Mutex<()>,
    /// Cancelled by a local close or by session teardown.
    die: CancellationToken,
    /// Cancelled when the peer sends FIN. Child of `die`.
    peer_fin: CancellationToken,
    close_once: AtomicBool,
    fin_sent: AtomicBool,
}

impl StreamShared {
    pub(crate) fn new(
        id: u32,
        session: Weak<SessionInner>,
        config: &Config,
        mode: FlowMode,
    ) -> Arc<Self> {
        let flow = match mode {
            FlowMode::BoundedBuffer => FlowControl::Bounded,
            FlowMode::SlidingWindow => FlowControl::Window(SendWindow::new()),
        };
        let die = CancellationToken::new();

        Arc::new(Self {
            id,
            version: config.version,
            max_frame_size: config.max_frame_size,
            advertised_window: config.max_stream_buffer as u32,
            update_threshold: (config.max_stream_buffer / 2) as u32,
            session,
            inbound: Mutex::new(Inbound::default()),
            readable: Notify::new(),
            flow,
            bytes_written: AtomicU64::new(0),
            read_timeout: AtomicU64::new(0),
            write_timeout: AtomicU64::new(0),
            read_lock: tokio::sync::Mutex::new(()),
            write_lock: tokio::sync::Mutex::new(()),
            peer_fin: die.child_token(),
            die,
            close_once: AtomicBool::new(false),
            fin_sent: AtomicBool::new(false),
        })
    }

    /// Appends a data payload and wakes a blocked reader.
    pub(crate) fn push(&self, data: Bytes) {
        self.inbound.lock().chunks.push_back(data);
        self.readable.notify_one();
    }

    pub(crate) fn fin_received(&self) {
        self.peer_fin.cancel();
    }

    pub(crate) fn window_update(&self, consumed: u32, window: u32) {
        match &self.flow {
            FlowControl::Window(send_window) => send_window.update(consumed, window),
            FlowControl::Bounded => {
                tracing::trace!(stream_id = self.id, "ignoring window update on v1 stream");
            }
        }
    }

    /// The session is gone; every blocked call returns `ClosedPipe`.
    pub(crate) fn session_closed(&self) {
        self.die.cancel();
    }

    /// Drops everything still buffered and returns how many bytes that was.
    pub(crate) fn drain(&self) -> usize {
        let mut inbound = self.inbound.lock();
        let n = inbound.len();
        inbound.chunks.clear();
        n
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.inbound.lock().len()
    }

    #[cfg(test)]
    fn in_flight(&self) -> Option<u32> {
        match &self.flow {
            FlowControl::Window(send_window) => send_window.in_flight().ok(),
            FlowControl::Bounded => None,
        }
    }

    fn session(&self) -> Result<Arc<SessionInner>> {
        self.session.upgrade().ok_or(SmuxError::ClosedPipe)
    }

    fn read_timeout(&self) -> Option<Duration> {
        load_timeout(&self.read_timeout)
    }

    fn write_timeout(&self) -> Option<Duration> {
        load_timeout(&self.write_timeout)
    }

    fn is_write_closed(&self) -> bool {
        self.die.is_cancelled() || self.fin_sent.load(Ordering::Acquire)
    }

    /// Submits a frame to the session scheduler unless this stream dies first.
    async fn write_frame(
        &self,
        session: &SessionInner,
        frame: Frame,
        prio: u64,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(SmuxError::ClosedPipe),
            written = session.write_frame(frame, prio, timeout) => written,
        }
    }

    async fn wait_readable(&self) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(SmuxError::ClosedPipe),
            _ = self.readable.notified() => Ok(()),
            _ = self.peer_fin.cancelled() => {
                if self.inbound.lock().chunks.is_empty() {
                    Err(SmuxError::Eof)
                } else {
                    Ok(())
                }
            }
            _ = sleep_or_forever(self.read_timeout()) => Err(SmuxError::ReadTimeout),
        }
    }

    async fn wait_window(&self, send_window: &SendWindow) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(SmuxError::ClosedPipe),
            _ = send_window.updated() => Ok(()),
            // No more updates come once the peer has sent FIN.
            _ = self.peer_fin.cancelled() => Err(SmuxError::Eof),
            _ = sleep_or_forever(self.write_timeout()) => Err(SmuxError::WriteTimeout),
        }
    }

    /// Settles the accounting for `n` bytes handed to the application.
    async fn consumed(&self, n: usize, update: Option<u32>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };

        match &self.flow {
            FlowControl::Bounded => session.return_tokens(n),
            FlowControl::Window(_) => {
                let Some(consumed) = update else {
                    return;
                };
                let frame = Frame::new_upd(self.version, self.id, consumed, self.advertised_window);
                if let Err(e) = self
                    .write_frame(&session, frame, CONTROL_PRIORITY, self.read_timeout())
                    .await
                {
                    tracing::debug!(stream_id = self.id, "window update not sent: {}", e);
                }
            }
        }
    }

    /// Sends `data` as PSH frames of at most `max_frame_size` bytes.
    async fn send_data(&self, session: &SessionInner, data: &[u8]) -> Result<usize> {
        let timeout = self.write_timeout();
        let mut sent = 0;

        for chunk in data.chunks(self.max_frame_size) {
            let frame = Frame::new_psh(self.version, self.id, Bytes::copy_from_slice(chunk));
            let prio = self.bytes_written.load(Ordering::Acquire);

            // Counted up front: a frame whose wait times out may still be
            // written, and the window must not under-count it.
            if let FlowControl::Window(send_window) = &self.flow {
                send_window.record_sent(chunk.len());
            }

            let n = self
                .write_frame(session, frame, prio, timeout)
                .await
                .map_err(|e| match e {
                    SmuxError::Timeout => SmuxError::WriteTimeout,
                    e => e,
                })?;

            self.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
            sent += n;
        }

        Ok(sent)
    }

    /// Local teardown shared by `close` and `Drop`. Returns the session if it
    /// is still around and a FIN is owed to the peer.
    fn begin_close(&self) -> Option<(Arc<SessionInner>, bool)> {
        if self.close_once.swap(true, Ordering::AcqRel) {
            return None;
        }

        // Still uncancelled here means the session did not tear us down.
        let session_alive = !self.die.is_cancelled();
        self.die.cancel();

        let session = self.session.upgrade()?;
        let owes_fin = session_alive && !self.fin_sent.swap(true, Ordering::AcqRel);
        Some((session, owes_fin))
    }
}

fn load_timeout(slot: &AtomicU64) -> Option<Duration> {
    match slot.load(Ordering::Acquire) {
        0 => None,
        nanos => Some(Duration::from_nanos(nanos)),
    }
}

fn store_timeout(slot: &AtomicU64, timeout: Option<Duration>) {
    let nanos = timeout
        .map(|t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0);
    slot.store(nanos, Ordering::Release);
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(timeout) => tokio::time::sleep(timeout).await,
        None => std::future::pending().await,
    }
}

/// A multiplexed stream within a smux session.
///
/// Reads and writes take `&self`, so one task can read while another writes
/// (share the stream through an `Arc`). Concurrent reads are served one at a
/// time, as are concurrent writes.
///
/// Dropping a stream without calling [`close`](Stream::close) still tears it
/// down and notifies the peer with a FIN.
#[derive(Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// Get the stream ID
    pub fn stream_id(&self) -> u32 {
        self.shared.id
    }

    /// True once the stream was closed locally or its session went away.
    pub fn is_closed(&self) -> bool {
        self.shared.die.is_cancelled()
    }

    /// Bound for each wait inside [`read`](Stream::read). `None` or a zero
    /// duration waits indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        store_timeout(&self.shared.read_timeout, timeout);
    }

    /// Bound for each wait inside [`write`](Stream::write). `None` or a zero
    /// duration waits indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        store_timeout(&self.shared.write_timeout, timeout);
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.shared.read_timeout()
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.shared.write_timeout()
    }

    /// Reads buffered data into `buf`, waiting for some to arrive if needed.
    ///
    /// Returns [`SmuxError::Eof`] once the peer has half-closed and every
    /// buffered byte was read, [`SmuxError::ClosedPipe`] when the stream or
    /// its session is closed, and [`SmuxError::ReadTimeout`] when the read
    /// timeout elapses. A timed-out read can simply be retried.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let s = &self.shared;
        let _reading = s.read_lock.lock().await;

        loop {
            let (n, update) = {
                let mut inbound = s.inbound.lock();
                let n = inbound.copy_to(buf);
                let update = match s.flow {
                    FlowControl::Window(_) => inbound.window.on_read(n, s.update_threshold),
                    FlowControl::Bounded => None,
                };
                (n, update)
            };

            if n > 0 {
                s.consumed(n, update).await;
                return Ok(n);
            }

            s.wait_readable().await?;
        }
    }

    /// Writes all of `buf` to the peer.
    ///
    /// On a v2 session the call waits whenever the peer's window is full,
    /// and gives up with [`SmuxError::Eof`] if the peer sends FIN meanwhile.
    /// Fails with [`SmuxError::ClosedPipe`] after [`close`](Stream::close)
    /// or [`close_write`](Stream::close_write).
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let s = &self.shared;
        if s.is_write_closed() {
            return Err(SmuxError::ClosedPipe);
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let session = s.session()?;
        let _writing = s.write_lock.lock().await;

        match &s.flow {
            FlowControl::Bounded => s.send_data(&session, buf).await,
            FlowControl::Window(send_window) => {
                let mut sent = 0;
                while sent < buf.len() {
                    let available = send_window.available()?;
                    if available == 0 {
                        s.wait_window(send_window).await?;
                        continue;
                    }

                    let end = sent + available.min(buf.len() - sent);
                    sent += s.send_data(&session, &buf[sent..end]).await?;
                }
                Ok(sent)
            }
        }
    }

    /// Half-closes the stream: sends FIN so the peer reads end-of-stream.
    /// Reading continues to work.
    pub async fn close_write(&self) -> Result<()> {
        let s = &self.shared;
        if s.die.is_cancelled() {
            return Err(SmuxError::ClosedPipe);
        }

        let session = s.session()?;
        // Queued behind any write still in progress.
        let _writing = s.write_lock.lock().await;
        if s.fin_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let fin = Frame::new_fin(s.version, s.id);
        s.write_frame(&session, fin, CONTROL_PRIORITY, s.write_timeout())
            .await
            .map_err(|e| match e {
                SmuxError::Timeout => SmuxError::WriteTimeout,
                e => e,
            })?;

        tracing::trace!(stream_id = s.id, "stream half-closed");
        Ok(())
    }

    /// Closes the stream. Idempotent.
    ///
    /// A FIN is sent if none was sent yet; failing to send it is not an
    /// error. The stream is removed from its session either way, and data
    /// not yet read is discarded.
    pub async fn close(&self) -> Result<()> {
        let s = &self.shared;
        let Some((session, owes_fin)) = s.begin_close() else {
            return Ok(());
        };

        if owes_fin {
            let fin = Frame::new_fin(s.version, s.id);
            if let Err(e) = session
                .write_frame(fin, CONTROL_PRIORITY, s.write_timeout())
                .await
            {
                tracing::debug!(stream_id = s.id, "FIN not sent: {}", e);
            }
        }

        session.stream_closed(s.id);
        Ok(())
    }

    /// Wraps the stream in an adapter implementing Tokio's I/O traits.
    pub fn into_io(self) -> StreamIo {
        StreamIo::new(self)
    }

    #[cfg(test)]
    pub(crate) fn buffered(&self) -> usize {
        self.shared.buffered()
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> Option<u32> {
        self.shared.in_flight()
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let s = &self.shared;
        if let Some((session, owes_fin)) = s.begin_close() {
            if owes_fin {
                session.post(Frame::new_fin(s.version, s.id));
            }
            session.stream_closed(s.id);
        }
    }
}
