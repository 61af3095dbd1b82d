use crate::{
    error::{Result, SmuxError},
    stream::Stream,
};
use bytes::Bytes;
use futures::{FutureExt, future::BoxFuture};
use std::{
    fmt, io,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Upper bound on a single read issued on behalf of `poll_read`.
const READ_CHUNK: usize = 64 * 1024;

/// [`AsyncRead`]/[`AsyncWrite`] adapter over a [`Stream`].
///
/// End-of-stream reads as `Ok(0)`, `poll_shutdown` half-closes the stream
/// (sends FIN), and errors are reported as [`io::Error`]s with a matching
/// [`io::ErrorKind`]. This makes a stream usable with `tokio::io::copy`,
/// `AsyncReadExt`, codecs and the like.
///
/// Writes behave like `tokio::fs::File`: once a buffer has been copied into
/// an in-flight write, `poll_write` reports it as written. Only one write is
/// in flight at a time. Its failure surfaces from the next `poll_write`,
/// `poll_flush` or `poll_shutdown`.
pub struct StreamIo {
    stream: Arc<Stream>,
    reading: Option<BoxFuture<'static, Result<Bytes>>>,
    leftover: Bytes,
    writing: Option<BoxFuture<'static, Result<usize>>>,
    shutting_down: Option<BoxFuture<'static, Result<()>>>,
}

impl StreamIo {
    pub fn new(stream: Stream) -> Self {
        Self {
            stream: Arc::new(stream),
            reading: None,
            leftover: Bytes::new(),
            writing: None,
            shutting_down: None,
        }
    }

    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Drives the in-flight write, if any, to completion.
    fn poll_settle_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let Some(writing) = self.writing.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(writing.poll_unpin(cx));
        self.writing = None;
        Poll::Ready(result.map(drop))
    }
}

impl fmt::Debug for StreamIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamIo")
            .field("stream", &self.stream)
            .field("leftover", &self.leftover.len())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for StreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if this.leftover.is_empty() {
            let len = buf.remaining().min(READ_CHUNK);
            let reading = this.reading.get_or_insert_with(|| {
                let stream = Arc::clone(&this.stream);
                async move {
                    let mut data = vec![0u8; len];
                    match stream.read(&mut data).await {
                        Ok(n) => {
                            data.truncate(n);
                            Ok(Bytes::from(data))
                        }
                        Err(SmuxError::Eof) => Ok(Bytes::new()),
                        Err(e) => Err(e),
                    }
                }
                .boxed()
            });

            let result = ready!(reading.poll_unpin(cx));
            this.reading = None;
            this.leftover = result?;

            if this.leftover.is_empty() {
                return Poll::Ready(Ok(()));
            }
        }

        let n = this.leftover.len().min(buf.remaining());
        buf.put_slice(&this.leftover.split_to(n));
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_settle_write(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let stream = Arc::clone(&this.stream);
        let data = Bytes::copy_from_slice(buf);
        let mut writing = async move { stream.write(&data).await }.boxed();

        // Closed streams fail on the first poll; anything else is accepted.
        match writing.poll_unpin(cx) {
            Poll::Ready(result) => Poll::Ready(result.map_err(io::Error::from)),
            Poll::Pending => {
                this.writing = Some(writing);
                Poll::Ready(Ok(buf.len()))
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the session as they are written.
        let result = ready!(self.get_mut().poll_settle_write(cx));
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_settle_write(cx))?;

        let shutting_down = this.shutting_down.get_or_insert_with(|| {
            let stream = Arc::clone(&this.stream);
            async move { stream.close_write().await }.boxed()
        });

        let result = ready!(shutting_down.poll_unpin(cx));
        this.shutting_down = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}
