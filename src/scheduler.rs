//! Outbound frame scheduling.
//!
//! Every frame leaves the session through two tasks. The shaper collects
//! submitted [`WriteRequest`]s into a min-heap keyed by priority and arrival
//! order, and hands the best one to the sender whenever the sender can take
//! another frame. The sender owns the transport sink, writes one frame at a
//! time and reports the outcome back to the submitter.
//!
//! Control frames are submitted with [`CONTROL_PRIORITY`] and therefore jump
//! ahead of queued data. Data frames use the stream's cumulative byte count,
//! which keeps a bulk transfer from starving small streams.

use crate::{
    error::{Result, SmuxError},
    frame::Frame,
};
use futures::{Sink, SinkExt};
use std::{cmp::Ordering, collections::BinaryHeap, time::Duration};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub(crate) const CONTROL_PRIORITY: u64 = 0;

/// A frame waiting to be written, with the channel its result goes back on.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    prio: u64,
    frame: Frame,
    result: oneshot::Sender<Result<usize>>,
}

/// Heap entry: lower priority first, then earlier arrival.
#[derive(Debug)]
struct Queued {
    seq: u64,
    request: WriteRequest,
}

impl Queued {
    fn key(&self) -> (u64, u64) {
        (self.request.prio, self.seq)
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap
        other.key().cmp(&self.key())
    }
}

/// Producer handle shared by the session and its streams.
#[derive(Debug, Clone)]
pub(crate) struct WriteScheduler {
    requests: flume::Sender<WriteRequest>,
}

impl WriteScheduler {
    pub(crate) fn new() -> (Self, flume::Receiver<WriteRequest>) {
        let (requests, incoming) = flume::unbounded();
        (Self { requests }, incoming)
    }

    fn submit(&self, prio: u64, frame: Frame) -> Result<oneshot::Receiver<Result<usize>>> {
        let (result, outcome) = oneshot::channel();
        self.requests
            .send(WriteRequest {
                prio,
                frame,
                result,
            })
            .map_err(|_| SmuxError::ClosedPipe)?;
        Ok(outcome)
    }

    /// Queues `frame` and waits until it has been written.
    ///
    /// Returns the payload length on success. When `timeout` elapses first
    /// the call fails with [`SmuxError::Timeout`], but the request stays
    /// queued and may still be written later.
    pub(crate) async fn write(
        &self,
        prio: u64,
        frame: Frame,
        timeout: Option<Duration>,
    ) -> Result<usize> {
        let outcome = self.submit(prio, frame)?;

        let result = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, outcome)
                .await
                .map_err(|_| SmuxError::Timeout)?,
            None => outcome.await,
        };

        // Dropped sender: the scheduler shut down with the request pending
        result.unwrap_or(Err(SmuxError::ClosedPipe))
    }

    /// Queues a control frame without waiting for it.
    pub(crate) fn post(&self, frame: Frame) {
        if self.submit(CONTROL_PRIORITY, frame).is_err() {
            tracing::debug!("scheduler closed, dropping posted frame");
        }
    }
}

/// Orders submitted requests and feeds them to the sender one at a time.
pub(crate) async fn shape_loop(
    incoming: flume::Receiver<WriteRequest>,
    writes: mpsc::Sender<WriteRequest>,
    die: CancellationToken,
) {
    let mut queue = BinaryHeap::new();
    let mut seq = 0u64;
    let mut enqueue = |queue: &mut BinaryHeap<Queued>, request| {
        queue.push(Queued { seq, request });
        seq += 1;
    };

    loop {
        while let Ok(request) = incoming.try_recv() {
            enqueue(&mut queue, request);
        }

        if queue.is_empty() {
            tokio::select! {
                biased;
                _ = die.cancelled() => break,
                request = incoming.recv_async() => match request {
                    Ok(request) => enqueue(&mut queue, request),
                    Err(_) => break,
                },
            }
            continue;
        }

        tokio::select! {
            biased;
            _ = die.cancelled() => break,
            request = incoming.recv_async() => match request {
                Ok(request) => enqueue(&mut queue, request),
                Err(_) => break,
            },
            permit = writes.reserve() => match permit {
                Ok(permit) => {
                    if let Some(next) = queue.pop() {
                        permit.send(next.request);
                    }
                }
                Err(_) => break,
            },
        }
    }

    // Pending submitters see their result channel dropped.
    tracing::debug!(pending = queue.len(), "shape_loop shutting down");
}

/// Writes frames to the transport in the order the shaper releases them.
///
/// Returns `Ok(())` when the session shuts down and the transport error when
/// a write fails. The frame that failed is answered with
/// [`SmuxError::ClosedPipe`].
pub(crate) async fn send_loop<S>(
    mut sink: S,
    mut writes: mpsc::Receiver<WriteRequest>,
    die: CancellationToken,
) -> Result<()>
where
    S: Sink<Frame, Error = SmuxError> + Unpin,
{
    loop {
        let request = tokio::select! {
            biased;
            _ = die.cancelled() => break,
            request = writes.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let WriteRequest { frame, result, .. } = request;
        let written = frame.payload_len();

        let sent = tokio::select! {
            biased;
            _ = die.cancelled() => {
                let _ = result.send(Err(SmuxError::ClosedPipe));
                break;
            }
            sent = sink.send(frame) => sent,
        };

        match sent {
            Ok(()) => {
                let _ = result.send(Ok(written));
            }
            Err(e) => {
                let _ = result.send(Err(SmuxError::ClosedPipe));
                return Err(e);
            }
        }
    }

    tracing::info!("send_loop shutting down");
    Ok(())
}
