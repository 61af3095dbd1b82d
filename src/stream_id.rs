use crate::error::{Result, SmuxError};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Allocates IDs for locally opened streams.
///
/// The client side hands out odd IDs starting at 3, the server side even
/// IDs starting at 2. Once the counter would wrap into the other side's
/// parity the generator goes away permanently: every later call fails with
/// [`SmuxError::GoAway`].
#[derive(Debug)]
pub struct StreamIdGenerator {
    next_id: AtomicU32,
    go_away: AtomicBool,
    is_client: bool,
}

impl StreamIdGenerator {
    pub fn new(is_client: bool) -> Self {
        Self::starting_at(is_client, if is_client { 1 } else { 0 })
    }

    /// A generator whose next allocation is `last + 2`.
    pub(crate) fn starting_at(is_client: bool, last: u32) -> Self {
        Self {
            next_id: AtomicU32::new(last),
            go_away: AtomicBool::new(false),
            is_client,
        }
    }

    pub fn next(&self) -> Result<u32> {
        if self.go_away.load(Ordering::Acquire) {
            return Err(SmuxError::GoAway);
        }

        // The counter never moves past the wrap point, so concurrent callers
        // cannot be handed an ID from the reused range.
        let advanced = self
            .next_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.wrapping_add(2);
                (next != next % 2).then_some(next)
            });

        match advanced {
            Ok(previous) => Ok(previous.wrapping_add(2)),
            Err(_) => {
                self.go_away.store(true, Ordering::Release);
                Err(SmuxError::GoAway)
            }
        }
    }

    pub fn is_go_away(&self) -> bool {
        self.go_away.load(Ordering::Acquire)
    }

    /// Checks that a SYN from the peer carries an ID of the peer's parity.
    pub fn validate_peer_stream_id(&self, stream_id: u32) -> Result<()> {
        let expected_parity = if self.is_client { 0 } else { 1 };

        if stream_id == 0 || stream_id % 2 != expected_parity {
            return Err(SmuxError::InvalidStreamId(stream_id));
        }

        Ok(())
    }
}
