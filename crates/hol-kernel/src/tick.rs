//! Logical time. Nothing in the ledger reads a wall clock; every ordering value
//! comes from a [`TickSource`] or a per-chain [`TickAllocator`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Logical ordering unit within a chain. Tick 0 is the genesis anchor.
pub type Tick = u64;

/// Ledger-wide logical clock used to stamp receipts and read windows.
pub trait TickSource: Send + Sync {
    fn now(&self) -> u64;

    /// Advance and return the new value.
    fn advance(&self) -> u64;

    /// Move the clock forward to at least `value` (used when recovering a journal).
    fn observe(&self, value: u64);
}

#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
        }
    }
}

impl TickSource for LogicalClock {
    fn now(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }

    fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe(&self, value: u64) {
        self.value.fetch_max(value, Ordering::SeqCst);
    }
}

/// Per-chain monotonic tick allocator. Writers race on [`TickAllocator::claim`];
/// the loser observes the tick that is actually next.
#[derive(Debug)]
pub struct TickAllocator {
    next: AtomicU64,
}

impl TickAllocator {
    pub fn new(next: Tick) -> Self {
        Self {
            next: AtomicU64::new(next),
        }
    }

    pub fn peek(&self) -> Tick {
        self.next.load(Ordering::Acquire)
    }

    /// Claim `tick` if it is the next tick to allocate. On failure returns the
    /// tick the caller should retry with.
    pub fn claim(&self, tick: Tick) -> Result<Tick, Tick> {
        self.next
            .compare_exchange(tick, tick + 1, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| tick)
    }

    /// Move the allocator to `next`, after recovery or to give back a claim
    /// that did not commit.
    pub(crate) fn reset(&self, next: Tick) {
        self.next.store(next, Ordering::Release);
    }
}

/// Cooperative cancellation for long replays. A cancelled replay persists nothing.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
