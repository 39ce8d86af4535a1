//! Cooperative cancellation for source operations
//!
//! Each source owns one [`CancellationEpoch`]: a generation counter plus a
//! count of operations still running under any generation. Superseding an
//! operation is a two step protocol:
//!
//! 1. [`CancellationEpoch::bump`] advances the generation. Tokens issued
//!    earlier become stale and their operations stop at the next checkpoint.
//! 2. [`CancellationEpoch::acknowledged`] resolves once every running
//!    operation has unwound. Only then may the new operation touch the
//!    source's decoder or scratch memory.
//!
//! A stale operation finishes with [`Outcome::Cancelled`], which is an
//! ordinary value rather than an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::trace;

/// Result of an operation that may be superseded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Outcome::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Generation a token was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancellationToken {
    generation: u64,
}

impl CancellationToken {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

struct EpochInner {
    generation: AtomicU64,
    in_flight: watch::Sender<usize>,
}

/// Generation counter plus acknowledgement signal
#[derive(Clone)]
pub struct CancellationEpoch {
    inner: Arc<EpochInner>,
}

impl Default for CancellationEpoch {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationEpoch {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0);
        Self {
            inner: Arc::new(EpochInner {
                generation: AtomicU64::new(0),
                in_flight,
            }),
        }
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Invalidate every outstanding token and issue one for the new generation
    pub fn bump(&self) -> CancellationToken {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        trace!("Cancellation epoch advanced to {}", generation);
        CancellationToken { generation }
    }

    /// Token for the current generation
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            generation: self.generation(),
        }
    }

    /// True once `token` has been superseded
    pub fn is_cancelled(&self, token: &CancellationToken) -> bool {
        token.generation != self.generation()
    }

    /// `Cancelled` if `token` is stale, `Completed(())` otherwise
    pub fn check(&self, token: &CancellationToken) -> Outcome<()> {
        if self.is_cancelled(token) {
            Outcome::Cancelled
        } else {
            Outcome::Completed(())
        }
    }

    /// Register a running operation
    ///
    /// Returns `None` if `token` is already stale. The operation counts as
    /// in flight until the returned guard is dropped.
    pub fn begin(&self, token: &CancellationToken) -> Option<InFlightGuard> {
        if self.is_cancelled(token) {
            return None;
        }
        self.inner.in_flight.send_modify(|count| *count += 1);
        Some(InFlightGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Number of operations currently in flight
    pub fn in_flight(&self) -> usize {
        *self.inner.in_flight.borrow()
    }

    /// Resolves once no operation is in flight
    pub async fn acknowledged(&self) {
        let mut receiver = self.inner.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close while waiting
        let _ = receiver.wait_for(|count| *count == 0).await;
    }
}

/// Marks one operation as in flight until dropped
pub struct InFlightGuard {
    inner: Arc<EpochInner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}
