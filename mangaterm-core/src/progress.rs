use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Lock-free progress of one chapter prefetch, shared between the
/// orchestrating thread, the download workers and the interaction loop.
///
/// `done` only grows and never exceeds `total`; `cancelled` flips once.
#[derive(Debug, Default)]
pub struct PrefetchProgress {
    total: AtomicUsize,
    done: AtomicUsize,
    cancelled: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProgressSnapshot {
    pub total: usize,
    pub done: usize,
    pub cancelled: bool,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.done >= self.total
    }
}

impl PrefetchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total(),
            done: self.done(),
            cancelled: self.is_cancelled(),
        }
    }

    pub(crate) fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Release);
    }

    /// Counts one finished page. Saturates at `total`.
    pub(crate) fn record_done(&self) -> usize {
        let total = self.total();
        let previous = self
            .done
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |done| {
                (done < total).then_some(done + 1)
            })
            .unwrap_or(total);
        (previous + 1).min(total)
    }
}
