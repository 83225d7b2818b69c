use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters that decide when a request may be issued and when the stream
/// is exhausted.
///
/// Indices are absolute positions in the source. The controller covers the
/// half-open range `first..end`; `end == None` means the sequence is
/// open-ended. Delivery order never depends on these counters beyond
/// `next_deliver`, which the consumer alone advances.
#[derive(Debug)]
pub struct WindowController {
    window_size: usize,
    first: usize,
    end: Option<usize>,
    requested: AtomicUsize,
    completed: AtomicUsize,
    next_deliver: AtomicUsize,
    pending: AtomicUsize,
    peak_pending: AtomicUsize,
}

impl WindowController {
    pub fn new(window_size: usize, first: usize, end: Option<usize>) -> Self {
        debug_assert!(window_size >= 1, "window size must be at least 1");
        Self {
            window_size,
            first,
            end,
            requested: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            next_deliver: AtomicUsize::new(first),
            pending: AtomicUsize::new(0),
            peak_pending: AtomicUsize::new(0),
        }
    }

    /// Claims the next index to request, or `None` when the range is
    /// exhausted or the window is already full.
    pub fn reserve_next(&self) -> Option<usize> {
        let mut requested = self.requested.load(Ordering::Acquire);
        loop {
            let index = self.first + requested;
            if self.end.is_some_and(|end| index >= end) {
                return None;
            }
            if index >= self.next_deliver.load(Ordering::Acquire) + self.window_size {
                return None;
            }
            match self.requested.compare_exchange_weak(
                requested,
                requested + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let pending = self.pending.fetch_add(1, Ordering::AcqRel) + 1;
                    self.peak_pending.fetch_max(pending, Ordering::AcqRel);
                    return Some(index);
                }
                Err(actual) => requested = actual,
            }
        }
    }

    /// Number of requests needed to fill the window from a cold start.
    pub fn initial_requests(&self) -> usize {
        match self.end {
            Some(end) => self.window_size.min(end.saturating_sub(self.first)),
            None => self.window_size,
        }
    }

    pub fn record_completion(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |p| p.checked_sub(1));
    }

    /// Moves the delivery cursor past the frame just handed out.
    pub fn advance_delivery(&self) -> usize {
        self.next_deliver.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn is_exhausted(&self) -> bool {
        self.end
            .is_some_and(|end| self.next_deliver.load(Ordering::Acquire) >= end)
    }

    pub fn next_deliver(&self) -> usize {
        self.next_deliver.load(Ordering::Acquire)
    }

    pub fn requested_count(&self) -> usize {
        self.requested.load(Ordering::Acquire)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::Acquire)
    }

    /// Requests issued whose callback has not fired yet.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Highest value `pending` has reached.
    pub fn peak_pending(&self) -> usize {
        self.peak_pending.load(Ordering::Acquire)
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn first(&self) -> usize {
        self.first
    }

    pub fn end(&self) -> Option<usize> {
        self.end
    }
}
