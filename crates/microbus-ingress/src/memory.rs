//! Admission control on the memory held by request bodies.
//!
//! Bodies are held twice while a request is in flight, once as read from the
//! client and once as handed to the bus, so reservations are capped at half
//! of the configured limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use microbus_telemetry::metrics::set_ingress_request_memory;

/// Shared request memory budget.
#[derive(Debug)]
pub struct MemoryLimiter {
    used: AtomicUsize,
    limit: AtomicUsize,
}

impl MemoryLimiter {
    /// Creates a limiter with a total limit in bytes.
    #[must_use]
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        })
    }

    /// Changes the limit. Existing reservations are kept.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    /// The total limit in bytes.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::SeqCst)
    }

    /// The most that can be reserved at once.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.limit() / 2
    }

    /// Bytes currently reserved.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Opens an empty reservation.
    #[must_use]
    pub fn reservation(self: &Arc<Self>) -> Reservation {
        Reservation {
            limiter: Arc::clone(self),
            bytes: 0,
        }
    }

    fn try_acquire(&self, bytes: usize) -> bool {
        let capacity = self.capacity();
        let acquired = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(bytes).filter(|total| *total <= capacity)
            })
            .is_ok();
        if acquired {
            set_ingress_request_memory(self.used());
        }
        acquired
    }

    fn release(&self, bytes: usize) {
        self.used.fetch_sub(bytes, Ordering::SeqCst);
        set_ingress_request_memory(self.used());
    }
}

/// Memory reserved by one request, released on drop.
#[derive(Debug)]
pub struct Reservation {
    limiter: Arc<MemoryLimiter>,
    bytes: usize,
}

impl Reservation {
    /// Reserves `bytes` more. Returns `false`, reserving nothing, if that
    /// would exceed the capacity.
    pub fn grow(&mut self, bytes: usize) -> bool {
        if bytes == 0 {
            return true;
        }
        if self.limiter.try_acquire(bytes) {
            self.bytes += bytes;
            true
        } else {
            false
        }
    }

    /// Bytes held by this reservation.
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.bytes > 0 {
            self.limiter.release(self.bytes);
        }
    }
}
