//! Read-only queue-occupancy sampling.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A narrow, read-only view of some queue's current length.
///
/// The controller reads one sample per tick. By default it samples the
/// discipline's own queue; attaching a `QueueSampler` to the builder points
/// the error signal at an external queue instead - typically the downstream
/// device's transmit queue, so the controller steers the occupancy that
/// actually determines delay.
///
/// Implementations must not block: the sample is taken from inside the
/// control loop. Returning `None` means the queue cannot currently be
/// observed; the controller then keeps its previous drop probability and
/// tries again next tick.
pub trait QueueSampler: Send + Sync {
    fn sample(&self) -> Option<usize>;
}

/// A depth gauge published by whoever owns the sampled queue.
///
/// The owner stores the queue's length into the atomic as it changes; the
/// controller reads it without any coordination.
impl QueueSampler for AtomicUsize {
    fn sample(&self) -> Option<usize> {
        Some(self.load(Ordering::Relaxed))
    }
}
