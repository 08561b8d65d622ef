//! Latest-value registers.
//!
//! The receiver publishes account-state changes (status, settings, identity,
//! refreshed token) that the orchestrator polls without blocking. Each value
//! is a latest-wins register consumed exactly once: writing replaces any
//! unread value, reading clears the register until the next write.

use parking_lot::Mutex;

/// A single-slot, read-clears register.
#[derive(Debug, Default)]
pub struct Latest<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Latest<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    /// Publish a value, replacing any unconsumed one.
    pub fn set(&self, value: T) {
        *self.slot.lock() = Some(value);
    }

    /// Consume the pending value, if any.
    pub fn take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Drop any pending value.
    pub fn clear(&self) {
        *self.slot.lock() = None;
    }
}
