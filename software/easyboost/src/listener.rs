//! Single-slot change notification.

use std::fmt;

/// Holds at most one callback for a signal.
/// Registering a new callback drops the previous one.
pub struct Listener<T> {
    callback: Option<Box<dyn FnMut(T)>>,
}

impl<T> Listener<T> {
    pub fn new() -> Self {
        Self { callback: None }
    }

    /// Replace the current subscriber, if any
    pub fn set(&mut self, callback: Box<dyn FnMut(T)>) {
        self.callback = Some(callback);
    }

    pub fn clear(&mut self) {
        self.callback = None;
    }

    pub fn is_set(&self) -> bool {
        self.callback.is_some()
    }

    /// Invoke the subscriber synchronously. Does nothing when the slot is empty.
    pub fn notify(&mut self, value: T) {
        if let Some(cb) = self.callback.as_mut() {
            cb(value);
        }
    }
}

impl<T> Default for Listener<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("is_set", &self.is_set())
            .finish()
    }
}
