//! Synchronous event fan-out.
//!
//! Listeners run inline on the thread that fires, in subscription order, so
//! head-changed notifications observe the same order as the writes that
//! produced them.

use parking_lot::Mutex;
use shared_types::Hash;

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

/// A list of callbacks for one event type.
pub struct EventManager<T> {
    listeners: Mutex<Vec<Listener<T>>>,
}

impl<T> EventManager<T> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener));
    }

    pub fn fire(&self, event: &T) {
        for listener in self.listeners.lock().iter() {
            listener(event);
        }
    }
}

impl<T> Default for EventManager<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fired after a block write moved the canonical head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadChanged {
    pub new_head: Hash,
    pub old_head: Hash,
    pub height: u64,
}
