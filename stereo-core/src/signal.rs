//! Callback lists for change notifications.

use parking_lot::RwLock;
use std::fmt;

type Slot<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Multi-subscriber callback; slots run on the emitting thread
pub struct Signal<T> {
    slots: RwLock<Vec<Slot<T>>>,
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn connect<F>(&self, slot: F)
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.slots.write().push(Box::new(slot));
    }

    pub fn emit(&self, value: &T) {
        for slot in self.slots.read().iter() {
            slot(value);
        }
    }

    pub fn disconnect_all(&self) {
        self.slots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal").field("slots", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_emit_reaches_all_slots() {
        let signal = Signal::<i32>::new();
        let sum = Arc::new(AtomicI32::new(0));
        for _ in 0..2 {
            let sum = sum.clone();
            signal.connect(move |v| {
                sum.fetch_add(*v, Ordering::SeqCst);
            });
        }
        signal.emit(&5);
        assert_eq!(sum.load(Ordering::SeqCst), 10);

        signal.disconnect_all();
        signal.emit(&5);
        assert_eq!(sum.load(Ordering::SeqCst), 10);
        assert!(signal.is_empty());
    }
}
