//! Observable list of stream names with the active selection.
//!
//! Used for audio and subtitle track menus. The decode side rebuilds the list
//! whenever a file opens; the UI changes the selection and the packet loop
//! consumes the change with [`StreamList::was_changed`].

use crate::signal::Signal;
use parking_lot::Mutex;

/// No stream selected
pub const NO_STREAM: i32 = -1;

#[derive(Debug)]
struct Selection {
    list: Vec<String>,
    value: i32,
    changed: bool,
}

#[derive(Debug)]
pub struct StreamList {
    inner: Mutex<Selection>,
    /// Fired with the new value after a successful `set_value`
    pub on_changed: Signal<i32>,
}

impl StreamList {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Selection {
                list: Vec::new(),
                value: NO_STREAM,
                changed: false,
            }),
            on_changed: Signal::new(),
        }
    }

    /// Replace list and selection at once
    pub fn set_list(&self, list: Vec<String>, value: i32) {
        let mut inner = self.inner.lock();
        inner.value = if value >= 0 && (value as usize) < list.len() {
            value
        } else {
            NO_STREAM
        };
        inner.list = list;
        inner.changed = false;
    }

    pub fn clear_list(&self) {
        self.set_list(Vec::new(), NO_STREAM);
    }

    /// Select another stream. Out-of-range values are refused unless nothing
    /// is selected yet.
    pub fn set_value(&self, value: i32) -> bool {
        {
            let mut inner = self.inner.lock();
            let len = inner.list.len() as i64;
            if value < NO_STREAM
                || value == inner.value
                || (inner.value != NO_STREAM && value as i64 >= len)
            {
                return false;
            }
            inner.value = value;
            inner.changed = true;
        }
        self.on_changed.emit(&value);
        true
    }

    /// Read and reset the changed flag
    pub fn was_changed(&self) -> bool {
        std::mem::take(&mut self.inner.lock().changed)
    }

    pub fn value(&self) -> i32 {
        self.inner.lock().value
    }

    pub fn list(&self) -> Vec<String> {
        self.inner.lock().list.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Name of the active stream
    pub fn selected_name(&self) -> Option<String> {
        let inner = self.inner.lock();
        usize::try_from(inner.value).ok().and_then(|i| inner.list.get(i).cloned())
    }
}

impl Default for StreamList {
    fn default() -> Self {
        Self::new()
    }
}
