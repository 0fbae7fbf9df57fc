//! Characters waiting for the engine to become ready.

use crate::actor::FormId;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::mem;

/// A de-duplicating set of pending identities.
///
/// [`flush`](Self::flush) swaps the whole set out before processing it, so
/// identities pushed while a flush runs (even from inside the callback) land
/// in a fresh set and are picked up by the same flush loop.
#[derive(Debug, Default)]
pub struct DeferredQueue {
    pending: Mutex<BTreeSet<FormId>>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an identity. Returns false if it was already queued.
    pub fn push(&self, id: FormId) -> bool {
        self.pending.lock().insert(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }

    /// Drain the queue, calling `apply` once per identity with no lock held.
    /// Returns how many identities were processed.
    pub fn flush(&self, mut apply: impl FnMut(FormId)) -> usize {
        let mut processed = 0;
        loop {
            let batch = mem::take(&mut *self.pending.lock());
            if batch.is_empty() {
                return processed;
            }
            for id in batch {
                apply(id);
                processed += 1;
            }
        }
    }
}
