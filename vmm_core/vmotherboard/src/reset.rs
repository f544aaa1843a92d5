// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform-wide reset dispatch.
//!
//! Devices that need to reinitialize on every platform reset register a
//! callback with the [`ResetDispatcher`]. Callbacks run in registration order
//! on the thread that calls [`ResetDispatcher::reset_all`].

use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::Weak;

type ResetCallback = Box<dyn FnMut() + Send>;

struct Entry {
    id: u64,
    name: Arc<str>,
    callback: ResetCallback,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// The platform reset dispatcher. Cheap to clone; all clones share the same
/// set of callbacks.
#[derive(Clone, Default)]
pub struct ResetDispatcher {
    inner: Arc<Mutex<Inner>>,
}

impl ResetDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to run on every platform reset. The callback is
    /// unregistered when the returned handle is dropped.
    ///
    /// Callbacks must not register or drop reset registrations themselves.
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        callback: impl FnMut() + Send + 'static,
    ) -> ResetRegistration {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let name = name.into();
        tracing::debug!(name = &*name, "registered reset callback");
        inner.entries.push(Entry {
            id,
            name,
            callback: Box::new(callback),
        });
        ResetRegistration {
            dispatcher: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Runs every registered callback, in registration order.
    pub fn reset_all(&self) {
        let mut inner = self.inner.lock();
        tracing::info!(count = inner.entries.len(), "platform reset");
        for entry in &mut inner.entries {
            tracing::trace!(name = &*entry.name, "reset");
            (entry.callback)();
        }
    }

    /// The names of the registered callbacks, in registration order.
    pub fn registered(&self) -> Vec<Arc<str>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }
}

/// Keeps a reset callback registered for as long as it is alive.
#[must_use]
pub struct ResetRegistration {
    dispatcher: Weak<Mutex<Inner>>,
    id: u64,
}

impl std::fmt::Debug for ResetRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for ResetRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.lock().entries.retain(|entry| entry.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use test_with_tracing::test;

    #[test]
    fn callbacks_run_in_order() {
        let dispatcher = ResetDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = dispatcher.register("a", {
            let log = log.clone();
            move || log.lock().push("a")
        });
        let _b = dispatcher.register("b", {
            let log = log.clone();
            move || log.lock().push("b")
        });

        dispatcher.reset_all();
        dispatcher.reset_all();
        assert_eq!(*log.lock(), ["a", "b", "a", "b"]);
    }

    #[test]
    fn dropping_registration_unregisters() {
        let dispatcher = ResetDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let registration = dispatcher.register("counter", {
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        dispatcher.reset_all();
        assert_eq!(dispatcher.registered().len(), 1);

        drop(registration);
        dispatcher.reset_all();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(dispatcher.registered().is_empty());
    }

    #[test]
    fn registration_outlives_dispatcher() {
        let dispatcher = ResetDispatcher::new();
        let registration = dispatcher.register("late", || {});
        drop(dispatcher);
        drop(registration);
    }
}
