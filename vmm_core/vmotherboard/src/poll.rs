// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device poll dispatch.
//!
//! Devices that pick up work completed elsewhere register with the
//! [`PollDispatcher`]. Each registration gets its own waker. When a waker
//! fires, the device is marked pending, and the next
//! [`PollDispatcher::run_pending`] call on the control thread invokes its
//! [`PollDevice::poll_device`](chipset_device::poll_device::PollDevice).

use chipset_device::ChipsetDevice;
use futures::task::ArcWake;
use futures::task::AtomicWaker;
use futures::task::waker_ref;
use parking_lot::Mutex;
use std::future::poll_fn;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;

/// Wakes whoever is waiting in [`PollDispatcher::wait`].
#[derive(Default)]
struct Notify {
    waker: AtomicWaker,
}

struct PollEvent {
    pending: AtomicBool,
    notify: Arc<Notify>,
}

impl ArcWake for PollEvent {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.pending.store(true, Ordering::SeqCst);
        arc_self.notify.waker.wake();
    }
}

struct Entry {
    id: u64,
    name: Arc<str>,
    device: Weak<Mutex<dyn ChipsetDevice>>,
    event: Arc<PollEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
}

/// The platform poll dispatcher. Cheap to clone; all clones share the same
/// set of registrations.
#[derive(Clone, Default)]
pub struct PollDispatcher {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl PollDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `device` to be polled. The device is polled at least once,
    /// on the next [`run_pending`](Self::run_pending), and then whenever the
    /// waker it was last polled with is woken. It is unregistered when the
    /// returned handle is dropped.
    pub fn register(
        &self,
        name: impl Into<Arc<str>>,
        device: Weak<Mutex<dyn ChipsetDevice>>,
    ) -> PollRegistration {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        let name = name.into();
        tracing::debug!(name = &*name, "registered poll device");
        inner.entries.push(Entry {
            id,
            name,
            device,
            event: Arc::new(PollEvent {
                pending: AtomicBool::new(true),
                notify: self.notify.clone(),
            }),
        });
        self.notify.waker.wake();
        PollRegistration {
            dispatcher: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Polls every device whose waker fired since it was last polled.
    /// Returns the number of devices polled.
    pub fn run_pending(&self) -> usize {
        // Collect first so devices can be polled without holding the
        // registration lock.
        let pending: Vec<_> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.event.pending.swap(false, Ordering::SeqCst))
            .map(|entry| (entry.name.clone(), entry.device.clone(), entry.event.clone()))
            .collect();

        let mut polled = 0;
        for (name, device, event) in pending {
            let Some(device) = device.upgrade() else {
                continue;
            };
            let mut device = device.lock();
            let Some(poll) = device.supports_poll_device() else {
                tracing::warn!(name = &*name, "registered device does not support polling");
                continue;
            };
            tracing::trace!(name = &*name, "poll");
            poll.poll_device(&mut Context::from_waker(&waker_ref(&event)));
            polled += 1;
        }
        polled
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        self.notify.waker.register(cx.waker());
        let any_pending = self
            .inner
            .lock()
            .entries
            .iter()
            .any(|entry| entry.event.pending.load(Ordering::SeqCst));
        if any_pending {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Waits until at least one registered device needs polling.
    pub async fn wait(&self) {
        poll_fn(|cx| self.poll_ready(cx)).await
    }

    /// The names of the registered devices, in registration order.
    pub fn registered(&self) -> Vec<Arc<str>> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.name.clone())
            .collect()
    }
}

/// Keeps a device registered for polling for as long as it is alive.
#[must_use]
pub struct PollRegistration {
    dispatcher: Weak<Mutex<Inner>>,
    id: u64,
}

impl std::fmt::Debug for PollRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollRegistration")
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for PollRegistration {
    fn drop(&mut self) {
        if let Some(inner) = self.dispatcher.upgrade() {
            inner.lock().entries.retain(|entry| entry.id != self.id);
        }
    }
}
