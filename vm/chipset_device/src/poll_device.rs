// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Device poll services.
//!
//! These services are used to allow an otherwise synchronous device to pick up
//! work that completed asynchronously elsewhere (on a backend thread, for
//! example). The platform calls the poll function on its control thread
//! whenever the associated waker is woken, so the device can update its state
//! with `&mut self` access and no extra synchronization.

use std::task::Context;

/// Implemented by devices which register themselves to be polled whenever the
/// associated waker is called.
pub trait PollDevice {
    /// Poll the device for asynchronous work.
    ///
    /// This is called whenever [`wake_by_ref`](std::task::Waker::wake_by_ref)
    /// is called on the waker passed in `cx.waker()`.
    fn poll_device(&mut self, cx: &mut Context<'_>);
}
