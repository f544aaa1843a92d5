// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and traits to model chipset devices.

#![forbid(unsafe_code)]

/// Implemented by any device that is considered part of the guest's "chipset"
/// (insofar as it exists on one or more system busses).
//
// DEVNOTE: keep this crate free of save/restore and configuration bounds, so
// that test devices stay cheap to write.
pub trait ChipsetDevice: 'static + Send {
    /// Optionally returns a trait object to send MMIO intercepts to.
    #[inline(always)]
    fn supports_mmio(&mut self) -> Option<&mut dyn mmio::MmioIntercept> {
        None
    }

    /// Optionally returns a trait object to send poll requests to.
    #[inline(always)]
    fn supports_poll_device(&mut self) -> Option<&mut dyn poll_device::PollDevice> {
        None
    }
}

pub mod io;
pub mod mmio;
pub mod poll_device;
