// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The "virtual motherboard": the platform services that devices plug into
//! while the VM is being constructed.
//!
//! At a high level: a [`Platform`] bundles the MMIO address space
//! ([`Chipset`]), the platform-wide [`ResetDispatcher`], the
//! [`PollDispatcher`] that runs asynchronous device work on the control
//! thread, the singleton [`DeviceRegistry`], and the [`Hypervisor`] flavor
//! the VM runs under.

#![forbid(unsafe_code)]

mod chipset;
pub mod poll;
pub mod registry;
pub mod reset;
pub mod snapshot;

pub use self::chipset::Chipset;
pub use self::chipset::IoRangeConflict;
pub use self::chipset::MappedRange;
pub use self::chipset::MappedRegion;
pub use self::poll::PollDispatcher;
pub use self::registry::DeviceRegistry;
pub use self::reset::ResetDispatcher;

/// The hypervisor environment the platform runs under.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum Hypervisor {
    /// Guest firmware runs the platform reset path before devices are first
    /// touched.
    #[default]
    Standard,
    /// Paravirtualized, hardware-assisted guests (Xen HVM). Device models
    /// cannot rely on a platform reset happening before first access.
    Xen,
}

/// The platform services available to devices at construction time.
#[derive(Clone, Default)]
pub struct Platform {
    hypervisor: Hypervisor,
    chipset: Chipset,
    reset: ResetDispatcher,
    poll: PollDispatcher,
    registry: DeviceRegistry,
}

impl Platform {
    pub fn new(hypervisor: Hypervisor) -> Self {
        Self {
            hypervisor,
            ..Default::default()
        }
    }

    pub fn hypervisor(&self) -> Hypervisor {
        self.hypervisor
    }

    pub fn chipset(&self) -> &Chipset {
        &self.chipset
    }

    pub fn reset_dispatcher(&self) -> &ResetDispatcher {
        &self.reset
    }

    pub fn poll_dispatcher(&self) -> &PollDispatcher {
        &self.poll
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Runs a full platform reset.
    pub fn reset(&self) {
        self.reset.reset_all();
    }
}
