// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The TPM Physical Presence Interface (PPI) region.
//!
//! A small page of RAM shared between guest firmware and the OS. The OS
//! queues physical presence requests through the ACPI fields declared over
//! it, and firmware acts on them across a reboot. The region is not cleared
//! on reset.

use crate::TPM_PPI_ADDR_SIZE;
use acpi::dsdt::Device;
use acpi::dsdt::Field;
use acpi::dsdt::FieldAccessType;
use acpi::dsdt::FieldLockRule;
use acpi::dsdt::FieldUpdateRule;
use acpi::dsdt::OperationRegion;
use acpi::dsdt::RegionSpace;
use chipset_device::ChipsetDevice;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::MmioIntercept;
use std::ops::Range;

/// Offset of the PPI request/response structure (the `TPP2` region).
const PPI_STRUCT_OFFSET: u64 = 0x100;
const PPI_STRUCT_SIZE: u64 = 0x5a;
/// Offset of the memory overwrite request byte (the `TPP3` region).
const PPI_MOVV_OFFSET: u64 = 0x15a;

/// Builds and maintains the PPI part of a TPM device.
pub trait PpiBuilder: ChipsetDevice {
    /// Runs on every device reset.
    fn reset(&mut self);

    /// Appends the PPI objects to the TPM device node.
    fn build_firmware_fragment(&self, device: &mut Device);
}

/// RAM-backed PPI region.
pub struct PpiRegion {
    base: u64,
    ram: Vec<u8>,
    memory_clear_requested: bool,
}

impl PpiRegion {
    /// Returns a zeroed region to be mapped at `base`.
    pub fn new(base: u64) -> Self {
        Self {
            base,
            ram: vec![0; TPM_PPI_ADDR_SIZE as usize],
            memory_clear_requested: false,
        }
    }

    /// Whether the guest asked for memory to be cleared as of the last reset.
    pub fn memory_clear_requested(&self) -> bool {
        self.memory_clear_requested
    }

    fn range(&self, addr: u64, len: usize) -> Option<Range<usize>> {
        let start = usize::try_from(addr.checked_sub(self.base)?).ok()?;
        let end = start.checked_add(len)?;
        (end <= self.ram.len()).then_some(start..end)
    }
}

impl PpiBuilder for PpiRegion {
    fn reset(&mut self) {
        self.memory_clear_requested = self.ram[PPI_MOVV_OFFSET as usize] & 0x1 != 0;
        if self.memory_clear_requested {
            tracing::warn!("guest requested a memory overwrite on reset");
        }
    }

    fn build_firmware_fragment(&self, device: &mut Device) {
        device.add_object(&OperationRegion::new(
            b"TPP2",
            RegionSpace::SystemMemory,
            self.base + PPI_STRUCT_OFFSET,
            PPI_STRUCT_SIZE,
        ));
        let mut field = Field::new(
            b"TPP2",
            FieldAccessType::AnyAcc,
            FieldLockRule::NoLock,
            FieldUpdateRule::Preserve,
        );
        field.add_named_field(b"PPIN", 8);
        field.add_named_field(b"PPIP", 32);
        field.add_named_field(b"PPRP", 32);
        field.add_named_field(b"PPRQ", 32);
        field.add_named_field(b"PPRM", 32);
        field.add_named_field(b"LPPR", 32);
        device.add_object(&field);

        device.add_object(&OperationRegion::new(
            b"TPP3",
            RegionSpace::SystemMemory,
            self.base + PPI_MOVV_OFFSET,
            1,
        ));
        let mut field = Field::new(
            b"TPP3",
            FieldAccessType::ByteAcc,
            FieldLockRule::NoLock,
            FieldUpdateRule::Preserve,
        );
        field.add_named_field(b"MOVV", 8);
        device.add_object(&field);
    }
}

impl ChipsetDevice for PpiRegion {
    fn supports_mmio(&mut self) -> Option<&mut dyn MmioIntercept> {
        Some(self)
    }
}

impl MmioIntercept for PpiRegion {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        let Some(range) = self.range(addr, data.len()) else {
            return IoResult::Err(IoError::InvalidAccessSize);
        };
        data.copy_from_slice(&self.ram[range]);
        IoResult::Ok
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> IoResult {
        let Some(range) = self.range(addr, data.len()) else {
            return IoResult::Err(IoError::InvalidAccessSize);
        };
        tracing::trace!(addr, len = data.len(), "tpm ppi write");
        self.ram[range].copy_from_slice(data);
        IoResult::Ok
    }
}

mod save_restore {
    use super::*;
    use vmcore::save_restore::RestoreError;
    use vmcore::save_restore::SaveError;
    use vmcore::save_restore::SaveRestore;

    mod state {
        use serde::Deserialize;
        use serde::Serialize;
        use vmcore::save_restore::SavedStateRoot;

        #[derive(Serialize, Deserialize)]
        pub struct SavedState {
            pub ram: Vec<u8>,
        }

        impl SavedStateRoot for SavedState {
            const NAME: &'static str = "tpm-crb.ppi";
            const VERSION: u32 = 1;
        }
    }

    impl SaveRestore for PpiRegion {
        type SavedState = state::SavedState;

        fn save(&mut self) -> Result<Self::SavedState, SaveError> {
            Ok(state::SavedState {
                ram: self.ram.clone(),
            })
        }

        fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError> {
            let state::SavedState { ram } = state;
            if ram.len() != self.ram.len() {
                return Err(RestoreError::InvalidSavedState(anyhow::anyhow!(
                    "expected {} bytes of ppi ram, found {}",
                    self.ram.len(),
                    ram.len()
                )));
            }
            self.ram = ram;
            Ok(())
        }
    }
}
