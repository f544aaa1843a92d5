// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Notable Exports: [`Chipset`], [`MappedRegion`]

mod io_ranges;

pub use self::io_ranges::IoRangeConflict;
pub use self::io_ranges::MappedRange;

use self::io_ranges::IoRanges;
use chipset_device::ChipsetDevice;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use parking_lot::Mutex;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::Weak;

/// The platform bus address space: routes guest MMIO accesses to the devices
/// that claimed the addressed region.
#[derive(Clone)]
pub struct Chipset {
    mmio_ranges: IoRanges,
}

enum IoType<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl Default for Chipset {
    fn default() -> Self {
        Self::new()
    }
}

impl Chipset {
    pub fn new() -> Self {
        Self {
            mmio_ranges: IoRanges::new(),
        }
    }

    /// Maps `range` to `dev`. The mapping is removed when the returned handle
    /// is dropped.
    pub fn map_mmio(
        &self,
        dev_name: impl Into<Arc<str>>,
        region_name: impl Into<Arc<str>>,
        range: RangeInclusive<u64>,
        dev: Weak<Mutex<dyn ChipsetDevice>>,
    ) -> Result<MappedRegion, IoRangeConflict> {
        let dev_name = dev_name.into();
        let region_name = region_name.into();
        self.mmio_ranges.register(
            *range.start(),
            *range.end(),
            region_name.clone(),
            dev,
            dev_name.clone(),
        )?;
        tracing::debug!(
            device = &*dev_name,
            region = &*region_name,
            start = range.start(),
            end = range.end(),
            "mapped mmio region"
        );
        Ok(MappedRegion {
            ranges: self.mmio_ranges.clone(),
            dev_name,
            region_name,
            range,
        })
    }

    /// Lists the currently mapped regions, in address order.
    pub fn mmio_regions(&self) -> Vec<MappedRange> {
        self.mmio_ranges.ranges()
    }

    /// Returns true if some device claims `address`.
    pub fn is_mapped(&self, address: u64) -> bool {
        self.mmio_ranges.is_occupied(address)
    }

    fn handle_io_result(
        &self,
        dev_name: &str,
        region_name: &str,
        address: u64,
        io_type: IoType<'_>,
        result: IoResult,
    ) {
        let IoResult::Err(err) = result else {
            return;
        };
        let error = match err {
            IoError::InvalidRegister => "register not present",
            IoError::InvalidAccessSize => "invalid access size",
            IoError::UnalignedAccess => "unaligned access",
            IoError::NoDevice => "no device",
        };
        match io_type {
            IoType::Read(bytes) => {
                // Fill data with !0 to indicate an error to the guest.
                bytes.fill(!0);
                tracing::warn!(
                    device = dev_name,
                    region = region_name,
                    address,
                    len = bytes.len(),
                    error,
                    "device mmio read error"
                );
            }
            IoType::Write(bytes) => tracing::warn!(
                device = dev_name,
                region = region_name,
                address,
                len = bytes.len(),
                error,
                ?bytes,
                "device mmio write error"
            ),
        }
    }

    /// Dispatch a MMIO read to the given address.
    pub fn mmio_read(&self, address: u64, data: &mut [u8]) {
        let Some(lookup) = self.mmio_ranges.lookup(address) else {
            self.handle_io_result(
                "<unknown>",
                "<unmapped>",
                address,
                IoType::Read(data),
                IoResult::Err(IoError::NoDevice),
            );
            return;
        };
        let r = match lookup.dev.lock().supports_mmio() {
            Some(mmio) => mmio.mmio_read(address, data),
            None => IoResult::Err(IoError::InvalidRegister),
        };
        self.handle_io_result(
            &lookup.dev_name,
            &lookup.region_name,
            address,
            IoType::Read(data),
            r,
        );
    }

    /// Dispatch a MMIO write to the given address.
    pub fn mmio_write(&self, address: u64, data: &[u8]) {
        let Some(lookup) = self.mmio_ranges.lookup(address) else {
            self.handle_io_result(
                "<unknown>",
                "<unmapped>",
                address,
                IoType::Write(data),
                IoResult::Err(IoError::NoDevice),
            );
            return;
        };
        let r = match lookup.dev.lock().supports_mmio() {
            Some(mmio) => mmio.mmio_write(address, data),
            None => IoResult::Err(IoError::InvalidRegister),
        };
        self.handle_io_result(
            &lookup.dev_name,
            &lookup.region_name,
            address,
            IoType::Write(data),
            r,
        );
    }
}

/// An MMIO region mapped into the [`Chipset`]. Unmapped on drop.
#[must_use]
pub struct MappedRegion {
    ranges: IoRanges,
    dev_name: Arc<str>,
    region_name: Arc<str>,
    range: RangeInclusive<u64>,
}

impl MappedRegion {
    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    pub fn range(&self) -> RangeInclusive<u64> {
        self.range.clone()
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("dev_name", &self.dev_name)
            .field("region_name", &self.region_name)
            .field("range", &format_args!("{:#x?}", self.range))
            .finish()
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        self.ranges.revoke(*self.range.start());
        tracing::debug!(
            device = &*self.dev_name,
            region = &*self.region_name,
            "unmapped mmio region"
        );
    }
}
