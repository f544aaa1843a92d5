// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Exports [`IoRanges`], which models the 64-bit MMIO address space with
//! certain regions "claimed" by [`ChipsetDevice`]s.

use chipset_device::ChipsetDevice;
use parking_lot::Mutex;
use parking_lot::RwLock;
use range_map_vec::RangeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::Weak;

struct IoRangesInner {
    map: RangeMap<u64, RangeEntry>,
}

#[derive(Debug, Clone)]
pub struct IoRangeConflict {
    existing_dev_region: (Arc<str>, Arc<str>, RangeInclusive<u64>),
    conflict_dev_region: (Arc<str>, Arc<str>, RangeInclusive<u64>),
}

impl IoRangeConflict {
    /// The name of the region that could not be mapped.
    pub fn region_name(&self) -> &str {
        &self.conflict_dev_region.1
    }

    /// The device and region names of the mapping already in place.
    pub fn existing(&self) -> (&str, &str) {
        (&self.existing_dev_region.0, &self.existing_dev_region.1)
    }
}

impl std::error::Error for IoRangeConflict {}
impl std::fmt::Display for IoRangeConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{:#x?} conflicts with existing {}/{}:{:#x?}",
            self.conflict_dev_region.0,
            self.conflict_dev_region.1,
            self.conflict_dev_region.2,
            self.existing_dev_region.0,
            self.existing_dev_region.1,
            self.existing_dev_region.2,
        )
    }
}

struct RangeEntry {
    region_name: Arc<str>,
    dev_name: Arc<str>,
    dev: Weak<Mutex<dyn ChipsetDevice>>,
}

/// A snapshot of one mapped region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedRange {
    pub dev_name: Arc<str>,
    pub region_name: Arc<str>,
    pub range: RangeInclusive<u64>,
}

#[derive(Clone)]
pub struct IoRanges {
    inner: Arc<RwLock<IoRangesInner>>,
}

impl IoRanges {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(IoRangesInner {
                map: RangeMap::new(),
            })),
        }
    }

    pub fn register(
        &self,
        start: u64,
        end: u64,
        region_name: Arc<str>,
        dev: Weak<Mutex<dyn ChipsetDevice>>,
        dev_name: Arc<str>,
    ) -> Result<(), IoRangeConflict> {
        let mut inner = self.inner.write();
        match inner.map.entry(start..=end) {
            range_map_vec::Entry::Vacant(entry) => {
                entry.insert(RangeEntry {
                    region_name,
                    dev_name,
                    dev,
                });
                Ok(())
            }
            range_map_vec::Entry::Overlapping(entry) => {
                let (existing_start, existing_end, existing) = entry.get();
                Err(IoRangeConflict {
                    existing_dev_region: (
                        existing.dev_name.clone(),
                        existing.region_name.clone(),
                        *existing_start..=*existing_end,
                    ),
                    conflict_dev_region: (dev_name, region_name, start..=end),
                })
            }
        }
    }

    pub fn revoke(&self, start: u64) {
        let mut inner = self.inner.write();
        inner.map.remove(&start);
    }

    /// Returns the device claiming `addr`, if it is still alive.
    pub fn lookup(&self, addr: u64) -> Option<LookupResult> {
        let inner = self.inner.read();
        let entry = inner.map.get(&addr)?;
        Some(LookupResult {
            dev: entry.dev.upgrade()?,
            dev_name: entry.dev_name.clone(),
            region_name: entry.region_name.clone(),
        })
    }

    pub fn is_occupied(&self, addr: u64) -> bool {
        self.inner.read().map.contains(&addr)
    }

    /// Lists the mapped ranges in ascending address order.
    pub fn ranges(&self) -> Vec<MappedRange> {
        // The map keeps its entries highest address first.
        self.inner
            .read()
            .map
            .iter()
            .rev()
            .map(|(range, entry)| MappedRange {
                dev_name: entry.dev_name.clone(),
                region_name: entry.region_name.clone(),
                range: *range.start()..=*range.end(),
            })
            .collect()
    }
}

pub struct LookupResult {
    pub dev: Arc<Mutex<dyn ChipsetDevice>>,
    pub dev_name: Arc<str>,
    pub region_name: Arc<str>,
}
