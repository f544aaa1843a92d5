// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform snapshot capture and restore.

use serde::Deserialize;
use serde::Serialize;
use vmcore::save_restore::DynSaveRestore;
use vmcore::save_restore::RestoreError;
use vmcore::save_restore::SaveError;
use vmcore::save_restore::SavedStateBlob;

/// One device's saved state within a [`Snapshot`].
#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub device: String,
    pub state: SavedStateBlob,
}

/// The saved state of a set of devices.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    entries: Vec<SnapshotEntry>,
}

impl Snapshot {
    /// Saves each device in order. The first failure aborts the whole
    /// snapshot.
    pub fn capture<'a, I>(devices: I) -> Result<Self, SaveError>
    where
        I: IntoIterator<Item = (&'a str, &'a mut dyn DynSaveRestore)>,
    {
        let mut entries = Vec::new();
        for (device, dev) in devices {
            let state = dev.save().map_err(|err| {
                tracing::error!(
                    device,
                    error = &err as &dyn std::error::Error,
                    "device save failed, aborting snapshot"
                );
                SaveError::ChildError(device.to_owned(), Box::new(err))
            })?;
            tracing::debug!(device, record = state.name(), "saved device");
            entries.push(SnapshotEntry {
                device: device.to_owned(),
                state,
            });
        }
        Ok(Self { entries })
    }

    /// Restores each saved entry into the device of the same name.
    pub fn restore<'a, I>(self, devices: I) -> Result<(), RestoreError>
    where
        I: IntoIterator<Item = (&'a str, &'a mut dyn DynSaveRestore)>,
    {
        let mut devices: Vec<_> = devices.into_iter().collect();
        for entry in self.entries {
            let Some((_, dev)) = devices.iter_mut().find(|(name, _)| *name == entry.device)
            else {
                return Err(RestoreError::UnknownEntryId(entry.device));
            };
            dev.restore(entry.state)
                .map_err(|err| RestoreError::ChildError(entry.device.clone(), Box::new(err)))?;
        }
        Ok(())
    }

    pub fn entries(&self) -> &[SnapshotEntry] {
        &self.entries
    }

    /// Encodes the snapshot for transfer out of the process.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SaveError> {
        serde_json::to_vec(self).map_err(|err| SaveError::Other(err.into()))
    }

    /// Decodes a snapshot produced by [`Snapshot::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RestoreError> {
        serde_json::from_slice(bytes).map_err(|err| RestoreError::InvalidSavedState(err.into()))
    }
}
