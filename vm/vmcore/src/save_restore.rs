// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for save/restore support.
//!
//! To implement save/restore for your device or state unit:
//!
//! 1. Define a saved state type and derive `serde`'s `Serialize` and
//!    `Deserialize` on it. This type needs to be stable across releases, so
//!    do not share types with your implementation even if they are currently
//!    identical.
//!
//! 2. Implement [`SavedStateRoot`] on the root of your saved state. The name
//!    and version become part of the serialized record, so you cannot change
//!    the name later, and you must bump the version whenever the layout
//!    changes.
//!
//! 3. Implement [`SaveRestore`] with your saved state as the associated type.
//!    Anything implementing it can be driven as a [`DynSaveRestore`] by the
//!    platform snapshot code.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Implemented by objects which can be saved/restored
pub trait SaveRestore {
    /// The concrete saved state type.
    type SavedState;

    /// Saves the object's state.
    fn save(&mut self) -> Result<Self::SavedState, SaveError>;
    /// Restores the object's state.
    fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError>;
}

/// Trait implemented by "root" saved state types, which are ones that either
/// form the root of a saved state tree, or at points in the tree where the
/// type is not known at compile time.
pub trait SavedStateRoot: 'static + Send + Serialize + DeserializeOwned {
    /// The externally visible record name.
    const NAME: &'static str;
    /// The record layout version.
    const VERSION: u32;
}

/// Convenience type for objects that have no saved state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoSavedState;

impl SavedStateRoot for NoSavedState {
    const NAME: &'static str = "save_restore.NoSavedState";
    const VERSION: u32 = 1;
}

/// Trait implemented by objects that implement `SaveRestore` with an
/// associated type that can be carried as an opaque [`SavedStateBlob`].
pub trait DynSaveRestore {
    /// Save the object.
    fn save(&mut self) -> Result<SavedStateBlob, SaveError>;
    /// Restore the object.
    fn restore(&mut self, state: SavedStateBlob) -> Result<(), RestoreError>;
}

impl<T: SaveRestore> DynSaveRestore for T
where
    T::SavedState: SavedStateRoot,
{
    fn save(&mut self) -> Result<SavedStateBlob, SaveError> {
        Ok(SavedStateBlob::new(SaveRestore::save(self)?)?)
    }

    fn restore(&mut self, state: SavedStateBlob) -> Result<(), RestoreError> {
        SaveRestore::restore(self, state.parse()?)
    }
}

/// An opaque saved state blob, tagged with the name and version of the root
/// type it was created from.
///
/// The record is held in its encoded form, so blobs (and anything built out
/// of them) can be serialized and carried out of the process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedStateBlob {
    name: String,
    version: u32,
    state: serde_json::Value,
}

impl SavedStateBlob {
    /// Encodes `data` into a blob.
    pub fn new<T: SavedStateRoot>(data: T) -> Result<Self, BlobError> {
        let state = serde_json::to_value(data).map_err(|source| BlobError::Encode {
            name: T::NAME,
            source,
        })?;
        Ok(Self {
            name: T::NAME.to_owned(),
            version: T::VERSION,
            state,
        })
    }

    /// The name of the record held by this blob.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version of the record held by this blob.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Decodes the blob into `T`, checking the record name and version.
    pub fn parse<T: SavedStateRoot>(self) -> Result<T, BlobError> {
        if self.name != T::NAME {
            return Err(BlobError::NameMismatch {
                expected: T::NAME,
                found: self.name,
            });
        }
        if self.version != T::VERSION {
            return Err(BlobError::VersionMismatch {
                name: T::NAME,
                expected: T::VERSION,
                found: self.version,
            });
        }
        serde_json::from_value(self.state).map_err(|source| BlobError::Decode {
            name: T::NAME,
            source,
        })
    }
}

/// An error encoding or decoding a [`SavedStateBlob`].
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("saved state record {found} does not match expected record {expected}")]
    NameMismatch {
        expected: &'static str,
        found: String,
    },
    #[error("saved state record {name} has version {found}, expected {expected}")]
    VersionMismatch {
        name: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("failed to encode saved state record {name}")]
    Encode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode saved state record {name}")]
    Decode {
        name: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// A restore error.
#[derive(Debug, thiserror::Error)]
pub enum RestoreError {
    /// unknown entry ID
    #[error("unknown entry id: {0}")]
    UnknownEntryId(String),
    /// restore failure in a child object
    #[error("failed to restore child device {0}")]
    ChildError(String, #[source] Box<RestoreError>),
    /// failure to unwrap a saved state blob
    #[error("failed to decode saved state")]
    Blob(#[from] BlobError),
    /// this object does not support save state
    #[error("unexpected saved state")]
    SavedStateNotSupported,
    /// custom saved state corruption error
    #[error("saved state is invalid")]
    InvalidSavedState(#[source] anyhow::Error),
    /// non-state-related restore failure
    #[error(transparent)]
    Other(anyhow::Error),
}

/// A save error.
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// This object does not support saved state.
    #[error("save state not supported")]
    NotSupported,
    /// Save failed in child object.
    #[error("failed to save child device {0}")]
    ChildError(String, #[source] Box<SaveError>),
    /// Save failed due to some other error.
    #[error(transparent)]
    Other(anyhow::Error),
    /// The child saved state is invalid.
    #[error("child saved state is invalid")]
    InvalidChildSavedState(#[source] anyhow::Error),
    /// The saved state could not be encoded.
    #[error("failed to encode saved state")]
    Blob(#[from] BlobError),
}
