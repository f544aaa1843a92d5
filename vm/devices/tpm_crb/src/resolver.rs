// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resolver for TPM CRB device handles.

use crate::TpmCrb;
use crate::TpmCrbConfig;
use crate::backend::TpmBackend;
use crate::crb::CrbEngine;
use crate::ppi::PpiRegion;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tpm_crb_resources::TpmCrbDeviceHandle;

/// The TPM backends available to the VM, by id.
#[derive(Clone, Default)]
pub struct TpmBackendRegistry {
    backends: HashMap<String, Arc<dyn TpmBackend>>,
}

impl TpmBackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `backend` as `id`, replacing any previous backend of that id.
    pub fn insert(&mut self, id: impl Into<String>, backend: Arc<dyn TpmBackend>) {
        self.backends.insert(id.into(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn TpmBackend>> {
        self.backends.get(id).cloned()
    }
}

#[derive(Debug, Error)]
pub enum ResolveTpmCrbError {
    #[error("unknown tpm backend `{0}`")]
    UnknownBackend(String),
}

/// Turns a [`TpmCrbDeviceHandle`] into a device.
pub struct TpmCrbResolver<'a> {
    backends: &'a TpmBackendRegistry,
}

impl<'a> TpmCrbResolver<'a> {
    pub fn new(backends: &'a TpmBackendRegistry) -> Self {
        Self { backends }
    }

    /// Resolves the handle's options into a device configuration.
    ///
    /// A handle without a backend resolves successfully; the device reports
    /// the missing backend when it is realized.
    pub fn resolve_config(
        &self,
        resource: &TpmCrbDeviceHandle,
    ) -> Result<TpmCrbConfig, ResolveTpmCrbError> {
        let backend = resource
            .tpmdev
            .as_deref()
            .map(|id| {
                self.backends
                    .get(id)
                    .ok_or_else(|| ResolveTpmCrbError::UnknownBackend(id.to_owned()))
            })
            .transpose()?;

        Ok(TpmCrbConfig {
            backend,
            ppi: resource.ppi,
        })
    }

    /// Builds an unrealized device named `name` from `resource`.
    pub fn resolve(
        &self,
        name: impl Into<Arc<str>>,
        resource: &TpmCrbDeviceHandle,
    ) -> Result<TpmCrb<CrbEngine, PpiRegion>, ResolveTpmCrbError> {
        let config = self.resolve_config(resource)?;
        Ok(TpmCrb::with_config(name, config))
    }
}
