// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Platform-wide device registry, used to enforce "at most one device of this
//! class" policies.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("at most one {class} device is permitted: {requested} conflicts with {existing}")]
pub struct AlreadyClaimed {
    pub class: &'static str,
    pub existing: Arc<str>,
    pub requested: Arc<str>,
}

/// Tracks which device classes have been claimed on the platform. Cheap to
/// clone; all clones share state.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    claims: Arc<Mutex<HashMap<&'static str, Arc<str>>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `class` for the device `name`. The claim is released when the
    /// returned handle is dropped.
    pub fn claim(
        &self,
        class: &'static str,
        name: impl Into<Arc<str>>,
    ) -> Result<DeviceClaim, AlreadyClaimed> {
        let name = name.into();
        let mut claims = self.claims.lock();
        if let Some(existing) = claims.get(class) {
            return Err(AlreadyClaimed {
                class,
                existing: existing.clone(),
                requested: name,
            });
        }
        claims.insert(class, name.clone());
        Ok(DeviceClaim {
            claims: Arc::downgrade(&self.claims),
            class,
            name,
        })
    }

    /// Returns the name of the device holding `class`, if any.
    pub fn owner(&self, class: &str) -> Option<Arc<str>> {
        self.claims.lock().get(class).cloned()
    }
}

/// Holds a device class claim for as long as it is alive.
#[must_use]
pub struct DeviceClaim {
    claims: Weak<Mutex<HashMap<&'static str, Arc<str>>>>,
    class: &'static str,
    name: Arc<str>,
}

impl DeviceClaim {
    pub fn class(&self) -> &'static str {
        self.class
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for DeviceClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClaim")
            .field("class", &self.class)
            .field("name", &self.name)
            .finish()
    }
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        if let Some(claims) = self.claims.upgrade() {
            claims.lock().remove(self.class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn second_claim_fails() {
        let registry = DeviceRegistry::new();
        let claim = registry.claim("tpm", "tpm0").unwrap();
        assert_eq!(claim.name(), "tpm0");
        let err = registry.claim("tpm", "tpm1").unwrap_err();
        assert_eq!(&*err.existing, "tpm0");
        assert_eq!(&*err.requested, "tpm1");
        assert_eq!(
            err.to_string(),
            "at most one tpm device is permitted: tpm1 conflicts with tpm0"
        );
    }

    #[test]
    fn classes_are_independent() {
        let registry = DeviceRegistry::new();
        let _tpm = registry.claim("tpm", "tpm0").unwrap();
        let _rtc = registry.claim("rtc", "rtc0").unwrap();
        assert_eq!(registry.owner("rtc").as_deref(), Some("rtc0"));
    }

    #[test]
    fn drop_releases_claim() {
        let registry = DeviceRegistry::new();
        let claim = registry.claim("tpm", "tpm0").unwrap();
        drop(claim);
        assert!(registry.owner("tpm").is_none());
        let _again = registry.claim("tpm", "tpm1").unwrap();
    }
}
