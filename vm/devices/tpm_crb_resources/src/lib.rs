// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Resources for the TPM CRB device.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::str::FromStr;
use thiserror::Error;

/// A handle to a TPM CRB device.
///
/// Parsed from the device option string, for example
/// `tpmdev=tpm0,ppi=off`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmCrbDeviceHandle {
    /// The id of the TPM backend the device forwards commands to.
    pub tpmdev: Option<String>,
    /// Whether to expose the physical presence interface.
    pub ppi: bool,
}

impl Default for TpmCrbDeviceHandle {
    fn default() -> Self {
        Self {
            tpmdev: None,
            ppi: true,
        }
    }
}

impl TpmCrbDeviceHandle {
    /// Returns a handle bound to the backend `tpmdev`, with PPI enabled.
    pub fn with_backend(tpmdev: impl Into<String>) -> Self {
        Self {
            tpmdev: Some(tpmdev.into()),
            ..Default::default()
        }
    }
}

/// An error parsing a [`TpmCrbDeviceHandle`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The option is not of the form `key=value`.
    #[error("expected key=value, found `{0}`")]
    MissingValue(String),
    /// The option key is not known.
    #[error("unknown tpm-crb option `{0}`")]
    UnknownOption(String),
    /// A boolean option has an unrecognized value.
    #[error("invalid value `{value}` for `{key}`, expected on/off")]
    InvalidBool {
        /// The option key.
        key: String,
        /// The rejected value.
        value: String,
    },
    /// The backend id is empty.
    #[error("`tpmdev` must not be empty")]
    EmptyBackend,
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ParseError> {
    match value {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        _ => Err(ParseError::InvalidBool {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

impl FromStr for TpmCrbDeviceHandle {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut handle = Self::default();
        for opt in s.split(',').map(str::trim).filter(|opt| !opt.is_empty()) {
            let (key, value) = opt
                .split_once('=')
                .ok_or_else(|| ParseError::MissingValue(opt.to_owned()))?;
            match key {
                "tpmdev" => {
                    if value.is_empty() {
                        return Err(ParseError::EmptyBackend);
                    }
                    handle.tpmdev = Some(value.to_owned());
                }
                "ppi" => handle.ppi = parse_bool(key, value)?,
                _ => return Err(ParseError::UnknownOption(key.to_owned())),
            }
        }
        Ok(handle)
    }
}
