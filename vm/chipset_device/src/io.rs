// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Memory mapped IO (MMIO) results.

/// An error related to the suitability of the IO request for the device. A
/// device should handle device-specific errors internally, and should return
/// `IoResult::Ok` in these conditions.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoError {
    /// The requested device register is not present.
    InvalidRegister,
    /// The access length is invalid for the specified address.
    InvalidAccessSize,
    /// The caller attempted to perform an unaligned access to the device
    /// registers.
    UnalignedAccess,
    /// No device is mapped at the requested address.
    NoDevice,
}

/// The result returned by a device MMIO operation, as in methods of
/// [`MmioIntercept`](crate::mmio::MmioIntercept).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum IoResult {
    /// The IO operation succeeded.
    Ok,
    /// The IO operation failed due to an access error.
    ///
    /// The caller should log the failure, then ignore writes, and fill the
    /// buffer with `!0` on reads.
    Err(IoError),
}

impl IoResult {
    /// Asserts if `self` is not `IoResult::Ok`.
    #[track_caller]
    pub fn unwrap(self) {
        if let IoResult::Err(e) = self {
            panic!("unexpected IO result {:?}", e)
        }
    }

    /// Converts `self` to a `Result<(), IoError>`.
    pub fn into_result(self) -> Result<(), IoError> {
        match self {
            IoResult::Ok => Ok(()),
            IoResult::Err(e) => Err(e),
        }
    }
}
