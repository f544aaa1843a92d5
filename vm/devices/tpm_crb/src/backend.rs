// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The interface between the CRB device and the TPM implementation that
//! actually executes commands.
//!
//! Backends run out of band (on their own thread, or in another process).
//! They report each finished command through a [`CompletionSender`], which
//! the device drains on the control thread.

use futures::channel::mpsc;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use thiserror::Error;

/// TPM protocol generation implemented by a backend.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TpmVersion {
    /// No backend has been attached yet.
    Unspecified,
    /// TPM 1.2.
    V1_2,
    /// TPM 2.0.
    V2_0,
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("tpm startup failed with status {0}")]
    Startup(i32),
    #[error("tpm backend is disconnected")]
    Disconnected,
    #[error(transparent)]
    Other(anyhow::Error),
}

/// The command/response buffer shared between the CRB data buffer and the
/// backend. Commands are read from, and responses written to, the same
/// buffer.
#[derive(Debug, Clone)]
pub struct CrbBuffer(Arc<Mutex<Vec<u8>>>);

impl CrbBuffer {
    pub fn new(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    pub fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock()
    }
}

/// A command handed to the backend.
#[derive(Debug)]
pub struct TpmBackendCmd {
    /// The locality the command was issued from.
    pub locality: u8,
    /// Length of the command at the start of `buffer`.
    pub input_len: usize,
    /// Maximum length of the response the backend may write.
    pub output_len: usize,
    pub buffer: CrbBuffer,
    /// Signalled once the response is in `buffer`.
    pub completion: CompletionSender,
}

/// A TPM implementation that CRB commands are forwarded to.
pub trait TpmBackend: Send + Sync {
    fn version(&self) -> TpmVersion;

    /// The largest command or response the backend supports.
    fn buffer_size(&self) -> usize;

    /// (Re)starts the TPM. Called on every device reset.
    fn startup(&self, buffer_size: usize) -> Result<(), BackendError>;

    /// Resets the backend's connection state.
    fn reset(&self) {}

    /// Returns the TPM's `tpmEstablished` flag.
    fn established_flag(&self) -> bool;

    /// Starts executing `cmd`. Returns immediately; completion is reported
    /// through `cmd.completion`.
    fn deliver_request(&self, cmd: TpmBackendCmd);

    /// Requests cancellation of the command in flight, if any.
    fn cancel_cmd(&self);

    /// Blocks until any command in flight has completed.
    fn finish_sync(&self) {}
}

/// Creates a completion channel.
pub fn completion_channel() -> (CompletionSender, CompletionReceiver) {
    let (send, recv) = mpsc::unbounded();
    (CompletionSender(send), CompletionReceiver(recv))
}

/// Reports command completions back to the device.
#[derive(Debug, Clone)]
pub struct CompletionSender(mpsc::UnboundedSender<i32>);

impl CompletionSender {
    /// Reports that the current command finished with `result_code` (zero
    /// on success).
    pub fn complete(&self, result_code: i32) {
        if self.0.unbounded_send(result_code).is_err() {
            tracing::debug!(result_code, "tpm completion dropped, device is gone");
        }
    }
}

/// The device end of a completion channel.
#[derive(Debug)]
pub struct CompletionReceiver(mpsc::UnboundedReceiver<i32>);

impl CompletionReceiver {
    pub fn poll_next(&mut self, cx: &mut Context<'_>) -> Poll<Option<i32>> {
        futures::StreamExt::poll_next_unpin(&mut self.0, cx)
    }

    /// Returns a completion that is already queued, without waiting.
    pub fn try_recv(&mut self) -> Option<i32> {
        self.0.try_recv().ok()
    }
}
