// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The Command Response Buffer (CRB) interface, as defined by the TCG PC
//! Client Platform TPM Profile.
//!
//! [`CrbCore`] is the contract the device shell drives. [`CrbEngine`] is the
//! register-level implementation of it: a 0x80 byte register block followed
//! by the command/response data buffer, all in one 4K page.

use crate::TPM_CRB_ADDR_BASE;
use crate::TPM_CRB_ADDR_SIZE;
use crate::backend::CompletionSender;
use crate::backend::CrbBuffer;
use crate::backend::TpmBackend;
use crate::backend::TpmBackendCmd;
use crate::backend::TpmVersion;
use bitfield_struct::bitfield;
use chipset_device::ChipsetDevice;
use chipset_device::io::IoError;
use chipset_device::io::IoResult;
use chipset_device::mmio::MmioIntercept;
use std::ops::Range;
use std::sync::Arc;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::KnownLayout;
use zerocopy::byteorder::big_endian::U16;
use zerocopy::byteorder::big_endian::U32;

const CRB_LOC_STATE: u64 = 0x00;
const CRB_LOC_CTRL: u64 = 0x08;
const CRB_LOC_STS: u64 = 0x0c;
const CRB_INTF_ID: u64 = 0x30;
const CRB_INTF_ID2: u64 = 0x34;
const CRB_CTRL_EXT: u64 = 0x38;
const CRB_CTRL_REQ: u64 = 0x40;
const CRB_CTRL_STS: u64 = 0x44;
const CRB_CTRL_CANCEL: u64 = 0x48;
const CRB_CTRL_START: u64 = 0x4c;
const CRB_INT_ENABLE: u64 = 0x50;
const CRB_INT_STS: u64 = 0x54;
const CRB_CTRL_CMD_SIZE_REG: u64 = 0x58;
const CRB_CTRL_CMD_LADDR: u64 = 0x5c;
const CRB_CTRL_CMD_HADDR: u64 = 0x60;
const CRB_CTRL_RSP_SIZE: u64 = 0x64;
const CRB_CTRL_RSP_ADDR: u64 = 0x68;
const CRB_DATA_BUFFER: u64 = 0x80;

/// Number of 32-bit registers in front of the data buffer.
const CRB_REGS: usize = CRB_DATA_BUFFER as usize / 4;

/// Size of the command/response data buffer.
pub const CRB_CTRL_CMD_SIZE: usize = (TPM_CRB_ADDR_SIZE - CRB_DATA_BUFFER) as usize;

const CRB_LOC_CTRL_REQUEST_ACCESS: u32 = 1 << 0;
const CRB_LOC_CTRL_RELINQUISH: u32 = 1 << 1;
const CRB_LOC_CTRL_SEIZE: u32 = 1 << 2;
const CRB_LOC_CTRL_RESET_ESTABLISHMENT_BIT: u32 = 1 << 3;

const CRB_CTRL_REQ_CMD_READY: u32 = 1 << 0;
const CRB_CTRL_REQ_GO_IDLE: u32 = 1 << 1;

const CRB_CANCEL_INVOKE: u32 = 1 << 0;
const CRB_START_INVOKE: u32 = 1 << 0;

const CRB_INTF_TYPE_CRB_ACTIVE: u8 = 0b1;
const CRB_INTF_VERSION_CRB: u8 = 0b1;
const CRB_INTF_DATA_XFER_SIZE_64: u8 = 0b11;
const CRB_INTF_IF_SELECTOR_CRB: u8 = 0b1;

const PCI_VENDOR_ID_IBM: u16 = 0x1014;

#[bitfield(u32)]
struct LocState {
    tpm_established: bool,
    loc_assigned: bool,
    #[bits(3)]
    active_locality: u8,
    #[bits(2)]
    _reserved: u8,
    tpm_reg_valid_sts: bool,
    #[bits(24)]
    _reserved2: u32,
}

#[bitfield(u32)]
struct LocSts {
    granted: bool,
    been_seized: bool,
    #[bits(30)]
    _reserved: u32,
}

#[bitfield(u32)]
struct IntfId {
    #[bits(4)]
    interface_type: u8,
    #[bits(4)]
    interface_version: u8,
    cap_locality: bool,
    cap_crb_idle_bypass: bool,
    _reserved1: bool,
    #[bits(2)]
    cap_data_xfer_size_support: u8,
    cap_fifo: bool,
    cap_crb: bool,
    #[bits(2)]
    cap_if_res: u8,
    #[bits(2)]
    interface_selector: u8,
    intf_sel_lock: bool,
    #[bits(4)]
    _reserved2: u8,
    #[bits(8)]
    rid: u8,
}

#[bitfield(u32)]
struct IntfId2 {
    vid: u16,
    did: u16,
}

#[bitfield(u32)]
struct CtrlSts {
    tpm_sts: bool,
    tpm_idle: bool,
    #[bits(30)]
    _reserved: u32,
}

/// The fixed header at the start of every TPM command.
#[repr(C)]
#[derive(Immutable, KnownLayout, FromBytes)]
struct CmdHeader {
    _tag: U16,
    size: U32,
    _code: U32,
}

#[derive(Debug, Error)]
pub enum CrbCoreError {
    #[error("tpm backend buffer of {0} bytes cannot hold a command header")]
    BufferTooSmall(usize),
    #[error("crb register window of {size:#x} bytes, expected {expected:#x}")]
    WindowSize { size: u64, expected: u64 },
}

/// The core refused to prepare for a snapshot.
#[derive(Debug, Error)]
#[error("tpm crb pre-save failed with status {0}")]
pub struct PreSaveFailed(pub i32);

/// The CRB interface state machine, as seen by the device shell.
pub trait CrbCore: ChipsetDevice {
    /// Binds the core to `backend` and prepares its memory. Command
    /// completions are routed to `owner`. Returns the size of the register
    /// window to map.
    fn init_memory(
        &mut self,
        backend: Arc<dyn TpmBackend>,
        owner: CompletionSender,
    ) -> Result<u64, CrbCoreError>;

    /// Reinitializes the registers for a window mapped at `base`.
    fn reset(&mut self, base: u64);

    /// The protocol version of the bound backend.
    fn version(&self) -> TpmVersion;

    /// Called once for each command the backend finishes.
    fn request_completed(&mut self, result_code: i32);

    /// Flushes transient state ahead of a snapshot.
    fn pre_save(&mut self) -> Result<(), PreSaveFailed>;
}

/// Register-level CRB implementation.
pub struct CrbEngine {
    // Runtime glue
    backend: Option<Arc<dyn TpmBackend>>,
    owner: Option<CompletionSender>,

    // Volatile state
    base: u64,
    regs: [u32; CRB_REGS],
    buffer: CrbBuffer,
    be_buffer_size: usize,
}

impl Default for CrbEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn reg_index(offset: u64) -> usize {
    (offset / 4) as usize
}

fn data_range(offset: u64, len: usize) -> Option<Range<usize>> {
    let start = (offset - CRB_DATA_BUFFER) as usize;
    let end = start.checked_add(len)?;
    (end <= CRB_CTRL_CMD_SIZE).then_some(start..end)
}

impl CrbEngine {
    pub fn new() -> Self {
        Self {
            backend: None,
            owner: None,
            base: TPM_CRB_ADDR_BASE,
            regs: [0; CRB_REGS],
            buffer: CrbBuffer::new(CRB_CTRL_CMD_SIZE),
            be_buffer_size: 0,
        }
    }

    fn reg<T: From<u32>>(&self, offset: u64) -> T {
        T::from(self.regs[reg_index(offset)])
    }

    fn set_reg<T: Into<u32>>(&mut self, offset: u64, value: T) {
        self.regs[reg_index(offset)] = value.into();
    }

    fn update<T: From<u32> + Into<u32>>(&mut self, offset: u64, f: impl FnOnce(T) -> T) {
        let value = f(self.reg(offset));
        self.set_reg(offset, value);
    }

    fn start_pending(&self) -> bool {
        self.regs[reg_index(CRB_CTRL_START)] & CRB_START_INVOKE != 0
    }

    fn active_locality(&self) -> Option<u8> {
        let state: LocState = self.reg(CRB_LOC_STATE);
        state.loc_assigned().then(|| state.active_locality())
    }

    /// Splits an absolute address into the issuing locality and the offset
    /// into the register page.
    fn decode(&self, addr: u64) -> Option<(u8, u64)> {
        let offset = addr.checked_sub(self.base)?;
        if offset >= TPM_CRB_ADDR_SIZE {
            return None;
        }
        Some(((offset >> 12) as u8, offset & 0xfff))
    }

    fn start_command(&mut self, locality: u8) {
        let (Some(backend), Some(owner)) = (self.backend.clone(), self.owner.clone()) else {
            tracing::warn!(locality, "tpm command started with no backend bound");
            return;
        };

        let input_len = {
            let buffer = self.buffer.lock();
            CmdHeader::ref_from_prefix(&buffer)
                .map_or(0, |(header, _)| header.size.get() as usize)
                .min(self.be_buffer_size)
        };

        self.regs[reg_index(CRB_CTRL_START)] |= CRB_START_INVOKE;
        tracing::debug!(locality, input_len, "delivering tpm command");
        backend.deliver_request(TpmBackendCmd {
            locality,
            input_len,
            output_len: self.be_buffer_size,
            buffer: self.buffer.clone(),
            completion: owner,
        });
    }

    fn write_loc_ctrl(&mut self, locality: u8, val: u32) {
        match val {
            CRB_LOC_CTRL_REQUEST_ACCESS => {
                self.update(CRB_LOC_STS, |sts: LocSts| {
                    sts.with_granted(true).with_been_seized(false)
                });
                self.update(CRB_LOC_STATE, |state: LocState| {
                    state.with_loc_assigned(true).with_active_locality(locality)
                });
            }
            CRB_LOC_CTRL_RELINQUISH => {
                self.update(CRB_LOC_STATE, |state: LocState| state.with_loc_assigned(false));
                self.update(CRB_LOC_STS, |sts: LocSts| sts.with_granted(false));
            }
            // Only meaningful for localities 3 and 4, which are not exposed.
            CRB_LOC_CTRL_RESET_ESTABLISHMENT_BIT | CRB_LOC_CTRL_SEIZE => {}
            _ => tracing::debug!(locality, val, "ignoring loc_ctrl write"),
        }
    }
}

impl CrbCore for CrbEngine {
    fn init_memory(
        &mut self,
        backend: Arc<dyn TpmBackend>,
        owner: CompletionSender,
    ) -> Result<u64, CrbCoreError> {
        let buffer_size = backend.buffer_size();
        if buffer_size < size_of::<CmdHeader>() {
            return Err(CrbCoreError::BufferTooSmall(buffer_size));
        }
        self.backend = Some(backend);
        self.owner = Some(owner);
        Ok(TPM_CRB_ADDR_SIZE)
    }

    fn reset(&mut self, base: u64) {
        self.base = base;
        self.regs = [0; CRB_REGS];

        self.set_reg(
            CRB_LOC_STATE,
            LocState::new()
                .with_tpm_reg_valid_sts(true)
                .with_tpm_established(true),
        );
        self.set_reg(CRB_CTRL_STS, CtrlSts::new().with_tpm_idle(true));
        self.set_reg(
            CRB_INTF_ID,
            IntfId::new()
                .with_interface_type(CRB_INTF_TYPE_CRB_ACTIVE)
                .with_interface_version(CRB_INTF_VERSION_CRB)
                .with_cap_locality(false)
                .with_cap_crb_idle_bypass(false)
                .with_cap_data_xfer_size_support(CRB_INTF_DATA_XFER_SIZE_64)
                .with_cap_fifo(false)
                .with_cap_crb(true)
                .with_interface_selector(CRB_INTF_IF_SELECTOR_CRB)
                .with_rid(0),
        );
        self.set_reg(CRB_INTF_ID2, IntfId2::new().with_vid(PCI_VENDOR_ID_IBM));

        let data = base + CRB_DATA_BUFFER;
        self.set_reg(CRB_CTRL_CMD_SIZE_REG, CRB_CTRL_CMD_SIZE as u32);
        self.set_reg(CRB_CTRL_CMD_LADDR, data as u32);
        self.set_reg(CRB_CTRL_CMD_HADDR, (data >> 32) as u32);
        self.set_reg(CRB_CTRL_RSP_SIZE, CRB_CTRL_CMD_SIZE as u32);
        self.set_reg(CRB_CTRL_RSP_ADDR, data as u32);
        self.set_reg(CRB_CTRL_RSP_ADDR + 4, (data >> 32) as u32);

        let Some(backend) = &self.backend else {
            tracing::warn!("tpm crb reset with no backend bound");
            return;
        };
        backend.reset();
        self.be_buffer_size = backend.buffer_size().min(CRB_CTRL_CMD_SIZE);
        if let Err(err) = backend.startup(self.be_buffer_size) {
            // Surface the failure to the guest rather than the host.
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "tpm backend startup failed"
            );
            self.update(CRB_CTRL_STS, |sts: CtrlSts| sts.with_tpm_sts(true));
        }
    }

    fn version(&self) -> TpmVersion {
        self.backend
            .as_ref()
            .map_or(TpmVersion::Unspecified, |backend| backend.version())
    }

    fn request_completed(&mut self, result_code: i32) {
        self.regs[reg_index(CRB_CTRL_START)] &= !CRB_START_INVOKE;
        if result_code != 0 {
            tracing::warn!(result_code, "tpm command failed");
            self.update(CRB_CTRL_STS, |sts: CtrlSts| sts.with_tpm_sts(true));
        }
    }

    fn pre_save(&mut self) -> Result<(), PreSaveFailed> {
        if let Some(backend) = &self.backend {
            backend.finish_sync();
        }
        Ok(())
    }
}

impl ChipsetDevice for CrbEngine {
    fn supports_mmio(&mut self) -> Option<&mut dyn MmioIntercept> {
        Some(self)
    }
}

impl MmioIntercept for CrbEngine {
    fn mmio_read(&mut self, addr: u64, data: &mut [u8]) -> IoResult {
        let Some((locality, offset)) = self.decode(addr) else {
            return IoResult::Err(IoError::InvalidRegister);
        };

        if offset >= CRB_DATA_BUFFER {
            let Some(range) = data_range(offset, data.len()) else {
                return IoResult::Err(IoError::InvalidAccessSize);
            };
            data.copy_from_slice(&self.buffer.lock()[range]);
            return IoResult::Ok;
        }

        match data.len() {
            1 | 2 | 4 => {}
            8 => {
                if !matches!(offset, CRB_INTF_ID | CRB_CTRL_RSP_ADDR) {
                    return IoResult::Err(IoError::InvalidAccessSize);
                }
            }
            _ => return IoResult::Err(IoError::InvalidAccessSize),
        }

        // Guests may read registers a byte at a time, so floor the offset
        // and shift.
        let floor_offset = offset & !0x3;
        let byte_offset = (offset - floor_offset) as usize;
        if data.len() < 8 && byte_offset + data.len() > 4 {
            return IoResult::Err(IoError::UnalignedAccess);
        }

        let mut val = u64::from(self.regs[reg_index(floor_offset)]);
        if data.len() == 8 {
            val |= u64::from(self.regs[reg_index(floor_offset) + 1]) << 32;
        }
        if floor_offset == CRB_LOC_STATE {
            if let Some(backend) = &self.backend {
                val |= u64::from(!backend.established_flag());
            }
        }
        let val = val >> (8 * byte_offset);

        tracing::trace!(addr, locality, offset, val, "tpm crb read");
        data.copy_from_slice(&val.to_le_bytes()[..data.len()]);
        IoResult::Ok
    }

    fn mmio_write(&mut self, addr: u64, data: &[u8]) -> IoResult {
        let Some((locality, offset)) = self.decode(addr) else {
            return IoResult::Err(IoError::InvalidRegister);
        };

        if offset >= CRB_DATA_BUFFER {
            let Some(range) = data_range(offset, data.len()) else {
                return IoResult::Err(IoError::InvalidAccessSize);
            };
            self.buffer.lock()[range].copy_from_slice(data);
            return IoResult::Ok;
        }

        if !matches!(data.len(), 1 | 2 | 4) {
            return IoResult::Err(IoError::InvalidAccessSize);
        }
        if offset & 0x3 != 0 {
            return IoResult::Err(IoError::UnalignedAccess);
        }

        let mut bytes = [0; 4];
        bytes[..data.len()].copy_from_slice(data);
        let val = u32::from_le_bytes(bytes);

        tracing::trace!(addr, locality, offset, val, "tpm crb write");

        match offset {
            CRB_CTRL_REQ => match val {
                CRB_CTRL_REQ_CMD_READY => {
                    self.update(CRB_CTRL_STS, |sts: CtrlSts| sts.with_tpm_idle(false))
                }
                CRB_CTRL_REQ_GO_IDLE => {
                    self.update(CRB_CTRL_STS, |sts: CtrlSts| sts.with_tpm_idle(true))
                }
                _ => {}
            },
            CRB_CTRL_CANCEL => {
                if val == CRB_CANCEL_INVOKE && self.start_pending() {
                    if let Some(backend) = &self.backend {
                        tracing::debug!(locality, "cancelling tpm command");
                        backend.cancel_cmd();
                    }
                }
            }
            CRB_CTRL_START => {
                if val == CRB_START_INVOKE
                    && !self.start_pending()
                    && self.active_locality() == Some(locality)
                {
                    self.start_command(locality);
                }
            }
            CRB_LOC_CTRL => self.write_loc_ctrl(locality, val),
            CRB_LOC_STATE | CRB_LOC_STS | CRB_INTF_ID | CRB_INTF_ID2 | CRB_CTRL_EXT
            | CRB_CTRL_STS | CRB_INT_ENABLE | CRB_INT_STS | CRB_CTRL_CMD_SIZE_REG
            | CRB_CTRL_CMD_LADDR | CRB_CTRL_CMD_HADDR | CRB_CTRL_RSP_SIZE | CRB_CTRL_RSP_ADDR => {
                tracing::debug!(offset, val, "ignoring write to read-only crb register");
            }
            _ => return IoResult::Err(IoError::InvalidRegister),
        }

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
            pub base: u64,
            pub regs: Vec<u32>,
            pub buffer: Vec<u8>,
            pub be_buffer_size: u32,
        }

        impl SavedStateRoot for SavedState {
            const NAME: &'static str = "tpm-crb.core";
            const VERSION: u32 = 1;
        }
    }

    #[derive(Debug, Error)]
    enum CrbRestoreError {
        #[error("expected {expected} registers, found {found}")]
        RegisterCount { expected: usize, found: usize },
        #[error("expected a {expected} byte data buffer, found {found}")]
        BufferSize { expected: usize, found: usize },
        #[error("backend buffer size {0:#x} exceeds the data buffer")]
        BackendBufferSize(u32),
    }

    impl SaveRestore for CrbEngine {
        type SavedState = state::SavedState;

        fn save(&mut self) -> Result<Self::SavedState, SaveError> {
            let Self {
                backend: _,
                owner: _,
                base,
                regs,
                ref buffer,
                be_buffer_size,
            } = *self;

            Ok(state::SavedState {
                base,
                regs: regs.to_vec(),
                buffer: buffer.lock().clone(),
                be_buffer_size: be_buffer_size as u32,
            })
        }

        fn restore(&mut self, state: Self::SavedState) -> Result<(), RestoreError> {
            let state::SavedState {
                base,
                regs,
                buffer,
                be_buffer_size,
            } = state;

            let regs: [u32; CRB_REGS] = regs.try_into().map_err(|regs: Vec<u32>| {
                RestoreError::InvalidSavedState(
                    CrbRestoreError::RegisterCount {
                        expected: CRB_REGS,
                        found: regs.len(),
                    }
                    .into(),
                )
            })?;
            if buffer.len() != CRB_CTRL_CMD_SIZE {
                return Err(RestoreError::InvalidSavedState(
                    CrbRestoreError::BufferSize {
                        expected: CRB_CTRL_CMD_SIZE,
                        found: buffer.len(),
                    }
                    .into(),
                ));
            }
            if be_buffer_size as usize > CRB_CTRL_CMD_SIZE {
                return Err(RestoreError::InvalidSavedState(
                    CrbRestoreError::BackendBufferSize(be_buffer_size).into(),
                ));
            }

            self.base = base;
            self.regs = regs;
            *self.buffer.lock() = buffer;
            self.be_buffer_size = be_buffer_size as usize;
            Ok(())
        }
    }
}
