// Licensed under the Apache-2.0 license

//! Software model of the RoT side of the mailbox: the SoC interface
//! registers, the mailbox peripheral and a runtime that answers commands.
//! Each requester talks to the shared device through its own `SocPort`.

mod dpe;
mod mailbox;
mod runtime;

pub use dpe::{DpeInstance, CERT_CHAIN_SIZE, MAX_CHUNK_SIZE, MAX_HANDLES};
pub use mailbox::{MailboxModel, MailboxRequester};
pub use runtime::{
    Runtime, FIPS_REV, FW_PROC_INVALID_IMAGE_SIZE, FW_PROC_MAILBOX_STATE_INCONSISTENT,
    RUNTIME_AUTH_AND_STASH_MEASUREMENT_DPE_ERROR, RUNTIME_AUTH_AND_STASH_UNSUPPORTED_IMAGE_SOURCE,
    RUNTIME_AUTH_MANIFEST_PREAMBLE_SIZE_LT_MIN, RUNTIME_INTERNAL, RUNTIME_INVALID_CHECKSUM,
    RUNTIME_MAILBOX_INVALID_PARAMS, RUNTIME_UNIMPLEMENTED_COMMAND,
};

use libcaliptra::dpe::{ContextHandle, DpeProfile};
use libcaliptra::mailbox::{populate_checksum, MailboxRespHeader};
use libcaliptra::{DeviceLifecycle, FlowStatus, FuseRegister, MboxStatus, SecurityState, SocMailbox};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default PAUSER of the first SoC requester.
pub const DEFAULT_REQUESTER: MailboxRequester = MailboxRequester::Soc(1);

pub struct InitParams {
    pub lifecycle: DeviceLifecycle,
    pub debug_locked: bool,

    /// FUSE_WR_DONE already set, e.g. by an earlier boot stage.
    pub fuse_wr_done: bool,

    pub flow_status: FlowStatus,

    /// Status reads that report CMD_BUSY before the runtime picks up a
    /// command.
    pub busy_cycles: u32,

    /// CSR returned by GET_IDEV_CSR. Setting it also raises
    /// IDEVID_CSR_READY.
    pub idevid_csr: Option<Vec<u8>>,

    pub dpe_profile: DpeProfile,
}

impl Default for InitParams {
    /// A booted device in production with runtime firmware running.
    fn default() -> Self {
        Self {
            lifecycle: DeviceLifecycle::Production,
            debug_locked: true,
            fuse_wr_done: true,
            flow_status: FlowStatus::READY_FOR_RUNTIME | FlowStatus::MAILBOX_FLOW_DONE,
            busy_cycles: 2,
            idevid_csr: None,
            dpe_profile: DpeProfile::default(),
        }
    }
}

impl InitParams {
    /// A fresh part waiting for fuses.
    pub fn unprovisioned() -> Self {
        Self {
            lifecycle: DeviceLifecycle::Unprovisioned,
            debug_locked: false,
            fuse_wr_done: false,
            flow_status: FlowStatus::READY_FOR_FUSES,
            ..Default::default()
        }
    }
}

/// Misbehavior injected into the next matching operation. Each fault
/// fires once.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Fault {
    /// Flips one bit of the response byte at this index after the
    /// checksum is computed.
    CorruptResponseByte(usize),
    /// Reports this FIPS status in the next response header.
    FipsStatus(u32),
    /// Completes the next command with this raw status value.
    UnknownStatus(u32),
    /// Fails the next command with this non-fatal FW error code.
    CommandFailure(u32),
    /// Signals DATA_READY without handing the mailbox back to the SoC.
    CompleteWithoutHandoff,
    /// Cuts the next response to this many bytes.
    TruncatedResponse(usize),
    /// The next `n` lock reads return 0 without taking the lock.
    LockReadsBlocked(u32),
    /// The next status read while ready for a command reports EXECUTE_UC.
    StaleFsmState,
    /// READY_FOR_FUSES stays set after FUSE_WR_DONE.
    IgnoreFuseWrDone,
}

/// SoC interface registers outside the mailbox.
pub struct SocIfc {
    pub security_state: SecurityState,
    pub flow_status: FlowStatus,
    pub fuse_wr_done: bool,
    pub fuses: HashMap<FuseRegister, Vec<u32>>,
    pub fw_error_fatal: u32,
    pub fw_error_non_fatal: u32,
}

impl SocIfc {
    pub fn new(params: &InitParams) -> Self {
        let mut flow_status = params.flow_status;
        if params.idevid_csr.is_some() {
            flow_status.insert(FlowStatus::IDEVID_CSR_READY);
        }
        Self {
            security_state: SecurityState::new(params.lifecycle, params.debug_locked),
            flow_status,
            fuse_wr_done: params.fuse_wr_done,
            fuses: HashMap::new(),
            fw_error_fatal: 0,
            fw_error_non_fatal: 0,
        }
    }
}

struct Device {
    mailbox: MailboxModel,
    runtime: Runtime,
    soc_ifc: SocIfc,
    faults: Vec<Fault>,
    busy_cycles: u32,
    busy_remaining: u32,
    executed: Vec<u32>,
}

impl Device {
    fn take_fault(&mut self, pred: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let idx = self.faults.iter().position(pred)?;
        Some(self.faults.remove(idx))
    }

    fn read_lock(&mut self, requester: MailboxRequester) -> bool {
        if let Some(Fault::LockReadsBlocked(n)) =
            self.take_fault(|f| matches!(f, Fault::LockReadsBlocked(_)))
        {
            if n > 1 {
                self.faults.push(Fault::LockReadsBlocked(n - 1));
            }
            return false;
        }
        self.mailbox.read_lock(requester)
    }

    fn write_execute(&mut self, requester: MailboxRequester, execute: bool) {
        if self.mailbox.lock_holder() != Some(requester) {
            return;
        }
        if execute {
            self.busy_remaining = self.busy_cycles;
        } else if self.mailbox.has_pending_request() {
            // Abandoned by the SoC; the runtime still runs it.
            log::debug!("SoC released the mailbox before the runtime answered");
            self.run_command();
        }
        self.mailbox.write_execute(requester, execute);
    }

    fn read_status(&mut self, requester: MailboxRequester) -> u32 {
        if self.mailbox.has_pending_request() {
            if self.busy_remaining > 0 {
                self.busy_remaining -= 1;
            } else {
                self.run_command();
            }
        }
        let status = self.mailbox.read_status(requester);
        if self.mailbox.is_ready_for_cmd()
            && self.mailbox.lock_holder() == Some(requester)
            && self
                .take_fault(|f| *f == Fault::StaleFsmState)
                .is_some()
        {
            let status = MboxStatus(status);
            return MboxStatus::new(
                status.0 & MboxStatus::STATUS_MASK,
                MboxStatus::FSM_EXECUTE_UC,
                status.soc_has_lock(),
            )
            .0;
        }
        status
    }

    fn run_command(&mut self) {
        let Some((cmd, req)) = self.mailbox.take_request() else {
            return;
        };
        self.executed.push(cmd);
        let fault = self.take_fault(|f| {
            matches!(
                f,
                Fault::CommandFailure(_) | Fault::UnknownStatus(_) | Fault::CompleteWithoutHandoff
            )
        });
        let result = self.runtime.handle(cmd, &req, &mut self.soc_ifc);

        match (fault, result) {
            (Some(Fault::CommandFailure(code)), _) | (_, Err(code)) => {
                log::debug!("command 0x{:08x} failed with 0x{:08x}", cmd, code);
                self.soc_ifc.fw_error_non_fatal = code;
                self.mailbox.respond(MboxStatus::CMD_FAILURE, vec![]);
            }
            (Some(Fault::UnknownStatus(status)), _) => {
                self.mailbox.respond(status, vec![]);
            }
            (Some(Fault::CompleteWithoutHandoff), _) => {
                self.mailbox.set_status(MboxStatus::DATA_READY);
            }
            (_, Ok(None)) => {
                self.mailbox.respond(MboxStatus::CMD_COMPLETE, vec![]);
            }
            (_, Ok(Some(resp))) => {
                let resp = self.finish_response(resp);
                self.mailbox.respond(MboxStatus::DATA_READY, resp);
            }
        }
    }

    /// Fills in the response header, then applies response faults.
    fn finish_response(&mut self, mut resp: Vec<u8>) -> Vec<u8> {
        let fips_status = match self.take_fault(|f| matches!(f, Fault::FipsStatus(_))) {
            Some(Fault::FipsStatus(status)) => status,
            _ => MailboxRespHeader::FIPS_STATUS_APPROVED,
        };
        if let Some(header) = resp.get_mut(4..8) {
            header.copy_from_slice(&fips_status.to_le_bytes());
        }
        populate_checksum(&mut resp);

        if let Some(Fault::CorruptResponseByte(idx)) =
            self.take_fault(|f| matches!(f, Fault::CorruptResponseByte(_)))
        {
            if let Some(byte) = resp.get_mut(idx) {
                *byte ^= 0x01;
            }
        }
        if let Some(Fault::TruncatedResponse(len)) =
            self.take_fault(|f| matches!(f, Fault::TruncatedResponse(_)))
        {
            resp.truncate(len);
        }
        resp
    }

    fn write_fuse(&mut self, fuse: FuseRegister, words: &[u32]) {
        if self.soc_ifc.fuse_wr_done {
            log::warn!("fuse write to {:?} after FUSE_WR_DONE ignored", fuse);
            return;
        }
        self.soc_ifc.fuses.insert(fuse, words.to_vec());
    }

    fn write_fuse_wr_done(&mut self) {
        self.soc_ifc.fuse_wr_done = true;
        if self
            .take_fault(|f| *f == Fault::IgnoreFuseWrDone)
            .is_some()
        {
            return;
        }
        if self.soc_ifc.flow_status.contains(FlowStatus::READY_FOR_FUSES) {
            self.soc_ifc.flow_status.remove(FlowStatus::READY_FOR_FUSES);
            self.soc_ifc.flow_status.insert(FlowStatus::READY_FOR_FW);
        }
    }
}

/// A shared device. Clones refer to the same device.
#[derive(Clone)]
pub struct ModelEmulated {
    device: Arc<Mutex<Device>>,
}

fn lock_device(device: &Mutex<Device>) -> MutexGuard<'_, Device> {
    device.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ModelEmulated {
    pub fn new(params: InitParams) -> Self {
        let device = Device {
            mailbox: MailboxModel::new(),
            runtime: Runtime::new(params.dpe_profile, params.idevid_csr.clone()),
            soc_ifc: SocIfc::new(&params),
            faults: vec![],
            busy_cycles: params.busy_cycles,
            busy_remaining: 0,
            executed: vec![],
        };
        Self {
            device: Arc::new(Mutex::new(device)),
        }
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        lock_device(&self.device)
    }

    /// Register port for one requester.
    pub fn soc(&self, requester: MailboxRequester) -> SocPort {
        SocPort {
            device: self.device.clone(),
            requester,
            delays: 0,
        }
    }

    pub fn inject_fault(&self, fault: Fault) {
        log::debug!("injecting {:?}", fault);
        self.device().faults.push(fault);
    }

    pub fn pending_faults(&self) -> Vec<Fault> {
        self.device().faults.clone()
    }

    pub fn set_busy_cycles(&self, busy_cycles: u32) {
        self.device().busy_cycles = busy_cycles;
    }

    pub fn mailbox_is_idle(&self) -> bool {
        self.device().mailbox.is_idle()
    }

    pub fn lock_holder(&self) -> Option<MailboxRequester> {
        self.device().mailbox.lock_holder()
    }

    /// Opcodes the runtime has executed, in order.
    pub fn executed_commands(&self) -> Vec<u32> {
        self.device().executed.clone()
    }

    pub fn loaded_firmware(&self) -> Option<Vec<u8>> {
        self.device().runtime.firmware().map(<[u8]>::to_vec)
    }

    pub fn stashed_measurements(&self) -> Vec<[u8; 48]> {
        self.device().runtime.measurements().to_vec()
    }

    pub fn dpe_active_handles(&self) -> Vec<ContextHandle> {
        self.device().runtime.dpe.active_handles()
    }

    pub fn dpe_cert_chain(&self) -> Vec<u8> {
        self.device().runtime.dpe.cert_chain().to_vec()
    }

    pub fn fuse(&self, fuse: FuseRegister) -> Option<Vec<u32>> {
        self.device().soc_ifc.fuses.get(&fuse).cloned()
    }

    pub fn fuse_wr_done(&self) -> bool {
        self.device().soc_ifc.fuse_wr_done
    }

    pub fn flow_status(&self) -> FlowStatus {
        self.device().soc_ifc.flow_status
    }

    pub fn set_flow_status(&self, flow_status: FlowStatus) {
        self.device().soc_ifc.flow_status = flow_status;
    }

    pub fn set_lifecycle(&self, lifecycle: DeviceLifecycle) {
        let mut device = self.device();
        let debug_locked = device.soc_ifc.security_state.debug_locked();
        device.soc_ifc.security_state = SecurityState::new(lifecycle, debug_locked);
    }

    pub fn set_fw_error_fatal(&self, code: u32) {
        self.device().soc_ifc.fw_error_fatal = code;
    }

    /// Resets the mailbox peripheral and clears pending faults, keeping
    /// fuses, firmware and DPE state.
    pub fn reset_mailbox(&self) {
        let mut device = self.device();
        device.mailbox = MailboxModel::new();
        device.faults.clear();
        device.busy_remaining = 0;
    }
}

/// One requester's register window onto the device.
pub struct SocPort {
    device: Arc<Mutex<Device>>,
    requester: MailboxRequester,
    delays: u64,
}

impl SocPort {
    pub fn requester(&self) -> MailboxRequester {
        self.requester
    }

    /// Number of `delay` calls made through this port.
    pub fn delays(&self) -> u64 {
        self.delays
    }

    fn device(&self) -> MutexGuard<'_, Device> {
        lock_device(&self.device)
    }
}

impl SocMailbox for SocPort {
    fn delay(&mut self) {
        self.delays += 1;
        std::thread::yield_now();
    }

    fn mbox_read_lock(&mut self) -> bool {
        let requester = self.requester;
        self.device().read_lock(requester)
    }

    fn mbox_write_cmd(&mut self, cmd: u32) {
        let requester = self.requester;
        self.device().mailbox.write_cmd(requester, cmd);
    }

    fn mbox_write_dlen(&mut self, dlen: u32) {
        let requester = self.requester;
        self.device().mailbox.write_dlen(requester, dlen);
    }

    fn mbox_read_dlen(&mut self) -> u32 {
        self.device().mailbox.read_dlen()
    }

    fn mbox_write_datain(&mut self, word: u32) {
        let requester = self.requester;
        self.device().mailbox.write_datain(requester, word);
    }

    fn mbox_read_dataout(&mut self) -> u32 {
        let requester = self.requester;
        self.device().mailbox.read_dataout(requester)
    }

    fn mbox_write_execute(&mut self, execute: bool) {
        let requester = self.requester;
        self.device().write_execute(requester, execute);
    }

    fn mbox_read_status(&mut self) -> u32 {
        let requester = self.requester;
        self.device().read_status(requester)
    }

    fn soc_read_fw_error_fatal(&mut self) -> u32 {
        self.device().soc_ifc.fw_error_fatal
    }

    fn soc_read_fw_error_non_fatal(&mut self) -> u32 {
        self.device().soc_ifc.fw_error_non_fatal
    }

    fn soc_read_flow_status(&mut self) -> u32 {
        self.device().soc_ifc.flow_status.bits()
    }

    fn soc_read_security_state(&mut self) -> u32 {
        self.device().soc_ifc.security_state.0
    }

    fn soc_write_fuse(&mut self, fuse: FuseRegister, words: &[u32]) {
        self.device().write_fuse(fuse, words);
    }

    fn soc_read_fuse_wr_done(&mut self) -> bool {
        self.device().soc_ifc.fuse_wr_done
    }

    fn soc_write_fuse_wr_done(&mut self) {
        self.device().write_fuse_wr_done();
    }
}
