// Licensed under the Apache-2.0 license

use crate::lifecycle::DeviceLifecycle;
use bitflags::bitflags;

/// Register-level access to one requester's view of the Caliptra SoC
/// interface and mailbox.
///
/// Implementations front real MMIO, an FPGA bridge or a software model.
/// Every instance presents one requester identity (AXI user / PAUSER) to the
/// mailbox arbitration logic; two instances over the same device compete for
/// the mailbox lock.
///
/// # Example
///
/// ```rust,ignore
/// struct RealSoc { base: *mut u32 }
/// impl SocMailbox for RealSoc {
///     fn mbox_read_lock(&mut self) -> bool {
///         unsafe { self.base.add(MBOX_LOCK_OFFSET).read_volatile() & 1 != 0 }
///     }
///     // ...
/// }
/// ```
pub trait SocMailbox {
    /// Provide a time base for mailbox status polling loops.
    fn delay(&mut self);

    /// Reads MBOX_LOCK. Reading `false` means the lock was just granted to
    /// this requester; `true` means somebody already holds it.
    fn mbox_read_lock(&mut self) -> bool;
    fn mbox_write_cmd(&mut self, cmd: u32);
    fn mbox_write_dlen(&mut self, dlen: u32);
    fn mbox_read_dlen(&mut self) -> u32;
    fn mbox_write_datain(&mut self, word: u32);
    fn mbox_read_dataout(&mut self) -> u32;
    fn mbox_write_execute(&mut self, execute: bool);
    fn mbox_read_status(&mut self) -> u32;

    fn soc_read_fw_error_fatal(&mut self) -> u32;
    fn soc_read_fw_error_non_fatal(&mut self) -> u32;
    fn soc_read_flow_status(&mut self) -> u32;
    fn soc_read_security_state(&mut self) -> u32;
    fn soc_write_fuse(&mut self, fuse: FuseRegister, words: &[u32]);
    fn soc_read_fuse_wr_done(&mut self) -> bool;
    fn soc_write_fuse_wr_done(&mut self);
}

/// MBOX_STATUS.STATUS values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MboxCmdStatus {
    CmdBusy,
    DataReady,
    CmdComplete,
    CmdFailure,
    Unknown(u32),
}

/// MBOX_STATUS.MBOX_FSM_PS values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MboxFsmState {
    Idle,
    RdyForCmd,
    RdyForData,
    RdyForDlen,
    ExecuteSoc,
    ExecuteUc,
    Unknown(u32),
}

/// Decoded MBOX_STATUS register.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MboxStatus(pub u32);

impl MboxStatus {
    pub const STATUS_MASK: u32 = 0xf;
    pub const FSM_SHIFT: u32 = 6;
    pub const FSM_MASK: u32 = 0x7 << Self::FSM_SHIFT;
    pub const SOC_HAS_LOCK: u32 = 1 << 9;

    pub const CMD_BUSY: u32 = 0x0;
    pub const DATA_READY: u32 = 0x1;
    pub const CMD_COMPLETE: u32 = 0x2;
    pub const CMD_FAILURE: u32 = 0x3;

    pub const FSM_IDLE: u32 = 0x0;
    pub const FSM_RDY_FOR_CMD: u32 = 0x1;
    pub const FSM_RDY_FOR_DATA: u32 = 0x2;
    pub const FSM_RDY_FOR_DLEN: u32 = 0x3;
    pub const FSM_EXECUTE_SOC: u32 = 0x4;
    pub const FSM_EXECUTE_UC: u32 = 0x6;

    pub fn new(status: u32, fsm: u32, soc_has_lock: bool) -> Self {
        let mut val = (status & Self::STATUS_MASK) | ((fsm << Self::FSM_SHIFT) & Self::FSM_MASK);
        if soc_has_lock {
            val |= Self::SOC_HAS_LOCK;
        }
        Self(val)
    }

    pub fn status(&self) -> MboxCmdStatus {
        match self.0 & Self::STATUS_MASK {
            Self::CMD_BUSY => MboxCmdStatus::CmdBusy,
            Self::DATA_READY => MboxCmdStatus::DataReady,
            Self::CMD_COMPLETE => MboxCmdStatus::CmdComplete,
            Self::CMD_FAILURE => MboxCmdStatus::CmdFailure,
            other => MboxCmdStatus::Unknown(other),
        }
    }

    pub fn fsm_state(&self) -> MboxFsmState {
        match (self.0 & Self::FSM_MASK) >> Self::FSM_SHIFT {
            Self::FSM_IDLE => MboxFsmState::Idle,
            Self::FSM_RDY_FOR_CMD => MboxFsmState::RdyForCmd,
            Self::FSM_RDY_FOR_DATA => MboxFsmState::RdyForData,
            Self::FSM_RDY_FOR_DLEN => MboxFsmState::RdyForDlen,
            Self::FSM_EXECUTE_SOC => MboxFsmState::ExecuteSoc,
            Self::FSM_EXECUTE_UC => MboxFsmState::ExecuteUc,
            other => MboxFsmState::Unknown(other),
        }
    }

    pub fn soc_has_lock(&self) -> bool {
        self.0 & Self::SOC_HAS_LOCK != 0
    }
}

bitflags! {
    /// CPTRA_FLOW_STATUS bits consumed by the SoC.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct FlowStatus: u32 {
        const IDEVID_CSR_READY = 1 << 24;
        const READY_FOR_FW = 1 << 28;
        const READY_FOR_RUNTIME = 1 << 29;
        const READY_FOR_FUSES = 1 << 30;
        const MAILBOX_FLOW_DONE = 1 << 31;
    }
}

/// CPTRA_SECURITY_STATE register.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SecurityState(pub u32);

impl SecurityState {
    const LIFECYCLE_MASK: u32 = 0x3;
    const DEBUG_LOCKED: u32 = 1 << 2;

    pub fn new(lifecycle: DeviceLifecycle, debug_locked: bool) -> Self {
        let mut val = u32::from(lifecycle);
        if debug_locked {
            val |= Self::DEBUG_LOCKED;
        }
        Self(val)
    }

    pub fn device_lifecycle(&self) -> DeviceLifecycle {
        DeviceLifecycle::from(self.0 & Self::LIFECYCLE_MASK)
    }

    pub fn debug_locked(&self) -> bool {
        self.0 & Self::DEBUG_LOCKED != 0
    }
}

/// Fuse registers written by the SoC during provisioning.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum FuseRegister {
    UdsSeed,
    FieldEntropy,
    KeyManifestPkHash,
    KeyManifestPkHashMask,
    OwnerPkHash,
    FmcKeyManifestSvn,
    RuntimeSvn,
    AntiRollbackDisable,
    IdevidCertAttr,
    IdevidManufHsmId,
    LifeCycle,
    LmsVerify,
    LmsRevocation,
    SocSteppingId,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fuses {
    pub uds_seed: [u32; 16],
    pub field_entropy: [u32; 8],
    pub key_manifest_pk_hash: [u32; 12],
    pub key_manifest_pk_hash_mask: u32,
    pub owner_pk_hash: [u32; 12],
    pub fmc_key_manifest_svn: u32,
    pub runtime_svn: [u32; 4],
    pub anti_rollback_disable: bool,
    pub idevid_cert_attr: [u32; 24],
    pub idevid_manuf_hsm_id: [u32; 4],
    pub life_cycle: DeviceLifecycle,
    pub lms_verify: bool,
    pub fuse_lms_revocation: u32,
    pub soc_stepping_id: u16,
}

impl Default for Fuses {
    fn default() -> Self {
        Self {
            uds_seed: [0x0001_0203; 16],
            field_entropy: [0x8080_8080; 8],
            key_manifest_pk_hash: [0; 12],
            key_manifest_pk_hash_mask: 0,
            owner_pk_hash: [0; 12],
            fmc_key_manifest_svn: 0,
            runtime_svn: [0; 4],
            anti_rollback_disable: false,
            idevid_cert_attr: [0; 24],
            idevid_manuf_hsm_id: [0; 4],
            life_cycle: DeviceLifecycle::Unprovisioned,
            lms_verify: false,
            fuse_lms_revocation: 0,
            soc_stepping_id: 0,
        }
    }
}

impl Fuses {
    /// Register contents in the order they are programmed.
    pub fn register_values(&self) -> Vec<(FuseRegister, Vec<u32>)> {
        vec![
            (FuseRegister::UdsSeed, self.uds_seed.to_vec()),
            (FuseRegister::FieldEntropy, self.field_entropy.to_vec()),
            (
                FuseRegister::KeyManifestPkHash,
                self.key_manifest_pk_hash.to_vec(),
            ),
            (
                FuseRegister::KeyManifestPkHashMask,
                vec![self.key_manifest_pk_hash_mask],
            ),
            (FuseRegister::OwnerPkHash, self.owner_pk_hash.to_vec()),
            (
                FuseRegister::FmcKeyManifestSvn,
                vec![self.fmc_key_manifest_svn],
            ),
            (FuseRegister::RuntimeSvn, self.runtime_svn.to_vec()),
            (
                FuseRegister::AntiRollbackDisable,
                vec![self.anti_rollback_disable as u32],
            ),
            (FuseRegister::IdevidCertAttr, self.idevid_cert_attr.to_vec()),
            (
                FuseRegister::IdevidManufHsmId,
                self.idevid_manuf_hsm_id.to_vec(),
            ),
            (FuseRegister::LifeCycle, vec![u32::from(self.life_cycle)]),
            (FuseRegister::LmsVerify, vec![self.lms_verify as u32]),
            (FuseRegister::LmsRevocation, vec![self.fuse_lms_revocation]),
            (
                FuseRegister::SocSteppingId,
                vec![u32::from(self.soc_stepping_id)],
            ),
        ]
    }
}
