/*++

Licensed under the Apache-2.0 license.

File Name:

    dispatcher.rs

Abstract:

    Client entry points: maps each logical operation onto mailbox
    transactions.

--*/

use crate::auth_manifest::AuthorizationManifest;
use crate::config::{DeriveFlagPolicy, MailboxConfig};
use crate::dpe::{
    CertifyKeyFormat, CertifyKeyResp, ContextHandle, DeriveContextFlags, DeriveContextResp,
    DpeContextManager, DpeProfile, GetProfileResp, InitCtxFlags, RotateCtxFlags, SignResp,
};
use crate::fw_load::{require_ready_for_fw, FwLoadSession, TocEntry, TocEntryId};
use crate::lifecycle::{DeviceLifecycle, FuseGate, LifecycleCache};
use crate::mailbox::{
    AuthAndStashFlags, AuthorizeAndStashReq, AuthorizeAndStashResult, CertifyKeyExtendedFlags,
    CertifyKeyExtendedReq, CommandId, FipsVersionReq, FipsVersionResp, GetIdevCsrReq,
    ImageHashSource, SetAuthManifestReq, StashMeasurementReq,
};
use crate::soc_mgr::{FlowStatus, Fuses, SocMailbox};
use crate::transaction::Mailbox;
use libcaliptra_error::{
    ApiError, DpeError, FuseError, LibCaliptraResult, MailboxError, MfgError,
};

/// One requester's view of a Caliptra RoT.
pub struct Caliptra<S: SocMailbox> {
    mbox: Mailbox<S>,
    lifecycle: LifecycleCache,
    fuse_gate: FuseGate,
    fw_load: FwLoadSession,
    dpe: DpeContextManager,
}

impl<S: SocMailbox> Caliptra<S> {
    pub fn new(soc: S, config: MailboxConfig) -> Self {
        Self {
            mbox: Mailbox::new(soc, config),
            lifecycle: LifecycleCache::new(),
            fuse_gate: FuseGate::new(),
            fw_load: FwLoadSession::new(),
            dpe: DpeContextManager::new(DpeProfile::default(), DeriveFlagPolicy::default()),
        }
    }

    pub fn with_dpe(mut self, profile: DpeProfile, policy: DeriveFlagPolicy) -> Self {
        self.dpe = DpeContextManager::new(profile, policy);
        self
    }

    pub fn mailbox(&self) -> &Mailbox<S> {
        &self.mbox
    }

    pub fn mailbox_mut(&mut self) -> &mut Mailbox<S> {
        &mut self.mbox
    }

    pub fn dpe(&self) -> &DpeContextManager {
        &self.dpe
    }

    pub fn dpe_mut(&mut self) -> &mut DpeContextManager {
        &mut self.dpe
    }

    pub fn fw_load(&self) -> &FwLoadSession {
        &self.fw_load
    }

    /// Clears a poisoned channel after the RoT was reset. Drops any
    /// unfinished firmware load and forgets the cached life cycle.
    pub fn recover(&mut self) {
        if let Err(err) = self.fw_load.abort(&mut self.mbox) {
            log::debug!("recover: no firmware load to drop ({})", err);
        }
        self.mbox.recover();
        self.lifecycle.invalidate();
    }

    pub fn flow_status(&mut self) -> FlowStatus {
        FlowStatus::from_bits_truncate(self.mbox.soc_mut().soc_read_flow_status())
    }

    pub fn ready_for_fuses(&mut self) -> bool {
        self.flow_status().contains(FlowStatus::READY_FOR_FUSES)
    }

    pub fn ready_for_firmware(&mut self) -> bool {
        self.flow_status().contains(FlowStatus::READY_FOR_FW)
    }

    pub fn ready_for_runtime(&mut self) -> bool {
        self.flow_status().contains(FlowStatus::READY_FOR_RUNTIME)
    }

    pub fn lifecycle(&mut self) -> DeviceLifecycle {
        self.lifecycle.get(self.mbox.soc_mut())
    }

    pub fn invalidate_lifecycle(&mut self) {
        self.lifecycle.invalidate();
    }

    pub fn is_fuse_window_open(&mut self) -> bool {
        self.fuse_gate
            .is_fuse_window_open(self.mbox.soc_mut(), &mut self.lifecycle)
    }

    /// Fails with `StillReadyForFuses` if provisioning is not over yet.
    pub fn assert_fuse_window_closed(&mut self) -> LibCaliptraResult<()> {
        self.fuse_gate
            .assert_closed(self.mbox.soc_mut(), &mut self.lifecycle)
    }

    /// Programs every fuse register and signals FUSE_WR_DONE. Only legal
    /// once, while the provisioning window is open and the RoT asks for
    /// fuses.
    pub fn init_fuses(&mut self, fuses: &Fuses) -> LibCaliptraResult<()> {
        self.fuse_gate
            .require_open(self.mbox.soc_mut(), &mut self.lifecycle)?;
        if !self.ready_for_fuses() {
            log::warn!("RoT is not requesting fuses");
            return Err(FuseError::NotReadyForFuses.into());
        }

        let soc = self.mbox.soc_mut();
        for (reg, words) in fuses.register_values() {
            soc.soc_write_fuse(reg, &words);
        }
        soc.soc_write_fuse_wr_done();
        self.fuse_gate.record_fuse_write_complete();
        log::info!("fuses written");

        if self.ready_for_fuses() {
            log::warn!("RoT still requests fuses after FUSE_WR_DONE");
            return Err(FuseError::StillReadyForFuses.into());
        }
        Ok(())
    }

    /// Sends a complete firmware image in one transaction. The RoT must be
    /// asking for firmware.
    pub fn upload_firmware(&mut self, image: &[u8]) -> LibCaliptraResult<()> {
        if self.fw_load.is_in_progress() {
            return Err(ApiError::PauserLocked.into());
        }
        require_ready_for_fw(&mut self.mbox)?;
        match self
            .mbox
            .exec(CommandId::FIRMWARE_LOAD.into(), image, &mut [])?
        {
            None => Ok(()),
            Some(_) => Err(ApiError::ApiInternalError.into()),
        }
    }

    pub fn upload_fw_start(&mut self, toc: &[TocEntry]) -> LibCaliptraResult<()> {
        self.fw_load.begin(&mut self.mbox, toc)
    }

    pub fn upload_fw_chunk(
        &mut self,
        id: TocEntryId,
        offset: u32,
        data: &[u8],
    ) -> LibCaliptraResult<()> {
        self.fw_load.write_chunk(&mut self.mbox, id, offset, data)
    }

    pub fn upload_fw_end(&mut self) -> LibCaliptraResult<()> {
        let timeout = self.mbox.config().max_wait_cycles;
        self.fw_load.finish(&mut self.mbox, timeout)
    }

    pub fn upload_fw_abort(&mut self) -> LibCaliptraResult<()> {
        self.fw_load.abort(&mut self.mbox)
    }

    /// Reads the IDevID CSR during manufacturing.
    pub fn get_idev_csr(&mut self) -> LibCaliptraResult<Vec<u8>> {
        if !self.flow_status().contains(FlowStatus::IDEVID_CSR_READY) {
            return Err(MfgError::IdevCsrNotReady.into());
        }
        let resp = self.mbox.exec_req(GetIdevCsrReq::default())?;
        let csr = resp.data().ok_or(ApiError::ApiInternalError)?;
        Ok(csr.to_vec())
    }

    pub fn fips_version(&mut self) -> LibCaliptraResult<FipsVersionResp> {
        self.mbox.exec_req(FipsVersionReq::default())
    }

    /// Stashes a measurement into DPE. A DPE failure comes back as the
    /// matching `DpeError`.
    pub fn stash_measurement(
        &mut self,
        metadata: [u8; 4],
        measurement: [u8; 48],
        context: [u8; 48],
        svn: u32,
    ) -> LibCaliptraResult<()> {
        let resp = self.mbox.exec_req(StashMeasurementReq {
            metadata,
            measurement,
            context,
            svn,
            ..Default::default()
        })?;
        DpeError::check(resp.dpe_result)
    }

    /// CertifyKey through the CERTIFY_KEY_EXTENDED command.
    pub fn certify_key_extended(
        &mut self,
        handle: ContextHandle,
        flags: CertifyKeyExtendedFlags,
        label: &[u8],
    ) -> LibCaliptraResult<CertifyKeyResp> {
        let mbox = &mut self.mbox;
        self.dpe.certify_key_extended(handle, label, |body| {
            let mut req = CertifyKeyExtendedReq {
                flags: flags.bits(),
                ..Default::default()
            };
            req.certify_key_req
                .get_mut(..body.len())
                .ok_or(ApiError::InvalidParams)?
                .copy_from_slice(body);
            let resp = mbox.exec_req(req)?;
            Ok(resp.certify_key_resp.to_vec())
        })
    }

    pub fn set_auth_manifest(
        &mut self,
        manifest: &AuthorizationManifest,
    ) -> LibCaliptraResult<()> {
        let bytes = manifest.to_bytes()?;
        self.mbox.exec_req(SetAuthManifestReq::new(&bytes)?)?;
        Ok(())
    }

    /// Asks the RoT whether the image with `fw_id` and `digest` is
    /// authorized by the manifest. The outcome is passed through as is.
    pub fn authorize_and_stash(
        &mut self,
        fw_id: u32,
        digest: [u8; 48],
        flags: AuthAndStashFlags,
    ) -> LibCaliptraResult<AuthorizeAndStashResult> {
        let resp = self.mbox.exec_req(AuthorizeAndStashReq {
            fw_id: fw_id.to_le_bytes(),
            measurement: digest,
            flags: flags.bits(),
            source: ImageHashSource::InRequest as u32,
            ..Default::default()
        })?;
        AuthorizeAndStashResult::try_from(resp.auth_req_result).map_err(|other| {
            log::warn!("unknown AUTHORIZE_AND_STASH result 0x{:08x}", other);
            ApiError::ApiInternalError.into()
        })
    }

    pub fn dpe_get_profile(&mut self) -> LibCaliptraResult<GetProfileResp> {
        self.dpe.get_profile(&mut self.mbox)
    }

    pub fn dpe_initialize_context(
        &mut self,
        flags: InitCtxFlags,
    ) -> LibCaliptraResult<ContextHandle> {
        self.dpe.initialize_context(&mut self.mbox, flags)
    }

    pub fn dpe_derive_context(
        &mut self,
        handle: ContextHandle,
        data: &[u8],
        flags: DeriveContextFlags,
        tci_type: u32,
        target_locality: u32,
    ) -> LibCaliptraResult<DeriveContextResp> {
        self.dpe
            .derive_context(&mut self.mbox, handle, data, flags, tci_type, target_locality)
    }

    pub fn dpe_certify_key(
        &mut self,
        handle: ContextHandle,
        format: CertifyKeyFormat,
        label: &[u8],
    ) -> LibCaliptraResult<CertifyKeyResp> {
        self.dpe.certify_key(&mut self.mbox, handle, 0, format, label)
    }

    pub fn dpe_sign(
        &mut self,
        handle: ContextHandle,
        label: &[u8],
        digest: &[u8],
    ) -> LibCaliptraResult<SignResp> {
        self.dpe.sign(&mut self.mbox, handle, label, 0, digest)
    }

    pub fn dpe_rotate_context_handle(
        &mut self,
        handle: ContextHandle,
        flags: RotateCtxFlags,
    ) -> LibCaliptraResult<ContextHandle> {
        self.dpe.rotate_context_handle(&mut self.mbox, handle, flags)
    }

    pub fn dpe_destroy_context(&mut self, handle: ContextHandle) -> LibCaliptraResult<()> {
        self.dpe.destroy_context(&mut self.mbox, handle)
    }

    pub fn dpe_get_certificate_chain(&mut self) -> LibCaliptraResult<Vec<u8>> {
        self.dpe.get_full_certificate_chain(&mut self.mbox)
    }

    /// The error that made the channel untrustworthy, if any.
    pub fn channel_poisoned(&self) -> Option<MailboxError> {
        self.mbox.poisoned()
    }
}
