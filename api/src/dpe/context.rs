// Licensed under the Apache-2.0 license

use super::{
    parse_response, CertifyKeyCmd, CertifyKeyFormat, CertifyKeyResp, ContextHandle,
    DeriveContextCmd, DeriveContextFlags, DeriveContextResp, DestroyCtxCmd, DpeCommand,
    DpeProfile, DpeResponse, DpeTransport, GetCertificateChainCmd, GetCertificateChainResp,
    GetProfileResp, InitCtxFlags, NewHandleResp, RotateCtxCmd, RotateCtxFlags, SignCmd, SignResp,
};
use crate::config::DeriveFlagPolicy;
use crate::mailbox::MAX_MAILBOX_SIZE;
use libcaliptra_error::{ApiError, DpeError, LibCaliptraError, LibCaliptraResult};
use std::collections::{BTreeMap, VecDeque};

/// Local identifier for a tracked context. Survives handle rotation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SlotId(u32);

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DpeContext {
    /// Current valid handle as last reported by the RoT.
    pub handle: ContextHandle,
    pub profile: DpeProfile,
    pub parent: Option<SlotId>,
    /// The context was kept alive while deriving a child.
    pub retained: bool,
    pub export_cdi: bool,
}

/// Tracks the contexts this requester created and the handles it has seen
/// retired.
///
/// The RoT stays authoritative: handles unknown here are still sent, and an
/// `InvalidHandle` from the RoT drops the local slot. Recently retired
/// handles fail locally with `DpeError::InvalidHandle` without a round trip;
/// only the last `MAX_RETIRED_HANDLES` are remembered.
#[derive(Debug)]
pub struct DpeContextManager {
    profile: DpeProfile,
    policy: DeriveFlagPolicy,
    contexts: BTreeMap<SlotId, DpeContext>,
    retired: VecDeque<ContextHandle>,
    next_slot: u32,
}

impl DpeContextManager {
    /// Size of each GetCertificateChain read.
    pub const CERT_CHAIN_CHUNK_SIZE: u32 = 2048;

    /// Upper bound for a certificate chain read in pieces.
    pub const MAX_CERT_CHAIN_SIZE: usize = MAX_MAILBOX_SIZE;

    pub const MAX_RETIRED_HANDLES: usize = 64;

    pub fn new(profile: DpeProfile, policy: DeriveFlagPolicy) -> Self {
        Self {
            profile,
            policy,
            contexts: BTreeMap::new(),
            retired: VecDeque::with_capacity(Self::MAX_RETIRED_HANDLES),
            next_slot: 0,
        }
    }

    pub fn profile(&self) -> DpeProfile {
        self.profile
    }

    pub fn policy(&self) -> &DeriveFlagPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: DeriveFlagPolicy) {
        self.policy = policy;
    }

    pub fn context(&self, slot: SlotId) -> Option<&DpeContext> {
        self.contexts.get(&slot)
    }

    pub fn contexts(&self) -> impl Iterator<Item = (SlotId, &DpeContext)> {
        self.contexts.iter().map(|(slot, ctx)| (*slot, ctx))
    }

    pub fn slot_of(&self, handle: ContextHandle) -> Option<SlotId> {
        self.contexts
            .iter()
            .find(|(_, ctx)| ctx.handle == handle)
            .map(|(slot, _)| *slot)
    }

    pub fn current_handle(&self, slot: SlotId) -> Option<ContextHandle> {
        self.contexts.get(&slot).map(|ctx| ctx.handle)
    }

    pub fn is_retired(&self, handle: ContextHandle) -> bool {
        self.retired.contains(&handle)
    }

    pub fn retired_count(&self) -> usize {
        self.retired.len()
    }

    fn retire(&mut self, handle: ContextHandle) {
        if self.is_retired(handle) {
            return;
        }
        if self.retired.len() == Self::MAX_RETIRED_HANDLES {
            self.retired.pop_front();
        }
        self.retired.push_back(handle);
    }

    fn unretire(&mut self, handle: ContextHandle) {
        self.retired.retain(|retired| *retired != handle);
    }

    /// Starts tracking a handle obtained elsewhere, e.g. the default
    /// context the RoT creates at boot.
    pub fn track(&mut self, handle: ContextHandle) -> SlotId {
        if let Some(slot) = self.slot_of(handle) {
            return slot;
        }
        self.unretire(handle);
        self.insert(handle, None)
    }

    fn insert(&mut self, handle: ContextHandle, parent: Option<SlotId>) -> SlotId {
        let slot = SlotId(self.next_slot);
        self.next_slot += 1;
        self.contexts.insert(
            slot,
            DpeContext {
                handle,
                profile: self.profile,
                parent,
                retained: false,
                export_cdi: false,
            },
        );
        slot
    }

    /// Fails with `DpeError::InvalidHandle` for handles known to be stale.
    pub fn check_handle(&self, handle: ContextHandle) -> LibCaliptraResult<()> {
        if self.is_retired(handle) {
            log::warn!("DPE handle {:02x?} was retired", handle.0);
            return Err(DpeError::InvalidHandle.into());
        }
        Ok(())
    }

    /// Records that the RoT replaced `old` with `new`.
    pub fn note_rotation(&mut self, old: ContextHandle, new: ContextHandle) -> SlotId {
        let slot = match self.slot_of(old) {
            Some(slot) => {
                if let Some(ctx) = self.contexts.get_mut(&slot) {
                    ctx.handle = new;
                }
                slot
            }
            None => self.insert(new, None),
        };
        if old != new {
            self.retire(old);
        }
        self.unretire(new);
        slot
    }

    /// Drops `handle`'s slot and every slot derived from it.
    fn forget(&mut self, handle: ContextHandle) {
        self.retire(handle);
        let Some(root) = self.slot_of(handle) else {
            return;
        };
        let mut doomed = vec![root];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            doomed.extend(
                self.contexts
                    .iter()
                    .filter(|(_, ctx)| ctx.parent == Some(parent))
                    .map(|(slot, _)| *slot),
            );
            i += 1;
        }
        for slot in doomed {
            if let Some(ctx) = self.contexts.remove(&slot) {
                self.retire(ctx.handle);
            }
        }
    }

    fn invoke<R: DpeResponse>(
        &mut self,
        transport: &mut impl DpeTransport,
        cmd: &DpeCommand,
    ) -> LibCaliptraResult<R> {
        self.exchange(cmd, DpeCommand::encode, |bytes| transport.invoke_dpe(bytes))
    }

    /// Encodes `cmd`, hands it to `send` and parses the DPE response that
    /// comes back. An `InvalidHandle` answer drops the command's handle.
    fn exchange<R: DpeResponse>(
        &mut self,
        cmd: &DpeCommand,
        encode: impl FnOnce(&DpeCommand, DpeProfile) -> LibCaliptraResult<Vec<u8>>,
        send: impl FnOnce(&[u8]) -> LibCaliptraResult<Vec<u8>>,
    ) -> LibCaliptraResult<R> {
        if let Some(handle) = cmd.handle() {
            self.check_handle(handle)?;
        }
        let bytes = encode(cmd, self.profile)?;
        let resp = send(&bytes)?;
        match parse_response::<R>(&resp, self.profile) {
            Err(LibCaliptraError::Dpe(DpeError::InvalidHandle)) => {
                if let Some(handle) = cmd.handle() {
                    log::info!("RoT rejected DPE handle {:02x?}; dropping it", handle.0);
                    self.forget(handle);
                }
                Err(DpeError::InvalidHandle.into())
            }
            other => other,
        }
    }

    pub fn get_profile(
        &mut self,
        transport: &mut impl DpeTransport,
    ) -> LibCaliptraResult<GetProfileResp> {
        self.invoke(transport, &DpeCommand::GetProfile)
    }

    pub fn initialize_context(
        &mut self,
        transport: &mut impl DpeTransport,
        flags: InitCtxFlags,
    ) -> LibCaliptraResult<ContextHandle> {
        let resp: NewHandleResp =
            self.invoke(transport, &DpeCommand::InitializeContext(flags))?;
        self.track(resp.handle);
        Ok(resp.handle)
    }

    /// Derives a child of `handle`. Without `RETAIN_PARENT_CONTEXT` the child
    /// takes over the parent's slot and `handle` is retired; with it the
    /// parent slot adopts the rotated parent handle and a new slot is created
    /// for the child.
    pub fn derive_context(
        &mut self,
        transport: &mut impl DpeTransport,
        handle: ContextHandle,
        data: &[u8],
        flags: DeriveContextFlags,
        tci_type: u32,
        target_locality: u32,
    ) -> LibCaliptraResult<DeriveContextResp> {
        if let Some(combination) = self.policy.violation(flags) {
            log::warn!("DeriveContext flags {:?} not allowed", combination);
            return Err(DpeError::InvalidArgument.into());
        }
        let cmd = DpeCommand::DeriveContext(DeriveContextCmd {
            handle,
            data: data.to_vec(),
            flags,
            tci_type,
            target_locality,
        });
        let resp: DeriveContextResp = self.invoke(transport, &cmd)?;

        let child_exists = resp.handle != ContextHandle::invalid_handle();
        if flags.contains(DeriveContextFlags::RETAIN_PARENT_CONTEXT) {
            let parent = self.note_rotation(handle, resp.parent_handle);
            if let Some(ctx) = self.contexts.get_mut(&parent) {
                ctx.retained = true;
            }
            if child_exists {
                self.unretire(resp.handle);
                let child = self.insert(resp.handle, Some(parent));
                if let Some(ctx) = self.contexts.get_mut(&child) {
                    ctx.export_cdi = flags.contains(DeriveContextFlags::EXPORT_CDI);
                }
            }
        } else if child_exists {
            let slot = self.note_rotation(handle, resp.handle);
            if let Some(ctx) = self.contexts.get_mut(&slot) {
                ctx.export_cdi = flags.contains(DeriveContextFlags::EXPORT_CDI);
            }
        } else {
            self.forget(handle);
        }
        log::debug!("DeriveContext {:?} -> {:02x?}", flags, resp.handle.0);
        Ok(resp)
    }

    pub fn certify_key(
        &mut self,
        transport: &mut impl DpeTransport,
        handle: ContextHandle,
        flags: u32,
        format: CertifyKeyFormat,
        label: &[u8],
    ) -> LibCaliptraResult<CertifyKeyResp> {
        let cmd = DpeCommand::CertifyKey(CertifyKeyCmd {
            handle,
            flags,
            format,
            label: label.to_vec(),
        });
        let resp: CertifyKeyResp = self.invoke(transport, &cmd)?;
        self.note_rotation(handle, resp.new_context_handle);
        Ok(resp)
    }

    /// CertifyKey carried by CERTIFY_KEY_EXTENDED. `send` delivers the
    /// command body, which has no DPE header, and returns the DPE response
    /// embedded in the mailbox response.
    pub fn certify_key_extended(
        &mut self,
        handle: ContextHandle,
        label: &[u8],
        send: impl FnOnce(&[u8]) -> LibCaliptraResult<Vec<u8>>,
    ) -> LibCaliptraResult<CertifyKeyResp> {
        let cmd = DpeCommand::CertifyKey(CertifyKeyCmd {
            handle,
            flags: 0,
            format: CertifyKeyFormat::X509,
            label: label.to_vec(),
        });
        let resp: CertifyKeyResp = self.exchange(&cmd, DpeCommand::encode_body, send)?;
        self.note_rotation(handle, resp.new_context_handle);
        Ok(resp)
    }

    pub fn sign(
        &mut self,
        transport: &mut impl DpeTransport,
        handle: ContextHandle,
        label: &[u8],
        flags: u32,
        digest: &[u8],
    ) -> LibCaliptraResult<SignResp> {
        let cmd = DpeCommand::Sign(SignCmd {
            handle,
            label: label.to_vec(),
            flags,
            digest: digest.to_vec(),
        });
        let resp: SignResp = self.invoke(transport, &cmd)?;
        self.note_rotation(handle, resp.new_context_handle);
        Ok(resp)
    }

    pub fn rotate_context_handle(
        &mut self,
        transport: &mut impl DpeTransport,
        handle: ContextHandle,
        flags: RotateCtxFlags,
    ) -> LibCaliptraResult<ContextHandle> {
        let cmd = DpeCommand::RotateContextHandle(RotateCtxCmd { handle, flags });
        let resp: NewHandleResp = self.invoke(transport, &cmd)?;
        self.note_rotation(handle, resp.handle);
        Ok(resp.handle)
    }

    /// Destroys the context and its descendants. Their handles are retired.
    pub fn destroy_context(
        &mut self,
        transport: &mut impl DpeTransport,
        handle: ContextHandle,
    ) -> LibCaliptraResult<()> {
        let cmd = DpeCommand::DestroyContext(DestroyCtxCmd { handle });
        self.invoke::<()>(transport, &cmd)?;
        self.forget(handle);
        Ok(())
    }

    pub fn get_certificate_chain(
        &mut self,
        transport: &mut impl DpeTransport,
        offset: u32,
        size: u32,
    ) -> LibCaliptraResult<Vec<u8>> {
        let cmd = DpeCommand::GetCertificateChain(GetCertificateChainCmd { offset, size });
        let resp: GetCertificateChainResp = self.invoke(transport, &cmd)?;
        Ok(resp.certificate_chain)
    }

    /// Reads the whole chain in `CERT_CHAIN_CHUNK_SIZE` pieces. A chain
    /// growing past `MAX_CERT_CHAIN_SIZE` fails with `ApiInternalError`.
    pub fn get_full_certificate_chain(
        &mut self,
        transport: &mut impl DpeTransport,
    ) -> LibCaliptraResult<Vec<u8>> {
        let mut chain = Vec::new();
        loop {
            let chunk = self.get_certificate_chain(
                transport,
                chain.len() as u32,
                Self::CERT_CHAIN_CHUNK_SIZE,
            )?;
            chain.extend_from_slice(&chunk);
            if chunk.len() < Self::CERT_CHAIN_CHUNK_SIZE as usize {
                return Ok(chain);
            }
            if chain.len() > Self::MAX_CERT_CHAIN_SIZE {
                log::warn!("certificate chain exceeds {} bytes", Self::MAX_CERT_CHAIN_SIZE);
                return Err(ApiError::ApiInternalError.into());
            }
        }
    }
}
