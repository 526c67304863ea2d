// Licensed under the Apache-2.0 license

//! A small DPE instance answering INVOKE_DPE commands. Keys, certificates
//! and signatures are SHA-384 derived placeholders, not real crypto.

use libcaliptra::dpe::{
    encode_error_response, encode_response, CertifyKeyCmd, CertifyKeyResp, CommandHdr,
    ContextHandle, DeriveContextCmd, DeriveContextFlags, DeriveContextResp, DpeCommand,
    DpeCommandId, DpeProfile, DpeResponse, GetCertificateChainCmd, GetCertificateChainResp,
    GetProfileResp, InitCtxFlags, NewHandleResp, RotateCtxCmd, RotateCtxFlags, SignCmd, SignResp,
};
use libcaliptra::error::DpeError;
use sha2::{Digest, Sha384};
use zerocopy::IntoBytes;

pub const MAX_HANDLES: usize = 24;
pub const MAX_CHUNK_SIZE: u32 = 2048;
pub const CERT_CHAIN_SIZE: usize = 3000;

const VENDOR_ID: u32 = u32::from_be_bytes(*b"CTRA");
const VENDOR_SKU: u32 = u32::from_be_bytes(*b"CTRA");

#[derive(Debug, Clone)]
struct TciNode {
    /// `None` once the context is no longer addressable, e.g. a parent that
    /// was not retained or a stashed measurement.
    handle: Option<ContextHandle>,
    parent: Option<usize>,
    tci_cumulative: [u8; 48],
}

pub struct DpeInstance {
    profile: DpeProfile,
    nodes: Vec<Option<TciNode>>,
    handle_counter: u64,
    cert_chain: Vec<u8>,
}

type DpeResult<T> = Result<T, DpeError>;

fn sha384(parts: &[&[u8]]) -> [u8; 48] {
    let mut hasher = Sha384::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

impl DpeInstance {
    /// Boots with the default context in place.
    pub fn new(profile: DpeProfile) -> Self {
        let mut cert_chain = Vec::with_capacity(CERT_CHAIN_SIZE);
        let mut block = sha384(&[b"cert chain".as_slice()]);
        while cert_chain.len() < CERT_CHAIN_SIZE {
            cert_chain.extend_from_slice(&block);
            block = sha384(&[block.as_slice()]);
        }
        cert_chain.truncate(CERT_CHAIN_SIZE);

        let mut instance = Self {
            profile,
            nodes: vec![None; MAX_HANDLES],
            handle_counter: 0,
            cert_chain,
        };
        instance.nodes[0] = Some(TciNode {
            handle: Some(ContextHandle::default_handle()),
            parent: None,
            tci_cumulative: [0; 48],
        });
        instance
    }

    pub fn profile(&self) -> DpeProfile {
        self.profile
    }

    pub fn cert_chain(&self) -> &[u8] {
        &self.cert_chain
    }

    /// Handles that currently name a live context.
    pub fn active_handles(&self) -> Vec<ContextHandle> {
        self.nodes
            .iter()
            .flatten()
            .filter_map(|node| node.handle)
            .collect()
    }

    pub fn used_nodes(&self) -> usize {
        self.nodes.iter().flatten().count()
    }

    /// Executes one DPE command and returns the encoded response.
    pub fn execute(&mut self, cmd: &[u8]) -> Vec<u8> {
        match self.dispatch(cmd) {
            Ok(resp) => resp,
            Err(err) => {
                log::debug!("DPE command failed: {}", err);
                encode_error_response(self.profile, err)
            }
        }
    }

    fn dispatch(&mut self, bytes: &[u8]) -> DpeResult<Vec<u8>> {
        let (profile, cmd) = DpeCommand::decode(bytes)?;
        if profile != self.profile {
            return Err(DpeError::InvalidCommand);
        }
        match cmd {
            DpeCommand::GetProfile => self.ok(&GetProfileResp {
                major_version: 0,
                minor_version: 10,
                vendor_id: VENDOR_ID,
                vendor_sku: VENDOR_SKU,
                max_tci_nodes: MAX_HANDLES as u32,
                flags: 0,
            }),
            DpeCommand::InitializeContext(flags) => {
                let handle = self.initialize_context(flags)?;
                self.ok(&NewHandleResp { handle })
            }
            DpeCommand::DeriveContext(cmd) => {
                let resp = self.derive_context(&cmd)?;
                self.ok(&resp)
            }
            DpeCommand::CertifyKey(cmd) => {
                let resp = self.certify_key(&cmd)?;
                self.ok(&resp)
            }
            DpeCommand::Sign(cmd) => {
                let resp = self.sign(&cmd)?;
                self.ok(&resp)
            }
            DpeCommand::RotateContextHandle(cmd) => {
                let handle = self.rotate(&cmd)?;
                self.ok(&NewHandleResp { handle })
            }
            DpeCommand::DestroyContext(cmd) => {
                let idx = self.find(cmd.handle)?;
                self.destroy(idx);
                self.ok(&())
            }
            DpeCommand::GetCertificateChain(cmd) => {
                let resp = self.get_certificate_chain(&cmd)?;
                self.ok(&resp)
            }
        }
    }

    fn ok<R: DpeResponse>(&self, resp: &R) -> DpeResult<Vec<u8>> {
        Ok(encode_response(self.profile, resp))
    }

    fn find(&self, handle: ContextHandle) -> DpeResult<usize> {
        self.nodes
            .iter()
            .position(|node| matches!(node, Some(n) if n.handle == Some(handle)))
            .ok_or(DpeError::InvalidHandle)
    }

    fn has_default(&self) -> bool {
        self.find(ContextHandle::default_handle()).is_ok()
    }

    fn free_slot(&self) -> DpeResult<usize> {
        self.nodes
            .iter()
            .position(Option::is_none)
            .ok_or(DpeError::MaxTcis)
    }

    fn node_mut(&mut self, idx: usize) -> DpeResult<&mut TciNode> {
        self.nodes
            .get_mut(idx)
            .and_then(Option::as_mut)
            .ok_or(DpeError::InternalError)
    }

    fn tci(&self, idx: usize) -> [u8; 48] {
        self.nodes
            .get(idx)
            .and_then(Option::as_ref)
            .map(|node| node.tci_cumulative)
            .unwrap_or([0; 48])
    }

    fn fresh_handle(&mut self) -> ContextHandle {
        loop {
            self.handle_counter += 1;
            let digest = sha384(&[b"handle".as_slice(), &self.handle_counter.to_le_bytes()]);
            let mut handle = ContextHandle::default();
            handle.0.copy_from_slice(&digest[..ContextHandle::SIZE]);
            if !handle.is_default() && handle != ContextHandle::invalid_handle() {
                return handle;
            }
        }
    }

    /// Default contexts keep their handle, everything else is rotated.
    fn rotate_node(&mut self, idx: usize) -> DpeResult<ContextHandle> {
        let fresh = self.fresh_handle();
        let node = self.node_mut(idx)?;
        match node.handle {
            Some(handle) if handle.is_default() => Ok(handle),
            _ => {
                node.handle = Some(fresh);
                Ok(fresh)
            }
        }
    }

    fn initialize_context(&mut self, flags: InitCtxFlags) -> DpeResult<ContextHandle> {
        let handle = if flags == InitCtxFlags::DEFAULT {
            if self.has_default() {
                return Err(DpeError::ArgumentNotSupported);
            }
            ContextHandle::default_handle()
        } else if flags == InitCtxFlags::SIMULATION {
            self.fresh_handle()
        } else {
            return Err(DpeError::InvalidArgument);
        };
        let idx = self.free_slot()?;
        self.nodes[idx] = Some(TciNode {
            handle: Some(handle),
            parent: None,
            tci_cumulative: [0; 48],
        });
        Ok(handle)
    }

    fn derive_context(&mut self, cmd: &DeriveContextCmd) -> DpeResult<DeriveContextResp> {
        let parent = self.find(cmd.handle)?;
        let slot = self.free_slot()?;
        let retain = cmd.flags.contains(DeriveContextFlags::RETAIN_PARENT_CONTEXT);
        let tci_cumulative = sha384(&[self.tci(parent).as_slice(), &cmd.data]);

        let (handle, parent_handle) = if retain {
            let parent_handle = self.rotate_node(parent)?;
            (self.fresh_handle(), parent_handle)
        } else {
            let node = self.node_mut(parent)?;
            let inherit_default = node.handle.is_some_and(|h| h.is_default());
            node.handle = None;
            let handle = if inherit_default {
                ContextHandle::default_handle()
            } else {
                self.fresh_handle()
            };
            (handle, ContextHandle::invalid_handle())
        };

        self.nodes[slot] = Some(TciNode {
            handle: Some(handle),
            parent: Some(parent),
            tci_cumulative,
        });
        Ok(DeriveContextResp {
            handle,
            parent_handle,
        })
    }

    fn derive_key(&self, idx: usize, label: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let size = self.profile.ecc_int_size();
        let tci = self.tci(idx);
        let x = sha384(&[b"pub x".as_slice(), &tci, label]);
        let y = sha384(&[b"pub y".as_slice(), &tci, label]);
        (x[..size].to_vec(), y[..size].to_vec())
    }

    fn certify_key(&mut self, cmd: &CertifyKeyCmd) -> DpeResult<CertifyKeyResp> {
        let idx = self.find(cmd.handle)?;
        let (derived_pubkey_x, derived_pubkey_y) = self.derive_key(idx, &cmd.label);
        let mut cert = Vec::with_capacity(128);
        cert.extend_from_slice(&[0x30, 0x7e]);
        cert.extend_from_slice(&sha384(&[
            b"cert".as_slice(),
            &derived_pubkey_x,
            &derived_pubkey_y,
        ]));
        cert.extend_from_slice(&derived_pubkey_x);
        cert.resize(128, 0);
        let new_context_handle = self.rotate_node(idx)?;
        Ok(CertifyKeyResp {
            new_context_handle,
            derived_pubkey_x,
            derived_pubkey_y,
            cert,
        })
    }

    fn sign(&mut self, cmd: &SignCmd) -> DpeResult<SignResp> {
        let idx = self.find(cmd.handle)?;
        let size = self.profile.ecc_int_size();
        let tci = self.tci(idx);
        let sig_r = sha384(&[b"sig r".as_slice(), &tci, &cmd.label, &cmd.digest]);
        let sig_s = sha384(&[b"sig s".as_slice(), &tci, &cmd.label, &cmd.digest]);
        let new_context_handle = self.rotate_node(idx)?;
        Ok(SignResp {
            new_context_handle,
            sig_r: sig_r[..size].to_vec(),
            sig_s: sig_s[..size].to_vec(),
        })
    }

    fn rotate(&mut self, cmd: &RotateCtxCmd) -> DpeResult<ContextHandle> {
        let idx = self.find(cmd.handle)?;
        let handle = if cmd.flags.contains(RotateCtxFlags::TARGET_IS_DEFAULT) {
            if !cmd.handle.is_default() && self.has_default() {
                return Err(DpeError::InvalidArgument);
            }
            ContextHandle::default_handle()
        } else {
            self.fresh_handle()
        };
        self.node_mut(idx)?.handle = Some(handle);
        Ok(handle)
    }

    /// Frees `idx` and everything derived from it.
    fn destroy(&mut self, idx: usize) {
        let mut doomed = vec![idx];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            for (child, node) in self.nodes.iter().enumerate() {
                if matches!(node, Some(n) if n.parent == Some(parent)) && !doomed.contains(&child)
                {
                    doomed.push(child);
                }
            }
            i += 1;
        }
        for idx in doomed {
            self.nodes[idx] = None;
        }
    }

    fn get_certificate_chain(
        &self,
        cmd: &GetCertificateChainCmd,
    ) -> DpeResult<GetCertificateChainResp> {
        if cmd.size > MAX_CHUNK_SIZE {
            return Err(DpeError::InvalidArgument);
        }
        let offset = cmd.offset as usize;
        if offset > self.cert_chain.len() {
            return Err(DpeError::InvalidArgument);
        }
        let end = (offset + cmd.size as usize).min(self.cert_chain.len());
        Ok(GetCertificateChainResp {
            certificate_chain: self.cert_chain[offset..end].to_vec(),
        })
    }

    /// STASH_MEASUREMENT: records a measurement under the default context.
    /// The node is not addressable through a handle.
    pub fn stash_measurement(&mut self, measurement: &[u8]) -> DpeResult<()> {
        let parent = self.find(ContextHandle::default_handle())?;
        let slot = self.free_slot()?;
        let tci_cumulative = sha384(&[self.tci(parent).as_slice(), measurement]);
        self.nodes[slot] = Some(TciNode {
            handle: None,
            parent: Some(parent),
            tci_cumulative,
        });
        Ok(())
    }

    /// Body of a CertifyKey command embedded in CERTIFY_KEY_EXTENDED. The
    /// body is padded to the fixed request size, so the trailing bytes are
    /// ignored.
    pub fn certify_key_extended(&mut self, body: &[u8]) -> Vec<u8> {
        let label_len = self.profile.hash_size();
        let used = ContextHandle::SIZE + 8 + label_len;
        let Some(body) = body.get(..used) else {
            return encode_error_response(self.profile, DpeError::InvalidArgument);
        };
        let mut cmd = CommandHdr::new(DpeCommandId::CERTIFY_KEY, self.profile)
            .as_bytes()
            .to_vec();
        cmd.extend_from_slice(body);
        self.execute(&cmd)
    }
}
