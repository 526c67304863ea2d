// Licensed under the Apache-2.0 license

use super::{
    CertifyKeyFormat, ContextHandle, DeriveContextFlags, DpeCommandId, DpeProfile, InitCtxFlags,
    RotateCtxFlags, DPE_CMD_MAGIC, DPE_RESP_MAGIC,
};
use libcaliptra_error::{ApiError, DpeError, LibCaliptraResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Header in front of every DPE command.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct CommandHdr {
    pub magic: u32,
    pub cmd_id: u32,
    pub profile: u32,
}

impl CommandHdr {
    pub fn new(cmd_id: DpeCommandId, profile: DpeProfile) -> Self {
        Self {
            magic: DPE_CMD_MAGIC,
            cmd_id: cmd_id.into(),
            profile: profile as u32,
        }
    }
}

/// Header in front of every DPE response. An error response is this
/// header alone.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct ResponseHdr {
    pub magic: u32,
    pub status: u32,
    pub profile: u32,
}

impl ResponseHdr {
    pub fn new(profile: DpeProfile, status: u32) -> Self {
        Self {
            magic: DPE_RESP_MAGIC,
            status,
            profile: profile as u32,
        }
    }
}

/// DeriveContext fields following the parent handle and the measurement.
#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct DeriveContextTail {
    flags: u32,
    tci_type: u32,
    target_locality: u32,
}

/// CertifyKey fields ahead of the label.
#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct CertifyKeyHead {
    handle: ContextHandle,
    flags: u32,
    format: u32,
}

#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct RotateCtxBody {
    handle: ContextHandle,
    flags: u32,
}

/// Cursor over a DPE message. Fixed-layout pieces are read with zerocopy;
/// `bytes` covers the fields whose size depends on the profile.
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn read<T: FromBytes>(&mut self) -> Option<T> {
        let (value, rest) = T::read_from_prefix(self.buf).ok()?;
        self.buf = rest;
        Some(value)
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.buf.len() < len {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

fn put_hash(out: &mut Vec<u8>, value: &[u8], profile: DpeProfile) -> LibCaliptraResult<()> {
    if value.len() != profile.hash_size() {
        log::warn!(
            "{} byte field does not match {:?} hash size",
            value.len(),
            profile
        );
        return Err(ApiError::InvalidParams.into());
    }
    out.extend_from_slice(value);
    Ok(())
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeriveContextCmd {
    pub handle: ContextHandle,
    /// Measurement of the child, one hash in size.
    pub data: Vec<u8>,
    pub flags: DeriveContextFlags,
    pub tci_type: u32,
    pub target_locality: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CertifyKeyCmd {
    pub handle: ContextHandle,
    pub flags: u32,
    pub format: CertifyKeyFormat,
    pub label: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignCmd {
    pub handle: ContextHandle,
    pub label: Vec<u8>,
    pub flags: u32,
    pub digest: Vec<u8>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RotateCtxCmd {
    pub handle: ContextHandle,
    pub flags: RotateCtxFlags,
}

#[repr(C)]
#[derive(Debug, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DestroyCtxCmd {
    pub handle: ContextHandle,
}

#[repr(C)]
#[derive(Debug, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GetCertificateChainCmd {
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DpeCommand {
    GetProfile,
    InitializeContext(InitCtxFlags),
    DeriveContext(DeriveContextCmd),
    CertifyKey(CertifyKeyCmd),
    Sign(SignCmd),
    RotateContextHandle(RotateCtxCmd),
    DestroyContext(DestroyCtxCmd),
    GetCertificateChain(GetCertificateChainCmd),
}

impl DpeCommand {
    pub fn id(&self) -> DpeCommandId {
        match self {
            DpeCommand::GetProfile => DpeCommandId::GET_PROFILE,
            DpeCommand::InitializeContext(_) => DpeCommandId::INITIALIZE_CONTEXT,
            DpeCommand::DeriveContext(_) => DpeCommandId::DERIVE_CONTEXT,
            DpeCommand::CertifyKey(_) => DpeCommandId::CERTIFY_KEY,
            DpeCommand::Sign(_) => DpeCommandId::SIGN,
            DpeCommand::RotateContextHandle(_) => DpeCommandId::ROTATE_CONTEXT_HANDLE,
            DpeCommand::DestroyContext(_) => DpeCommandId::DESTROY_CONTEXT,
            DpeCommand::GetCertificateChain(_) => DpeCommandId::GET_CERTIFICATE_CHAIN,
        }
    }

    /// The handle this command operates on, if any.
    pub fn handle(&self) -> Option<ContextHandle> {
        match self {
            DpeCommand::DeriveContext(cmd) => Some(cmd.handle),
            DpeCommand::CertifyKey(cmd) => Some(cmd.handle),
            DpeCommand::Sign(cmd) => Some(cmd.handle),
            DpeCommand::RotateContextHandle(cmd) => Some(cmd.handle),
            DpeCommand::DestroyContext(cmd) => Some(cmd.handle),
            DpeCommand::GetProfile
            | DpeCommand::InitializeContext(_)
            | DpeCommand::GetCertificateChain(_) => None,
        }
    }

    /// Command header followed by the body.
    pub fn encode(&self, profile: DpeProfile) -> LibCaliptraResult<Vec<u8>> {
        let mut out = CommandHdr::new(self.id(), profile)
            .as_bytes()
            .to_vec();
        self.encode_body_into(profile, &mut out)?;
        Ok(out)
    }

    /// The body alone, as embedded in CERTIFY_KEY_EXTENDED.
    pub fn encode_body(&self, profile: DpeProfile) -> LibCaliptraResult<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        self.encode_body_into(profile, &mut out)?;
        Ok(out)
    }

    fn encode_body_into(&self, profile: DpeProfile, out: &mut Vec<u8>) -> LibCaliptraResult<()> {
        match self {
            DpeCommand::GetProfile => (),
            DpeCommand::InitializeContext(flags) => out.extend_from_slice(flags.bits().as_bytes()),
            DpeCommand::DeriveContext(cmd) => {
                out.extend_from_slice(cmd.handle.as_bytes());
                put_hash(out, &cmd.data, profile)?;
                let tail = DeriveContextTail {
                    flags: cmd.flags.bits(),
                    tci_type: cmd.tci_type,
                    target_locality: cmd.target_locality,
                };
                out.extend_from_slice(tail.as_bytes());
            }
            DpeCommand::CertifyKey(cmd) => {
                let head = CertifyKeyHead {
                    handle: cmd.handle,
                    flags: cmd.flags,
                    format: cmd.format as u32,
                };
                out.extend_from_slice(head.as_bytes());
                put_hash(out, &cmd.label, profile)?;
            }
            DpeCommand::Sign(cmd) => {
                out.extend_from_slice(cmd.handle.as_bytes());
                put_hash(out, &cmd.label, profile)?;
                out.extend_from_slice(cmd.flags.as_bytes());
                put_hash(out, &cmd.digest, profile)?;
            }
            DpeCommand::RotateContextHandle(cmd) => {
                let body = RotateCtxBody {
                    handle: cmd.handle,
                    flags: cmd.flags.bits(),
                };
                out.extend_from_slice(body.as_bytes());
            }
            DpeCommand::DestroyContext(cmd) => out.extend_from_slice(cmd.as_bytes()),
            DpeCommand::GetCertificateChain(cmd) => out.extend_from_slice(cmd.as_bytes()),
        }
        Ok(())
    }

    /// Parses a full command as the RoT receives it.
    pub fn decode(bytes: &[u8]) -> Result<(DpeProfile, DpeCommand), DpeError> {
        let mut r = Reader::new(bytes);
        let hdr: CommandHdr = r.read().ok_or(DpeError::InvalidCommand)?;
        if hdr.magic != DPE_CMD_MAGIC {
            return Err(DpeError::InvalidCommand);
        }
        let profile = DpeProfile::try_from(hdr.profile).map_err(|_| DpeError::InvalidCommand)?;
        let cmd = Self::decode_body(DpeCommandId(hdr.cmd_id), profile, &mut r)?;
        if r.remaining() != 0 {
            return Err(DpeError::InvalidCommand);
        }
        Ok((profile, cmd))
    }

    fn decode_body(
        id: DpeCommandId,
        profile: DpeProfile,
        r: &mut Reader<'_>,
    ) -> Result<DpeCommand, DpeError> {
        let hash = profile.hash_size();
        let cmd = match id {
            DpeCommandId::GET_PROFILE => Some(DpeCommand::GetProfile),
            DpeCommandId::INITIALIZE_CONTEXT => r
                .read::<u32>()
                .map(|flags| DpeCommand::InitializeContext(InitCtxFlags::from_bits_retain(flags))),
            DpeCommandId::DERIVE_CONTEXT => (|| {
                let handle = r.read::<ContextHandle>()?;
                let data = r.bytes(hash)?.to_vec();
                let tail: DeriveContextTail = r.read()?;
                Some(DpeCommand::DeriveContext(DeriveContextCmd {
                    handle,
                    data,
                    flags: DeriveContextFlags::from_bits_retain(tail.flags),
                    tci_type: tail.tci_type,
                    target_locality: tail.target_locality,
                }))
            })(),
            DpeCommandId::CERTIFY_KEY => (|| {
                let head: CertifyKeyHead = r.read()?;
                Some(DpeCommand::CertifyKey(CertifyKeyCmd {
                    handle: head.handle,
                    flags: head.flags,
                    format: CertifyKeyFormat::try_from(head.format).ok()?,
                    label: r.bytes(hash)?.to_vec(),
                }))
            })(),
            DpeCommandId::SIGN => (|| {
                Some(DpeCommand::Sign(SignCmd {
                    handle: r.read::<ContextHandle>()?,
                    label: r.bytes(hash)?.to_vec(),
                    flags: r.read::<u32>()?,
                    digest: r.bytes(hash)?.to_vec(),
                }))
            })(),
            DpeCommandId::ROTATE_CONTEXT_HANDLE => r.read::<RotateCtxBody>().map(|body| {
                DpeCommand::RotateContextHandle(RotateCtxCmd {
                    handle: body.handle,
                    flags: RotateCtxFlags::from_bits_retain(body.flags),
                })
            }),
            DpeCommandId::DESTROY_CONTEXT => r
                .read::<DestroyCtxCmd>()
                .map(DpeCommand::DestroyContext),
            DpeCommandId::GET_CERTIFICATE_CHAIN => r
                .read::<GetCertificateChainCmd>()
                .map(DpeCommand::GetCertificateChain),
            _ => return Err(DpeError::InvalidCommand),
        };
        cmd.ok_or(DpeError::InvalidArgument)
    }
}

/// A DPE response body, following the common response header.
pub trait DpeResponse: Sized {
    fn encode_body(&self, profile: DpeProfile, out: &mut Vec<u8>);
    fn decode_body(r: &mut Reader<'_>, profile: DpeProfile) -> Option<Self>;
}

impl DpeResponse for () {
    fn encode_body(&self, _profile: DpeProfile, _out: &mut Vec<u8>) {}
    fn decode_body(_r: &mut Reader<'_>, _profile: DpeProfile) -> Option<Self> {
        Some(())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct GetProfileResp {
    pub major_version: u16,
    pub minor_version: u16,
    pub vendor_id: u32,
    pub vendor_sku: u32,
    pub max_tci_nodes: u32,
    pub flags: u32,
}

impl DpeResponse for GetProfileResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode_body(r: &mut Reader<'_>, _profile: DpeProfile) -> Option<Self> {
        r.read()
    }
}

/// Response of InitializeContext and RotateCtxHandle.
#[repr(C)]
#[derive(Debug, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct NewHandleResp {
    pub handle: ContextHandle,
}

impl DpeResponse for NewHandleResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode_body(r: &mut Reader<'_>, _profile: DpeProfile) -> Option<Self> {
        r.read()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct DeriveContextResp {
    pub handle: ContextHandle,
    pub parent_handle: ContextHandle,
}

impl DpeResponse for DeriveContextResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }

    fn decode_body(r: &mut Reader<'_>, _profile: DpeProfile) -> Option<Self> {
        r.read()
    }
}

/// The public key coordinates are sized by the profile and the certificate
/// is length prefixed, so only the handle has a fixed layout.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CertifyKeyResp {
    pub new_context_handle: ContextHandle,
    pub derived_pubkey_x: Vec<u8>,
    pub derived_pubkey_y: Vec<u8>,
    pub cert: Vec<u8>,
}

impl DpeResponse for CertifyKeyResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice(self.new_context_handle.as_bytes());
        out.extend_from_slice(&self.derived_pubkey_x);
        out.extend_from_slice(&self.derived_pubkey_y);
        out.extend_from_slice((self.cert.len() as u32).as_bytes());
        out.extend_from_slice(&self.cert);
    }

    fn decode_body(r: &mut Reader<'_>, profile: DpeProfile) -> Option<Self> {
        let new_context_handle = r.read::<ContextHandle>()?;
        let derived_pubkey_x = r.bytes(profile.ecc_int_size())?.to_vec();
        let derived_pubkey_y = r.bytes(profile.ecc_int_size())?.to_vec();
        let cert_size = r.read::<u32>()? as usize;
        Some(Self {
            new_context_handle,
            derived_pubkey_x,
            derived_pubkey_y,
            cert: r.bytes(cert_size)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignResp {
    pub new_context_handle: ContextHandle,
    pub sig_r: Vec<u8>,
    pub sig_s: Vec<u8>,
}

impl DpeResponse for SignResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice(self.new_context_handle.as_bytes());
        out.extend_from_slice(&self.sig_r);
        out.extend_from_slice(&self.sig_s);
    }

    fn decode_body(r: &mut Reader<'_>, profile: DpeProfile) -> Option<Self> {
        Some(Self {
            new_context_handle: r.read::<ContextHandle>()?,
            sig_r: r.bytes(profile.ecc_int_size())?.to_vec(),
            sig_s: r.bytes(profile.ecc_int_size())?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct GetCertificateChainResp {
    pub certificate_chain: Vec<u8>,
}

impl DpeResponse for GetCertificateChainResp {
    fn encode_body(&self, _profile: DpeProfile, out: &mut Vec<u8>) {
        out.extend_from_slice((self.certificate_chain.len() as u32).as_bytes());
        out.extend_from_slice(&self.certificate_chain);
    }

    fn decode_body(r: &mut Reader<'_>, _profile: DpeProfile) -> Option<Self> {
        let size = r.read::<u32>()? as usize;
        Some(Self {
            certificate_chain: r.bytes(size)?.to_vec(),
        })
    }
}

/// Successful response as the RoT sends it.
pub fn encode_response<R: DpeResponse>(profile: DpeProfile, resp: &R) -> Vec<u8> {
    let mut out = ResponseHdr::new(profile, DpeError::NO_ERROR)
        .as_bytes()
        .to_vec();
    resp.encode_body(profile, &mut out);
    out
}

/// Failed response: the header alone, carrying the error code.
pub fn encode_error_response(profile: DpeProfile, err: DpeError) -> Vec<u8> {
    ResponseHdr::new(profile, err.code()).as_bytes().to_vec()
}

/// Validates the response header and decodes the body. A DPE error status
/// maps to the matching `DpeError`.
pub fn parse_response<R: DpeResponse>(bytes: &[u8], profile: DpeProfile) -> LibCaliptraResult<R> {
    let mut r = Reader::new(bytes);
    let Some(hdr) = r.read::<ResponseHdr>() else {
        log::warn!("DPE response shorter than its header: {} bytes", bytes.len());
        return Err(ApiError::ApiInternalError.into());
    };
    if hdr.magic != DPE_RESP_MAGIC {
        log::warn!("bad DPE response magic 0x{:08x}", hdr.magic);
        return Err(ApiError::ApiInternalError.into());
    }
    if let Err(err) = DpeError::check(hdr.status) {
        log::debug!("DPE returned {}", err);
        return Err(err);
    }
    if hdr.profile != profile as u32 {
        log::warn!("DPE response profile {} expected {:?}", hdr.profile, profile);
        return Err(ApiError::ApiInternalError.into());
    }
    R::decode_body(&mut r, profile).ok_or_else(|| {
        log::warn!("truncated DPE response body");
        ApiError::ApiInternalError.into()
    })
}
