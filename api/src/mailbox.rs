// Licensed under the Apache-2.0 license

use crate::checksum::calc_checksum;
use bitflags::bitflags;
use core::mem::size_of;
use libcaliptra_error::{ApiError, LibCaliptraResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Mailbox SRAM capacity.
pub const MAX_MAILBOX_SIZE: usize = 128 << 10;

#[derive(PartialEq, Eq, Clone, Copy, Debug, Hash)]
pub struct CommandId(pub u32);

impl CommandId {
    pub const FIRMWARE_LOAD: Self = Self(0x46574C44); // "FWLD"
    pub const GET_IDEV_CSR: Self = Self(0x4944_4352); // "IDCR"
    pub const STASH_MEASUREMENT: Self = Self(0x4D454153); // "MEAS"
    pub const INVOKE_DPE: Self = Self(0x44504543); // "DPEC"
    pub const CERTIFY_KEY_EXTENDED: Self = Self(0x434B4558); // "CKEX"
    pub const SET_AUTH_MANIFEST: Self = Self(0x4154_4D4E); // "ATMN"
    pub const AUTHORIZE_AND_STASH: Self = Self(0x4154_5348); // "ATSH"

    // FIPS module commands.
    pub const VERSION: Self = Self(0x4650_5652); // "FPVR"
}

impl From<u32> for CommandId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<CommandId> for u32 {
    fn from(value: CommandId) -> Self {
        value.0
    }
}

/// A trait implemented by request types. Describes the associated command ID
/// and response type.
pub trait Request: IntoBytes + FromBytes + Immutable + KnownLayout {
    const ID: CommandId;
    type Resp: Response;

    /// The bytes actually sent; variable-size requests trim unused capacity.
    fn as_bytes_partial(&self) -> LibCaliptraResult<&[u8]> {
        Ok(self.as_bytes())
    }

    fn as_bytes_partial_mut(&mut self) -> LibCaliptraResult<&mut [u8]> {
        Ok(self.as_mut_bytes())
    }
}

pub trait Response: IntoBytes + FromBytes
where
    Self: Sized,
{
    /// The minimum size (in bytes) of this response. Shorter responses are
    /// rejected; longer ones up to `size_of::<Self>()` are zero padded.
    const MIN_SIZE: usize = size_of::<Self>();

    fn populate_chksum(&mut self) {
        populate_checksum(self.as_mut_bytes());
    }
}

/// Fills in the leading checksum word of a response buffer.
pub fn populate_checksum(msg: &mut [u8]) {
    if msg.len() < size_of::<u32>() {
        return;
    }
    let (checksum_bytes, payload_bytes) = msg.split_at_mut(size_of::<u32>());
    let checksum = calc_checksum(0, payload_bytes);
    checksum_bytes.copy_from_slice(&checksum.to_le_bytes());
}

/// Computes the request checksum over `req` and writes it into its header.
pub fn populate_req_checksum<R: Request>(req: &mut R) -> LibCaliptraResult<()> {
    let bytes = req.as_bytes_partial_mut()?;
    if bytes.len() < size_of::<MailboxReqHeader>() {
        return Err(ApiError::InvalidParams.into());
    }
    let (header_bytes, payload_bytes) = bytes.split_at_mut(size_of::<MailboxReqHeader>());
    let checksum = calc_checksum(R::ID.into(), payload_bytes);
    header_bytes.copy_from_slice(&checksum.to_le_bytes());
    Ok(())
}

// HEADER
#[repr(C)]
#[derive(Default, Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct MailboxReqHeader {
    pub chksum: u32,
}

#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, KnownLayout, Immutable, PartialEq, Eq, Clone)]
pub struct MailboxRespHeader {
    pub chksum: u32,
    pub fips_status: u32,
}
impl Response for MailboxRespHeader {}

impl MailboxRespHeader {
    pub const FIPS_STATUS_APPROVED: u32 = 0;
}

impl Default for MailboxRespHeader {
    fn default() -> Self {
        Self {
            chksum: 0,
            fips_status: MailboxRespHeader::FIPS_STATUS_APPROVED,
        }
    }
}

/// FIPS status carried in every response header.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FipsStatus {
    Approved,
}

impl TryFrom<u32> for FipsStatus {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            MailboxRespHeader::FIPS_STATUS_APPROVED => Ok(FipsStatus::Approved),
            other => Err(other),
        }
    }
}

// Generic variable-sized data response type
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq, Clone)]
pub struct VarSizeDataResp {
    pub hdr: MailboxRespHeader,
    pub data_size: u32,
    pub data: [u8; VarSizeDataResp::DATA_MAX_SIZE], // variable length
}

impl VarSizeDataResp {
    pub const DATA_MAX_SIZE: usize = 4096;

    pub fn data(&self) -> Option<&[u8]> {
        self.data.get(..self.data_size as usize)
    }
}

impl Response for VarSizeDataResp {
    const MIN_SIZE: usize = size_of::<MailboxRespHeader>() + size_of::<u32>();
}

impl Default for VarSizeDataResp {
    fn default() -> Self {
        Self {
            hdr: MailboxRespHeader::default(),
            data_size: 0,
            data: [0u8; Self::DATA_MAX_SIZE],
        }
    }
}

// GET_IDEV_CSR
#[repr(C)]
#[derive(Default, Debug, IntoBytes, FromBytes, KnownLayout, Immutable, PartialEq, Eq)]
pub struct GetIdevCsrReq {
    pub hdr: MailboxReqHeader,
}

impl Request for GetIdevCsrReq {
    const ID: CommandId = CommandId::GET_IDEV_CSR;
    type Resp = GetIdevCsrResp;
}

pub type GetIdevCsrResp = VarSizeDataResp;

// FIPS_GET_VERSION
#[repr(C)]
#[derive(Default, Debug, IntoBytes, FromBytes, KnownLayout, Immutable, PartialEq, Eq)]
pub struct FipsVersionReq {
    pub hdr: MailboxReqHeader,
}

impl Request for FipsVersionReq {
    const ID: CommandId = CommandId::VERSION;
    type Resp = FipsVersionResp;
}

#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FipsVersionResp {
    pub hdr: MailboxRespHeader,
    pub mode: u32,
    pub fips_rev: [u32; 3],
    pub name: [u8; 12],
}
impl Response for FipsVersionResp {}

impl FipsVersionResp {
    pub const NAME: [u8; 12] = *b"Caliptra RTM";
    pub const MODE: u32 = 0x46495053;
}

// STASH_MEASUREMENT
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct StashMeasurementReq {
    pub hdr: MailboxReqHeader,
    pub metadata: [u8; 4],
    pub measurement: [u8; 48],
    pub context: [u8; 48],
    pub svn: u32,
}
impl Default for StashMeasurementReq {
    fn default() -> Self {
        Self {
            hdr: Default::default(),
            metadata: Default::default(),
            measurement: [0u8; 48],
            context: [0u8; 48],
            svn: Default::default(),
        }
    }
}
impl Request for StashMeasurementReq {
    const ID: CommandId = CommandId::STASH_MEASUREMENT;
    type Resp = StashMeasurementResp;
}

#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct StashMeasurementResp {
    pub hdr: MailboxRespHeader,
    pub dpe_result: u32,
}
impl Response for StashMeasurementResp {}

// CERTIFY_KEY_EXTENDED
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct CertifyKeyExtendedReq {
    pub hdr: MailboxReqHeader,
    pub flags: u32,
    pub certify_key_req: [u8; CertifyKeyExtendedReq::CERTIFY_KEY_REQ_SIZE],
}
impl CertifyKeyExtendedReq {
    pub const CERTIFY_KEY_REQ_SIZE: usize = 72;
}
impl Default for CertifyKeyExtendedReq {
    fn default() -> Self {
        Self {
            hdr: MailboxReqHeader::default(),
            flags: 0,
            certify_key_req: [0u8; Self::CERTIFY_KEY_REQ_SIZE],
        }
    }
}
impl Request for CertifyKeyExtendedReq {
    const ID: CommandId = CommandId::CERTIFY_KEY_EXTENDED;
    type Resp = CertifyKeyExtendedResp;
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct CertifyKeyExtendedFlags: u32 {
        const DMTF_OTHER_NAME = 1u32 << 31;
    }
}

#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct CertifyKeyExtendedResp {
    pub hdr: MailboxRespHeader,
    pub certify_key_resp: [u8; CertifyKeyExtendedResp::CERTIFY_KEY_RESP_SIZE],
}
impl CertifyKeyExtendedResp {
    pub const CERTIFY_KEY_RESP_SIZE: usize = 2176;
}
impl Default for CertifyKeyExtendedResp {
    fn default() -> Self {
        Self {
            hdr: MailboxRespHeader::default(),
            certify_key_resp: [0u8; Self::CERTIFY_KEY_RESP_SIZE],
        }
    }
}
impl Response for CertifyKeyExtendedResp {
    // The embedded DPE response is variable length.
    const MIN_SIZE: usize = size_of::<MailboxRespHeader>();
}

// INVOKE_DPE_COMMAND
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct InvokeDpeReq {
    pub hdr: MailboxReqHeader,
    pub data_size: u32,
    pub data: [u8; InvokeDpeReq::DATA_MAX_SIZE], // variable length
}

impl InvokeDpeReq {
    pub const DATA_MAX_SIZE: usize = 512;

    pub fn new(cmd: &[u8]) -> LibCaliptraResult<Self> {
        let mut req = Self::default();
        req.data
            .get_mut(..cmd.len())
            .ok_or(ApiError::InvalidParams)?
            .copy_from_slice(cmd);
        req.data_size = cmd.len() as u32;
        Ok(req)
    }
}

impl Request for InvokeDpeReq {
    const ID: CommandId = CommandId::INVOKE_DPE;
    type Resp = InvokeDpeResp;

    fn as_bytes_partial(&self) -> LibCaliptraResult<&[u8]> {
        if self.data_size as usize > Self::DATA_MAX_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        let unused_byte_count = Self::DATA_MAX_SIZE - self.data_size as usize;
        Ok(&self.as_bytes()[..size_of::<Self>() - unused_byte_count])
    }

    fn as_bytes_partial_mut(&mut self) -> LibCaliptraResult<&mut [u8]> {
        if self.data_size as usize > Self::DATA_MAX_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        let unused_byte_count = Self::DATA_MAX_SIZE - self.data_size as usize;
        Ok(&mut self.as_mut_bytes()[..size_of::<Self>() - unused_byte_count])
    }
}

impl Default for InvokeDpeReq {
    fn default() -> Self {
        Self {
            hdr: MailboxReqHeader::default(),
            data_size: 0,
            data: [0u8; InvokeDpeReq::DATA_MAX_SIZE],
        }
    }
}

#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct InvokeDpeResp {
    pub hdr: MailboxRespHeader,
    pub data_size: u32,
    pub data: [u8; InvokeDpeResp::DATA_MAX_SIZE], // variable length
}

impl InvokeDpeResp {
    pub const DATA_MAX_SIZE: usize = 2200;

    pub fn data(&self) -> Option<&[u8]> {
        self.data.get(..self.data_size as usize)
    }
}

impl Response for InvokeDpeResp {
    const MIN_SIZE: usize = size_of::<MailboxRespHeader>() + size_of::<u32>();
}

impl Default for InvokeDpeResp {
    fn default() -> Self {
        Self {
            hdr: MailboxRespHeader::default(),
            data_size: 0,
            data: [0u8; InvokeDpeResp::DATA_MAX_SIZE],
        }
    }
}

// SET_AUTH_MANIFEST
#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct SetAuthManifestReq {
    pub hdr: MailboxReqHeader,
    pub manifest_size: u32,
    pub manifest: [u8; SetAuthManifestReq::MAX_MAN_SIZE],
}
impl SetAuthManifestReq {
    pub const MAX_MAN_SIZE: usize = 34 * 1024;

    pub fn new(manifest: &[u8]) -> LibCaliptraResult<Self> {
        let mut req = Self::default();
        req.manifest
            .get_mut(..manifest.len())
            .ok_or(ApiError::InvalidParams)?
            .copy_from_slice(manifest);
        req.manifest_size = manifest.len() as u32;
        Ok(req)
    }
}
impl Request for SetAuthManifestReq {
    const ID: CommandId = CommandId::SET_AUTH_MANIFEST;
    type Resp = MailboxRespHeader;

    fn as_bytes_partial(&self) -> LibCaliptraResult<&[u8]> {
        if self.manifest_size as usize > Self::MAX_MAN_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        let unused_byte_count = Self::MAX_MAN_SIZE - self.manifest_size as usize;
        Ok(&self.as_bytes()[..size_of::<Self>() - unused_byte_count])
    }

    fn as_bytes_partial_mut(&mut self) -> LibCaliptraResult<&mut [u8]> {
        if self.manifest_size as usize > Self::MAX_MAN_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        let unused_byte_count = Self::MAX_MAN_SIZE - self.manifest_size as usize;
        Ok(&mut self.as_mut_bytes()[..size_of::<Self>() - unused_byte_count])
    }
}
impl Default for SetAuthManifestReq {
    fn default() -> Self {
        Self {
            hdr: MailboxReqHeader::default(),
            manifest_size: 0,
            manifest: [0u8; SetAuthManifestReq::MAX_MAN_SIZE],
        }
    }
}

// AUTHORIZE_AND_STASH
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageHashSource {
    Invalid = 0,
    InRequest = 1,
}

impl From<u32> for ImageHashSource {
    fn from(val: u32) -> Self {
        match val {
            1_u32 => ImageHashSource::InRequest,
            _ => ImageHashSource::Invalid,
        }
    }
}

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct AuthAndStashFlags : u32 {
        const SKIP_STASH = 0x1;
    }
}

impl From<u32> for AuthAndStashFlags {
    fn from(value: u32) -> Self {
        AuthAndStashFlags::from_bits_truncate(value)
    }
}

impl AuthAndStashFlags {
    pub fn set_skip_stash(&mut self, skip_stash: bool) {
        self.set(AuthAndStashFlags::SKIP_STASH, skip_stash);
    }
}

#[repr(C)]
#[derive(Debug, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct AuthorizeAndStashReq {
    pub hdr: MailboxReqHeader,
    pub fw_id: [u8; 4],
    pub measurement: [u8; 48], // Image digest.
    pub context: [u8; 48],
    pub svn: u32,
    pub flags: u32,
    pub source: u32,
}
impl Default for AuthorizeAndStashReq {
    fn default() -> Self {
        Self {
            hdr: Default::default(),
            fw_id: Default::default(),
            measurement: [0u8; 48],
            context: [0u8; 48],
            svn: Default::default(),
            flags: AuthAndStashFlags::SKIP_STASH.bits(),
            source: ImageHashSource::InRequest as u32,
        }
    }
}
impl Request for AuthorizeAndStashReq {
    const ID: CommandId = CommandId::AUTHORIZE_AND_STASH;
    type Resp = AuthorizeAndStashResp;
}

#[repr(C)]
#[derive(Debug, Default, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct AuthorizeAndStashResp {
    pub hdr: MailboxRespHeader,
    pub auth_req_result: u32,
}
impl Response for AuthorizeAndStashResp {}

/// Decoded `auth_req_result` of an AUTHORIZE_AND_STASH response.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizeAndStashResult {
    AuthorizeImage = 0xDEADC0DE,
    ImageNotAuthorized = 0x21523F21,
    ImageHashMismatch = 0x8BFB95CB,
}

impl TryFrom<u32> for AuthorizeAndStashResult {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0xDEADC0DE => Ok(Self::AuthorizeImage),
            0x21523F21 => Ok(Self::ImageNotAuthorized),
            0x8BFB95CB => Ok(Self::ImageHashMismatch),
            other => Err(other),
        }
    }
}
