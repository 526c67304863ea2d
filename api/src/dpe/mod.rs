// Licensed under the Apache-2.0 license

//! DICE Protection Environment commands carried inside INVOKE_DPE.

mod commands;
mod context;

pub use commands::*;
pub use context::*;

use crate::mailbox::{InvokeDpeReq, Request};
use crate::soc_mgr::SocMailbox;
use crate::transaction::Mailbox;
use bitflags::bitflags;
use libcaliptra_error::{ApiError, LibCaliptraResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const DPE_CMD_MAGIC: u32 = u32::from_be_bytes(*b"DPEC");
pub const DPE_RESP_MAGIC: u32 = u32::from_be_bytes(*b"DPER");

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum DpeProfile {
    P256Sha256 = 3,
    #[default]
    P384Sha384 = 4,
}

impl DpeProfile {
    pub const fn hash_size(self) -> usize {
        match self {
            DpeProfile::P256Sha256 => 32,
            DpeProfile::P384Sha384 => 48,
        }
    }

    pub const fn ecc_int_size(self) -> usize {
        self.hash_size()
    }
}

impl TryFrom<u32> for DpeProfile {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            3 => Ok(DpeProfile::P256Sha256),
            4 => Ok(DpeProfile::P384Sha384),
            other => Err(other),
        }
    }
}

/// Opaque capability returned by the RoT for one context.
#[repr(C)]
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ContextHandle(pub [u8; ContextHandle::SIZE]);

impl ContextHandle {
    pub const SIZE: usize = 16;

    /// Handle of the default context for a locality.
    pub const fn default_handle() -> Self {
        Self([0; Self::SIZE])
    }

    /// Placeholder the RoT returns where no handle applies.
    pub const fn invalid_handle() -> Self {
        Self([0xff; Self::SIZE])
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default_handle()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct DpeCommandId(pub u32);

impl DpeCommandId {
    pub const GET_PROFILE: Self = Self(0x1);
    pub const INITIALIZE_CONTEXT: Self = Self(0x7);
    pub const DERIVE_CONTEXT: Self = Self(0x8);
    pub const CERTIFY_KEY: Self = Self(0x9);
    pub const SIGN: Self = Self(0xA);
    pub const ROTATE_CONTEXT_HANDLE: Self = Self(0xE);
    pub const DESTROY_CONTEXT: Self = Self(0xF);
    pub const GET_CERTIFICATE_CHAIN: Self = Self(0x10);
}

impl From<DpeCommandId> for u32 {
    fn from(value: DpeCommandId) -> Self {
        value.0
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct DeriveContextFlags: u32 {
        const RETAIN_PARENT_CONTEXT = 1 << 29;
        const RECURSIVE = 1 << 24;
        const EXPORT_CDI = 1 << 23;
        const CREATE_CERTIFICATE = 1 << 22;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct InitCtxFlags: u32 {
        const SIMULATION = 1 << 31;
        const DEFAULT = 1 << 30;
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct RotateCtxFlags: u32 {
        const TARGET_IS_DEFAULT = 1 << 31;
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum CertifyKeyFormat {
    #[default]
    X509 = 0,
    Csr = 1,
}

impl TryFrom<u32> for CertifyKeyFormat {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(CertifyKeyFormat::X509),
            1 => Ok(CertifyKeyFormat::Csr),
            other => Err(other),
        }
    }
}

/// Carries encoded DPE commands to the RoT and returns the raw DPE
/// response.
pub trait DpeTransport {
    fn invoke_dpe(&mut self, cmd: &[u8]) -> LibCaliptraResult<Vec<u8>>;
}

impl<S: SocMailbox> DpeTransport for Mailbox<S> {
    fn invoke_dpe(&mut self, cmd: &[u8]) -> LibCaliptraResult<Vec<u8>> {
        let req = InvokeDpeReq::new(cmd)?;
        log::debug!("INVOKE_DPE with {} byte command", req.data_size);
        let resp = self.exec_req(req)?;
        let data = resp.data().ok_or(ApiError::ApiInternalError)?;
        Ok(data.to_vec())
    }
}
