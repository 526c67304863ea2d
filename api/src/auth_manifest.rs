/*++

Licensed under the Apache-2.0 license.

File Name:

    auth_manifest.rs

Abstract:

    Image authorization manifest sent with SET_AUTH_MANIFEST. Signatures
    are produced and checked by the RoT tooling; only the layout lives here.

--*/

use crate::mailbox::SetAuthManifestReq;
use bitflags::bitflags;
use core::mem::size_of;
use libcaliptra_error::{ApiError, LibCaliptraResult};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const AUTH_MANIFEST_MARKER: u32 = 0x4154_4D4E;
pub const AUTH_MANIFEST_VERSION: u32 = 1;
pub const AUTH_MANIFEST_IMAGE_METADATA_MAX_COUNT: usize = 127;

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct AuthManifestFlags: u32 {
        const VENDOR_SIGNATURE_REQUIRED = 0b1;
    }
}

impl From<u32> for AuthManifestFlags {
    fn from(value: u32) -> Self {
        AuthManifestFlags::from_bits_truncate(value)
    }
}

bitflags! {
    /// Per-image flags. Bits [1:0] hold the `ImageHashSource`.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct ImageMetadataFlags: u32 {
        const IGNORE_AUTH_CHECK = 1 << 2;
    }
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct AuthManifestPreamble {
    pub marker: u32,
    pub size: u32,
    pub version: u32,
    pub svn: u32,
    pub flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct AuthManifestImageMetadata {
    pub fw_id: u32,
    pub flags: u32,
    pub digest: [u8; 48],
}

impl Default for AuthManifestImageMetadata {
    fn default() -> Self {
        Self {
            fw_id: 0,
            flags: 0,
            digest: [0; 48],
        }
    }
}

/// Preamble, entry count, then the image metadata entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizationManifest {
    pub preamble: AuthManifestPreamble,
    pub image_metadata: Vec<AuthManifestImageMetadata>,
}

impl AuthorizationManifest {
    pub fn new(svn: u32, flags: AuthManifestFlags) -> Self {
        Self {
            preamble: AuthManifestPreamble {
                marker: AUTH_MANIFEST_MARKER,
                size: size_of::<AuthManifestPreamble>() as u32,
                version: AUTH_MANIFEST_VERSION,
                svn,
                flags: flags.bits(),
            },
            image_metadata: vec![],
        }
    }

    pub fn flags(&self) -> AuthManifestFlags {
        AuthManifestFlags::from(self.preamble.flags)
    }

    pub fn with_image(mut self, fw_id: u32, flags: u32, digest: [u8; 48]) -> Self {
        self.image_metadata.push(AuthManifestImageMetadata {
            fw_id,
            flags,
            digest,
        });
        self
    }

    pub fn find(&self, fw_id: u32) -> Option<&AuthManifestImageMetadata> {
        self.image_metadata.iter().find(|m| m.fw_id == fw_id)
    }

    pub fn to_bytes(&self) -> LibCaliptraResult<Vec<u8>> {
        if self.image_metadata.len() > AUTH_MANIFEST_IMAGE_METADATA_MAX_COUNT {
            return Err(ApiError::InvalidParams.into());
        }
        let mut out = Vec::with_capacity(
            size_of::<AuthManifestPreamble>()
                + 4
                + self.image_metadata.len() * size_of::<AuthManifestImageMetadata>(),
        );
        out.extend_from_slice(self.preamble.as_bytes());
        out.extend_from_slice(&(self.image_metadata.len() as u32).to_le_bytes());
        for entry in &self.image_metadata {
            out.extend_from_slice(entry.as_bytes());
        }
        if out.len() > SetAuthManifestReq::MAX_MAN_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        Ok(out)
    }

    /// Parses a manifest, checking the marker, preamble size and entry
    /// count.
    pub fn parse(bytes: &[u8]) -> LibCaliptraResult<Self> {
        let (preamble, rest) =
            AuthManifestPreamble::read_from_prefix(bytes).map_err(|_| ApiError::InvalidParams)?;
        if preamble.marker != AUTH_MANIFEST_MARKER
            || preamble.size as usize != size_of::<AuthManifestPreamble>()
        {
            return Err(ApiError::InvalidParams.into());
        }
        let (count, mut rest) = u32::read_from_prefix(rest).map_err(|_| ApiError::InvalidParams)?;
        if count as usize > AUTH_MANIFEST_IMAGE_METADATA_MAX_COUNT {
            return Err(ApiError::InvalidParams.into());
        }
        let mut image_metadata = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (entry, tail) = AuthManifestImageMetadata::read_from_prefix(rest)
                .map_err(|_| ApiError::InvalidParams)?;
            image_metadata.push(entry);
            rest = tail;
        }
        if !rest.is_empty() {
            return Err(ApiError::InvalidParams.into());
        }
        Ok(Self {
            preamble,
            image_metadata,
        })
    }
}
