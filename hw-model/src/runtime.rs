/*++

Licensed under the Apache-2.0 license.

File Name:

    runtime.rs

Abstract:

    Stand-in for the RoT runtime firmware: executes mailbox commands and
    produces their responses.

--*/

use crate::dpe::DpeInstance;
use crate::SocIfc;
use libcaliptra::auth_manifest::{AuthorizationManifest, ImageMetadataFlags};
use libcaliptra::dpe::DpeProfile;
use libcaliptra::mailbox::{
    AuthAndStashFlags, AuthorizeAndStashReq, AuthorizeAndStashResp, AuthorizeAndStashResult,
    CertifyKeyExtendedReq, CertifyKeyExtendedResp, CommandId, FipsVersionResp, GetIdevCsrResp,
    ImageHashSource, InvokeDpeReq, InvokeDpeResp, MailboxRespHeader, SetAuthManifestReq,
    StashMeasurementReq, StashMeasurementResp,
};
use libcaliptra::{verify_checksum, FlowStatus};
use zerocopy::{FromBytes, Immutable, IntoBytes};

pub const FW_PROC_INVALID_IMAGE_SIZE: u32 = 0x0102_0002;
pub const FW_PROC_MAILBOX_STATE_INCONSISTENT: u32 = 0x0102_0003;
pub const RUNTIME_INTERNAL: u32 = 0x000E_0001;
pub const RUNTIME_UNIMPLEMENTED_COMMAND: u32 = 0x000E_0002;
pub const RUNTIME_INVALID_CHECKSUM: u32 = 0x000E_0005;
pub const RUNTIME_MAILBOX_INVALID_PARAMS: u32 = 0x000E_0009;
pub const RUNTIME_AUTH_MANIFEST_PREAMBLE_SIZE_LT_MIN: u32 = 0x000E_004B;
pub const RUNTIME_AUTH_AND_STASH_UNSUPPORTED_IMAGE_SOURCE: u32 = 0x000E_004E;
pub const RUNTIME_AUTH_AND_STASH_MEASUREMENT_DPE_ERROR: u32 = 0x000E_0050;

pub const FIPS_REV: [u32; 3] = [0x0001_0000, 0x0000_0002, 0x0000_0000];

/// Full response including the 8 byte header, `None` for a command that
/// completes without data, or the firmware error code for CMD_FAILURE.
pub type CmdResult = Result<Option<Vec<u8>>, u32>;

pub struct Runtime {
    pub dpe: DpeInstance,
    idevid_csr: Option<Vec<u8>>,
    firmware: Option<Vec<u8>>,
    auth_manifest: Option<AuthorizationManifest>,
    measurements: Vec<[u8; 48]>,
}

/// Copies a possibly truncated request into a zeroed `R`.
fn read_request<R: FromBytes + IntoBytes + Default>(req: &[u8]) -> Result<R, u32> {
    let mut parsed = R::default();
    parsed
        .as_mut_bytes()
        .get_mut(..req.len())
        .ok_or(RUNTIME_MAILBOX_INVALID_PARAMS)?
        .copy_from_slice(req);
    Ok(parsed)
}

/// Drops the unused tail of a variable sized response.
fn truncated(resp: &(impl IntoBytes + Immutable), unused: usize) -> Vec<u8> {
    let bytes = resp.as_bytes();
    bytes[..bytes.len() - unused].to_vec()
}

fn verify_request_checksum(cmd: CommandId, req: &[u8]) -> Result<(), u32> {
    let (chksum, payload) = req
        .split_first_chunk::<4>()
        .ok_or(RUNTIME_MAILBOX_INVALID_PARAMS)?;
    if !verify_checksum(u32::from_le_bytes(*chksum), cmd.into(), payload) {
        log::warn!("request checksum mismatch for command 0x{:08x}", cmd.0);
        return Err(RUNTIME_INVALID_CHECKSUM);
    }
    Ok(())
}

impl Runtime {
    pub fn new(profile: DpeProfile, idevid_csr: Option<Vec<u8>>) -> Self {
        Self {
            dpe: DpeInstance::new(profile),
            idevid_csr,
            firmware: None,
            auth_manifest: None,
            measurements: vec![],
        }
    }

    pub fn firmware(&self) -> Option<&[u8]> {
        self.firmware.as_deref()
    }

    pub fn measurements(&self) -> &[[u8; 48]] {
        &self.measurements
    }

    pub fn auth_manifest(&self) -> Option<&AuthorizationManifest> {
        self.auth_manifest.as_ref()
    }

    /// Executes one mailbox command.
    pub fn handle(&mut self, cmd: u32, req: &[u8], soc_ifc: &mut SocIfc) -> CmdResult {
        let cmd = CommandId::from(cmd);
        if cmd == CommandId::FIRMWARE_LOAD {
            return self.firmware_load(req, soc_ifc);
        }
        verify_request_checksum(cmd, req)?;
        match cmd {
            CommandId::GET_IDEV_CSR => self.get_idev_csr(),
            CommandId::VERSION => Self::fips_version(),
            CommandId::STASH_MEASUREMENT => self.stash_measurement(req),
            CommandId::INVOKE_DPE => self.invoke_dpe(req),
            CommandId::CERTIFY_KEY_EXTENDED => self.certify_key_extended(req),
            CommandId::SET_AUTH_MANIFEST => self.set_auth_manifest(req),
            CommandId::AUTHORIZE_AND_STASH => self.authorize_and_stash(req),
            _ => {
                log::warn!("unimplemented command 0x{:08x}", cmd.0);
                Err(RUNTIME_UNIMPLEMENTED_COMMAND)
            }
        }
    }

    fn firmware_load(&mut self, image: &[u8], soc_ifc: &mut SocIfc) -> CmdResult {
        if !soc_ifc.flow_status.contains(FlowStatus::READY_FOR_FW) {
            log::warn!("FIRMWARE_LOAD while not ready for firmware");
            return Err(FW_PROC_MAILBOX_STATE_INCONSISTENT);
        }
        if image.is_empty() {
            return Err(FW_PROC_INVALID_IMAGE_SIZE);
        }
        log::info!("firmware image of {} bytes loaded", image.len());
        self.firmware = Some(image.to_vec());
        soc_ifc.flow_status.remove(FlowStatus::READY_FOR_FW);
        soc_ifc.flow_status.insert(FlowStatus::READY_FOR_RUNTIME);
        Ok(None)
    }

    fn get_idev_csr(&mut self) -> CmdResult {
        let csr = self
            .idevid_csr
            .as_deref()
            .ok_or(RUNTIME_MAILBOX_INVALID_PARAMS)?;
        let mut resp = GetIdevCsrResp::default();
        resp.data
            .get_mut(..csr.len())
            .ok_or(RUNTIME_INTERNAL)?
            .copy_from_slice(csr);
        resp.data_size = csr.len() as u32;
        Ok(Some(truncated(&resp, GetIdevCsrResp::DATA_MAX_SIZE - csr.len())))
    }

    fn fips_version() -> CmdResult {
        let resp = FipsVersionResp {
            mode: FipsVersionResp::MODE,
            fips_rev: FIPS_REV,
            name: FipsVersionResp::NAME,
            ..Default::default()
        };
        Ok(Some(resp.as_bytes().to_vec()))
    }

    fn stash_measurement(&mut self, req: &[u8]) -> CmdResult {
        let req: StashMeasurementReq = read_request(req)?;
        let dpe_result = match self.dpe.stash_measurement(&req.measurement) {
            Ok(()) => {
                self.measurements.push(req.measurement);
                0
            }
            Err(err) => err.code(),
        };
        let resp = StashMeasurementResp {
            dpe_result,
            ..Default::default()
        };
        Ok(Some(resp.as_bytes().to_vec()))
    }

    fn invoke_dpe(&mut self, req: &[u8]) -> CmdResult {
        let req: InvokeDpeReq = read_request(req)?;
        let cmd = req
            .data
            .get(..req.data_size as usize)
            .ok_or(RUNTIME_MAILBOX_INVALID_PARAMS)?;
        let dpe_resp = self.dpe.execute(cmd);

        let mut resp = InvokeDpeResp::default();
        resp.data
            .get_mut(..dpe_resp.len())
            .ok_or(RUNTIME_INTERNAL)?
            .copy_from_slice(&dpe_resp);
        resp.data_size = dpe_resp.len() as u32;
        Ok(Some(truncated(
            &resp,
            InvokeDpeResp::DATA_MAX_SIZE - dpe_resp.len(),
        )))
    }

    fn certify_key_extended(&mut self, req: &[u8]) -> CmdResult {
        let req: CertifyKeyExtendedReq = read_request(req)?;
        let dpe_resp = self.dpe.certify_key_extended(&req.certify_key_req);

        let mut resp = CertifyKeyExtendedResp::default();
        resp.certify_key_resp
            .get_mut(..dpe_resp.len())
            .ok_or(RUNTIME_INTERNAL)?
            .copy_from_slice(&dpe_resp);
        Ok(Some(resp.as_bytes().to_vec()))
    }

    fn set_auth_manifest(&mut self, req: &[u8]) -> CmdResult {
        let req: SetAuthManifestReq = read_request(req)?;
        let bytes = req
            .manifest
            .get(..req.manifest_size as usize)
            .ok_or(RUNTIME_MAILBOX_INVALID_PARAMS)?;
        let manifest = AuthorizationManifest::parse(bytes).map_err(|err| {
            log::warn!("rejecting auth manifest: {}", err);
            RUNTIME_AUTH_MANIFEST_PREAMBLE_SIZE_LT_MIN
        })?;
        self.auth_manifest = Some(manifest);
        Ok(Some(MailboxRespHeader::default().as_bytes().to_vec()))
    }

    fn authorize_and_stash(&mut self, req: &[u8]) -> CmdResult {
        let req: AuthorizeAndStashReq = read_request(req)?;
        if ImageHashSource::from(req.source) != ImageHashSource::InRequest {
            return Err(RUNTIME_AUTH_AND_STASH_UNSUPPORTED_IMAGE_SOURCE);
        }
        let fw_id = u32::from_le_bytes(req.fw_id);
        let entry = self
            .auth_manifest
            .as_ref()
            .and_then(|manifest| manifest.find(fw_id));

        let result = match entry {
            None => AuthorizeAndStashResult::ImageNotAuthorized,
            Some(entry)
                if ImageMetadataFlags::from_bits_truncate(entry.flags)
                    .contains(ImageMetadataFlags::IGNORE_AUTH_CHECK) =>
            {
                AuthorizeAndStashResult::AuthorizeImage
            }
            Some(entry) if entry.digest != req.measurement => {
                AuthorizeAndStashResult::ImageHashMismatch
            }
            Some(_) => AuthorizeAndStashResult::AuthorizeImage,
        };

        let skip_stash = AuthAndStashFlags::from(req.flags).contains(AuthAndStashFlags::SKIP_STASH);
        if result == AuthorizeAndStashResult::AuthorizeImage && !skip_stash {
            self.dpe
                .stash_measurement(&req.measurement)
                .map_err(|_| RUNTIME_AUTH_AND_STASH_MEASUREMENT_DPE_ERROR)?;
            self.measurements.push(req.measurement);
        }

        let resp = AuthorizeAndStashResp {
            auth_req_result: result as u32,
            ..Default::default()
        };
        Ok(Some(resp.as_bytes().to_vec()))
    }
}
