// Licensed under the Apache-2.0 license

use crate::common::run_model;
use libcaliptra::auth_manifest::{AuthManifestFlags, AuthorizationManifest, ImageMetadataFlags};
use libcaliptra::error::{LibCaliptraError, MailboxError, MfgError};
use libcaliptra::mailbox::{AuthAndStashFlags, AuthorizeAndStashResult, FipsVersionResp};
use libcaliptra::calc_checksum;
use libcaliptra_model::{
    InitParams, FIPS_REV, RUNTIME_AUTH_MANIFEST_PREAMBLE_SIZE_LT_MIN,
    RUNTIME_UNIMPLEMENTED_COMMAND,
};
use sha2::{Digest, Sha384};

const FW_ID: u32 = 0x55;

fn digest(data: &[u8]) -> [u8; 48] {
    Sha384::digest(data).into()
}

#[test]
fn test_idev_csr_not_ready() {
    let (model, mut caliptra) = run_model(InitParams::default());
    assert_eq!(
        caliptra.get_idev_csr(),
        Err(LibCaliptraError::Mfg(MfgError::IdevCsrNotReady))
    );
    assert!(model.executed_commands().is_empty());
}

#[test]
fn test_idev_csr() {
    let csr: Vec<u8> = [0x30, 0x82, 0x01, 0x2c]
        .into_iter()
        .chain((0..296).map(|i| i as u8))
        .collect();
    let (_model, mut caliptra) = run_model(InitParams {
        lifecycle: libcaliptra::DeviceLifecycle::Manufacturing,
        idevid_csr: Some(csr.clone()),
        ..Default::default()
    });
    assert_eq!(caliptra.get_idev_csr().unwrap(), csr);
}

#[test]
fn test_fips_version_fields() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let resp = caliptra.fips_version().unwrap();
    assert_eq!(resp.mode, FipsVersionResp::MODE);
    assert_eq!(resp.fips_rev, FIPS_REV);
    assert_eq!(&resp.name, b"Caliptra RTM");
}

#[test]
fn test_unimplemented_command() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let cmd = u32::from_be_bytes(*b"NOPE");
    let req = calc_checksum(cmd, &[]).to_le_bytes();
    let mut resp = [0u8; 16];
    assert_eq!(
        caliptra.mailbox_mut().exec(cmd, &req, &mut resp).map(|_| ()),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(
        caliptra.mailbox().last_fw_error(),
        Some(RUNTIME_UNIMPLEMENTED_COMMAND)
    );
}

#[test]
fn test_authorize_and_stash() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let image = b"runtime image";
    let manifest = AuthorizationManifest::new(1, AuthManifestFlags::VENDOR_SIGNATURE_REQUIRED)
        .with_image(FW_ID, 1, digest(image));
    caliptra.set_auth_manifest(&manifest).unwrap();

    assert_eq!(
        caliptra.authorize_and_stash(FW_ID, digest(image), AuthAndStashFlags::empty()),
        Ok(AuthorizeAndStashResult::AuthorizeImage)
    );
    assert_eq!(model.stashed_measurements(), vec![digest(image)]);

    assert_eq!(
        caliptra.authorize_and_stash(FW_ID, digest(image), AuthAndStashFlags::SKIP_STASH),
        Ok(AuthorizeAndStashResult::AuthorizeImage)
    );
    assert_eq!(model.stashed_measurements().len(), 1);
}

#[test]
fn test_authorize_rejections() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let image = b"runtime image";

    // No manifest yet.
    assert_eq!(
        caliptra.authorize_and_stash(FW_ID, digest(image), AuthAndStashFlags::empty()),
        Ok(AuthorizeAndStashResult::ImageNotAuthorized)
    );

    let manifest = AuthorizationManifest::new(1, AuthManifestFlags::empty())
        .with_image(FW_ID, 1, digest(image));
    caliptra.set_auth_manifest(&manifest).unwrap();

    assert_eq!(
        caliptra.authorize_and_stash(FW_ID, digest(b"tampered"), AuthAndStashFlags::empty()),
        Ok(AuthorizeAndStashResult::ImageHashMismatch)
    );
    assert_eq!(
        caliptra.authorize_and_stash(FW_ID + 1, digest(image), AuthAndStashFlags::empty()),
        Ok(AuthorizeAndStashResult::ImageNotAuthorized)
    );
    assert!(model.stashed_measurements().is_empty());
}

#[test]
fn test_ignore_auth_check() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let manifest = AuthorizationManifest::new(1, AuthManifestFlags::empty()).with_image(
        FW_ID,
        1 | ImageMetadataFlags::IGNORE_AUTH_CHECK.bits(),
        [0; 48],
    );
    caliptra.set_auth_manifest(&manifest).unwrap();
    assert_eq!(
        caliptra.authorize_and_stash(FW_ID, digest(b"anything"), AuthAndStashFlags::SKIP_STASH),
        Ok(AuthorizeAndStashResult::AuthorizeImage)
    );
    assert!(model.stashed_measurements().is_empty());
}

#[test]
fn test_malformed_manifest_rejected() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let mut manifest = AuthorizationManifest::new(1, AuthManifestFlags::empty());
    manifest.preamble.size = 4;
    assert_eq!(
        caliptra.set_auth_manifest(&manifest),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(
        caliptra.mailbox().last_fw_error(),
        Some(RUNTIME_AUTH_MANIFEST_PREAMBLE_SIZE_LT_MIN)
    );
}
