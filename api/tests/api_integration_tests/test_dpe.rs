// Licensed under the Apache-2.0 license

use crate::common::run_model;
use libcaliptra::dpe::{
    CertifyKeyFormat, ContextHandle, DeriveContextFlags, DpeContextManager, DpeProfile,
    InitCtxFlags, RotateCtxFlags,
};
use libcaliptra::error::{DpeError, LibCaliptraError};
use libcaliptra::mailbox::{CertifyKeyExtendedFlags, CommandId};
use libcaliptra::{Caliptra, DeriveFlagPolicy, MailboxConfig};
use libcaliptra_model::{
    InitParams, MailboxRequester, ModelEmulated, CERT_CHAIN_SIZE, DEFAULT_REQUESTER, MAX_HANDLES,
};

const DATA: [u8; 48] = [0x11; 48];
const LABEL: [u8; 48] = [0x22; 48];
const DIGEST: [u8; 48] = [0x33; 48];

fn dpe_calls(model: &ModelEmulated) -> usize {
    model
        .executed_commands()
        .iter()
        .filter(|cmd| **cmd == CommandId::INVOKE_DPE.0)
        .count()
}

fn certify_key_extended_calls(model: &ModelEmulated) -> usize {
    model
        .executed_commands()
        .iter()
        .filter(|cmd| **cmd == CommandId::CERTIFY_KEY_EXTENDED.0)
        .count()
}

fn dpe_err(err: DpeError) -> LibCaliptraError {
    LibCaliptraError::Dpe(err)
}

#[test]
fn test_get_profile() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let profile = caliptra.dpe_get_profile().unwrap();
    assert_eq!(profile.major_version, 0);
    assert_eq!(profile.minor_version, 10);
    assert_eq!(profile.vendor_id, u32::from_be_bytes(*b"CTRA"));
    assert_eq!(profile.max_tci_nodes, MAX_HANDLES as u32);
}

#[test]
fn test_derive_retires_parent_handle() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let slot = caliptra.dpe().slot_of(h0).unwrap();

    let resp = caliptra
        .dpe_derive_context(h0, &DATA, DeriveContextFlags::CREATE_CERTIFICATE, 0, 0)
        .unwrap();
    let h1 = resp.handle;
    assert_ne!(h1, h0);
    assert_eq!(resp.parent_handle, ContextHandle::invalid_handle());
    assert!(caliptra.dpe().is_retired(h0));
    assert_eq!(caliptra.dpe().slot_of(h1), Some(slot));

    // The stale handle never reaches the RoT.
    let sent = dpe_calls(&model);
    assert_eq!(
        caliptra.dpe_sign(h0, &LABEL, &DIGEST).map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(dpe_calls(&model), sent);

    let active = model.dpe_active_handles();
    assert!(active.contains(&h1));
    assert!(!active.contains(&h0));
}

#[test]
fn test_derive_from_default_context() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let default = ContextHandle::default_handle();
    let resp = caliptra
        .dpe_derive_context(default, &DATA, DeriveContextFlags::empty(), 0, 0)
        .unwrap();
    assert_eq!(resp.handle, default);
    assert!(!caliptra.dpe().is_retired(default));
    assert_eq!(
        caliptra.dpe_initialize_context(InitCtxFlags::DEFAULT),
        Err(dpe_err(DpeError::ArgumentNotSupported))
    );
}

#[test]
fn test_retain_parent() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let parent_slot = caliptra.dpe().slot_of(h0).unwrap();

    let resp = caliptra
        .dpe_derive_context(h0, &DATA, DeriveContextFlags::RETAIN_PARENT_CONTEXT, 0, 0)
        .unwrap();
    assert_ne!(resp.parent_handle, h0);
    assert_ne!(resp.parent_handle, ContextHandle::invalid_handle());
    assert_ne!(resp.handle, resp.parent_handle);
    assert!(caliptra.dpe().is_retired(h0));

    assert_eq!(caliptra.dpe().slot_of(resp.parent_handle), Some(parent_slot));
    let child_slot = caliptra.dpe().slot_of(resp.handle).unwrap();
    let child = caliptra.dpe().context(child_slot).unwrap();
    assert_eq!(child.parent, Some(parent_slot));
    assert!(caliptra.dpe().context(parent_slot).unwrap().retained);

    let active = model.dpe_active_handles();
    assert!(active.contains(&resp.handle));
    assert!(active.contains(&resp.parent_handle));
    assert!(caliptra.dpe_sign(resp.handle, &LABEL, &DIGEST).is_ok());
}

#[test]
fn test_rotation_retires_old_handle() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let slot = caliptra.dpe().slot_of(h0).unwrap();

    let h1 = caliptra
        .dpe_rotate_context_handle(h0, RotateCtxFlags::empty())
        .unwrap();
    assert_ne!(h1, h0);
    assert!(caliptra.dpe().is_retired(h0));
    assert_eq!(caliptra.dpe().current_handle(slot), Some(h1));

    let signed = caliptra.dpe_sign(h1, &LABEL, &DIGEST).unwrap();
    assert_eq!(signed.sig_r.len(), 48);
    assert_eq!(signed.sig_s.len(), 48);
    let h2 = signed.new_context_handle;
    assert_ne!(h2, h1);
    assert!(caliptra.dpe().is_retired(h1));

    let cert = caliptra
        .dpe_certify_key(h2, CertifyKeyFormat::X509, &LABEL)
        .unwrap();
    assert_eq!(cert.cert.len(), 128);
    assert_eq!(cert.derived_pubkey_x.len(), 48);
    assert!(caliptra.dpe().is_retired(h2));
    assert_eq!(
        caliptra.dpe().current_handle(slot),
        Some(cert.new_context_handle)
    );
}

#[test]
fn test_rotate_to_default_while_default_exists() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    assert_eq!(
        caliptra.dpe_rotate_context_handle(h0, RotateCtxFlags::TARGET_IS_DEFAULT),
        Err(dpe_err(DpeError::InvalidArgument))
    );
    // A DPE error does not invalidate the handle.
    assert!(!caliptra.dpe().is_retired(h0));
    assert!(caliptra.dpe_sign(h0, &LABEL, &DIGEST).is_ok());
}

#[test]
fn test_policy_rejects_before_sending() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let flags = DeriveContextFlags::EXPORT_CDI | DeriveContextFlags::CREATE_CERTIFICATE;
    assert_eq!(
        caliptra
            .dpe_derive_context(ContextHandle::default_handle(), &DATA, flags, 0, 0)
            .map(|_| ()),
        Err(dpe_err(DpeError::InvalidArgument))
    );
    assert_eq!(dpe_calls(&model), 0);
}

#[test]
fn test_permissive_policy_sends() {
    let model = ModelEmulated::new(InitParams::default());
    let mut caliptra = Caliptra::new(model.soc(DEFAULT_REQUESTER), MailboxConfig::default())
        .with_dpe(DpeProfile::P384Sha384, DeriveFlagPolicy::permissive());
    let flags = DeriveContextFlags::EXPORT_CDI | DeriveContextFlags::CREATE_CERTIFICATE;
    let resp = caliptra
        .dpe_derive_context(ContextHandle::default_handle(), &DATA, flags, 0, 0)
        .unwrap();
    assert_eq!(dpe_calls(&model), 1);
    let slot = caliptra.dpe().slot_of(resp.handle).unwrap();
    assert!(caliptra.dpe().context(slot).unwrap().export_cdi);
}

#[test]
fn test_max_tcis() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    // The default context already takes one node.
    for _ in 1..MAX_HANDLES {
        caliptra
            .dpe_initialize_context(InitCtxFlags::SIMULATION)
            .unwrap();
    }
    assert_eq!(
        caliptra.dpe_initialize_context(InitCtxFlags::SIMULATION),
        Err(dpe_err(DpeError::MaxTcis))
    );
}

#[test]
fn test_destroy_context() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let resp = caliptra
        .dpe_derive_context(h0, &DATA, DeriveContextFlags::RETAIN_PARENT_CONTEXT, 0, 0)
        .unwrap();

    caliptra.dpe_destroy_context(resp.parent_handle).unwrap();
    assert!(caliptra.dpe().is_retired(resp.parent_handle));
    assert!(caliptra.dpe().is_retired(resp.handle));
    assert_eq!(caliptra.dpe().slot_of(resp.handle), None);

    let active = model.dpe_active_handles();
    assert!(!active.contains(&resp.parent_handle));
    assert!(!active.contains(&resp.handle));
    assert_eq!(active, vec![ContextHandle::default_handle()]);
}

#[test]
fn test_unknown_handle_rejected_by_rot() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let bogus = ContextHandle([0x42; 16]);
    assert!(!caliptra.dpe().is_retired(bogus));

    assert_eq!(
        caliptra.dpe_sign(bogus, &LABEL, &DIGEST).map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(dpe_calls(&model), 1);
    assert!(caliptra.dpe().is_retired(bogus));

    // Known stale now: no second round trip.
    assert_eq!(
        caliptra.dpe_sign(bogus, &LABEL, &DIGEST).map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(dpe_calls(&model), 1);
}

#[test]
fn test_certificate_chain() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let chain = caliptra.dpe_get_certificate_chain().unwrap();
    assert_eq!(chain.len(), CERT_CHAIN_SIZE);
    assert_eq!(chain, model.dpe_cert_chain());
    assert_eq!(dpe_calls(&model), 2);
}

#[test]
fn test_profile_mismatch() {
    let model = ModelEmulated::new(InitParams::default());
    let mut caliptra = Caliptra::new(model.soc(DEFAULT_REQUESTER), MailboxConfig::default())
        .with_dpe(DpeProfile::P256Sha256, DeriveFlagPolicy::default());
    assert_eq!(
        caliptra.dpe_get_profile().map(|_| ()),
        Err(dpe_err(DpeError::InvalidCommand))
    );
}

#[test]
fn test_stash_measurement() {
    let (model, mut caliptra) = run_model(InitParams::default());
    caliptra
        .stash_measurement(*b"TEST", [0xaa; 48], [0; 48], 1)
        .unwrap();
    assert_eq!(model.stashed_measurements(), vec![[0xaa; 48]]);

    // Each stash takes a node; the default context holds the first.
    for _ in 2..MAX_HANDLES {
        caliptra
            .stash_measurement(*b"TEST", [0xbb; 48], [0; 48], 1)
            .unwrap();
    }
    assert_eq!(
        caliptra.stash_measurement(*b"TEST", [0xcc; 48], [0; 48], 1),
        Err(dpe_err(DpeError::MaxTcis))
    );
    assert_eq!(model.stashed_measurements().len(), MAX_HANDLES - 1);
}

#[test]
fn test_certify_key_extended() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    let default = ContextHandle::default_handle();
    let resp = caliptra
        .certify_key_extended(default, CertifyKeyExtendedFlags::empty(), &LABEL)
        .unwrap();
    assert_eq!(resp.new_context_handle, default);
    assert_eq!(resp.cert.len(), 128);

    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let resp = caliptra
        .certify_key_extended(h0, CertifyKeyExtendedFlags::empty(), &LABEL)
        .unwrap();
    assert_ne!(resp.new_context_handle, h0);
    assert!(caliptra.dpe().is_retired(h0));

    assert_eq!(
        caliptra
            .certify_key_extended(h0, CertifyKeyExtendedFlags::empty(), &LABEL)
            .map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
}

#[test]
fn test_certify_key_extended_handle_rotated_elsewhere() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let mut other = Caliptra::new(model.soc(MailboxRequester::Soc(9)), MailboxConfig::default());

    let h0 = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let slot = caliptra.dpe().slot_of(h0).unwrap();
    // Another requester rotates the context; this one still holds h0.
    let h1 = other
        .dpe_rotate_context_handle(h0, RotateCtxFlags::empty())
        .unwrap();
    assert_ne!(h1, h0);
    assert!(!caliptra.dpe().is_retired(h0));

    assert_eq!(
        caliptra
            .certify_key_extended(h0, CertifyKeyExtendedFlags::empty(), &LABEL)
            .map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(certify_key_extended_calls(&model), 1);
    assert!(caliptra.dpe().context(slot).is_none());
    assert_eq!(caliptra.dpe().slot_of(h0), None);
    assert!(caliptra.dpe().is_retired(h0));

    // Dropped locally: no second round trip.
    assert_eq!(
        caliptra
            .certify_key_extended(h0, CertifyKeyExtendedFlags::empty(), &LABEL)
            .map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(certify_key_extended_calls(&model), 1);
}

#[test]
fn test_retired_handles_stay_bounded() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let first = caliptra
        .dpe_initialize_context(InitCtxFlags::SIMULATION)
        .unwrap();
    let mut handle = first;
    for _ in 0..500 {
        handle = caliptra
            .dpe_rotate_context_handle(handle, RotateCtxFlags::empty())
            .unwrap();
    }
    assert_eq!(caliptra.dpe().contexts().count(), 1);
    assert_eq!(
        caliptra.dpe().retired_count(),
        DpeContextManager::MAX_RETIRED_HANDLES
    );
    assert!(!caliptra.dpe().is_retired(first));

    // The RoT still rejects the oldest handle.
    let sent = dpe_calls(&model);
    assert_eq!(
        caliptra
            .dpe_rotate_context_handle(first, RotateCtxFlags::empty())
            .map(|_| ()),
        Err(dpe_err(DpeError::InvalidHandle))
    );
    assert_eq!(dpe_calls(&model), sent + 1);
    let slot = caliptra.dpe().slot_of(handle).unwrap();
    assert_eq!(caliptra.dpe().current_handle(slot), Some(handle));
}
