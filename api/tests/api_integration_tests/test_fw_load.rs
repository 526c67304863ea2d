// Licensed under the Apache-2.0 license

use crate::common::run_model;
use libcaliptra::error::{ApiError, LibCaliptraError, MailboxError};
use libcaliptra::mailbox::CommandId;
use libcaliptra::{
    Caliptra, DeviceLifecycle, FlowStatus, Fuses, MailboxConfig, TocEntry, TocEntryId,
    TransactionState,
};
use libcaliptra_model::{
    Fault, InitParams, MailboxRequester, FW_PROC_INVALID_IMAGE_SIZE,
    FW_PROC_MAILBOX_STATE_INCONSISTENT,
};

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + 3) as u8).collect()
}

fn ready_for_fw() -> InitParams {
    InitParams {
        flow_status: FlowStatus::READY_FOR_FW,
        ..Default::default()
    }
}

fn toc() -> Vec<TocEntry> {
    vec![
        TocEntry::new(TocEntryId::Fmc, 0, 5),
        TocEntry::new(TocEntryId::Runtime, 5, 7),
    ]
}

#[test]
fn test_upload_firmware() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    assert!(caliptra.ready_for_firmware());
    let image = image(64);
    caliptra.upload_firmware(&image).unwrap();

    assert_eq!(model.loaded_firmware(), Some(image));
    assert_eq!(model.executed_commands(), vec![CommandId::FIRMWARE_LOAD.0]);
    assert!(caliptra.ready_for_runtime());
    assert!(!caliptra.ready_for_firmware());
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_upload_empty_firmware_rejected() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    assert_eq!(
        caliptra.upload_firmware(&[]),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(
        caliptra.mailbox().last_fw_error(),
        Some(FW_PROC_INVALID_IMAGE_SIZE)
    );
    assert_eq!(model.loaded_firmware(), None);
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_piecewise_upload() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let image = image(12);

    caliptra.upload_fw_start(&toc()).unwrap();
    assert_eq!(caliptra.fw_load().progress(), Some((0, 12)));
    assert_eq!(
        model.lock_holder(),
        Some(libcaliptra_model::DEFAULT_REQUESTER)
    );

    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image[..3])
        .unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 3, &image[3..5])
        .unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Runtime, 0, &image[5..12])
        .unwrap();
    assert_eq!(caliptra.fw_load().progress(), Some((12, 12)));

    caliptra.upload_fw_end().unwrap();
    assert!(!caliptra.fw_load().is_in_progress());
    assert_eq!(model.loaded_firmware(), Some(image));
    assert!(model.mailbox_is_idle());
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);
}

#[test]
fn test_incomplete_finish_keeps_session() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let image = image(12);
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image[..5])
        .unwrap();

    assert_eq!(
        caliptra.upload_fw_end(),
        Err(LibCaliptraError::Api(ApiError::InvalidParams))
    );
    assert!(caliptra.fw_load().is_in_progress());
    assert!(model.executed_commands().is_empty());

    caliptra
        .upload_fw_chunk(TocEntryId::Runtime, 0, &image[5..])
        .unwrap();
    caliptra.upload_fw_end().unwrap();
    assert_eq!(model.loaded_firmware(), Some(image));
}

#[test]
fn test_chunk_order_enforced() {
    let (_model, mut caliptra) = run_model(ready_for_fw());
    let image = image(12);
    caliptra.upload_fw_start(&toc()).unwrap();

    let invalid = Err(LibCaliptraError::Api(ApiError::InvalidParams));
    // Runtime before FMC is finished.
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Runtime, 0, &image[5..7]),
        invalid
    );
    // Gap inside an entry.
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Fmc, 2, &image[2..4]),
        invalid
    );
    // Past the end of the entry.
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Fmc, 0, &image[..6]),
        invalid
    );
    // Not in the ToC.
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Max, 0, &image[..1]),
        invalid
    );
    assert_eq!(caliptra.fw_load().progress(), Some((0, 12)));

    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image[..5])
        .unwrap();
    // Rewriting finished data.
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Fmc, 0, &image[..1]),
        invalid
    );
    caliptra.upload_fw_abort().unwrap();
}

#[test]
fn test_no_session() {
    let (_model, mut caliptra) = run_model(ready_for_fw());
    let not_in_progress = Err(LibCaliptraError::Api(ApiError::FwLoadNotInProgress));
    assert_eq!(
        caliptra.upload_fw_chunk(TocEntryId::Fmc, 0, &[1, 2, 3]),
        not_in_progress
    );
    assert_eq!(caliptra.upload_fw_end(), not_in_progress);
    assert_eq!(caliptra.upload_fw_abort(), not_in_progress);
}

#[test]
fn test_abort_discards_image() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let image = image(12);
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image[..5])
        .unwrap();
    caliptra.upload_fw_abort().unwrap();

    assert!(!caliptra.fw_load().is_in_progress());
    assert!(model.mailbox_is_idle());
    assert_eq!(model.loaded_firmware(), None);
    assert!(model.executed_commands().is_empty());

    // A fresh session works afterwards.
    caliptra.upload_firmware(&image).unwrap();
    assert_eq!(model.loaded_firmware(), Some(image));
}

#[test]
fn test_nested_begin_rejected() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    caliptra.upload_fw_start(&toc()).unwrap();
    assert_eq!(
        caliptra.upload_fw_start(&toc()),
        Err(LibCaliptraError::Api(ApiError::PauserLocked))
    );
    assert_eq!(
        caliptra.upload_firmware(&image(4)),
        Err(LibCaliptraError::Api(ApiError::PauserLocked))
    );
    assert!(caliptra.fw_load().is_in_progress());
    assert_eq!(caliptra.fw_load().progress(), Some((0, 12)));
    caliptra.upload_fw_abort().unwrap();
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_invalid_toc() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let invalid = Err(LibCaliptraError::Api(ApiError::InvalidParams));
    assert_eq!(caliptra.upload_fw_start(&[]), invalid);
    assert_eq!(
        caliptra.upload_fw_start(&[TocEntry::new(TocEntryId::Max, 0, 4)]),
        invalid
    );
    assert_eq!(
        caliptra.upload_fw_start(&[
            TocEntry::new(TocEntryId::Fmc, 0, 4),
            TocEntry::new(TocEntryId::Runtime, 6, 4),
        ]),
        invalid
    );
    // Rejected before the lock is taken.
    assert!(model.mailbox_is_idle());
    assert!(!caliptra.fw_load().is_in_progress());
}

#[test]
fn test_begin_while_other_requester_holds_lock() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let mut other = Caliptra::new(model.soc(MailboxRequester::Soc(9)), MailboxConfig::default());
    other.mailbox_mut().lock().unwrap();

    assert_eq!(
        caliptra.upload_fw_start(&toc()),
        Err(LibCaliptraError::Api(ApiError::PauserLocked))
    );
    assert!(!caliptra.fw_load().is_in_progress());
    other.mailbox_mut().release();
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra.upload_fw_abort().unwrap();
}

#[test]
fn test_finish_reports_failure() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    let image = image(12);
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image[..5])
        .unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Runtime, 0, &image[5..])
        .unwrap();

    model.inject_fault(Fault::CommandFailure(0x0102_0003));
    assert_eq!(
        caliptra.upload_fw_end(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(caliptra.mailbox().last_fw_error(), Some(0x0102_0003));
    assert!(!caliptra.fw_load().is_in_progress());
    assert!(model.mailbox_is_idle());
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);
}

#[test]
fn test_load_refused_until_ready_for_fw() {
    let (model, mut caliptra) = run_model(InitParams::unprovisioned());
    assert_eq!(caliptra.lifecycle(), DeviceLifecycle::Unprovisioned);
    assert!(!caliptra.ready_for_firmware());

    let not_ready = Err(LibCaliptraError::Api(ApiError::FwLoadNotInProgress));
    assert_eq!(caliptra.upload_fw_start(&toc()), not_ready);
    assert_eq!(caliptra.upload_firmware(&image(12)), not_ready);
    assert!(!caliptra.fw_load().is_in_progress());
    assert!(model.mailbox_is_idle());
    assert!(model.executed_commands().is_empty());
    assert_eq!(model.loaded_firmware(), None);

    // Provisioning fuses moves the RoT on to asking for firmware.
    caliptra.init_fuses(&Fuses::default()).unwrap();
    assert!(caliptra.ready_for_firmware());
    caliptra.upload_firmware(&image(12)).unwrap();
    assert_eq!(model.loaded_firmware(), Some(image(12)));
    assert!(caliptra.ready_for_runtime());
}

#[test]
fn test_rot_refuses_load_when_not_ready() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Fmc, 0, &image(5))
        .unwrap();
    caliptra
        .upload_fw_chunk(TocEntryId::Runtime, 0, &image(7))
        .unwrap();

    // The RoT changed its mind after the session started.
    model.set_flow_status(FlowStatus::READY_FOR_RUNTIME);
    assert_eq!(
        caliptra.upload_fw_end(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(
        caliptra.mailbox().last_fw_error(),
        Some(FW_PROC_MAILBOX_STATE_INCONSISTENT)
    );
    assert_eq!(model.loaded_firmware(), None);
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_recover_drops_session() {
    let (model, mut caliptra) = run_model(ready_for_fw());
    caliptra.upload_fw_start(&toc()).unwrap();
    caliptra.recover();
    assert!(!caliptra.fw_load().is_in_progress());
    assert!(model.mailbox_is_idle());
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);

    // Nothing to drop the second time around.
    caliptra.recover();
    caliptra.upload_firmware(&image(12)).unwrap();
    assert_eq!(model.loaded_firmware(), Some(image(12)));
}
