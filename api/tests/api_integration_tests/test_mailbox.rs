// Licensed under the Apache-2.0 license

use crate::common::{run_model, run_model_with_config};
use libcaliptra::error::{ApiError, LibCaliptraError, MailboxError};
use libcaliptra::mailbox::{CommandId, FipsVersionResp};
use libcaliptra::{calc_checksum, Completion, MailboxConfig, TransactionState};
use libcaliptra_model::{Fault, InitParams, DEFAULT_REQUESTER};

fn fips_version_request() -> [u8; 4] {
    calc_checksum(CommandId::VERSION.into(), &[]).to_le_bytes()
}

#[test]
fn test_fips_version() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let resp = caliptra.fips_version().unwrap();
    assert_eq!(resp.mode, FipsVersionResp::MODE);
    assert_eq!(resp.name, FipsVersionResp::NAME);
    assert!(model.mailbox_is_idle());
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);
}

#[test]
fn test_response_checksum_corruption() {
    let (model, mut caliptra) = run_model(InitParams::default());
    // Every byte of the response is covered, header included.
    for idx in [0, 3, 4, 8, 20, 35] {
        model.inject_fault(Fault::CorruptResponseByte(idx));
        assert_eq!(
            caliptra.fips_version(),
            Err(LibCaliptraError::Mailbox(MailboxError::MbxRespChksumInvalid)),
            "corrupted byte {}",
            idx
        );
        assert!(model.mailbox_is_idle());
    }
    // Not fatal to the channel.
    assert_eq!(caliptra.channel_poisoned(), None);
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_fips_not_approved_poisons_channel() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::FipsStatus(1));
    let err = caliptra.fips_version().unwrap_err();
    assert_eq!(
        err,
        LibCaliptraError::Mailbox(MailboxError::MbxRespFipsNotApproved)
    );
    assert!(err.is_fatal_to_session());
    assert!(model.mailbox_is_idle());

    // Refused locally until recovered.
    let executed = model.executed_commands().len();
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxRespFipsNotApproved))
    );
    assert_eq!(model.executed_commands().len(), executed);

    caliptra.recover();
    assert_eq!(caliptra.channel_poisoned(), None);
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_unknown_status_poisons_channel() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::UnknownStatus(0xa));
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusUnknown))
    );
    assert_eq!(
        caliptra.channel_poisoned(),
        Some(MailboxError::MbxStatusUnknown)
    );
    assert!(model.mailbox_is_idle());

    model.reset_mailbox();
    caliptra.recover();
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_command_failure_records_fw_error() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::CommandFailure(0x000e_1234));
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusFailed))
    );
    assert_eq!(caliptra.mailbox().last_fw_error(), Some(0x000e_1234));
    assert!(model.mailbox_is_idle());

    // The fatal register wins when both are set.
    model.set_fw_error_fatal(0x77);
    model.inject_fault(Fault::CommandFailure(0x1));
    assert!(caliptra.fips_version().is_err());
    assert_eq!(caliptra.mailbox().last_fw_error(), Some(0x77));

    // Failures do not poison the channel.
    assert_eq!(caliptra.channel_poisoned(), None);
}

#[test]
fn test_complete_without_handoff() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::CompleteWithoutHandoff);
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxCompleteNotReady))
    );
    assert!(model.mailbox_is_idle());
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_truncated_response() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::TruncatedResponse(6));
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxRespNoHeader))
    );
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_timeout_abandons_command() {
    let (model, mut caliptra) = run_model_with_config(
        InitParams {
            busy_cycles: 1000,
            ..Default::default()
        },
        MailboxConfig {
            max_wait_cycles: 10,
            ..Default::default()
        },
    );
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxBusy))
    );
    assert!(model.mailbox_is_idle());
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);
    // The RoT still ran the abandoned command.
    assert_eq!(model.executed_commands(), vec![CommandId::VERSION.0]);

    model.set_busy_cycles(0);
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_stale_fsm_state() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::StaleFsmState);
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxStatusNotIdle))
    );
    assert!(model.mailbox_is_idle());
    assert!(model.executed_commands().is_empty());
}

#[test]
fn test_lock_read_blocked() {
    let (model, mut caliptra) = run_model(InitParams::default());
    model.inject_fault(Fault::LockReadsBlocked(2));
    assert_eq!(
        caliptra.fips_version(),
        Err(LibCaliptraError::Api(ApiError::RegAccessError))
    );
    assert_eq!(model.lock_holder(), None);
    assert!(caliptra.fips_version().is_ok());
}

#[test]
fn test_guard_releases_on_drop() {
    let (model, mut caliptra) = run_model(InitParams::default());
    {
        let tx = caliptra.mailbox_mut().acquire().unwrap();
        assert_eq!(tx.state(), TransactionState::Locked);
        assert_eq!(model.lock_holder(), Some(DEFAULT_REQUESTER));
    }
    assert_eq!(model.lock_holder(), None);
    assert_eq!(caliptra.mailbox().state(), TransactionState::Idle);
}

#[test]
fn test_manual_transaction() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let mut tx = caliptra.mailbox_mut().acquire().unwrap();
    tx.submit(CommandId::VERSION.into(), &fips_version_request())
        .unwrap();
    assert_eq!(tx.state(), TransactionState::Executing);
    let completion = tx.poll_completion(100).unwrap();
    assert_eq!(completion, Completion::DataReady { len: 36 });
    assert_eq!(tx.state(), TransactionState::ResponseReady);

    let mut buf = [0u8; 64];
    let resp = tx.read_response(&mut buf).unwrap();
    assert_eq!(resp.len(), 36);
    assert_eq!(&resp[24..36], b"Caliptra RTM");
    tx.release();
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_response_buffer_too_small() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let mut buf = [0u8; 16];
    assert_eq!(
        caliptra
            .mailbox_mut()
            .exec(CommandId::VERSION.into(), &fips_version_request(), &mut buf),
        Err(LibCaliptraError::Api(ApiError::InvalidParams))
    );
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_declared_length_enforced() {
    let (model, mut caliptra) = run_model(InitParams::default());
    let mbox = caliptra.mailbox_mut();
    mbox.lock().unwrap();
    mbox.start_command(CommandId::VERSION.into(), 4).unwrap();
    assert_eq!(
        mbox.execute(),
        Err(LibCaliptraError::Api(ApiError::InvalidParams))
    );
    assert_eq!(
        mbox.write_data(&[0; 8]),
        Err(LibCaliptraError::Api(ApiError::InvalidParams))
    );
    mbox.write_data(&fips_version_request()).unwrap();
    assert_eq!(mbox.data_remaining(), 0);
    mbox.execute().unwrap();
    assert!(mbox.poll_completion(100).is_ok());
    mbox.release();
    assert!(model.mailbox_is_idle());
}

#[test]
fn test_try_complete_without_command() {
    let (_model, mut caliptra) = run_model(InitParams::default());
    assert_eq!(
        caliptra.mailbox_mut().try_complete(),
        Err(LibCaliptraError::Mailbox(MailboxError::MbxNoMsgPending))
    );
}
