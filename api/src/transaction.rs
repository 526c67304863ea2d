/*++

Licensed under the Apache-2.0 license.

File Name:

    transaction.rs

Abstract:

    Mailbox transaction engine: lock arbitration, command submission,
    completion polling and response validation.

--*/

use crate::checksum::verify_resp_checksum;
use crate::config::{AcquirePolicy, MailboxConfig};
use crate::mailbox::{
    populate_req_checksum, FipsStatus, MailboxRespHeader, Request, Response, MAX_MAILBOX_SIZE,
};
use crate::soc_mgr::{MboxCmdStatus, MboxFsmState, MboxStatus, SocMailbox};
use core::mem::size_of;
use libcaliptra_error::{ApiError, LibCaliptraError, LibCaliptraResult, MailboxError};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

/// Local view of the single outstanding transaction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransactionState {
    Idle,
    Locked,
    CommandWritten,
    Executing,
    ResponseReady,
    Error,
}

/// How the RoT finished a command.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Completion {
    /// Success without response data.
    Complete,
    /// Success with `len` bytes waiting in the mailbox.
    DataReady { len: u32 },
}

/// Streams bytes into MBOX_DATAIN as little-endian words.
#[derive(Debug, Default)]
struct FifoWriter {
    partial: [u8; 4],
    partial_len: usize,
    remaining: usize,
}

impl FifoWriter {
    fn start(&mut self, dlen: usize) {
        *self = Self {
            remaining: dlen,
            ..Default::default()
        };
    }

    fn push(&mut self, soc: &mut impl SocMailbox, mut data: &[u8]) {
        self.remaining -= data.len();
        if self.partial_len > 0 {
            let take = (4 - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];
            if self.partial_len < 4 {
                return;
            }
            soc.mbox_write_datain(u32::from_le_bytes(self.partial));
            self.partial_len = 0;
        }
        let mut words = data.chunks_exact(4);
        for word in &mut words {
            soc.mbox_write_datain(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        }
        let rest = words.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }

    fn flush(&mut self, soc: &mut impl SocMailbox) {
        if self.partial_len > 0 {
            self.partial[self.partial_len..].fill(0);
            soc.mbox_write_datain(u32::from_le_bytes(self.partial));
            self.partial_len = 0;
        }
    }
}

fn mbox_read_fifo(soc: &mut impl SocMailbox, buf: &mut [u8]) {
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        chunk.copy_from_slice(&soc.mbox_read_dataout().to_le_bytes());
    }
    let rest = chunks.into_remainder();
    if !rest.is_empty() {
        let word = soc.mbox_read_dataout().to_le_bytes();
        let len = rest.len();
        rest.copy_from_slice(&word[..len]);
    }
}

/// The mailbox as seen by one requester.
///
/// Only one transaction can be outstanding. `acquire` hands out a
/// [`MailboxTransaction`] guard that releases the hardware lock when it goes
/// out of scope, whatever path the caller takes out of the transaction.
pub struct Mailbox<S: SocMailbox> {
    soc: S,
    config: MailboxConfig,
    state: TransactionState,
    completion: Option<Completion>,
    writer: FifoWriter,
    poisoned: Option<MailboxError>,
    last_fw_error: Option<u32>,
}

impl<S: SocMailbox> Mailbox<S> {
    pub fn new(soc: S, config: MailboxConfig) -> Self {
        Self {
            soc,
            config,
            state: TransactionState::Idle,
            completion: None,
            writer: FifoWriter::default(),
            poisoned: None,
            last_fw_error: None,
        }
    }

    pub fn soc(&self) -> &S {
        &self.soc
    }

    pub fn soc_mut(&mut self) -> &mut S {
        &mut self.soc
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// FW error register value captured on the last `MbxStatusFailed`.
    pub fn last_fw_error(&self) -> Option<u32> {
        self.last_fw_error
    }

    /// The error that made the channel untrustworthy, if any.
    pub fn poisoned(&self) -> Option<MailboxError> {
        self.poisoned
    }

    /// Accepts the channel again after the RoT has been reset.
    pub fn recover(&mut self) {
        self.release();
        if let Some(err) = self.poisoned.take() {
            log::info!("mailbox channel recovered after {:?}", err);
        }
    }

    /// Takes the mailbox lock and returns a guard for one transaction.
    pub fn acquire(&mut self) -> LibCaliptraResult<MailboxTransaction<'_, S>> {
        self.lock()?;
        Ok(MailboxTransaction { mbox: self })
    }

    /// Takes the mailbox lock without a guard. The caller must `release`.
    pub fn lock(&mut self) -> LibCaliptraResult<()> {
        if let Some(err) = self.poisoned {
            log::error!("refusing transaction on untrusted mailbox channel: {:?}", err);
            return Err(err.into());
        }
        if self.state != TransactionState::Idle {
            // We hold the lock ourselves; waiting would never end.
            log::warn!("mailbox already held by this requester ({:?})", self.state);
            return Err(ApiError::PauserLocked.into());
        }

        // Read a 0 to get the lock
        let mut wait_cycles = match self.config.acquire {
            AcquirePolicy::NonBlocking => 0,
            AcquirePolicy::Blocking { max_wait_cycles } => max_wait_cycles,
        };
        while self.soc.mbox_read_lock() {
            if wait_cycles == 0 {
                log::debug!("mailbox lock held by another requester");
                return Err(ApiError::PauserLocked.into());
            }
            self.soc.delay();
            wait_cycles -= 1;
        }

        // Mailbox lock value should read 1 now
        // If not, the reads are likely being blocked by the PAUSER check or some other issue
        if !self.soc.mbox_read_lock() {
            log::warn!("mailbox lock did not stick; register access blocked?");
            return Err(ApiError::RegAccessError.into());
        }

        log::debug!("mailbox lock acquired");
        self.state = TransactionState::Locked;
        Ok(())
    }

    fn fail(&mut self, err: impl Into<LibCaliptraError>) -> LibCaliptraError {
        self.state = TransactionState::Error;
        err.into()
    }

    fn poison(&mut self, err: MailboxError) -> LibCaliptraError {
        log::error!("mailbox channel no longer trusted: {:?}", err);
        self.poisoned = Some(err);
        self.fail(err)
    }

    /// Writes the command opcode and declared length. Payload bytes follow
    /// through `write_data`.
    pub fn start_command(&mut self, cmd: u32, dlen: usize) -> LibCaliptraResult<()> {
        if self.state != TransactionState::Locked {
            return Err(ApiError::ApiInternalError.into());
        }
        if dlen > MAX_MAILBOX_SIZE {
            return Err(ApiError::InvalidParams.into());
        }
        let status = MboxStatus(self.soc.mbox_read_status());
        if status.fsm_state() != MboxFsmState::RdyForCmd {
            log::warn!(
                "mailbox FSM not ready for a command: {:?}",
                status.fsm_state()
            );
            return Err(self.fail(MailboxError::MbxStatusNotIdle));
        }

        log::debug!("mailbox cmd 0x{:08x} dlen {}", cmd, dlen);
        self.soc.mbox_write_cmd(cmd);
        self.soc.mbox_write_dlen(dlen as u32);
        self.writer.start(dlen);
        self.state = TransactionState::CommandWritten;
        Ok(())
    }

    /// Appends payload bytes. The total may not exceed the declared length.
    pub fn write_data(&mut self, data: &[u8]) -> LibCaliptraResult<()> {
        if self.state != TransactionState::CommandWritten {
            return Err(ApiError::ApiInternalError.into());
        }
        if data.len() > self.writer.remaining {
            return Err(ApiError::InvalidParams.into());
        }
        self.writer.push(&mut self.soc, data);
        Ok(())
    }

    /// Bytes still owed before `execute` may be called.
    pub fn data_remaining(&self) -> usize {
        self.writer.remaining
    }

    /// Hands the command to the RoT.
    pub fn execute(&mut self) -> LibCaliptraResult<()> {
        if self.state != TransactionState::CommandWritten {
            return Err(ApiError::ApiInternalError.into());
        }
        if self.writer.remaining != 0 {
            return Err(ApiError::InvalidParams.into());
        }
        self.writer.flush(&mut self.soc);

        // Ask the microcontroller to execute this command
        self.soc.mbox_write_execute(true);
        self.state = TransactionState::Executing;
        Ok(())
    }

    /// Sends a complete command.
    pub fn submit(&mut self, cmd: u32, payload: &[u8]) -> LibCaliptraResult<()> {
        self.start_command(cmd, payload.len())?;
        self.write_data(payload)?;
        self.execute()
    }

    /// Checks the command status once. `MbxBusy` means the RoT is still
    /// working on it.
    pub fn try_complete(&mut self) -> LibCaliptraResult<Completion> {
        match self.state {
            TransactionState::Executing => (),
            TransactionState::ResponseReady => {
                return self
                    .completion
                    .ok_or_else(|| ApiError::ApiInternalError.into())
            }
            _ => return Err(MailboxError::MbxNoMsgPending.into()),
        }

        let status = MboxStatus(self.soc.mbox_read_status());
        let completion = match status.status() {
            MboxCmdStatus::CmdBusy => {
                log::trace!("mailbox busy");
                return Err(MailboxError::MbxBusy.into());
            }
            MboxCmdStatus::CmdFailure => {
                let fatal = self.soc.soc_read_fw_error_fatal();
                let fw_error = if fatal != 0 {
                    fatal
                } else {
                    self.soc.soc_read_fw_error_non_fatal()
                };
                log::warn!("mailbox command failed, fw error 0x{:08x}", fw_error);
                self.last_fw_error = Some(fw_error);
                return Err(self.fail(MailboxError::MbxStatusFailed));
            }
            MboxCmdStatus::Unknown(raw) => {
                log::warn!("unrecognized mailbox status 0x{:x}", raw);
                return Err(self.poison(MailboxError::MbxStatusUnknown));
            }
            MboxCmdStatus::CmdComplete => Completion::Complete,
            MboxCmdStatus::DataReady => Completion::DataReady {
                len: self.soc.mbox_read_dlen(),
            },
        };

        if status.fsm_state() != MboxFsmState::ExecuteSoc {
            log::warn!(
                "completion signalled while FSM in {:?}",
                status.fsm_state()
            );
            return Err(self.fail(MailboxError::MbxCompleteNotReady));
        }
        if let Completion::DataReady { len } = completion {
            if len as usize > MAX_MAILBOX_SIZE {
                return Err(self.fail(MailboxError::MbxCompleteNotReady));
            }
        }

        log::debug!("mailbox command done: {:?}", completion);
        self.completion = Some(completion);
        self.state = TransactionState::ResponseReady;
        Ok(completion)
    }

    /// Waits for the outstanding command, calling `SocMailbox::delay`
    /// between status reads. On timeout the command is abandoned: the lock
    /// is released and `MbxBusy` returned. The RoT still finishes the
    /// command on its side.
    pub fn poll_completion(&mut self, timeout_cycles: u32) -> LibCaliptraResult<Completion> {
        let mut cycles = timeout_cycles;
        loop {
            match self.try_complete() {
                Err(LibCaliptraError::Mailbox(MailboxError::MbxBusy)) => {
                    if cycles == 0 {
                        log::warn!(
                            "mailbox command timed out after {} cycles; abandoning",
                            timeout_cycles
                        );
                        self.release();
                        return Err(MailboxError::MbxBusy.into());
                    }
                    self.soc.delay();
                    cycles -= 1;
                }
                other => return other,
            }
        }
    }

    /// Reads and validates the response into `buf`.
    ///
    /// Checks run in order: header present, checksum, FIPS status. On any
    /// failure the bytes copied into `buf` are wiped.
    pub fn read_response<'r>(&mut self, buf: &'r mut [u8]) -> LibCaliptraResult<&'r [u8]> {
        if self.state != TransactionState::ResponseReady {
            return Err(MailboxError::MbxNoMsgPending.into());
        }
        let len = match self.completion {
            Some(Completion::DataReady { len }) => len as usize,
            _ => return Err(self.fail(MailboxError::MbxRespNoHeader)),
        };
        if len < size_of::<MailboxRespHeader>() {
            return Err(self.fail(MailboxError::MbxRespNoHeader));
        }
        if len > buf.len() {
            log::warn!("response of {} bytes does not fit {} byte buffer", len, buf.len());
            return Err(self.fail(ApiError::InvalidParams));
        }

        let resp = &mut buf[..len];
        mbox_read_fifo(&mut self.soc, resp);

        let Some((expected, actual)) = verify_resp_checksum(resp) else {
            return Err(self.fail(MailboxError::MbxRespNoHeader));
        };
        if expected != actual {
            log::warn!(
                "response checksum mismatch: expected 0x{:08x} actual 0x{:08x}",
                expected,
                actual
            );
            resp.fill(0);
            return Err(self.fail(MailboxError::MbxRespChksumInvalid));
        }

        let hdr = match MailboxRespHeader::read_from_prefix(resp) {
            Ok((hdr, _)) => hdr,
            Err(_) => return Err(self.fail(MailboxError::MbxRespNoHeader)),
        };
        if let Err(fips_status) = FipsStatus::try_from(hdr.fips_status) {
            log::warn!("response FIPS status 0x{:x} not approved", fips_status);
            resp.fill(0);
            return Err(self.poison(MailboxError::MbxRespFipsNotApproved));
        }

        Ok(&buf[..len])
    }

    /// Returns the mailbox to the RoT. Safe to call in any state.
    pub fn release(&mut self) {
        if self.state == TransactionState::Idle {
            return;
        }
        log::debug!("mailbox released from {:?}", self.state);
        self.soc.mbox_write_execute(false);
        self.state = TransactionState::Idle;
        self.completion = None;
        self.writer = FifoWriter::default();
    }

    /// Executes `cmd` with request data `buf`. Returns `Ok(Some(_))` if the
    /// RoT responded with data, `Ok(None)` if it indicated success without
    /// data.
    pub fn exec<'r>(
        &mut self,
        cmd: u32,
        buf: &[u8],
        resp_data: &'r mut [u8],
    ) -> LibCaliptraResult<Option<&'r [u8]>> {
        let timeout = self.config.max_wait_cycles;
        let mut tx = self.acquire()?;
        tx.submit(cmd, buf)?;
        match tx.poll_completion(timeout)? {
            Completion::Complete => Ok(None),
            Completion::DataReady { .. } => tx.read_response(resp_data).map(Some),
        }
    }

    /// Executes a typed request and returns the typed response. The request
    /// checksum is filled in here; the response checksum and FIPS status
    /// are validated by `read_response`.
    pub fn exec_req<R: Request>(&mut self, mut req: R) -> LibCaliptraResult<R::Resp> {
        populate_req_checksum(&mut req)?;
        let mut resp_bytes = vec![0u8; size_of::<R::Resp>()];
        let Some(data) = self.exec(R::ID.into(), req.as_bytes_partial()?, &mut resp_bytes)? else {
            return Err(MailboxError::MbxRespNoHeader.into());
        };

        if data.len() < R::Resp::MIN_SIZE || data.len() > size_of::<R::Resp>() {
            log::warn!(
                "unexpected response length {} for cmd 0x{:08x} (min {}, max {})",
                data.len(),
                u32::from(R::ID),
                R::Resp::MIN_SIZE,
                size_of::<R::Resp>()
            );
            return Err(ApiError::ApiInternalError.into());
        }

        let mut response = R::Resp::new_zeroed();
        response.as_mut_bytes()[..data.len()].copy_from_slice(data);
        Ok(response)
    }
}

/// Exclusive ownership of the mailbox for one command/response exchange.
/// Dropping the guard releases the lock.
pub struct MailboxTransaction<'a, S: SocMailbox> {
    mbox: &'a mut Mailbox<S>,
}

impl<S: SocMailbox> MailboxTransaction<'_, S> {
    pub fn state(&self) -> TransactionState {
        self.mbox.state
    }

    pub fn submit(&mut self, cmd: u32, payload: &[u8]) -> LibCaliptraResult<()> {
        self.mbox.submit(cmd, payload)
    }

    pub fn try_complete(&mut self) -> LibCaliptraResult<Completion> {
        self.mbox.try_complete()
    }

    pub fn poll_completion(&mut self, timeout_cycles: u32) -> LibCaliptraResult<Completion> {
        self.mbox.poll_completion(timeout_cycles)
    }

    pub fn read_response<'r>(&mut self, buf: &'r mut [u8]) -> LibCaliptraResult<&'r [u8]> {
        self.mbox.read_response(buf)
    }

    pub fn release(self) {
        // Drop does the work.
    }
}

impl<S: SocMailbox> Drop for MailboxTransaction<'_, S> {
    fn drop(&mut self) {
        self.mbox.release();
    }
}
