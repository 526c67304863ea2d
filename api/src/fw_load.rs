/*++

Licensed under the Apache-2.0 license.

File Name:

    fw_load.rs

Abstract:

    Piecewise firmware upload: begin / chunk / finish over one mailbox
    transaction.

--*/

use crate::mailbox::{CommandId, MAX_MAILBOX_SIZE};
use crate::soc_mgr::{FlowStatus, SocMailbox};
use crate::transaction::{Completion, Mailbox};
use libcaliptra_error::{ApiError, LibCaliptraResult};

/// Identifies an image component in the table of contents.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TocEntryId {
    Fmc = 1,
    Runtime = 2,
    /// Terminator for unused slots. Never a real component.
    Max = 0xFFFF_FFFF,
}

impl TryFrom<u32> for TocEntryId {
    type Error = u32;
    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            1 => Ok(TocEntryId::Fmc),
            2 => Ok(TocEntryId::Runtime),
            0xFFFF_FFFF => Ok(TocEntryId::Max),
            other => Err(other),
        }
    }
}

impl From<TocEntryId> for u32 {
    fn from(value: TocEntryId) -> Self {
        value as u32
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TocEntry {
    pub id: TocEntryId,
    /// Byte offset of the component within the image.
    pub offset: u32,
    pub length: u32,
}

impl TocEntry {
    pub fn new(id: TocEntryId, offset: u32, length: u32) -> Self {
        Self { id, offset, length }
    }
}

/// Per-entry progress of a running upload.
#[derive(Debug, Clone)]
struct Progress {
    toc: Vec<TocEntry>,
    written: Vec<u32>,
    total: u32,
}

impl Progress {
    /// The entry that must receive the next byte.
    fn current(&self) -> Option<usize> {
        self.toc
            .iter()
            .zip(&self.written)
            .position(|(entry, written)| *written < entry.length)
    }

    fn bytes_written(&self) -> u32 {
        self.written.iter().sum()
    }
}

#[derive(Debug, Clone, Default)]
enum SessionState {
    #[default]
    Idle,
    InProgress(Progress),
}

/// State of a piecewise FIRMWARE_LOAD.
///
/// The mailbox lock is held from `begin` until `finish` or `abort`, so no
/// other command can interleave with the image data.
#[derive(Debug, Default)]
pub struct FwLoadSession {
    state: SessionState,
}

fn validate_toc(toc: &[TocEntry]) -> LibCaliptraResult<u32> {
    if toc.is_empty() {
        return Err(ApiError::InvalidParams.into());
    }
    let mut expected_offset = 0u32;
    for (i, entry) in toc.iter().enumerate() {
        if entry.id == TocEntryId::Max {
            log::warn!("ToC entry {} is the MAX sentinel", i);
            return Err(ApiError::InvalidParams.into());
        }
        if toc[..i].iter().any(|e| e.id == entry.id) {
            log::warn!("ToC lists {:?} twice", entry.id);
            return Err(ApiError::InvalidParams.into());
        }
        if entry.length == 0 || entry.offset != expected_offset {
            log::warn!(
                "ToC entry {:?} at offset {} len {} does not follow offset {}",
                entry.id,
                entry.offset,
                entry.length,
                expected_offset
            );
            return Err(ApiError::InvalidParams.into());
        }
        expected_offset = expected_offset
            .checked_add(entry.length)
            .ok_or(ApiError::InvalidParams)?;
    }
    if expected_offset as usize > MAX_MAILBOX_SIZE {
        return Err(ApiError::InvalidParams.into());
    }
    Ok(expected_offset)
}

/// Fails with `FwLoadNotInProgress` unless the RoT raises READY_FOR_FW,
/// which it only does once the life cycle flow is past fuse provisioning.
pub fn require_ready_for_fw<S: SocMailbox>(mbox: &mut Mailbox<S>) -> LibCaliptraResult<()> {
    let flow = FlowStatus::from_bits_truncate(mbox.soc_mut().soc_read_flow_status());
    if !flow.contains(FlowStatus::READY_FOR_FW) {
        log::warn!("RoT is not asking for firmware: {:?}", flow);
        return Err(ApiError::FwLoadNotInProgress.into());
    }
    Ok(())
}

impl FwLoadSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(self.state, SessionState::InProgress(_))
    }

    /// Bytes accepted so far and the image size, while a load is running.
    pub fn progress(&self) -> Option<(u32, u32)> {
        match &self.state {
            SessionState::InProgress(p) => Some((p.bytes_written(), p.total)),
            SessionState::Idle => None,
        }
    }

    /// Takes the mailbox and announces an image described by `toc`. The
    /// RoT must be asking for firmware.
    pub fn begin<S: SocMailbox>(
        &mut self,
        mbox: &mut Mailbox<S>,
        toc: &[TocEntry],
    ) -> LibCaliptraResult<()> {
        if self.is_in_progress() {
            log::warn!("firmware load already in progress");
            return Err(ApiError::PauserLocked.into());
        }
        require_ready_for_fw(mbox)?;
        let total = validate_toc(toc)?;

        mbox.lock()?;
        if let Err(err) = mbox.start_command(CommandId::FIRMWARE_LOAD.into(), total as usize) {
            mbox.release();
            return Err(err);
        }

        log::info!("firmware load started: {} bytes in {} entries", total, toc.len());
        self.state = SessionState::InProgress(Progress {
            toc: toc.to_vec(),
            written: vec![0; toc.len()],
            total,
        });
        Ok(())
    }

    /// Streams `data` into entry `id` at `offset` bytes from the start of
    /// that entry. Entries are written in ToC order without gaps.
    pub fn write_chunk<S: SocMailbox>(
        &mut self,
        mbox: &mut Mailbox<S>,
        id: TocEntryId,
        offset: u32,
        data: &[u8],
    ) -> LibCaliptraResult<()> {
        let SessionState::InProgress(progress) = &mut self.state else {
            return Err(ApiError::FwLoadNotInProgress.into());
        };
        let index = progress
            .toc
            .iter()
            .position(|e| e.id == id)
            .ok_or(ApiError::InvalidParams)?;
        let entry = progress.toc[index];

        let end = u32::try_from(data.len())
            .ok()
            .and_then(|len| offset.checked_add(len))
            .ok_or(ApiError::InvalidParams)?;
        if end > entry.length {
            log::warn!(
                "chunk {:?} [{}..{}) exceeds entry length {}",
                id,
                offset,
                end,
                entry.length
            );
            return Err(ApiError::InvalidParams.into());
        }
        if data.is_empty() {
            return Ok(());
        }
        if progress.current() != Some(index) || offset != progress.written[index] {
            log::warn!(
                "out-of-order chunk {:?} at offset {} (expected offset {})",
                id,
                offset,
                progress.written[index]
            );
            return Err(ApiError::InvalidParams.into());
        }

        mbox.write_data(data)?;
        progress.written[index] = end;
        log::trace!("fw chunk {:?} now at {}/{}", id, end, entry.length);
        Ok(())
    }

    /// Executes the load once every entry is complete. An incomplete image
    /// fails with `InvalidParams` and the session stays open.
    pub fn finish<S: SocMailbox>(
        &mut self,
        mbox: &mut Mailbox<S>,
        timeout_cycles: u32,
    ) -> LibCaliptraResult<()> {
        let SessionState::InProgress(progress) = &self.state else {
            return Err(ApiError::FwLoadNotInProgress.into());
        };
        if let Some(index) = progress.current() {
            let entry = &progress.toc[index];
            log::warn!(
                "firmware entry {:?} incomplete: {}/{} bytes",
                entry.id,
                progress.written[index],
                entry.length
            );
            return Err(ApiError::InvalidParams.into());
        }

        self.state = SessionState::Idle;
        let result = mbox
            .execute()
            .and_then(|_| mbox.poll_completion(timeout_cycles));
        mbox.release();
        match result? {
            Completion::Complete => (),
            Completion::DataReady { len } => {
                log::debug!("firmware load returned {} unexpected bytes", len)
            }
        }
        log::info!("firmware load complete");
        Ok(())
    }

    /// Drops the upload and frees the mailbox. Data already written never
    /// executes.
    pub fn abort<S: SocMailbox>(&mut self, mbox: &mut Mailbox<S>) -> LibCaliptraResult<()> {
        if !self.is_in_progress() {
            return Err(ApiError::FwLoadNotInProgress.into());
        }
        self.state = SessionState::Idle;
        mbox.release();
        log::info!("firmware load aborted");
        Ok(())
    }
}
