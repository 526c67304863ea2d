/*++

Licensed under the Apache-2.0 license.

File Name:

    mailbox.rs

Abstract:

    Mailbox arbitration lock, command FSM and FIFO as exposed to SoC
    requesters and to the runtime responder.

--*/

use libcaliptra::mailbox::MAX_MAILBOX_SIZE;
use libcaliptra::MboxStatus;
use smlang::statemachine;

/// Who is driving the mailbox. Each SoC agent is told apart by its
/// PAUSER value.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum MailboxRequester {
    Caliptra,
    Soc(u32),
}

impl From<MailboxRequester> for u32 {
    fn from(val: MailboxRequester) -> Self {
        match val {
            MailboxRequester::Caliptra => 0,
            MailboxRequester::Soc(pauser) => pauser,
        }
    }
}

#[derive(PartialEq)]
/// Command opcode
pub struct Cmd(pub u32);

#[derive(PartialEq)]
/// Data length
pub struct DataLength(pub u32);

#[derive(PartialEq)]
/// Data In
pub struct DataIn(pub u32);

#[derive(PartialEq)]
/// Status and payload produced by the runtime.
pub struct UcResponse {
    pub status: u32,
    pub data: Vec<u8>,
}

statemachine! {
    transitions: {
        // CurrentState Event [guard] / action = NextState

        //move from idle to rdy for command when lock is acquired.
        *Idle + RdLock(MailboxRequester) [is_not_locked] / lock = RdyForCmd,

        RdyForCmd + CmdWrite(Cmd) / set_cmd = RdyForDlen,
        RdyForDlen + DlenWrite(DataLength) / init_dlen = RdyForData,
        RdyForData + DataWrite(DataIn) / enqueue = RdyForData,

        //hand the request to the runtime.
        RdyForData + SocExecSet = ExecUc,

        //runtime is done, mailbox goes back to the requester.
        ExecUc + UcRespond(UcResponse) / respond = ExecSoc,
        ExecSoc + DataRead / dequeue = ExecSoc,

        //requester clears execute, from any point after locking.
        RdyForCmd + SocExecClear [is_locked] / unlock = Idle,
        RdyForDlen + SocExecClear [is_locked] / unlock = Idle,
        RdyForData + SocExecClear [is_locked] / unlock = Idle,
        ExecUc + SocExecClear [is_locked] / unlock = Idle,
        ExecSoc + SocExecClear [is_locked] / unlock = Idle
    }
}

const FIFO_WORDS: usize = MAX_MAILBOX_SIZE / 4;

/// State machine extended variables.
pub struct Context {
    /// lock state
    pub locked: bool,
    /// Who acquired the lock.
    pub user: MailboxRequester,
    pub cmd: u32,
    /// number of data bytes
    pub dlen: u32,
    fifo: Vec<u32>,
    read_index: usize,
    /// Command status field of MBOX_STATUS
    status: u32,
    data_out: u32,
}

impl Context {
    fn new() -> Self {
        Self {
            locked: false,
            user: MailboxRequester::Caliptra,
            cmd: 0,
            dlen: 0,
            fifo: Vec::new(),
            read_index: 0,
            status: MboxStatus::CMD_BUSY,
            data_out: 0,
        }
    }

    fn reset_fifo(&mut self) {
        self.fifo.clear();
        self.read_index = 0;
    }
}

impl StateMachineContext for Context {
    // guards
    fn is_not_locked(&mut self, _user: &MailboxRequester) -> Result<(), ()> {
        if self.locked {
            // no transition
            Err(())
        } else {
            Ok(())
        }
    }

    fn is_locked(&mut self) -> Result<(), ()> {
        if self.locked {
            Ok(())
        } else {
            // no transition
            Err(())
        }
    }

    // actions
    fn lock(&mut self, user: &MailboxRequester) {
        self.reset_fifo();
        self.locked = true;
        self.user = *user;
        self.status = MboxStatus::CMD_BUSY;
    }

    fn unlock(&mut self) {
        self.locked = false;
        self.cmd = 0;
        self.dlen = 0;
        self.reset_fifo();
        // Reset status
        self.status = MboxStatus::CMD_BUSY;
    }

    fn set_cmd(&mut self, cmd: &Cmd) {
        self.cmd = cmd.0;
    }

    fn init_dlen(&mut self, data_len: &DataLength) {
        self.reset_fifo();
        self.dlen = data_len.0;
    }

    fn enqueue(&mut self, data_in: &DataIn) {
        if self.fifo.len() < FIFO_WORDS {
            self.fifo.push(data_in.0);
        }
    }

    fn respond(&mut self, resp: &UcResponse) {
        self.reset_fifo();
        self.status = resp.status;
        self.dlen = resp.data.len() as u32;
        self.fifo = resp
            .data
            .chunks(4)
            .map(|chunk| {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(word)
            })
            .collect();
    }

    fn dequeue(&mut self) {
        self.data_out = self.fifo.get(self.read_index).copied().unwrap_or(0);
        self.read_index += 1;
    }
}

/// The mailbox peripheral. Writes from anyone but the lock holder are
/// dropped, as the hardware does for a PAUSER mismatch.
pub struct MailboxModel {
    state_machine: StateMachine<Context>,
    request_taken: bool,
}

impl Default for MailboxModel {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxModel {
    pub fn new() -> Self {
        Self {
            state_machine: StateMachine::new(Context::new()),
            request_taken: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state_machine.state(), States::Idle)
    }

    pub fn lock_holder(&self) -> Option<MailboxRequester> {
        let context = self.state_machine.context();
        context.locked.then_some(context.user)
    }

    fn is_owner(&self, requester: MailboxRequester) -> bool {
        self.lock_holder() == Some(requester)
    }

    /// MBOX_LOCK read. Returns the value of the lock bit before the read,
    /// so `false` means the lock was just granted.
    pub fn read_lock(&mut self, requester: MailboxRequester) -> bool {
        self.state_machine
            .process_event(Events::RdLock(requester))
            .is_err()
    }

    pub fn write_cmd(&mut self, requester: MailboxRequester, cmd: u32) {
        if self.is_owner(requester) {
            let _ = self.state_machine.process_event(Events::CmdWrite(Cmd(cmd)));
        }
    }

    pub fn write_dlen(&mut self, requester: MailboxRequester, dlen: u32) {
        if self.is_owner(requester) {
            let _ = self
                .state_machine
                .process_event(Events::DlenWrite(DataLength(dlen)));
        }
    }

    pub fn read_dlen(&self) -> u32 {
        self.state_machine.context().dlen
    }

    pub fn write_datain(&mut self, requester: MailboxRequester, word: u32) {
        if self.is_owner(requester) {
            let _ = self
                .state_machine
                .process_event(Events::DataWrite(DataIn(word)));
        }
    }

    pub fn read_dataout(&mut self, requester: MailboxRequester) -> u32 {
        if !self.is_owner(requester) {
            return 0;
        }
        match self.state_machine.process_event(Events::DataRead) {
            Ok(_) => self.state_machine.context().data_out,
            Err(_) => 0,
        }
    }

    pub fn write_execute(&mut self, requester: MailboxRequester, execute: bool) {
        if !self.is_owner(requester) {
            return;
        }
        let event = if execute {
            Events::SocExecSet
        } else {
            Events::SocExecClear
        };
        if self.state_machine.process_event(event).is_ok() && execute {
            self.request_taken = false;
        }
    }

    /// MBOX_STATUS as seen by `requester`.
    pub fn read_status(&self, requester: MailboxRequester) -> u32 {
        let fsm = match self.state_machine.state() {
            States::Idle => MboxStatus::FSM_IDLE,
            States::RdyForCmd => MboxStatus::FSM_RDY_FOR_CMD,
            States::RdyForDlen => MboxStatus::FSM_RDY_FOR_DLEN,
            States::RdyForData => MboxStatus::FSM_RDY_FOR_DATA,
            States::ExecUc => MboxStatus::FSM_EXECUTE_UC,
            States::ExecSoc => MboxStatus::FSM_EXECUTE_SOC,
        };
        MboxStatus::new(
            self.state_machine.context().status,
            fsm,
            self.is_owner(requester),
        )
        .0
    }

    pub fn is_ready_for_cmd(&self) -> bool {
        matches!(self.state_machine.state(), States::RdyForCmd)
    }

    /// True while a request waits for the runtime.
    pub fn has_pending_request(&self) -> bool {
        matches!(self.state_machine.state(), States::ExecUc) && !self.request_taken
    }

    /// Hands the pending request to the runtime: the opcode and the
    /// payload truncated to DLEN.
    pub fn take_request(&mut self) -> Option<(u32, Vec<u8>)> {
        if !self.has_pending_request() {
            return None;
        }
        self.request_taken = true;
        let context = self.state_machine.context();
        let mut bytes: Vec<u8> = context
            .fifo
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        bytes.resize(context.dlen as usize, 0);
        Some((context.cmd, bytes))
    }

    /// Completes the command with `status` and returns the mailbox to
    /// the requester.
    pub fn respond(&mut self, status: u32, data: Vec<u8>) -> bool {
        self.state_machine
            .process_event(Events::UcRespond(UcResponse { status, data }))
            .is_ok()
    }

    /// Sets the status field without handing the mailbox back.
    pub fn set_status(&mut self, status: u32) {
        self.state_machine.context.status = status;
    }
}
