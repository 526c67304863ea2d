// Licensed under the Apache-2.0 license

use crate::dpe::DeriveContextFlags;

/// How `Mailbox::acquire` behaves when another requester holds the lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AcquirePolicy {
    /// Fail immediately with `PauserLocked`.
    #[default]
    NonBlocking,
    /// Poll the lock register, calling `SocMailbox::delay` between attempts,
    /// and give up with `PauserLocked` after `max_wait_cycles` attempts.
    Blocking { max_wait_cycles: u32 },
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MailboxConfig {
    /// Polling budget used when a caller does not pass its own timeout.
    pub max_wait_cycles: u32,
    pub acquire: AcquirePolicy,
}

impl MailboxConfig {
    pub const DEFAULT_MAX_WAIT_CYCLES: u32 = 400_000;
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            max_wait_cycles: Self::DEFAULT_MAX_WAIT_CYCLES,
            acquire: AcquirePolicy::NonBlocking,
        }
    }
}

/// DeriveContext flag combinations rejected before anything is sent.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeriveFlagPolicy {
    forbidden: Vec<DeriveContextFlags>,
}

impl Default for DeriveFlagPolicy {
    fn default() -> Self {
        Self {
            forbidden: vec![
                DeriveContextFlags::EXPORT_CDI | DeriveContextFlags::CREATE_CERTIFICATE,
            ],
        }
    }
}

impl DeriveFlagPolicy {
    /// A policy that forbids nothing and leaves validation to the RoT.
    pub fn permissive() -> Self {
        Self { forbidden: vec![] }
    }

    pub fn forbid(mut self, combination: DeriveContextFlags) -> Self {
        if !self.forbidden.contains(&combination) {
            self.forbidden.push(combination);
        }
        self
    }

    pub fn allow(mut self, combination: DeriveContextFlags) -> Self {
        self.forbidden.retain(|c| *c != combination);
        self
    }

    /// Returns the first forbidden combination fully contained in `flags`.
    pub fn violation(&self, flags: DeriveContextFlags) -> Option<DeriveContextFlags> {
        self.forbidden
            .iter()
            .copied()
            .find(|combination| flags.contains(*combination))
    }
}
