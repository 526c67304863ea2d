// Licensed under the Apache-2.0 license

//! Client side of the Caliptra mailbox: transaction engine, firmware
//! loading, fuse provisioning and DPE context tracking.

pub mod auth_manifest;

mod checksum;

pub mod config;

mod dispatcher;

pub mod dpe;

pub mod fw_load;

pub mod lifecycle;

pub mod mailbox;

pub mod soc_mgr;

pub mod transaction;

pub use libcaliptra_error as error;

pub use checksum::{calc_checksum, verify_checksum, verify_resp_checksum};

pub use config::{AcquirePolicy, DeriveFlagPolicy, MailboxConfig};

pub use dispatcher::Caliptra;

pub use fw_load::{FwLoadSession, TocEntry, TocEntryId};

pub use lifecycle::DeviceLifecycle;

pub use soc_mgr::{FlowStatus, FuseRegister, Fuses, MboxStatus, SecurityState, SocMailbox};

pub use transaction::{Completion, Mailbox, MailboxTransaction, TransactionState};
