/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Status codes returned by libcaliptra, partitioned by domain.

--*/
use core::fmt;

/// Defines a `#[repr(u32)]` error enum for one domain.
///
/// Takes a list of (name, value, doc) tuples. Every code must be unique
/// within the domain; `all_codes()` lets the unit tests check that.
macro_rules! define_error_domain {
    ($(#[$meta:meta])* $domain:ident { $(($name:ident, $value:expr, $doc:expr)),* $(,)? }) => {
        $(#[$meta])*
        #[repr(u32)]
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum $domain {
            $(
                #[doc = $doc]
                $name = $value,
            )*
        }

        impl $domain {
            /// Numeric code as seen on the C ABI.
            pub const fn code(self) -> u32 {
                self as u32
            }

            const fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $doc,)*
                }
            }

            #[cfg(test)]
            /// Returns all codes of this domain for uniqueness tests
            pub fn all_codes() -> Vec<(&'static str, u32)> {
                vec![$((stringify!($name), $value),)*]
            }
        }

        impl TryFrom<u32> for $domain {
            type Error = UnknownCode;
            fn try_from(val: u32) -> Result<Self, UnknownCode> {
                match val {
                    $(v if v == $value => Ok(Self::$name),)*
                    other => Err(UnknownCode(other)),
                }
            }
        }

        impl From<$domain> for u32 {
            fn from(val: $domain) -> Self {
                val.code()
            }
        }

        impl fmt::Display for $domain {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} (0x{:x})", self.description(), self.code())
            }
        }

        impl std::error::Error for $domain {}
    };
}

/// A numeric code that does not belong to the domain it was decoded for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct UnknownCode(pub u32);

define_error_domain!(
    /// General API errors.
    ApiError {
        (InvalidParams, 0x100, "Invalid parameters"),
        (ApiInternalError, 0x101, "API internal error"),
        (RegAccessError, 0x102, "Register access error"),
        (PauserLocked, 0x103, "Mailbox is locked by another requester"),
        (FwLoadNotInProgress, 0x104, "Piecewise firmware load not in progress"),
    }
);

define_error_domain!(
    /// Fuse provisioning errors.
    FuseError {
        (NotReadyForFuses, 0x200, "Device is not ready for fuses"),
        (StillReadyForFuses, 0x201, "Device is still ready for fuses"),
    }
);

define_error_domain!(
    /// Mailbox transport and integrity errors.
    MailboxError {
        (MbxBusy, 0x300, "Mailbox command still executing"),
        (MbxNoMsgPending, 0x301, "No mailbox command pending"),
        (MbxCompleteNotReady, 0x302, "Mailbox completion signalled before handoff"),
        (MbxStatusFailed, 0x303, "Mailbox command failed"),
        (MbxStatusUnknown, 0x304, "Unknown mailbox status"),
        (MbxStatusNotIdle, 0x305, "Mailbox not idle"),
        (MbxRespNoHeader, 0x306, "Mailbox response has no header"),
        (MbxRespChksumInvalid, 0x307, "Mailbox response checksum invalid"),
        (MbxRespFipsNotApproved, 0x308, "Mailbox response FIPS status not approved"),
    }
);

define_error_domain!(
    /// Manufacturing flow errors.
    MfgError {
        (IdevCsrNotReady, 0x400, "IDevID CSR not ready"),
    }
);

define_error_domain!(
    /// Errors reported by the DPE instance inside the RoT.
    DpeError {
        (InternalError, 1, "DPE internal error"),
        (InvalidCommand, 2, "DPE invalid command"),
        (InvalidArgument, 3, "DPE invalid argument"),
        (ArgumentNotSupported, 4, "DPE argument not supported"),
        (InvalidHandle, 0x1000, "DPE invalid handle"),
        (InvalidLocality, 0x1001, "DPE invalid locality"),
        (BadTag, 0x1002, "DPE bad tag"),
        (MaxTcis, 0x1003, "DPE maximum TCI nodes reached"),
        (PlatformError, 0x1004, "DPE platform error"),
        (CryptoError, 0x1005, "DPE crypto error"),
        (HashError, 0x1006, "DPE hash error"),
        (RandError, 0x1007, "DPE rand error"),
    }
);

impl DpeError {
    pub const NO_ERROR: u32 = 0;

    /// Decodes a DPE response status word. `NO_ERROR` is success.
    pub fn check(status: u32) -> Result<(), LibCaliptraError> {
        if status == Self::NO_ERROR {
            return Ok(());
        }
        match DpeError::try_from(status) {
            Ok(err) => Err(err.into()),
            Err(UnknownCode(code)) => Err(LibCaliptraError::UnknownDpeStatus(code)),
        }
    }
}

/// libcaliptra error type
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum LibCaliptraError {
    #[error("api: {0}")]
    Api(#[from] ApiError),
    #[error("fuse: {0}")]
    Fuse(#[from] FuseError),
    #[error("mailbox: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("mfg: {0}")]
    Mfg(#[from] MfgError),
    #[error("dpe: {0}")]
    Dpe(#[from] DpeError),
    #[error("dpe: unrecognized status 0x{0:x}")]
    UnknownDpeStatus(u32),
}

impl LibCaliptraError {
    /// Errors after which the mailbox channel must no longer be trusted.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Self::Mailbox(MailboxError::MbxStatusUnknown)
                | Self::Mailbox(MailboxError::MbxRespFipsNotApproved)
        )
    }

    /// Request or usage errors reported by DPE, as opposed to transport errors.
    pub fn is_dpe(&self) -> bool {
        matches!(self, Self::Dpe(_) | Self::UnknownDpeStatus(_))
    }

    /// Flat code for the C ABI. DPE codes live in their own range and are not
    /// distinguishable from API codes by value alone.
    pub fn code(&self) -> u32 {
        match self {
            Self::Api(e) => e.code(),
            Self::Fuse(e) => e.code(),
            Self::Mailbox(e) => e.code(),
            Self::Mfg(e) => e.code(),
            Self::Dpe(e) => e.code(),
            Self::UnknownDpeStatus(code) => *code,
        }
    }
}

pub type LibCaliptraResult<T> = Result<T, LibCaliptraError>;
