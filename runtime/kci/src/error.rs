//! KCI error types

use core::fmt;

use thiserror::Error;
use tpu_mailbox::MailboxError;

/// Which wait of a command ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Waiting for command-queue space
    Enqueue,
    /// Waiting for the matching response
    Response,
}

impl fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enqueue => f.write_str("enqueue"),
            Self::Response => f.write_str("response"),
        }
    }
}

#[derive(Debug, Error)]
pub enum KciError {
    #[error("device memory allocation of {requested} bytes failed")]
    OutOfMemory { requested: usize },

    #[error("KCI command queue is full")]
    QueueFull,

    #[error("KCI {phase} timed out after {waited_ms} ms")]
    Timeout { phase: TimeoutPhase, waited_ms: u64 },

    /// The response stream skipped this command
    #[error("no response for command seq {seq}")]
    NoResponse { seq: u64 },

    #[error("firmware returned error {code} ({})", KciErrorCode::name(*code))]
    Device { code: u16 },

    #[error("command not implemented by the running firmware")]
    Unimplemented,

    #[error("command seq {seq} cancelled")]
    Cancelled { seq: u64 },

    #[error("reverse KCI ring is full")]
    ReverseFull,

    #[error("KCI is not attached to a mailbox")]
    NoDevice,

    #[error("invalid KCI configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to parse KCI configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("mailbox error: {0}")]
    Mailbox(#[source] MailboxError),
}

impl From<MailboxError> for KciError {
    fn from(e: MailboxError) -> Self {
        match e {
            MailboxError::OutOfMemory { requested } => Self::OutOfMemory { requested },
            MailboxError::QueueFull => Self::QueueFull,
            MailboxError::Timeout { waited_ms } => Self::Timeout {
                phase: TimeoutPhase::Enqueue,
                waited_ms,
            },
            MailboxError::Released => Self::NoDevice,
            other => Self::Mailbox(other),
        }
    }
}

impl KciError {
    /// Whether retrying the same command may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::QueueFull | Self::Timeout { .. } | Self::NoResponse { .. }
        )
    }
}

pub type Result<T> = core::result::Result<T, KciError>;

/// Error codes carried in the `code` field of a KCI response
///
/// The firmware uses the canonical status space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum KciErrorCode {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl KciErrorCode {
    pub const fn from_raw(raw: u16) -> Option<Self> {
        use KciErrorCode::*;
        Some(match raw {
            0 => Ok,
            1 => Cancelled,
            2 => Unknown,
            3 => InvalidArgument,
            4 => DeadlineExceeded,
            5 => NotFound,
            6 => AlreadyExists,
            7 => PermissionDenied,
            8 => ResourceExhausted,
            9 => FailedPrecondition,
            10 => Aborted,
            11 => OutOfRange,
            12 => Unimplemented,
            13 => Internal,
            14 => Unavailable,
            15 => DataLoss,
            16 => Unauthenticated,
            _ => return None,
        })
    }

    /// Human-readable name of a raw code
    pub fn name(raw: u16) -> &'static str {
        match Self::from_raw(raw) {
            Some(code) => code.as_str(),
            None => "unrecognized",
        }
    }

    pub const fn as_str(self) -> &'static str {
        use KciErrorCode::*;
        match self {
            Ok => "OK",
            Cancelled => "CANCELLED",
            Unknown => "UNKNOWN",
            InvalidArgument => "INVALID_ARGUMENT",
            DeadlineExceeded => "DEADLINE_EXCEEDED",
            NotFound => "NOT_FOUND",
            AlreadyExists => "ALREADY_EXISTS",
            PermissionDenied => "PERMISSION_DENIED",
            ResourceExhausted => "RESOURCE_EXHAUSTED",
            FailedPrecondition => "FAILED_PRECONDITION",
            Aborted => "ABORTED",
            OutOfRange => "OUT_OF_RANGE",
            Unimplemented => "UNIMPLEMENTED",
            Internal => "INTERNAL",
            Unavailable => "UNAVAILABLE",
            DataLoss => "DATA_LOSS",
            Unauthenticated => "UNAUTHENTICATED",
        }
    }
}
