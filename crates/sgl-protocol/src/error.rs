use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Protocol status published in the `status` register at the end of every
/// cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    UnknownCommand = 1,
    Bounds = 2,
    TransferSize = 3,
    Malformed = 4,
    NotConnected = 5,
    VectorTooLarge = 6,
}

impl Status {
    pub const fn as_u32(self) -> u32 {
        self as u32
    }

    pub const fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            0 => Self::Ok,
            1 => Self::UnknownCommand,
            2 => Self::Bounds,
            3 => Self::TransferSize,
            4 => Self::Malformed,
            5 => Self::NotConnected,
            6 => Self::VectorTooLarge,
            _ => return None,
        })
    }

    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Ok => "ok",
            Self::UnknownCommand => "unknown command",
            Self::Bounds => "out of bounds",
            Self::TransferSize => "transfer size mismatch",
            Self::Malformed => "malformed command record",
            Self::NotConnected => "no connected client",
            Self::VectorTooLarge => "vector result too large",
        };
        f.write_str(text)
    }
}

/// An access that would fall outside `[0, total)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("access of {len} bytes at offset {offset:#x} exceeds segment size {total:#x}")]
pub struct BoundsError {
    pub offset: usize,
    pub len: usize,
    pub total: usize,
}

impl BoundsError {
    /// Validates `offset..offset + len` against `total`.
    pub fn check(offset: usize, len: usize, total: usize) -> Result<(), Self> {
        match offset.checked_add(len) {
            Some(end) if end <= total => Ok(()),
            _ => Err(Self { offset, len, total }),
        }
    }
}

/// Bulk transfer whose byte count disagrees with the declared total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bulk transfer size mismatch (declared {declared} bytes, got {actual} bytes)")]
pub struct TransferSizeError {
    pub declared: usize,
    pub actual: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {waited:?}")]
    TimedOut { waited: Duration },

    #[error("wait cancelled")]
    Cancelled,
}

/// Failures while encoding or decoding a command record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("unknown command id {0}")]
    UnknownCommand(u32),

    #[error("submit register holds command {submit} but the record carries {record}")]
    IdMismatch { submit: u32, record: u32 },

    #[error("{command} takes {expected} arguments, got {found}")]
    Arity {
        command: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("{command} argument {index} has the wrong shape")]
    Shape { command: &'static str, index: usize },

    #[error("{command} argument {index} holds {found} elements, expected {expected}")]
    ArrayLength {
        command: &'static str,
        index: usize,
        expected: usize,
        found: usize,
    },

    #[error("{command} record truncated (needed {needed} bytes, {available} available)")]
    Truncated {
        command: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("{command} record has {extra} trailing bytes")]
    TrailingBytes { command: &'static str, extra: usize },

    #[error("record payload of {len} bytes exceeds the command area ({max} bytes)")]
    Oversized { len: usize, max: usize },

    #[error("vector result of {len} bytes exceeds the return slot ({max} bytes)")]
    VectorTooLarge { len: usize, max: usize },
}

impl CodecError {
    /// Status the host reports when a cycle fails with this error.
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownCommand(_) => Status::UnknownCommand,
            Self::VectorTooLarge { .. } => Status::VectorTooLarge,
            _ => Status::Malformed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid API version {0:?} (expected `major.minor`)")]
pub struct ParseVersionError(pub String);
