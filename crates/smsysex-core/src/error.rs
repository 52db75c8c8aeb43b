//! Error types for the smSysex engine.
//!
//! This module provides a unified error type for all engine operations,
//! plus the closed taxonomy of FAT-derived status codes the device reports
//! in its JSON replies.

use std::time::Duration;

use thiserror::Error;

/// A specialized `Result` type for smSysex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the smSysex engine.
#[derive(Error, Debug)]
pub enum Error {
    /// No MIDI connection is available
    #[error("no MIDI connection available")]
    NoConnection,

    /// Sending over the MIDI transport failed
    #[error("failed to send over MIDI transport: {0}")]
    SendFailed(String),

    /// Session negotiation got no reply in time
    #[error(
        "session negotiation timed out - check that the device is connected \
         and its firmware supports smSysex"
    )]
    NegotiationTimeout,

    /// A request got no matching reply in time
    #[error("no response from device within {}s", .0.as_secs())]
    ResponseTimeout(Duration),

    /// An inbound SysEx message did not follow the envelope layout
    #[error("malformed SysEx envelope: {0}")]
    MalformedEnvelope(String),

    /// A reply body could not be parsed, even by the repair fallback
    #[error("unparseable device reply: {0}")]
    MalformedReply(String),

    /// The reply did not carry the expected response key
    #[error("unexpected reply: expected '^{expected}', got {actual}")]
    UnexpectedReply {
        /// Reply key the caller was waiting for
        expected: String,
        /// What actually arrived
        actual: String,
    },

    /// The device reported a filesystem error
    #[error("{}", .0.message())]
    Device(DeviceStatus),

    /// The operation was cancelled by the user
    #[error("transfer cancelled")]
    Cancelled,

    /// A path was rejected before reaching the device
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// No transfer item exists with the given id
    #[error("unknown transfer id {0}")]
    UnknownTransfer(u64),

    /// The engine has shut down and can no longer complete requests
    #[error("engine shut down")]
    Closed,

    /// No session is active (it was invalidated mid-operation)
    #[error("no active session")]
    NoSession,

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same operation may succeed.
    ///
    /// Device-side transient failures and response timeouts are worth a
    /// bounded retry; everything else fails immediately.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Device(status) => status.is_retryable(),
            Self::ResponseTimeout(_) => true,
            _ => false,
        }
    }

    /// True when the error is a user cancellation rather than a failure.
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// FAT-derived status codes reported by the device.
///
/// The numeric codes follow the embedded filesystem's result enumeration;
/// [`DeviceStatus::from_code`] maps anything unknown to
/// [`DeviceStatus::Unknown`] so new firmware cannot break classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Operation succeeded
    Ok,
    /// Low-level disk I/O error
    DiskError,
    /// Internal filesystem assertion failed
    Internal,
    /// The storage medium is not ready
    NotReady,
    /// File not found
    NotFound,
    /// Path not found
    PathNotFound,
    /// The path name format is invalid
    InvalidName,
    /// Access denied, directory not empty, or the volume is full
    AccessDenied,
    /// The target already exists
    Exists,
    /// The file or directory object is invalid
    InvalidObject,
    /// The medium is write protected
    WriteProtected,
    /// The drive number is invalid
    InvalidDrive,
    /// The volume has no work area
    NotEnabled,
    /// No valid FAT volume found
    NoFilesystem,
    /// Volume formatting was aborted
    FormatAborted,
    /// The filesystem timed out internally
    Timeout,
    /// The object is locked by another operation
    Locked,
    /// The filesystem ran out of working memory
    OutOfMemory,
    /// Too many open files
    TooManyOpenFiles,
    /// A command parameter was invalid
    InvalidParameter,
    /// The directory to delete is not empty
    NotEmpty,
    /// A code this driver does not recognize
    Unknown,
}

impl DeviceStatus {
    /// Map a raw numeric code from a device reply to a status.
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Ok,
            1 => Self::DiskError,
            2 => Self::Internal,
            3 => Self::NotReady,
            4 => Self::NotFound,
            5 => Self::PathNotFound,
            6 => Self::InvalidName,
            7 => Self::AccessDenied,
            8 => Self::Exists,
            9 => Self::InvalidObject,
            10 => Self::WriteProtected,
            11 => Self::InvalidDrive,
            12 => Self::NotEnabled,
            13 => Self::NoFilesystem,
            14 => Self::FormatAborted,
            15 => Self::Timeout,
            16 => Self::Locked,
            17 => Self::OutOfMemory,
            18 => Self::TooManyOpenFiles,
            19 => Self::InvalidParameter,
            20 => Self::NotEmpty,
            _ => Self::Unknown,
        }
    }

    /// Whether a bounded retry with backoff is worthwhile.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::DiskError | Self::Internal | Self::OutOfMemory)
    }

    /// Human-readable description used in surfaced error messages.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::DiskError => "SD card read/write error",
            Self::Internal => "device filesystem internal error",
            Self::NotReady => "SD card is not ready",
            Self::NotFound => "file not found",
            Self::PathNotFound => "folder not found",
            Self::InvalidName => "invalid file name",
            Self::AccessDenied => "access denied - the folder may not be empty or the SD card is full",
            Self::Exists => "a file with that name already exists",
            Self::InvalidObject => "invalid file handle",
            Self::WriteProtected => "SD card is write protected",
            Self::InvalidDrive => "invalid drive",
            Self::NotEnabled => "SD card volume not mounted",
            Self::NoFilesystem => "no filesystem found on the SD card",
            Self::FormatAborted => "volume formatting aborted",
            Self::Timeout => "device filesystem timed out",
            Self::Locked => "file is locked by another operation",
            Self::OutOfMemory => "device is out of memory",
            Self::TooManyOpenFiles => "too many open files on the device",
            Self::InvalidParameter => "invalid command parameter",
            Self::NotEmpty => "folder is not empty",
            Self::Unknown => "unrecognized device error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_mapping_is_closed() {
        assert_eq!(DeviceStatus::from_code(0), DeviceStatus::Ok);
        assert_eq!(DeviceStatus::from_code(4), DeviceStatus::NotFound);
        assert_eq!(DeviceStatus::from_code(17), DeviceStatus::OutOfMemory);
        assert_eq!(DeviceStatus::from_code(20), DeviceStatus::NotEmpty);
        assert_eq!(DeviceStatus::from_code(200), DeviceStatus::Unknown);
    }

    #[test]
    fn test_retryable_subset() {
        assert!(DeviceStatus::DiskError.is_retryable());
        assert!(DeviceStatus::Internal.is_retryable());
        assert!(DeviceStatus::OutOfMemory.is_retryable());
        assert!(!DeviceStatus::NotFound.is_retryable());
        assert!(!DeviceStatus::AccessDenied.is_retryable());
    }

    #[test]
    fn test_device_error_renders_human_message() {
        let err = Error::Device(DeviceStatus::NotFound);
        assert_eq!(err.to_string(), "file not found");
    }

    #[test]
    fn test_cancellation_is_not_recoverable_failure() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::Cancelled.is_recoverable());
    }
}
