//! smSysex wire protocol implementation.
//!
//! Every request/response travels in one SysEx envelope:
//!
//! ```text
//! ┌──────┬───────────────┬──────────┬───────┬────────────┬─────────────────────┬──────┐
//! │ 0xF0 │ developer id  │ cmd type │ msgId │ JSON UTF-8 │ 0x00 + packed bytes │ 0xF7 │
//! │      │   (4 bytes)   │ (1 byte) │ (1 B) │ (optional) │     (optional)      │      │
//! └──────┴───────────────┴──────────┴───────┴────────────┴─────────────────────┴──────┘
//! ```
//!
//! The JSON body is a single-key object naming the command
//! (`{"dir": {...}}`); replies use the same key prefixed with `^`
//! (`{"^dir": {...}}`) and may carry a numeric `err` status. Binary
//! payloads (file blocks) follow a lone `0x00` separator, 7-bit packed by
//! [`crate::pack`].
//!
//! Device firmware can emit raw control bytes inside filename strings,
//! which breaks strict JSON parsing; decoding therefore falls back to the
//! extraction grammar in [`repair`] for the reply shapes known to be
//! affected (directory listings and session replies).

pub mod repair;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DeviceStatus, Error, Result};
use crate::pack;

/// SysEx start byte.
pub const SYSEX_START: u8 = 0xF0;
/// SysEx end byte.
pub const SYSEX_END: u8 = 0xF7;
/// Developer identifier the device answers to.
pub const DEVICE_ID: [u8; 4] = [0x00, 0x21, 0x7B, 0x01];
/// Bytes before the body: start byte, developer id, command type, msgId.
pub const HEADER_SIZE: usize = 7;

/// Command-type byte of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Liveness probe
    Ping = 0x00,
    /// Device-initiated popup text
    Popup = 0x01,
    /// HID event passthrough
    Hid = 0x02,
    /// Device-initiated debug log line
    Debug = 0x03,
    /// JSON command (host to device)
    Json = 0x04,
    /// JSON reply (device to host)
    JsonReply = 0x05,
    /// Reply to a ping
    Pong = 0x7F,
}

impl MessageKind {
    /// Parse a command-type byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Ping),
            0x01 => Some(Self::Popup),
            0x02 => Some(Self::Hid),
            0x03 => Some(Self::Debug),
            0x04 => Some(Self::Json),
            0x05 => Some(Self::JsonReply),
            0x7F => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Commands the host can issue, serialized as single-key JSON objects.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    /// Negotiate a session and a message-id range
    Session {
        /// Client tag identifying this host
        tag: String,
    },
    /// Liveness probe
    Ping {},
    /// List a directory page
    Dir {
        /// Absolute directory path
        path: String,
        /// First entry index of the page
        offset: u32,
        /// Maximum entries in the page
        lines: u32,
        /// Bypass any device-side listing cache
        force: bool,
    },
    /// Open a file and obtain a handle
    Open {
        /// Absolute file path
        path: String,
        /// 1 to open for writing, 0 for reading
        write: u8,
        /// FAT date word for the entry
        date: u16,
        /// FAT time word for the entry
        time: u16,
    },
    /// Write a block at an offset (packed data follows the JSON body)
    Write {
        /// File handle from `open`
        fid: u32,
        /// Byte offset of the block
        addr: u32,
        /// Block length in bytes
        size: u32,
    },
    /// Read a block at an offset (packed data follows in the reply)
    Read {
        /// File handle from `open`
        fid: u32,
        /// Byte offset of the block
        addr: u32,
        /// Requested length in bytes
        size: u32,
    },
    /// Close a file handle
    Close {
        /// File handle from `open`
        fid: u32,
    },
    /// Delete a file or directory
    Delete {
        /// Absolute path to delete
        path: String,
    },
    /// Create a directory
    Mkdir {
        /// Absolute path to create
        path: String,
        /// FAT date word for the entry
        date: u16,
        /// FAT time word for the entry
        time: u16,
    },
}

impl Command {
    /// The reply key (without the `^` prefix) this command is answered
    /// under.
    #[must_use]
    pub const fn reply_key(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::Ping {} => "ping",
            Self::Dir { .. } => "dir",
            Self::Open { .. } => "open",
            Self::Write { .. } => "write",
            Self::Read { .. } => "read",
            Self::Close { .. } => "close",
            Self::Delete { .. } => "delete",
            Self::Mkdir { .. } => "mkdir",
        }
    }
}

/// One decoded SysEx envelope.
#[derive(Debug, Clone)]
pub struct Envelope {
    /// Command-type byte
    pub kind: MessageKind,
    /// Message id used for request/response correlation
    pub msg_id: u8,
    /// Parsed JSON body; `Null` for bodyless kinds, a string for
    /// popup/debug text
    pub body: Value,
    /// Unpacked binary payload, when a `0x00` separator was present
    pub binary: Option<Vec<u8>>,
}

impl Envelope {
    /// Extract and deserialize the reply object for `key`.
    ///
    /// # Errors
    ///
    /// [`Error::UnexpectedReply`] when the body does not carry `^key`,
    /// [`Error::MalformedReply`] when the object exists but does not fit
    /// `T`.
    pub fn reply<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .body
            .get(format!("^{key}"))
            .ok_or_else(|| Error::UnexpectedReply {
                expected: key.to_string(),
                actual: self.reply_key().unwrap_or_else(|| "<no reply key>".to_string()),
            })?;
        serde_json::from_value(value.clone())
            .map_err(|e| Error::MalformedReply(format!("^{key}: {e}")))
    }

    /// The `^`-prefixed key of the body, if it is a single-key object.
    #[must_use]
    pub fn reply_key(&self) -> Option<String> {
        self.body
            .as_object()
            .and_then(|map| map.keys().next())
            .cloned()
    }

    /// Device status carried in the reply's `err` field, `Ok` when absent.
    #[must_use]
    pub fn status(&self) -> DeviceStatus {
        self.body
            .as_object()
            .and_then(|map| map.values().next())
            .and_then(|value| value.get("err"))
            .and_then(Value::as_u64)
            .map_or(DeviceStatus::Ok, |code| {
                DeviceStatus::from_code(u32::try_from(code).unwrap_or(u32::MAX))
            })
    }
}

/// Session negotiation reply.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionReply {
    /// Session id assigned by the device
    pub sid: u32,
    /// Lowest message id allocated to this session
    #[serde(rename = "midMin")]
    pub mid_min: u8,
    /// Highest message id allocated to this session
    #[serde(rename = "midMax")]
    pub mid_max: u8,
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Entry name
    pub name: String,
    /// Size in bytes (0 for directories)
    #[serde(default)]
    pub size: u64,
    /// FAT attribute bits
    #[serde(default)]
    pub attr: u8,
    /// FAT date word of the last modification
    #[serde(default)]
    pub date: u16,
    /// FAT time word of the last modification
    #[serde(default)]
    pub time: u16,
}

impl FileEntry {
    /// Whether the entry is a directory.
    #[must_use]
    pub const fn is_directory(&self) -> bool {
        self.attr & crate::fat::ATTR_DIRECTORY != 0
    }
}

/// Directory listing reply.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirReply {
    /// Entries of the requested page
    #[serde(default)]
    pub list: Vec<FileEntry>,
    /// Device status code
    #[serde(default)]
    pub err: Option<u32>,
}

/// `open` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct OpenReply {
    /// File handle for subsequent `read`/`write`/`close`
    #[serde(default)]
    pub fid: u32,
    /// Current file size in bytes
    #[serde(default)]
    pub size: u64,
    /// Device status code
    #[serde(default)]
    pub err: Option<u32>,
}

/// `read` reply; the block itself arrives as the envelope binary.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadReply {
    /// File handle the block belongs to
    #[serde(default)]
    pub fid: u32,
    /// Byte offset of the block
    #[serde(default)]
    pub addr: u32,
    /// Actual block length in bytes
    #[serde(default)]
    pub size: u32,
    /// Device status code
    #[serde(default)]
    pub err: Option<u32>,
}

/// Generic acknowledgment reply carrying only a status.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AckReply {
    /// Device status code
    #[serde(default)]
    pub err: Option<u32>,
}

/// Read the command type and message id without decoding the body.
#[must_use]
pub fn peek_header(bytes: &[u8]) -> Option<(MessageKind, u8)> {
    if bytes.len() < HEADER_SIZE || bytes[0] != SYSEX_START || bytes[1..5] != DEVICE_ID {
        return None;
    }
    MessageKind::from_byte(bytes[5]).map(|kind| (kind, bytes[6]))
}

/// Encode an envelope from raw body text and optional binary payload.
#[must_use]
pub fn encode_raw(kind: MessageKind, msg_id: u8, text: &[u8], binary: Option<&[u8]>) -> Vec<u8> {
    let packed = binary.map(pack::pack);
    let mut out = Vec::with_capacity(
        HEADER_SIZE + text.len() + packed.as_ref().map_or(0, |p| p.len() + 1) + 1,
    );
    out.push(SYSEX_START);
    out.extend_from_slice(&DEVICE_ID);
    out.push(kind as u8);
    out.push(msg_id & 0x7F);
    out.extend_from_slice(text);
    if let Some(packed) = packed {
        out.push(0x00);
        out.extend_from_slice(&packed);
    }
    out.push(SYSEX_END);
    out
}

/// Serialize a [`Command`] into a complete SysEx envelope.
pub fn encode_command(msg_id: u8, command: &Command, binary: Option<&[u8]>) -> Result<Vec<u8>> {
    let text = serde_json::to_vec(command)?;
    Ok(encode_raw(MessageKind::Json, msg_id, &text, binary))
}

/// Decode a complete SysEx message into an [`Envelope`].
///
/// # Errors
///
/// [`Error::MalformedEnvelope`] when the framing is wrong;
/// [`Error::MalformedReply`] when a JSON body fails both strict parsing
/// and the repair fallback.
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    let (kind, msg_id) = peek_header(bytes).ok_or_else(|| {
        Error::MalformedEnvelope(format!("bad header in {}-byte message", bytes.len()))
    })?;

    // 0xF7 cannot occur inside 7-bit body bytes, so the first one ends
    // the message.
    let terminator = bytes[HEADER_SIZE..]
        .iter()
        .position(|&b| b == SYSEX_END)
        .map(|pos| pos + HEADER_SIZE)
        .ok_or_else(|| Error::MalformedEnvelope("missing terminator".to_string()))?;
    let body = &bytes[HEADER_SIZE..terminator];

    match kind {
        MessageKind::Json | MessageKind::JsonReply => {
            let (json_bytes, binary) = match body.iter().position(|&b| b == 0x00) {
                Some(split) => (
                    &body[..split],
                    Some(pack::unpack(&body[split + 1..], None)),
                ),
                None => (body, None),
            };
            let text = String::from_utf8_lossy(json_bytes);
            let value = match serde_json::from_str::<Value>(&text) {
                Ok(value) => value,
                Err(strict_err) => repair::repair(&text).ok_or_else(|| {
                    Error::MalformedReply(format!("{strict_err} (repair failed)"))
                })?,
            };
            Ok(Envelope {
                kind,
                msg_id,
                body: value,
                binary,
            })
        }
        MessageKind::Popup | MessageKind::Debug => Ok(Envelope {
            kind,
            msg_id,
            body: Value::String(String::from_utf8_lossy(body).into_owned()),
            binary: None,
        }),
        MessageKind::Hid => Ok(Envelope {
            kind,
            msg_id,
            body: Value::Null,
            binary: Some(body.to_vec()),
        }),
        MessageKind::Ping | MessageKind::Pong => Ok(Envelope {
            kind,
            msg_id,
            body: Value::Null,
            binary: None,
        }),
    }
}
