//! # smSysex Core Library
//!
//! `smsysex-core` is a host-side driver for talking to embedded music
//! devices over the smSysex protocol: JSON request/response messages and
//! raw binary payloads tunneled through MIDI System Exclusive.
//!
//! ## Features
//!
//! - **7-bit-safe framing**: arbitrary binary packed into the MIDI data
//!   byte range and unpacked losslessly on the way back
//! - **Sessions**: negotiated message-id windows so several controllers
//!   can share one device without crosstalk
//! - **Fragment reassembly**: platform MIDI stacks may deliver SysEx in
//!   pieces; buffers are bounded in both size and lifetime
//! - **File transfers**: chunked, cancellable uploads and downloads with
//!   a bounded number of concurrently active items
//!
//! ## Modules
//!
//! - [`config`] - Engine configuration (TOML-backed)
//! - [`error`] - Unified error type and the device status taxonomy
//! - [`fat`] - FAT timestamp packing and attribute bits
//! - [`pack`] - 7-bit packing of binary payloads
//! - [`protocol`] - Envelope encode/decode and the command set
//! - [`reassembly`] - Inbound fragment reassembly
//! - [`retry`] - Bounded exponential backoff policy
//! - [`session`] - Session negotiation and request/reply correlation
//! - [`transfer`] - File transfer engine and directory cache
//! - [`transport`] - The MIDI transport seam
//!
//! ## Example
//!
//! ```rust,ignore
//! use smsysex_core::{EngineConfig, SysexClient, TransferEngine};
//!
//! let config = EngineConfig::default();
//! let (client, _events) = SysexClient::new(sink, inbound, config.clone());
//! let client = std::sync::Arc::new(client);
//!
//! let (engine, _conflicts) =
//!     TransferEngine::new(client, config.transfer, config.retry);
//! let entries = engine.list_directory("/", Default::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod error;
pub mod fat;
pub mod pack;
pub mod protocol;
pub mod reassembly;
pub mod retry;
pub mod session;
pub mod transfer;
pub mod transport;

pub use config::EngineConfig;
pub use error::{DeviceStatus, Error, Result};
pub use session::{DeviceEvent, SysexClient};
pub use transfer::{
    ConflictChoice, ConflictRequest, ListOptions, QueueProgress, TransferEngine, TransferId,
    TransferSnapshot, TransferStatus, UploadFile, UploadOptions,
};
pub use transport::{ChannelSink, InboundReceiver, MidiSink};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
