//! Transport boundary.
//!
//! The engine does not enumerate or open MIDI devices. The embedding
//! application hands it one outbound sink plus an inbound channel of raw
//! byte deliveries, and the engine treats that pair as an unreliable,
//! possibly-fragmenting duplex pipe.

use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Outbound half of the MIDI byte pipe.
///
/// Implementations wrap whatever the platform offers (a `midir` output
/// port, a Web MIDI bridge, a serial driver). `send` must accept a
/// complete SysEx message and either hand it to the transport or fail.
pub trait MidiSink: Send + Sync {
    /// Send one complete SysEx message.
    fn send(&self, bytes: &[u8]) -> Result<()>;
}

/// Inbound half of the MIDI byte pipe.
///
/// Each item is one delivery from the platform MIDI stack; deliveries may
/// be fragments of a logical message.
pub type InboundReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// A [`MidiSink`] backed by an in-process channel.
///
/// Used by the test suite's mock device and handy for loopback debugging.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelSink {
    /// Create a sink and the receiver observing everything sent to it.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MidiSink for ChannelSink {
    fn send(&self, bytes: &[u8]) -> Result<()> {
        self.tx
            .send(bytes.to_vec())
            .map_err(|_| Error::NoConnection)
    }
}
