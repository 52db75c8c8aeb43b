//! Fragment reassembly for inbound SysEx deliveries.
//!
//! Platform MIDI stacks deliver large SysEx messages in arbitrary pieces.
//! The reassembler buffers fragments per logical message (keyed by the
//! message id in the envelope header), emits the concatenation once a
//! fragment ends with the SysEx terminator, and bounds both the size and
//! the lifetime of every buffer:
//!
//! - a buffer exceeding the configured byte ceiling is force-flushed, so a
//!   corrupt or missing terminator cannot grow memory without limit;
//! - a buffer idle longer than the configured window is force-flushed by
//!   the owner's timer loop.
//!
//! The type is a synchronous state machine - `push` and `flush_expired`
//! take the current instant from the caller, which keeps the timing logic
//! testable without a runtime. The engine's reader task drives it from a
//! `select!` over the inbound channel and [`Reassembler::next_deadline`].

use std::collections::HashMap;
use std::time::Instant;

use crate::config::ReassemblyConfig;
use crate::protocol::{self, SYSEX_END, SYSEX_START};

/// Buffered fragments of one logical message.
#[derive(Debug)]
struct MessageBuffer {
    data: Vec<u8>,
    last_update: Instant,
}

/// Per-message fragment buffers with bounded size and lifetime.
#[derive(Debug)]
pub struct Reassembler {
    config: ReassemblyConfig,
    buffers: HashMap<u8, MessageBuffer>,
    /// Key of the most recently touched buffer; continuation fragments
    /// carry no header, so they append here.
    last_key: Option<u8>,
}

impl Reassembler {
    /// Create a reassembler with the given bounds.
    #[must_use]
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            config,
            buffers: HashMap::new(),
            last_key: None,
        }
    }

    /// Feed one transport delivery; returns every message completed by it.
    ///
    /// A fragment beginning with the SysEx start byte opens (or restarts)
    /// the buffer for its message id; any other fragment continues the
    /// most recently touched buffer. Completion, the byte ceiling, and
    /// passthrough mode can each emit a message, and restarting a stale
    /// buffer flushes its leftovers too, so the result is a list.
    pub fn push(&mut self, fragment: &[u8], now: Instant) -> Vec<Vec<u8>> {
        if fragment.is_empty() {
            return Vec::new();
        }
        if !self.config.enabled {
            return vec![fragment.to_vec()];
        }

        let mut completed = Vec::new();

        let key = if fragment[0] == SYSEX_START {
            let key = protocol::peek_header(fragment).map_or(0, |(_, msg_id)| msg_id);
            // a fresh start while bytes are buffered means the previous
            // message never saw its terminator
            if let Some(stale) = self.buffers.remove(&key) {
                tracing::warn!(
                    key,
                    bytes = stale.data.len(),
                    "flushing stale buffer on message restart"
                );
                completed.push(stale.data);
            }
            key
        } else {
            self.last_key.unwrap_or(0)
        };
        self.last_key = Some(key);

        let buffer = self.buffers.entry(key).or_insert_with(|| MessageBuffer {
            data: Vec::with_capacity(fragment.len()),
            last_update: now,
        });
        buffer.data.extend_from_slice(fragment);
        buffer.last_update = now;

        if fragment.last() == Some(&SYSEX_END) {
            let buffer = self.buffers.remove(&key).map(|b| b.data).unwrap_or_default();
            self.forget_key(key);
            completed.push(buffer);
        } else if buffer.data.len() > self.config.max_buffer_bytes {
            let buffer = self.buffers.remove(&key).map(|b| b.data).unwrap_or_default();
            self.forget_key(key);
            tracing::warn!(key, bytes = buffer.len(), "force-flushing oversized buffer");
            completed.push(buffer);
        }

        completed
    }

    /// Earliest instant at which some buffer becomes idle-expired.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffers
            .values()
            .map(|buffer| buffer.last_update + self.config.idle_flush())
            .min()
    }

    /// Flush every buffer whose idle window has elapsed at `now`.
    pub fn flush_expired(&mut self, now: Instant) -> Vec<Vec<u8>> {
        let idle = self.config.idle_flush();
        let expired: Vec<u8> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| now.duration_since(buffer.last_update) >= idle)
            .map(|(&key, _)| key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| {
                self.forget_key(key);
                self.buffers.remove(&key).map(|buffer| {
                    tracing::debug!(key, bytes = buffer.data.len(), "idle-flushing buffer");
                    buffer.data
                })
            })
            .collect()
    }

    /// Flush everything, regardless of age. Used by global cancellation so
    /// abandoned replies cannot pin memory.
    pub fn flush_all(&mut self) -> Vec<Vec<u8>> {
        self.last_key = None;
        self.buffers
            .drain()
            .map(|(_, buffer)| buffer.data)
            .collect()
    }

    /// Switch passthrough mode on or off. Leftover buffers are returned so
    /// the caller can still dispatch them.
    pub fn set_enabled(&mut self, enabled: bool) -> Vec<Vec<u8>> {
        self.config.enabled = enabled;
        if enabled {
            Vec::new()
        } else {
            self.flush_all()
        }
    }

    /// Total bytes currently buffered across all keys.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffers.values().map(|buffer| buffer.data.len()).sum()
    }

    /// True when nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    fn forget_key(&mut self, key: u8) {
        if self.last_key == Some(key) {
            self.last_key = None;
        }
    }
}
