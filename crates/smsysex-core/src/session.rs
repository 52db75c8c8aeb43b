//! Session negotiation and request/response correlation.
//!
//! The device only answers commands inside a negotiated session that
//! allocates a message-id range. [`SysexClient`] owns all of that state:
//! the current session, the pending-request table, and the reader task
//! that feeds inbound fragments through the [`Reassembler`](crate::reassembly::Reassembler)
//! and resolves replies by message id.
//!
//! ## Correlation
//!
//! Every request occupies one message id until its reply arrives, its
//! timeout fires, or the engine shuts down. Ids rotate through a counter
//! in `[1, 7]` offset from the session's `mid_min`, clamped to the window
//! the device actually allocated; an id still occupied
//! by an outstanding request is skipped, and when all slots are busy the
//! caller waits until one frees. Replies with no matching pending request
//! are discarded silently - they are stale or duplicated.
//!
//! Negotiation itself uses the reserved message id 0 and is single-flight:
//! concurrent callers share the one in-flight negotiation instead of each
//! sending their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::protocol::{self, Command, Envelope, MessageKind, SessionReply};
use crate::reassembly::Reassembler;
use crate::transport::{InboundReceiver, MidiSink};

/// A negotiated session scope.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    /// Session id assigned by the device
    pub sid: u32,
    /// Lowest message id of the allocated range
    pub mid_min: u8,
    /// Highest message id of the allocated range
    pub mid_max: u8,
    counter: u8,
}

impl Session {
    /// Upper bound on the rotating counter, which spans `[1, span]`.
    const MAX_COUNTER_SPAN: u8 = 7;

    fn new(reply: &SessionReply) -> Self {
        Self {
            sid: reply.sid,
            mid_min: reply.mid_min,
            mid_max: reply.mid_max,
            counter: 0,
        }
    }

    /// Counter positions available, clamped to the allocated id window so
    /// a device granting fewer than 8 ids never sees one past `mid_max`.
    fn span(&self) -> u8 {
        self.mid_max
            .saturating_sub(self.mid_min)
            .clamp(1, Self::MAX_COUNTER_SPAN)
    }

    /// Advance the counter and produce the next message id.
    fn next_msg_id(&mut self) -> u8 {
        self.counter = self.counter % self.span() + 1;
        self.mid_min.saturating_add(self.counter)
    }
}

/// Unsolicited traffic from the device, forwarded to the embedding UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Text the device wants shown as a popup
    Popup(String),
    /// A firmware debug log line
    DebugLog(String),
    /// Raw HID passthrough bytes
    Hid(Vec<u8>),
    /// A pong that matched no pending request
    Pong {
        /// Message id carried by the pong
        msg_id: u8,
    },
}

type PendingSender = oneshot::Sender<Result<Envelope>>;

struct Shared {
    sink: Box<dyn MidiSink>,
    config: EngineConfig,
    session: Mutex<Option<Session>>,
    pending: Mutex<HashMap<u8, PendingSender>>,
    slot_freed: Notify,
    /// Serializes negotiation so concurrent first commands share one
    /// in-flight `session` request.
    negotiating: tokio::sync::Mutex<()>,
    reassembler: Mutex<Reassembler>,
    events_tx: mpsc::UnboundedSender<DeviceEvent>,
}

/// The transport engine: session, correlation, and inbound dispatch.
///
/// One instance per connected device. All methods take `&self`; internal
/// state is guarded by short-lived locks, and the single reader task is
/// the only writer to the reassembly buffers.
pub struct SysexClient {
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for SysexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysexClient")
            .field("session", &*self.shared.session.lock())
            .field("pending", &self.shared.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl SysexClient {
    /// Create a client over the given transport halves.
    ///
    /// Returns the client plus the channel carrying unsolicited
    /// [`DeviceEvent`]s.
    #[must_use]
    pub fn new(
        sink: Box<dyn MidiSink>,
        inbound: InboundReceiver,
        config: EngineConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeviceEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reassembler = Reassembler::new(config.reassembly.clone());
        let shared = Arc::new(Shared {
            sink,
            config,
            session: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            slot_freed: Notify::new(),
            negotiating: tokio::sync::Mutex::new(()),
            reassembler: Mutex::new(reassembler),
            events_tx,
        });
        let reader = tokio::spawn(reader_loop(Arc::clone(&shared), inbound));
        (Self { shared, reader }, events_rx)
    }

    /// Send a command and await its correlated reply.
    ///
    /// Negotiates a session first when none is active. The reply envelope
    /// is returned as-is; callers extract their typed reply and check the
    /// device status.
    pub async fn request(&self, command: &Command, binary: Option<&[u8]>) -> Result<Envelope> {
        loop {
            self.ensure_session().await?;
            let slot = match self.shared.allocate_slot() {
                Ok(slot) => slot.await,
                Err(e) => Err(e),
            };
            match slot {
                Ok((msg_id, rx)) => {
                    let timeout = self.shared.config.session.response_timeout();
                    return self
                        .shared
                        .send_and_wait(msg_id, rx, command, binary, timeout)
                        .await;
                }
                // invalidated between negotiation and allocation;
                // renegotiate and try again
                Err(Error::NoSession) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Probe the device; resolves once the reply arrives.
    pub async fn ping(&self) -> Result<()> {
        let reply = self.request(&Command::Ping {}, None).await?;
        match reply.kind {
            MessageKind::Pong | MessageKind::JsonReply | MessageKind::Json => Ok(()),
            other => Err(Error::MalformedReply(format!(
                "unexpected ping reply kind {other:?}"
            ))),
        }
    }

    /// Whether a session is currently established.
    #[must_use]
    pub fn has_session(&self) -> bool {
        self.shared.session.lock().is_some()
    }

    /// The active session parameters, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        *self.shared.session.lock()
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Invalidate the session; the next command renegotiates.
    ///
    /// Requests already pending under the old session are left to resolve
    /// or time out on their own.
    pub fn reset_session(&self) {
        if self.shared.session.lock().take().is_some() {
            tracing::info!("session invalidated");
        }
    }

    /// Drop all partially reassembled inbound data.
    ///
    /// Called during global cancellation so replies to abandoned requests
    /// cannot pin buffered memory.
    pub fn flush_reassembly(&self) {
        let flushed = self.shared.reassembler.lock().flush_all();
        if !flushed.is_empty() {
            tracing::debug!(buffers = flushed.len(), "discarded reassembly buffers");
        }
    }

    /// Toggle reassembly passthrough (each fragment treated as complete).
    pub fn set_reassembly_enabled(&self, enabled: bool) {
        let leftovers = self.shared.reassembler.lock().set_enabled(enabled);
        if !leftovers.is_empty() {
            tracing::debug!(
                buffers = leftovers.len(),
                "discarded reassembly buffers on passthrough switch"
            );
        }
    }

    async fn ensure_session(&self) -> Result<()> {
        if self.shared.session.lock().is_some() {
            return Ok(());
        }
        let _guard = self.shared.negotiating.lock().await;
        if self.shared.session.lock().is_some() {
            // someone else finished negotiating while we waited
            return Ok(());
        }

        let command = Command::Session {
            tag: self.shared.config.session.tag.clone(),
        };
        let rx = self.shared.reserve_slot(0)?;
        let timeout = self.shared.config.session.negotiation_timeout();
        let envelope = self
            .shared
            .send_and_wait(0, rx, &command, None, timeout)
            .await
            .map_err(|e| match e {
                Error::ResponseTimeout(_) => Error::NegotiationTimeout,
                other => other,
            })?;
        let reply: SessionReply = envelope.reply("session")?;
        tracing::info!(
            sid = reply.sid,
            mid_min = reply.mid_min,
            mid_max = reply.mid_max,
            "session established"
        );
        *self.shared.session.lock() = Some(Session::new(&reply));
        Ok(())
    }
}

impl Drop for SysexClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Outcome of a successful slot reservation attempt, or a future that
/// resolves once a busy table frees a slot.
enum SlotAttempt {
    Ready(u8, oneshot::Receiver<Result<Envelope>>),
    Busy,
}

impl Shared {
    /// Reserve a specific message id (used for negotiation's id 0).
    fn reserve_slot(&self, msg_id: u8) -> Result<oneshot::Receiver<Result<Envelope>>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&msg_id) {
            return Err(Error::Internal(format!(
                "message id {msg_id} already reserved"
            )));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(msg_id, tx);
        Ok(rx)
    }

    /// Begin allocation of a rotating message id.
    ///
    /// Fails fast with [`Error::NoSession`] when no session is active so
    /// the caller can renegotiate; otherwise returns a future that
    /// resolves once an id is reserved (immediately when a slot is free).
    fn allocate_slot(
        self: &Arc<Self>,
    ) -> Result<impl std::future::Future<Output = Result<(u8, oneshot::Receiver<Result<Envelope>>)>>>
    {
        if self.session.lock().is_none() {
            return Err(Error::NoSession);
        }
        let shared = Arc::clone(self);
        Ok(async move {
            loop {
                let notified = shared.slot_freed.notified();
                tokio::pin!(notified);
                // register for wakeups before probing, so a slot freed
                // between the probe and the await is not missed
                notified.as_mut().enable();

                match shared.try_allocate()? {
                    SlotAttempt::Ready(msg_id, rx) => return Ok((msg_id, rx)),
                    SlotAttempt::Busy => {
                        tracing::debug!("all message-id slots busy, waiting");
                        notified.await;
                    }
                }
            }
        })
    }

    fn try_allocate(&self) -> Result<SlotAttempt> {
        let mut session = self.session.lock();
        let session = session.as_mut().ok_or(Error::NoSession)?;
        let mut pending = self.pending.lock();
        for _ in 0..usize::from(session.span()) {
            let msg_id = session.next_msg_id();
            if !pending.contains_key(&msg_id) {
                let (tx, rx) = oneshot::channel();
                pending.insert(msg_id, tx);
                return Ok(SlotAttempt::Ready(msg_id, rx));
            }
        }
        Ok(SlotAttempt::Busy)
    }

    async fn send_and_wait(
        &self,
        msg_id: u8,
        rx: oneshot::Receiver<Result<Envelope>>,
        command: &Command,
        binary: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<Envelope> {
        let bytes = protocol::encode_command(msg_id, command, binary)?;
        if let Err(e) = self.sink.send(&bytes) {
            self.release_slot(msg_id);
            return Err(e);
        }
        tracing::trace!(
            msg_id,
            command = command.reply_key(),
            bytes = bytes.len(),
            "request sent"
        );
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                self.release_slot(msg_id);
                tracing::warn!(msg_id, ?timeout, "request timed out");
                Err(Error::ResponseTimeout(timeout))
            }
        }
    }

    fn release_slot(&self, msg_id: u8) {
        if self.pending.lock().remove(&msg_id).is_some() {
            self.slot_freed.notify_waiters();
        }
    }

    /// Route one complete inbound message.
    fn dispatch(&self, bytes: &[u8]) {
        let Some((kind, msg_id)) = protocol::peek_header(bytes) else {
            tracing::warn!(len = bytes.len(), "dropping message with unrecognized header");
            return;
        };
        match kind {
            MessageKind::Popup | MessageKind::Debug | MessageKind::Hid => {
                match protocol::decode(bytes) {
                    Ok(envelope) => {
                        let event = match kind {
                            MessageKind::Popup => DeviceEvent::Popup(
                                envelope.body.as_str().unwrap_or("").to_string(),
                            ),
                            MessageKind::Debug => DeviceEvent::DebugLog(
                                envelope.body.as_str().unwrap_or("").to_string(),
                            ),
                            _ => DeviceEvent::Hid(envelope.binary.unwrap_or_default()),
                        };
                        let _ = self.events_tx.send(event);
                    }
                    Err(e) => tracing::warn!(?kind, "dropping undecodable message: {e}"),
                }
            }
            MessageKind::Json | MessageKind::JsonReply | MessageKind::Ping | MessageKind::Pong => {
                let sender = self.pending.lock().remove(&msg_id);
                match sender {
                    Some(tx) => {
                        self.slot_freed.notify_waiters();
                        let _ = tx.send(protocol::decode(bytes));
                    }
                    None if kind == MessageKind::Pong => {
                        let _ = self.events_tx.send(DeviceEvent::Pong { msg_id });
                    }
                    None => {
                        tracing::debug!(msg_id, "discarding reply with no pending request");
                    }
                }
            }
        }
    }
}

/// Drives the reassembler from inbound deliveries and its idle deadlines,
/// dispatching every completed message.
async fn reader_loop(shared: Arc<Shared>, mut inbound: InboundReceiver) {
    loop {
        let deadline = shared.reassembler.lock().next_deadline();
        let completed = if let Some(deadline) = deadline {
            tokio::select! {
                fragment = inbound.recv() => match fragment {
                    Some(fragment) => shared
                        .reassembler
                        .lock()
                        .push(&fragment, Instant::now()),
                    None => break,
                },
                () = tokio::time::sleep_until(deadline.into()) => {
                    shared.reassembler.lock().flush_expired(Instant::now())
                }
            }
        } else {
            match inbound.recv().await {
                Some(fragment) => shared.reassembler.lock().push(&fragment, Instant::now()),
                None => break,
            }
        };
        for message in completed {
            shared.dispatch(&message);
        }
    }
    tracing::debug!("inbound channel closed, reader task exiting");
    // fail anything still waiting so callers don't hang until timeout
    let mut pending = shared.pending.lock();
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::Closed));
    }
}
