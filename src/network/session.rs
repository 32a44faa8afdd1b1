//! Session Transport
//!
//! One `Session` per client connection. Each session runs two tasks:
//!
//! ```text
//!   send loop:  outbound queue --drain--> frame (+terminator) --> PacketSink
//!   recv loop:  PacketSource --> packet group --split--> PacketHandler
//! ```
//!
//! Handlers run inline in the receive task. They reach other sessions only
//! through their queues, so sessions never touch each other's transports.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::config::ServerConfig;
use crate::lobby::semaphore::Semaphore;
use crate::lobby::stage::Stage;
use crate::network::packet::{
    build_ack, frame, Opcode, PacketReader, ParseError, ACK_FAILURE, ACK_SUCCESS,
};
use crate::network::protocol::ClientPacket;
use crate::network::transport::{PacketSink, PacketSource};

/// Pending ack handles kept for latency measurement before the table is reset.
const MAX_PENDING_ACKS: usize = 1024;

/// Connection-scoped session identifier, assigned in accept order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receiving end of a session's outbound queue, owned by the send loop.
#[derive(Debug)]
pub struct OutboundQueue {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutboundQueue {
    /// Take one queued message without waiting.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Everything queued right now, in order.
    fn drain(&mut self, first: Vec<u8>) -> Vec<Vec<u8>> {
        let mut batch = vec![first];
        while let Ok(message) = self.rx.try_recv() {
            batch.push(message);
        }
        batch
    }
}

/// Why a receive loop ended.
#[derive(Debug)]
pub enum DisconnectReason {
    /// Client sent a logout, or the server closed the session.
    Graceful,
    /// Stream ended without a logout.
    Lost,
    /// Transport error.
    Errored(std::io::Error),
}

/// What happened to one packet group.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct GroupOutcome {
    /// Packets handed to the handler.
    pub dispatched: usize,
    /// Parse failure that discarded the rest of the group.
    pub error: Option<ParseError>,
}

/// Opcode handling, selected by `match` over [`ClientPacket`].
pub trait PacketHandler: Send + Sync + 'static {
    /// Handle one parsed packet.
    fn handle(&self, session: &Arc<Session>, packet: ClientPacket) -> impl Future<Output = ()> + Send;

    /// Clean up after the receive loop ends (stage and semaphore departure).
    fn on_disconnect(&self, session: &Arc<Session>) -> impl Future<Output = ()> + Send;
}

/// Server-side state of one client connection.
pub struct Session {
    id: SessionId,
    char_id: AtomicU32,
    name: RwLock<String>,
    sender: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
    close_notify: Notify,
    last_activity: Mutex<Instant>,
    stage: Mutex<Option<Arc<Stage>>>,
    previous_stage_id: Mutex<Option<String>>,
    reservation: Mutex<Option<Arc<Stage>>>,
    semaphore: Mutex<Option<Arc<Semaphore>>>,
    pending_acks: Mutex<HashMap<u32, Instant>>,
    log_inbound: bool,
    log_outbound: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Stages and semaphores point back at sessions, so only identity is printed.
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("char_id", &self.char_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create a session and the queue its send loop will drain.
    pub fn new(id: SessionId, config: &ServerConfig) -> (Arc<Self>, OutboundQueue) {
        let (sender, rx) = mpsc::channel(config.send_queue_capacity.max(1));
        let tracing_forced = cfg!(feature = "debug-tracing");
        let session = Arc::new(Self {
            id,
            char_id: AtomicU32::new(0),
            name: RwLock::new(String::new()),
            sender,
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            last_activity: Mutex::new(Instant::now()),
            stage: Mutex::new(None),
            previous_stage_id: Mutex::new(None),
            reservation: Mutex::new(None),
            semaphore: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            log_inbound: config.log_inbound || tracing_forced,
            log_outbound: config.log_outbound || tracing_forced,
        });
        (session, OutboundQueue { rx })
    }

    // =========================================================================
    // IDENTITY
    // =========================================================================

    /// Session ID.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Character ID, 0 until login.
    pub fn char_id(&self) -> u32 {
        self.char_id.load(Ordering::Acquire)
    }

    /// Bind a character.
    pub fn set_char_id(&self, char_id: u32) {
        self.char_id.store(char_id, Ordering::Release);
    }

    /// Display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    /// Set the display name.
    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Whether the session is closing.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed. Loops stop at their next iteration boundary; a handler
    /// already running finishes first.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_notify.notify_waiters();
        }
    }

    /// Resolves once the session is closed. Any number of tasks may wait.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent close is not missed.
        notified.as_mut().enable();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Record client activity.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Time since the last client activity.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    // =========================================================================
    // LOBBY BACK-REFERENCES
    // =========================================================================

    /// Stage the session is in.
    pub fn stage(&self) -> Option<Arc<Stage>> {
        self.stage.lock().clone()
    }

    /// Replace the current stage, returning the old one.
    ///
    /// This only moves the pointer; membership of the stages themselves is
    /// changed by the caller (leave old, then join new).
    pub fn replace_stage(&self, stage: Option<Arc<Stage>>) -> Option<Arc<Stage>> {
        std::mem::replace(&mut *self.stage.lock(), stage)
    }

    /// Stage to return to on back-stage.
    pub fn previous_stage_id(&self) -> Option<String> {
        self.previous_stage_id.lock().clone()
    }

    /// Remember the stage to return to.
    pub fn set_previous_stage_id(&self, id: Option<String>) {
        *self.previous_stage_id.lock() = id;
    }

    /// Replace the reserved stage, returning the old one.
    pub fn replace_reservation(&self, stage: Option<Arc<Stage>>) -> Option<Arc<Stage>> {
        std::mem::replace(&mut *self.reservation.lock(), stage)
    }

    /// Semaphore the session holds or hosts.
    pub fn semaphore(&self) -> Option<Arc<Semaphore>> {
        self.semaphore.lock().clone()
    }

    /// Replace the held semaphore, returning the old one.
    pub fn replace_semaphore(&self, semaphore: Option<Arc<Semaphore>>) -> Option<Arc<Semaphore>> {
        std::mem::replace(&mut *self.semaphore.lock(), semaphore)
    }

    // =========================================================================
    // OUTBOUND QUEUE
    // =========================================================================

    fn trace_outbound(&self, data: &[u8]) {
        if self.log_outbound && data.len() >= 2 {
            let opcode = Opcode(u16::from_be_bytes([data[0], data[1]]));
            debug!(
                session = %self.id,
                char_id = self.char_id(),
                %opcode,
                len = data.len(),
                payload = %hex::encode(&data[2..]),
                "-> queued"
            );
        }
    }

    /// Queue one message, waiting while the queue is full.
    ///
    /// Returns false if the send loop is gone.
    pub async fn queue_send(&self, data: Vec<u8>) -> bool {
        self.trace_outbound(&data);
        if self.sender.send(data).await.is_err() {
            debug!(session = %self.id, "Send queue closed, message discarded");
            return false;
        }
        true
    }

    /// Queue one message, dropping it if the queue is full.
    ///
    /// Used on fan-out paths so one slow client never stalls the others.
    pub fn queue_send_non_blocking(&self, data: Vec<u8>) -> bool {
        self.trace_outbound(&data);
        match self.sender.try_send(data) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    session = %self.id,
                    char_id = self.char_id(),
                    "Send queue full, dropped broadcast message"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue an acknowledgement built by [`build_ack`].
    pub async fn queue_ack(&self, ack_handle: u32, is_buffer: bool, error_code: u8, data: &[u8]) {
        if let Some(issued) = self.pending_acks.lock().remove(&ack_handle) {
            trace!(
                session = %self.id,
                ack_handle,
                latency_us = issued.elapsed().as_micros() as u64,
                "Ack latency"
            );
        }
        self.queue_send(build_ack(ack_handle, is_buffer, error_code, data)).await;
    }

    /// Successful buffer ack.
    pub async fn ack_buf_succeed(&self, ack_handle: u32, data: &[u8]) {
        self.queue_ack(ack_handle, true, ACK_SUCCESS, data).await;
    }

    /// Failed buffer ack.
    pub async fn ack_buf_fail(&self, ack_handle: u32, data: &[u8]) {
        self.queue_ack(ack_handle, true, ACK_FAILURE, data).await;
    }

    /// Successful simple ack (4 zero bytes).
    pub async fn ack_simple_succeed(&self, ack_handle: u32) {
        self.queue_ack(ack_handle, false, ACK_SUCCESS, &[0; 4]).await;
    }

    /// Failed simple ack (4 zero bytes).
    pub async fn ack_simple_fail(&self, ack_handle: u32) {
        self.queue_ack(ack_handle, false, ACK_FAILURE, &[0; 4]).await;
    }

    /// Remember when an ack handle arrived.
    fn record_ack(&self, ack_handle: u32) {
        let mut pending = self.pending_acks.lock();
        if pending.len() >= MAX_PENDING_ACKS {
            pending.clear();
        }
        pending.insert(ack_handle, Instant::now());
    }

    /// Ack handles still waiting for a response.
    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.lock().len()
    }

    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Split one decoded byte group into packets and dispatch each.
    ///
    /// A group may hold several packets back to back. The loop walks a cursor
    /// instead of recursing, so a group of many tiny packets costs no stack.
    /// The first parse failure discards the rest of the group: once a body
    /// length is wrong the remaining bytes cannot be realigned.
    pub async fn process_group<H: PacketHandler>(self: &Arc<Self>, data: &[u8], handler: &H) -> GroupOutcome {
        let mut outcome = GroupOutcome::default();
        let mut offset = 0;

        while data.len() - offset >= 2 {
            if self.is_closed() {
                break;
            }

            let mut reader = PacketReader::new(&data[offset..]);
            let opcode = match reader.read_u16() {
                Ok(raw) => Opcode(raw),
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            };
            let ack_handle = reader.peek_u32();

            let packet = match ClientPacket::parse(opcode, &mut reader) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!(
                        session = %self.id,
                        char_id = self.char_id(),
                        %opcode,
                        discarded = data.len() - offset,
                        "Failed to parse packet: {}", e
                    );
                    outcome.error = Some(e);
                    break;
                }
            };

            if self.log_inbound {
                debug!(
                    session = %self.id,
                    char_id = self.char_id(),
                    %opcode,
                    body = %hex::encode(&data[offset + 2..offset + reader.position()]),
                    "<- {}", packet.name()
                );
            }
            offset += reader.position();

            if packet == ClientPacket::End {
                break;
            }
            if let Some(handle) = ack_handle.filter(|_| packet.ack_handle().is_some()) {
                self.record_ack(handle);
            }

            self.dispatch(handler, packet).await;
            outcome.dispatched += 1;
        }

        outcome
    }

    /// Invoke the handler inside the fault boundary.
    ///
    /// This is the only place handler panics are caught. A panic is logged with
    /// the session identity and turns into a no-op for that packet; the
    /// connection and every other session keep running.
    async fn dispatch<H: PacketHandler>(self: &Arc<Self>, handler: &H, packet: ClientPacket) {
        let name = packet.name();
        let result = AssertUnwindSafe(handler.handle(self, packet))
            .catch_unwind()
            .await;
        if let Err(panic) = result {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(
                session = %self.id,
                char_id = self.char_id(),
                packet = name,
                "Handler panicked: {}", message
            );
        }
    }
}

// =============================================================================
// SESSION LOOPS
// =============================================================================

/// Drain the outbound queue onto the transport until the session closes.
///
/// Every message becomes its own terminated frame and its own write. Messages
/// still queued when the session closes are flushed before returning.
pub async fn run_send_loop<S: PacketSink>(
    session: Arc<Session>,
    mut queue: OutboundQueue,
    mut sink: S,
    tick: Duration,
) {
    loop {
        if session.is_closed() {
            break;
        }

        let first = tokio::select! {
            message = queue.rx.recv() => message,
            _ = session.closed() => continue,
        };
        let Some(first) = first else { break };

        for message in queue.drain(first) {
            if let Err(e) = sink.send_packet(&frame(&message)).await {
                warn!(session = %session.id, "Send failed: {}", e);
                session.close();
                return;
            }
        }

        if !tick.is_zero() {
            tokio::time::sleep(tick).await;
        }
    }

    while let Some(message) = queue.try_recv() {
        if sink.send_packet(&frame(&message)).await.is_err() {
            break;
        }
    }
    debug!(session = %session.id, "Send loop stopped");
}

/// Read packet groups and dispatch them until logout or disconnect, then run
/// the handler's departure cleanup.
pub async fn run_recv_loop<R: PacketSource, H: PacketHandler>(
    session: Arc<Session>,
    mut source: R,
    handler: Arc<H>,
    tick: Duration,
) -> DisconnectReason {
    let reason = loop {
        if session.is_closed() {
            break DisconnectReason::Graceful;
        }

        // Only the read races the close; a group being handled runs to the end.
        let read = tokio::select! {
            read = source.read_packet() => read,
            _ = session.closed() => break DisconnectReason::Graceful,
        };
        match read {
            Ok(Some(group)) => {
                session.touch();
                session.process_group(&group, handler.as_ref()).await;
            }
            Ok(None) => {
                break if session.is_closed() {
                    DisconnectReason::Graceful
                } else {
                    DisconnectReason::Lost
                };
            }
            Err(e) => break DisconnectReason::Errored(e),
        }

        if !tick.is_zero() {
            tokio::time::sleep(tick).await;
        }
    };

    match &reason {
        DisconnectReason::Graceful => info!(
            session = %session.id,
            char_id = session.char_id(),
            "Session closed"
        ),
        DisconnectReason::Lost => info!(
            session = %session.id,
            char_id = session.char_id(),
            idle_ms = session.idle_for().as_millis() as u64,
            "Connection lost"
        ),
        DisconnectReason::Errored(e) => warn!(
            session = %session.id,
            char_id = session.char_id(),
            "Connection error: {}", e
        ),
    }

    handler.on_disconnect(&session).await;
    session.close();
    reason
}
