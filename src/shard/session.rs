//! Shard session state machine
//!
//! A [`ShardSession`] owns one shard's connection lifecycle: connect, wait
//! for HELLO, IDENTIFY or RESUME, heartbeat, deliver dispatches, and decide
//! after every disconnect whether the session can be resumed. [`ShardSession::run_once`]
//! drives exactly one connection; the manager loops it with backoff.
//!
//! ```text
//! DISCONNECTED → CONNECTING → AWAITING_HELLO → IDENTIFYING ─┐
//!                                            → RESUMING ────┴→ READY → RUNNING
//! RUNNING → RECONNECT_REQUESTED (resume gate open)   ─┐
//!         → ERRORED             (resume gate closed) ─┴→ DISCONNECTED
//! ```

use super::backoff::Backoff;
use super::heartbeat::{HeartbeatState, HeartbeatTimer};
use super::identify::IdentifyThrottle;
use super::state::{ShardState, ShardStatus};
use super::transport::{CloseFrame, Transport, TransportOpener, WireMessage};
use crate::codec::{
    self, CloseCode, CloseDisposition, DecodeError, FrameDecoder, Identify, InboundPayload, Resume,
};
use crate::config::SessionSettings;
use crate::error::GatewayError;
use crate::events::GatewayEvent;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Connection-level state of one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Ready,
    Running,
    ReconnectRequested,
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingHello => "awaiting_hello",
            SessionState::Identifying => "identifying",
            SessionState::Resuming => "resuming",
            SessionState::Ready => "ready",
            SessionState::Running => "running",
            SessionState::ReconnectRequested => "reconnect_requested",
            SessionState::Errored => "errored",
        }
    }
}

/// `(index, total)` pair sent in IDENTIFY
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardId {
    pub index: u32,
    pub total: u32,
}

impl ShardId {
    pub fn new(index: u32, total: u32) -> Self {
        Self { index, total }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.total)
    }
}

/// Out-of-band requests from the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardCommand {
    /// Drop the connection and resume on a fresh one
    Reconnect,
}

/// How one connection ended
#[derive(Debug)]
pub enum CycleOutcome {
    /// Shutdown was requested; the session is cleared
    Shutdown,
    /// The connection was lost; reconnect after backoff
    Reconnect(GatewayError),
}

/// The live half of one connection
struct Connection {
    shard_id: u32,
    transport: Box<dyn Transport>,
    decoder: FrameDecoder,
}

impl Connection {
    /// Next complete payload. Cancel safe as long as the transport's `recv` is.
    async fn next_payload(&mut self) -> Result<InboundPayload, GatewayError> {
        let shard_id = self.shard_id;
        loop {
            let message = self
                .transport
                .recv()
                .await
                .map_err(|source| GatewayError::TransportFailed { shard_id, source })?;

            let decoded = match message {
                WireMessage::Text(text) => self.decoder.decode_text(&text).map(Some),
                WireMessage::Binary(bytes) => self.decoder.decode_binary(&bytes),
                WireMessage::Close(frame) => return Err(close_error(shard_id, frame)),
            };

            match decoded {
                Ok(Some(payload)) => return Ok(payload),
                Ok(None) => trace!(shard_id, buffered = self.decoder.buffered(), "Partial compressed frame"),
                Err(source) => return Err(GatewayError::Decode { shard_id, source }),
            }
        }
    }

    async fn send(&mut self, frame: String) -> Result<(), GatewayError> {
        let shard_id = self.shard_id;
        self.transport
            .send(frame)
            .await
            .map_err(|source| GatewayError::TransportFailed { shard_id, source })
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        if let Err(error) = self.transport.close(code.0, reason).await {
            debug!(shard_id = self.shard_id, error = %error, "Close handshake failed");
        }
    }
}

fn close_error(shard_id: u32, frame: Option<CloseFrame>) -> GatewayError {
    let Some(frame) = frame else {
        return GatewayError::TransportClosed {
            shard_id,
            code: None,
            resumable: true,
        };
    };

    let code = CloseCode(frame.code);
    match code.disposition() {
        CloseDisposition::Resume => GatewayError::TransportClosed {
            shard_id,
            code: Some(frame.code),
            resumable: true,
        },
        CloseDisposition::Reidentify => GatewayError::TransportClosed {
            shard_id,
            code: Some(frame.code),
            resumable: false,
        },
        CloseDisposition::AuthRejected => GatewayError::AuthRejected { shard_id },
        CloseDisposition::Fatal => GatewayError::FatalClose {
            shard_id,
            code: frame.code,
            reason: if frame.reason.is_empty() {
                code.name().to_string()
            } else {
                frame.reason
            },
        },
    }
}

async fn next_command(commands: &mut Option<mpsc::UnboundedReceiver<ShardCommand>>) -> Option<ShardCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Apply a manager command; every command ends the current connection.
fn on_command(shard_id: u32, backoff: &mut Backoff, command: ShardCommand) -> GatewayError {
    match command {
        ShardCommand::Reconnect => {
            info!(shard_id, "Reconnect requested by manager");
            backoff.reset();
            GatewayError::ReconnectRequested { shard_id }
        }
    }
}

/// One shard's session
pub struct ShardSession {
    shard: ShardId,
    settings: Arc<SessionSettings>,
    opener: Arc<dyn TransportOpener>,
    sink: mpsc::Sender<GatewayEvent>,
    identify: Arc<IdentifyThrottle>,
    tracker: ShardState,
    commands: Option<mpsc::UnboundedReceiver<ShardCommand>>,

    state: SessionState,
    sequence: Option<u64>,
    session_id: Option<String>,
    resume_url: Option<Url>,
    resume_gate: bool,
    backoff: Backoff,
    running_since: Option<Instant>,
    connections: u64,
}

impl ShardSession {
    pub fn new(
        shard: ShardId,
        settings: Arc<SessionSettings>,
        opener: Arc<dyn TransportOpener>,
        sink: mpsc::Sender<GatewayEvent>,
        identify: Arc<IdentifyThrottle>,
        tracker: ShardState,
    ) -> Self {
        let backoff = Backoff::new(settings.backoff_base, settings.backoff_max);
        Self {
            shard,
            settings,
            opener,
            sink,
            identify,
            tracker,
            commands: None,
            state: SessionState::Disconnected,
            sequence: None,
            session_id: None,
            resume_url: None,
            resume_gate: false,
            backoff,
            running_since: None,
            connections: 0,
        }
    }

    /// Attach the manager's command channel
    pub fn with_commands(mut self, commands: mpsc::UnboundedReceiver<ShardCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Last sequence number seen on this session
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether the next connection will RESUME instead of IDENTIFY
    pub fn can_resume(&self) -> bool {
        self.resume_gate && self.session_id.is_some() && self.sequence.is_some()
    }

    /// Delay before the next connection attempt
    pub fn next_backoff(&mut self) -> Duration {
        self.backoff.next_delay()
    }

    /// Mark the shard stopped without a connection (shutdown during backoff)
    pub fn stop(&mut self) {
        self.clear_session();
        self.set_state(SessionState::Disconnected);
        self.tracker.set_status(self.shard.index, ShardStatus::Disconnected);
    }

    /// Drive one connection from connect to disconnect.
    ///
    /// Returns `Err` only for fatal errors; every other failure comes back as
    /// [`CycleOutcome::Reconnect`] with the session data needed to resume.
    pub async fn run_once(&mut self, shutdown: &CancellationToken) -> Result<CycleOutcome, GatewayError> {
        self.connections += 1;
        if self.connections == 1 {
            self.tracker.set_status(self.shard.index, ShardStatus::Connecting);
        }

        let resuming = self.can_resume();
        if !resuming {
            self.clear_session();
            tokio::select! {
                _ = self.identify.acquire(self.shard.index) => {}
                _ = shutdown.cancelled() => return self.settle(Ok(CycleOutcome::Shutdown)),
            }
        }

        let outcome = self.connect_and_drive(resuming, shutdown).await;
        self.settle(outcome)
    }

    async fn connect_and_drive(
        &mut self,
        resuming: bool,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, GatewayError> {
        let shard_id = self.shard.index;
        self.set_state(SessionState::Connecting);
        let url = self.connect_url(resuming)?;
        debug!(shard_id, url = %url, resuming, "Connecting to gateway");

        let opened = tokio::select! {
            opened = self.opener.open(&url) => opened,
            _ = shutdown.cancelled() => return Ok(CycleOutcome::Shutdown),
        };
        let transport = match opened {
            Ok(transport) => transport,
            Err(source) => {
                return Ok(CycleOutcome::Reconnect(GatewayError::TransportFailed { shard_id, source }))
            }
        };

        let mut conn = Connection {
            shard_id,
            transport,
            decoder: FrameDecoder::new(self.settings.compression),
        };

        match self.drive(&mut conn, resuming, shutdown).await {
            Ok(outcome) => Ok(outcome),
            Err(error) => {
                let code = if error.allows_resume() {
                    CloseCode::RECONNECT
                } else {
                    CloseCode::NORMAL
                };
                conn.close(code, error.error_type_label()).await;
                if error.is_fatal() {
                    Err(error)
                } else {
                    Ok(CycleOutcome::Reconnect(error))
                }
            }
        }
    }

    /// Handshake then event loop. Any `Err` means the connection must be dropped.
    async fn drive(
        &mut self,
        conn: &mut Connection,
        resuming: bool,
        shutdown: &CancellationToken,
    ) -> Result<CycleOutcome, GatewayError> {
        let shard_id = self.shard.index;
        self.set_state(SessionState::AwaitingHello);

        let waited = self.settings.handshake_timeout;
        let first = tokio::select! {
            first = tokio::time::timeout(waited, conn.next_payload()) => first,
            _ = shutdown.cancelled() => {
                conn.close(CloseCode::NORMAL, "shutting down").await;
                return Ok(CycleOutcome::Shutdown);
            }
        };
        let interval = match first.map_err(|_| GatewayError::HandshakeTimeout { shard_id, waited })?? {
            InboundPayload::Hello { heartbeat_interval } => heartbeat_interval,
            other => {
                return Err(GatewayError::UnexpectedPayload {
                    shard_id,
                    expected: "HELLO",
                    op: other.opcode(),
                })
            }
        };
        debug!(shard_id, interval_ms = interval.as_millis() as u64, "Received HELLO");

        let mut heartbeat = HeartbeatState::new(interval);
        let mut timer = match self.settings.heartbeat_jitter {
            Some(jitter) => HeartbeatTimer::new(interval, jitter),
            None => HeartbeatTimer::with_random_jitter(interval),
        };

        self.send_handshake(conn, resuming).await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(shard_id, "Shard shutting down");
                    conn.close(CloseCode::NORMAL, "shutting down").await;
                    return Ok(CycleOutcome::Shutdown);
                }
                Some(command) = next_command(&mut self.commands) => {
                    return Err(on_command(shard_id, &mut self.backoff, command));
                }
                _ = timer.tick() => self.beat(conn, &mut heartbeat).await?,
                payload = conn.next_payload() => {
                    let payload = payload?;
                    if let Some(outcome) = self
                        .handle_payload(conn, &mut timer, &mut heartbeat, payload, shutdown)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    async fn send_handshake(&mut self, conn: &mut Connection, resuming: bool) -> Result<(), GatewayError> {
        let shard_id = self.shard.index;
        let resume_data = if resuming {
            self.session_id.clone().zip(self.sequence)
        } else {
            None
        };

        let frame = match resume_data {
            Some((session_id, seq)) => {
                self.set_state(SessionState::Resuming);
                info!(shard_id, session_id = %session_id, seq, "Resuming session");
                codec::encode_resume(&Resume {
                    token: self.settings.token.expose(),
                    session_id: &session_id,
                    seq,
                })
            }
            None => {
                self.set_state(SessionState::Identifying);
                info!(shard_id, total = self.shard.total, "Identifying");
                codec::encode_identify(&Identify {
                    token: self.settings.token.expose(),
                    intents: self.settings.intents,
                    properties: &self.settings.properties,
                    shard: [self.shard.index, self.shard.total],
                    large_threshold: self.settings.large_threshold,
                    compress: false,
                })
            }
        }
        .map_err(|source| GatewayError::Decode {
            shard_id,
            source: DecodeError::Json(source),
        })?;

        conn.send(frame).await
    }

    async fn beat(&self, conn: &mut Connection, heartbeat: &mut HeartbeatState) -> Result<(), GatewayError> {
        let shard_id = self.shard.index;
        if !heartbeat.is_acked() {
            warn!(
                shard_id,
                interval_ms = heartbeat.interval().as_millis() as u64,
                "Heartbeat not acknowledged, connection is zombied"
            );
            return Err(GatewayError::Zombied { shard_id });
        }

        conn.send(codec::encode_heartbeat(self.sequence)).await?;
        heartbeat.record_sent(Instant::now());
        trace!(shard_id, seq = ?self.sequence, "Sent heartbeat");
        Ok(())
    }

    async fn handle_payload(
        &mut self,
        conn: &mut Connection,
        timer: &mut HeartbeatTimer,
        heartbeat: &mut HeartbeatState,
        payload: InboundPayload,
        shutdown: &CancellationToken,
    ) -> Result<Option<CycleOutcome>, GatewayError> {
        let shard_id = self.shard.index;
        match payload {
            InboundPayload::Dispatch { sequence, event, data } => {
                return self
                    .dispatch(conn, timer, heartbeat, shutdown, sequence, event, data)
                    .await;
            }
            InboundPayload::Heartbeat => {
                debug!(shard_id, "Gateway requested an immediate heartbeat");
                conn.send(codec::encode_heartbeat(self.sequence)).await?;
            }
            InboundPayload::HeartbeatAck => {
                let latency = heartbeat.record_ack(Instant::now());
                self.tracker.record_heartbeat(shard_id, latency);
                if let Some(latency) = latency {
                    crate::metrics::record_heartbeat_latency(shard_id, latency);
                    trace!(shard_id, latency_ms = latency.as_millis() as u64, "Heartbeat acknowledged");
                }
            }
            InboundPayload::Reconnect => {
                info!(shard_id, "Gateway requested reconnect");
                self.backoff.reset();
                return Err(GatewayError::ReconnectRequested { shard_id });
            }
            InboundPayload::InvalidSession { resumable } => {
                warn!(shard_id, resumable, "Session invalidated by gateway");
                return Err(GatewayError::SessionInvalidated { shard_id, resumable });
            }
            InboundPayload::Hello { .. } => debug!(shard_id, "Ignoring repeated HELLO"),
            InboundPayload::Unknown { op } => warn!(shard_id, op, "Ignoring unknown opcode"),
        }
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &mut self,
        conn: &mut Connection,
        timer: &mut HeartbeatTimer,
        heartbeat: &mut HeartbeatState,
        shutdown: &CancellationToken,
        sequence: u64,
        event_name: String,
        data: Value,
    ) -> Result<Option<CycleOutcome>, GatewayError> {
        let shard_id = self.shard.index;
        if let Some(last) = self.sequence {
            if sequence <= last {
                debug!(shard_id, sequence, last, event = %event_name, "Skipping replayed dispatch");
                return Ok(None);
            }
        }
        match event_name.as_str() {
            "READY" => self.on_ready(sequence, &data)?,
            "RESUMED" => self.on_resumed(sequence),
            _ => {}
        }

        self.tracker.record_event(shard_id, sequence);
        crate::metrics::record_event(shard_id, &event_name);

        // The sequence only advances once the event is handed off, so a
        // connection dropped while the sink is full replays it on resume.
        let event = GatewayEvent::from_dispatch(shard_id, sequence, &event_name, data);
        let outcome = self.forward(conn, timer, heartbeat, shutdown, event).await?;
        if outcome.is_none() {
            self.sequence = Some(sequence);
        }
        Ok(outcome)
    }

    fn on_ready(&mut self, sequence: u64, data: &Value) -> Result<(), GatewayError> {
        let shard_id = self.shard.index;
        let session_id = data
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or(GatewayError::Decode {
                shard_id,
                source: DecodeError::MissingField { op: 0, field: "session_id" },
            })?;

        self.session_id = Some(session_id.to_owned());
        self.resume_url = data
            .get("resume_gateway_url")
            .and_then(Value::as_str)
            .and_then(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(error) => {
                    warn!(shard_id, url = raw, error = %error, "Ignoring invalid resume URL");
                    None
                }
            });
        self.resume_gate = true;
        self.tracker
            .set_session(shard_id, self.session_id.clone(), Some(sequence));

        info!(shard_id, session_id, "Shard ready");
        self.enter_running();
        Ok(())
    }

    fn on_resumed(&mut self, sequence: u64) {
        info!(shard_id = self.shard.index, seq = sequence, "Session resumed");
        self.enter_running();
    }

    fn enter_running(&mut self) {
        self.set_state(SessionState::Ready);
        self.tracker.set_status(self.shard.index, ShardStatus::Ready);
        self.set_state(SessionState::Running);
        self.running_since = Some(Instant::now());
    }

    /// Deliver one event, waiting for sink capacity. Heartbeats keep going
    /// while the sink is full so backpressure does not kill the connection.
    /// Acks cannot be read while blocked here, so beats are recorded but
    /// not checked; the next tick in the read loop does the zombie check.
    async fn forward(
        &mut self,
        conn: &mut Connection,
        timer: &mut HeartbeatTimer,
        heartbeat: &mut HeartbeatState,
        shutdown: &CancellationToken,
        event: GatewayEvent,
    ) -> Result<Option<CycleOutcome>, GatewayError> {
        let shard_id = self.shard.index;
        let permit = loop {
            tokio::select! {
                permit = self.sink.reserve() => {
                    break permit.map_err(|_| GatewayError::SinkClosed { shard_id })?;
                }
                _ = shutdown.cancelled() => {
                    info!(shard_id, "Shard shutting down with undelivered event");
                    conn.close(CloseCode::NORMAL, "shutting down").await;
                    return Ok(Some(CycleOutcome::Shutdown));
                }
                Some(command) = next_command(&mut self.commands) => {
                    return Err(on_command(shard_id, &mut self.backoff, command));
                }
                _ = timer.tick() => {
                    debug!(shard_id, "Event sink full, heartbeating while waiting");
                    conn.send(codec::encode_heartbeat(self.sequence)).await?;
                    heartbeat.record_sent(Instant::now());
                }
            }
        };
        permit.send(event);
        Ok(None)
    }

    fn connect_url(&self, resuming: bool) -> Result<Url, GatewayError> {
        let mut url = match (&self.resume_url, resuming) {
            (Some(resume_url), true) => resume_url.clone(),
            _ => Url::parse(&self.settings.gateway_url).map_err(|e| {
                GatewayError::Config(format!("invalid gateway url '{}': {e}", self.settings.gateway_url))
            })?,
        };

        {
            let mut query = url.query_pairs_mut();
            query
                .clear()
                .append_pair("v", &self.settings.api_version.to_string())
                .append_pair("encoding", "json");
            if let Some(compress) = self.settings.compression.query_value() {
                query.append_pair("compress", compress);
            }
        }
        Ok(url)
    }

    fn settle(&mut self, outcome: Result<CycleOutcome, GatewayError>) -> Result<CycleOutcome, GatewayError> {
        let shard_id = self.shard.index;
        if let Some(since) = self.running_since.take() {
            if since.elapsed() >= self.settings.backoff_reset_after {
                self.backoff.reset();
            }
        }

        match &outcome {
            Ok(CycleOutcome::Shutdown) => {
                self.stop();
            }
            Ok(CycleOutcome::Reconnect(reason)) => {
                if reason.allows_resume() && self.session_id.is_some() {
                    self.set_state(SessionState::ReconnectRequested);
                } else {
                    self.clear_session();
                    self.set_state(SessionState::Errored);
                }
                self.tracker.set_status(shard_id, ShardStatus::Reconnecting);
                self.tracker.record_reconnect(shard_id);
                crate::metrics::record_reconnect(shard_id, reason.error_type_label());
                self.set_state(SessionState::Disconnected);
            }
            Err(error) => {
                self.clear_session();
                self.set_state(SessionState::Errored);
                self.tracker.set_status(shard_id, ShardStatus::Fatal);
                crate::metrics::record_reconnect(shard_id, error.error_type_label());
            }
        }

        outcome
    }

    fn clear_session(&mut self) {
        self.session_id = None;
        self.sequence = None;
        self.resume_url = None;
        self.resume_gate = false;
        self.tracker.set_session(self.shard.index, None, None);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            trace!(shard_id = self.shard.index, from = self.state.as_str(), to = state.as_str(), "Session state");
        }
        self.state = state;
        self.tracker.set_session_state(self.shard.index, state);
    }
}
