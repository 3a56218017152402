//! Call Engine - Zustandsmaschine für 1:1 Audio-Anrufe
//!
//! Koordiniert Media Session Manager, Peer Connection Negotiator,
//! Signaling Client und Call Timer.
//!
//! Alle Zustandsänderungen laufen in einem einzigen Task, der ein Event nach
//! dem anderen vollständig abarbeitet. Suspendierende Arbeit (Mikrofon,
//! Negotiator, Relay-Verbindung) läuft in eigenen Tasks und meldet sich mit
//! der Generation zurück, mit der sie gestartet wurde. Hat sich die
//! Generation inzwischen geändert, wird das Ergebnis verworfen und seine
//! Ressourcen sofort freigegeben.

use super::audio::{CpalMediaDevices, MediaDevices, MediaSessionManager, MediaStreamHandle};
use super::error::{CallError, StateErrorKind, TerminationKind};
use super::negotiator::{
    NegotiationPayload, Negotiator, NegotiatorEvent, NegotiatorFactory, NegotiatorSink,
    RemoteStreamInfo,
};
use super::session::{CallEvent, CallSession, CallState, CallStatus};
use super::timer::CallTimer;
use super::webrtc::WebRtcNegotiatorFactory;
use crate::config::CallConfig;
use crate::crypto::SigningIdentity;
use crate::signaling::{RelayConnector, SignalingClient, SignalingEvent, WebSocketConnector};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

// ============================================================================
// COMMANDS & INPUTS
// ============================================================================

/// Operationen der Anwendung
enum Command {
    Initialize {
        user_id: String,
        room_id: String,
        reply: Reply<()>,
    },
    StartCall {
        target_user_id: String,
        room_id: String,
        reply: Reply<()>,
    },
    AnswerCall {
        reply: Reply<()>,
    },
    RejectCall {
        reply: Reply<()>,
    },
    EndCall {
        reply: Reply<()>,
    },
    SetMuted {
        muted: bool,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
}

/// Lokale Audio-Ressourcen einer Sitzung, fertig vorbereitet
struct Prepared {
    stream: MediaStreamHandle,
    negotiator: Box<dyn Negotiator>,
}

/// Interne Events, die zurück in die Zustandsmaschine laufen
enum Input {
    Initialized {
        attempt: u64,
        user_id: String,
        room_id: String,
        result: Result<Connected, CallError>,
        reply: Reply<()>,
    },
    Prepared {
        generation: u64,
        result: Result<Prepared, CallError>,
    },
    Signaling {
        epoch: u64,
        event: SignalingEvent,
    },
    Negotiator {
        generation: u64,
        event: NegotiatorEvent,
    },
    Tick {
        generation: u64,
        elapsed: u64,
    },
    ResetIdle {
        generation: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Start,
    Answer,
}

/// Eine Operation, die auf Mikrofon + Negotiator wartet
struct PendingOp {
    kind: PendingKind,
    generation: u64,
    reply: Reply<()>,
}

/// Warum eine Sitzung in `ended` übergeht
#[derive(Debug)]
enum EndCause {
    LocalHangup,
    LocalReject,
    NegotiatorClosed,
    Disconnect,
    /// Wird nach dem Aufräumen als `CallEvent::Error` gemeldet
    Error(CallError),
}

// ============================================================================
// SHARED STATUS
// ============================================================================

/// Vom Engine-Task veröffentlichter Zustand für synchrone Abfragen
#[derive(Debug, Clone)]
struct SharedStatus {
    state: CallState,
    connected_since: Option<Instant>,
    duration: u64,
    has_local_stream: bool,
    has_remote_stream: bool,
    muted: bool,
    initialized: bool,
    current: Option<CallSession>,
    last: Option<CallSession>,
}

impl Default for SharedStatus {
    fn default() -> Self {
        Self {
            state: CallState::Idle,
            connected_since: None,
            duration: 0,
            has_local_stream: false,
            has_remote_stream: false,
            muted: false,
            initialized: false,
            current: None,
            last: None,
        }
    }
}

// ============================================================================
// CALL SESSION MANAGER
// ============================================================================

/// Öffentliche Schnittstelle der Call Engine
///
/// Günstig klonbar; alle Klone steuern dieselbe Zustandsmaschine. Jede Instanz
/// ist unabhängig, es gibt keinen globalen Zustand. Muss innerhalb einer
/// Tokio-Runtime erzeugt werden.
#[derive(Clone)]
pub struct CallSessionManager {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<CallEvent>,
    status: Arc<RwLock<SharedStatus>>,
    media: MediaSessionManager,
}

impl CallSessionManager {
    /// Erstellt einen Manager mit expliziten Kollaborateuren
    pub fn new(
        config: CallConfig,
        devices: Arc<dyn MediaDevices>,
        negotiators: Arc<dyn NegotiatorFactory>,
        connector: Arc<dyn RelayConnector>,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(100);
        let status = Arc::new(RwLock::new(SharedStatus::default()));
        let media = MediaSessionManager::new(devices);

        let engine = Engine {
            config,
            media: media.clone(),
            negotiators,
            connector,
            identity: None,
            signaling: None,
            epoch: 0,
            init_attempt: 0,
            initializing: false,
            local_user_id: None,
            room_id: None,
            generation: 0,
            session: None,
            stream: None,
            negotiator: None,
            remote_stream: None,
            inbound_backlog: Vec::new(),
            outbound_backlog: Vec::new(),
            announced: false,
            pending: None,
            timer: CallTimer::new(),
            muted: false,
            inputs: input_tx,
            events: events.clone(),
            status: Arc::clone(&status),
            replies: Vec::new(),
        };
        tokio::spawn(engine.run(command_rx, input_rx));

        Self {
            commands: command_tx,
            events,
            status,
            media,
        }
    }

    /// Standard-Backends: cpal Mikrofon, WebRTC, WebSocket-Relay
    pub fn with_defaults(config: CallConfig) -> Self {
        let negotiators = Arc::new(WebRtcNegotiatorFactory::from_config(&config));
        Self::new(
            config,
            Arc::new(CpalMediaDevices),
            negotiators,
            Arc::new(WebSocketConnector),
        )
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Prüft die Mikrofon-Berechtigung und verbindet mit dem Relay
    pub async fn initialize(&self, user_id: &str, room_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::Initialize {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
            reply,
        })
        .await
    }

    /// Ruft `target_user_id` an
    ///
    /// Der Zustand wechselt sofort auf `calling`; die Operation endet, sobald
    /// Mikrofon und Negotiator bereit sind und `start-call` gesendet wurde.
    pub async fn start_call(&self, target_user_id: &str, room_id: &str) -> Result<(), CallError> {
        self.request(|reply| Command::StartCall {
            target_user_id: target_user_id.to_string(),
            room_id: room_id.to_string(),
            reply,
        })
        .await
    }

    /// Nimmt den eingehenden Anruf an
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::AnswerCall { reply }).await
    }

    /// Lehnt den eingehenden Anruf ab
    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::RejectCall { reply }).await
    }

    /// Beendet den laufenden Anruf (auch vor dem Verbinden)
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    /// Schaltet das Mikrofon stumm oder wieder an
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| Command::SetMuted { muted, reply }).await
    }

    /// Trennt das Signaling und räumt eine laufende Sitzung auf
    pub async fn disconnect(&self) {
        let _ = self.request(|reply| Command::Disconnect { reply }).await;
    }

    /// Gibt den aktuellen Call-Status zurück
    pub fn get_call_state(&self) -> CallStatus {
        let status = self.status.read();
        let duration = match (status.state, status.connected_since) {
            (CallState::Connected, Some(since)) => since.elapsed().as_secs(),
            _ => status.duration,
        };
        CallStatus {
            state: status.state,
            duration,
            has_local_stream: status.has_local_stream,
            has_remote_stream: status.has_remote_stream,
        }
    }

    pub fn state(&self) -> CallState {
        self.status.read().state
    }

    /// `true` in `calling`, `incoming` und `connected`
    pub fn is_in_call(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == CallState::Connected
    }

    pub fn is_initialized(&self) -> bool {
        self.status.read().initialized
    }

    pub fn is_muted(&self) -> bool {
        self.status.read().muted
    }

    /// Die laufende Sitzung (auch während `ended`)
    pub fn current_session(&self) -> Option<CallSession> {
        self.status.read().current.clone()
    }

    /// Die zuletzt abgeschlossene Sitzung
    pub fn last_session(&self) -> Option<CallSession> {
        self.status.read().last.clone()
    }

    /// Anzahl aktuell gehaltener Mikrofon-Streams
    pub fn live_streams(&self) -> usize {
        self.media.live_streams()
    }

    async fn request(&self, build: impl FnOnce(Reply<()>) -> Command) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| CallError::State(StateErrorKind::ManagerClosed))?;
        rx.await
            .map_err(|_| CallError::State(StateErrorKind::ManagerClosed))?
    }
}

impl std::fmt::Debug for CallSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionManager")
            .field("status", &self.get_call_state())
            .finish()
    }
}

// ============================================================================
// BACKGROUND WORK
// ============================================================================

type Connected = (SignalingClient, mpsc::UnboundedReceiver<SignalingEvent>);

/// Prüft die Mikrofon-Berechtigung und betritt den Raum
async fn connect_relay(
    media: MediaSessionManager,
    mut client: SignalingClient,
    user_id: String,
    room_id: String,
) -> Result<Connected, CallError> {
    let probe = media.acquire().await?;
    media.release(&probe);

    let events = client.connect(user_id, room_id).await?;
    Ok((client, events))
}

/// Erwirbt das Mikrofon und erzeugt den Negotiator dazu
///
/// Schlägt der Negotiator fehl, wird der Stream sofort wieder freigegeben.
async fn prepare(
    media: MediaSessionManager,
    factory: Arc<dyn NegotiatorFactory>,
    initiator: bool,
    sink: NegotiatorSink,
) -> Result<Prepared, CallError> {
    let stream = media.acquire().await?;
    match factory.create(initiator, &stream, sink).await {
        Ok(negotiator) => Ok(Prepared { stream, negotiator }),
        Err(e) => {
            media.release(&stream);
            Err(e.into())
        }
    }
}

// ============================================================================
// ENGINE
// ============================================================================

struct Engine {
    config: CallConfig,
    media: MediaSessionManager,
    negotiators: Arc<dyn NegotiatorFactory>,
    connector: Arc<dyn RelayConnector>,
    identity: Option<Arc<SigningIdentity>>,

    signaling: Option<SignalingClient>,
    /// Zählt Relay-Verbindungen; Events alter Verbindungen werden verworfen
    epoch: u64,
    init_attempt: u64,
    initializing: bool,
    local_user_id: Option<String>,
    room_id: Option<String>,

    /// Zählt Sitzungswechsel; Ergebnisse mit alter Generation werden verworfen
    generation: u64,
    session: Option<CallSession>,
    stream: Option<MediaStreamHandle>,
    negotiator: Option<Box<dyn Negotiator>>,
    remote_stream: Option<RemoteStreamInfo>,
    /// Blobs der Gegenseite, bevor unser Negotiator existiert
    inbound_backlog: Vec<NegotiationPayload>,
    /// Eigene Blobs, bevor die Gegenseite vom Anruf weiß
    outbound_backlog: Vec<NegotiationPayload>,
    announced: bool,
    pending: Option<PendingOp>,
    timer: CallTimer,
    muted: bool,

    inputs: mpsc::UnboundedSender<Input>,
    events: broadcast::Sender<CallEvent>,
    status: Arc<RwLock<SharedStatus>>,
    replies: Vec<(Reply<()>, Result<(), CallError>)>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut inputs: mpsc::UnboundedReceiver<Input>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(input) = inputs.recv() => self.handle_input(input),
            }
            self.publish();
            self.flush_replies();
        }

        tracing::info!("Call engine shutting down");
        self.teardown();
        self.publish();
        self.flush_replies();
    }

    fn flush_replies(&mut self) {
        for (reply, result) in self.replies.drain(..) {
            let _ = reply.send(result);
        }
    }

    fn state(&self) -> CallState {
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(CallState::Idle)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    /// Meldet einen Fehler an die Anwendung und an den Aufrufer
    fn fail(&mut self, reply: Reply<()>, err: CallError) {
        tracing::warn!("Operation failed: {}", err);
        self.emit(CallEvent::Error(err.clone()));
        self.respond(reply, Err(err));
    }

    /// Antworten gehen erst nach `publish` raus, damit der Aufrufer den
    /// neuen Zustand sieht
    fn respond(&mut self, reply: Reply<()>, result: Result<(), CallError>) {
        self.replies.push((reply, result));
    }

    fn set_state(&mut self, state: CallState) {
        if let Some(session) = self.session.as_mut() {
            session.state = state;
        }
        tracing::info!("Call state changed: {}", state);
        self.publish();
        self.emit(CallEvent::StateChanged(state));
    }

    fn remote_id(&self) -> Option<&str> {
        self.session
            .as_ref()
            .map(|s| s.remote_participant_id.as_str())
    }

    // ========================================================================
    // COMMANDS
    // ========================================================================

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Initialize {
                user_id,
                room_id,
                reply,
            } => self.initialize(user_id, room_id, reply),
            Command::StartCall {
                target_user_id,
                room_id,
                reply,
            } => self.start_call(target_user_id, room_id, reply),
            Command::AnswerCall { reply } => self.answer_call(reply),
            Command::RejectCall { reply } => self.reject_call(reply),
            Command::EndCall { reply } => self.end_call(reply),
            Command::SetMuted { muted, reply } => self.set_muted(muted, reply),
            Command::Disconnect { reply } => {
                self.disconnect();
                self.respond(reply, Ok(()));
            }
        }
    }

    fn initialize(&mut self, user_id: String, room_id: String, reply: Reply<()>) {
        if self.signaling.is_some() {
            return self.fail(reply, StateErrorKind::AlreadyInitialized.into());
        }
        if self.initializing {
            return self.fail(reply, StateErrorKind::OperationPending.into());
        }

        let url = match self.config.websocket_url() {
            Ok(url) => url.to_string(),
            Err(e) => return self.fail(reply, CallError::Connection(e.to_string())),
        };
        let identity = match self.identity() {
            Ok(identity) => identity,
            Err(e) => return self.fail(reply, e),
        };

        self.initializing = true;
        self.init_attempt += 1;
        let attempt = self.init_attempt;
        let media = self.media.clone();
        let connector = Arc::clone(&self.connector);
        let queue = self.config.send_queue;
        let heartbeat = self.config.heartbeat_interval();
        let inputs = self.inputs.clone();

        tracing::info!("Initializing call engine for {} in room {}", user_id, room_id);
        tokio::spawn(async move {
            let client = SignalingClient::new(url, connector, identity)
                .with_queue(queue)
                .with_heartbeat(heartbeat);
            let result = connect_relay(media, client, user_id.clone(), room_id.clone()).await;

            let _ = inputs.send(Input::Initialized {
                attempt,
                user_id,
                room_id,
                result,
                reply,
            });
        });
    }

    fn identity(&mut self) -> Result<Arc<SigningIdentity>, CallError> {
        if let Some(identity) = &self.identity {
            return Ok(Arc::clone(identity));
        }
        let identity = match &self.config.identity_key_path {
            Some(path) => SigningIdentity::load_or_create(path)?,
            None => SigningIdentity::generate(),
        };
        let identity = Arc::new(identity);
        self.identity = Some(Arc::clone(&identity));
        Ok(identity)
    }

    fn start_call(&mut self, target_user_id: String, room_id: String, reply: Reply<()>) {
        let Some(local) = self.local_user_id.clone().filter(|_| self.signaling.is_some()) else {
            return self.fail(reply, StateErrorKind::NotInitialized.into());
        };
        if self.state() != CallState::Idle {
            return self.fail(reply, StateErrorKind::CallInProgress.into());
        }

        tracing::info!("Starting call to {} in room {}", target_user_id, room_id);
        self.generation += 1;
        self.session = Some(CallSession::outgoing(local, target_user_id, room_id));
        self.announced = false;
        self.set_state(CallState::Calling);

        self.pending = Some(PendingOp {
            kind: PendingKind::Start,
            generation: self.generation,
            reply,
        });
        self.spawn_prepare(true);
    }

    fn answer_call(&mut self, reply: Reply<()>) {
        if self.state() != CallState::Incoming {
            return self.fail(reply, StateErrorKind::NoIncomingCall.into());
        }
        if self.pending.is_some() {
            return self.fail(reply, StateErrorKind::OperationPending.into());
        }

        tracing::info!("Answering call from {:?}", self.remote_id());
        self.pending = Some(PendingOp {
            kind: PendingKind::Answer,
            generation: self.generation,
            reply,
        });
        self.spawn_prepare(false);
    }

    fn reject_call(&mut self, reply: Reply<()>) {
        if self.state() != CallState::Incoming {
            return self.fail(reply, StateErrorKind::NoIncomingCall.into());
        }

        tracing::info!("Rejecting call from {:?}", self.remote_id());
        self.send_reject();
        self.enter_ended(EndCause::LocalReject);
        self.respond(reply, Ok(()));
    }

    fn end_call(&mut self, reply: Reply<()>) {
        match self.state() {
            CallState::Calling | CallState::Connected => {}
            _ => return self.fail(reply, StateErrorKind::NoActiveCall.into()),
        }

        tracing::info!("Hanging up");
        self.send_end();
        self.enter_ended(EndCause::LocalHangup);
        self.respond(reply, Ok(()));
    }

    fn set_muted(&mut self, muted: bool, reply: Reply<()>) {
        let Some(stream) = self.stream.as_ref() else {
            return self.fail(reply, StateErrorKind::NoActiveCall.into());
        };
        self.media.set_muted(stream, muted);
        self.muted = muted;
        self.respond(reply, Ok(()));
    }

    fn disconnect(&mut self) {
        match self.state() {
            CallState::Incoming => self.send_reject(),
            CallState::Calling | CallState::Connected => self.send_end(),
            _ => {}
        }
        self.enter_ended(EndCause::Disconnect);
        self.reset_to_idle();

        // Laufende Initialisierung verwerfen
        self.initializing = false;
        self.init_attempt += 1;

        if let Some(mut client) = self.signaling.take() {
            client.disconnect();
        }
        self.epoch += 1;
        self.local_user_id = None;
        self.room_id = None;
    }

    /// Räumt beim Beenden des Engine-Tasks alles ab
    fn teardown(&mut self) {
        self.disconnect();
        self.cleanup();
    }

    // ========================================================================
    // INPUTS
    // ========================================================================

    fn handle_input(&mut self, input: Input) {
        match input {
            Input::Initialized {
                attempt,
                user_id,
                room_id,
                result,
                reply,
            } => self.on_initialized(attempt, user_id, room_id, result, reply),
            Input::Prepared { generation, result } => self.on_prepared(generation, result),
            Input::Signaling { epoch, event } => {
                if epoch == self.epoch && self.signaling.is_some() {
                    self.on_signaling(event);
                } else {
                    tracing::debug!("Dropping event from stale relay connection: {:?}", event);
                }
            }
            Input::Negotiator { generation, event } => {
                if generation == self.generation && self.state().is_active() {
                    self.on_negotiator(event);
                } else {
                    tracing::debug!("Dropping stale negotiator event: {:?}", event);
                }
            }
            Input::Tick {
                generation,
                elapsed,
            } => {
                if generation == self.generation && self.state() == CallState::Connected {
                    if let Some(session) = self.session.as_mut() {
                        session.duration_seconds = elapsed;
                    }
                    self.emit(CallEvent::DurationTick(elapsed));
                }
            }
            Input::ResetIdle { generation } => {
                if generation == self.generation {
                    self.reset_to_idle();
                }
            }
        }
    }

    fn on_initialized(
        &mut self,
        attempt: u64,
        user_id: String,
        room_id: String,
        result: Result<Connected, CallError>,
        reply: Reply<()>,
    ) {
        if attempt != self.init_attempt {
            if let Ok((mut client, _)) = result {
                client.disconnect();
            }
            self.respond(reply, Err(StateErrorKind::SessionChanged.into()));
            return;
        }
        self.initializing = false;

        let (client, mut events) = match result {
            Ok(connected) => connected,
            Err(e) => return self.fail(reply, e),
        };

        self.epoch += 1;
        let epoch = self.epoch;
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inputs.send(Input::Signaling { epoch, event }).is_err() {
                    break;
                }
            }
        });

        tracing::info!("Call engine ready as {} in room {}", user_id, room_id);
        self.signaling = Some(client);
        self.local_user_id = Some(user_id);
        self.room_id = Some(room_id);
        self.respond(reply, Ok(()));
    }

    fn on_prepared(&mut self, generation: u64, result: Result<Prepared, CallError>) {
        let op = match self.pending.take() {
            Some(op) if op.generation == generation => op,
            other => {
                // Sitzung hat gewechselt, Ergebnis verwerfen
                self.pending = other;
                if let Ok(prepared) = result {
                    tracing::warn!("Discarding media prepared for a stale session");
                    prepared.negotiator.close();
                    self.media.release(&prepared.stream);
                }
                return;
            }
        };

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(err) => return self.on_prepare_failed(op, err),
        };

        self.stream = Some(prepared.stream);
        self.negotiator = Some(prepared.negotiator);
        self.muted = false;

        let sent = match op.kind {
            PendingKind::Start => self.send_start(),
            PendingKind::Answer => self.send_answer(),
        };
        if let Err(err) = sent {
            self.enter_ended(EndCause::Error(err.clone()));
            self.respond(op.reply, Err(err));
            return;
        }

        self.announced = true;
        self.flush_backlogs();
        if op.kind == PendingKind::Answer {
            self.enter_connected();
        }
        self.respond(op.reply, Ok(()));
    }

    fn on_prepare_failed(&mut self, op: PendingOp, err: CallError) {
        let permission = matches!(err, CallError::Permission(_));
        match (permission, op.kind) {
            (true, PendingKind::Start) => {
                // Es wurde noch nichts angekündigt, direkt zurück auf idle
                self.cleanup();
                self.generation += 1;
                self.session = None;
                self.set_state(CallState::Idle);
                self.fail(op.reply, err);
            }
            (true, PendingKind::Answer) => {
                // Anruf klingelt weiter, die Anwendung kann ablehnen
                self.fail(op.reply, err);
            }
            _ => {
                if op.kind == PendingKind::Answer {
                    self.send_reject();
                }
                self.enter_ended(EndCause::Error(err.clone()));
                self.respond(op.reply, Err(err));
            }
        }
    }

    fn on_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::IncomingCall { caller_id, room_id } => {
                // Nachlauf eines beendeten Anrufs blockiert keinen neuen
                self.reset_to_idle();
                if self.state() != CallState::Idle {
                    tracing::warn!("Incoming call from {} while {}", caller_id, self.state());
                    self.emit(CallEvent::Error(StateErrorKind::CallInProgress.into()));
                    return;
                }
                let (Some(local), Some(default_room)) =
                    (self.local_user_id.clone(), self.room_id.clone())
                else {
                    return;
                };

                tracing::info!("Incoming call from {}", caller_id);
                self.generation += 1;
                self.session = Some(CallSession::incoming(
                    local,
                    caller_id,
                    room_id.unwrap_or(default_room),
                ));
                self.announced = false;
                self.set_state(CallState::Incoming);
            }

            SignalingEvent::CallAnswered { answerer_id } => {
                if self.state() == CallState::Calling && self.is_remote(&answerer_id) {
                    tracing::info!("Call answered by {}", answerer_id);
                    self.enter_connected();
                }
            }

            SignalingEvent::CallRejected { rejecter_id } => {
                if self.state() == CallState::Calling && self.is_remote(&rejecter_id) {
                    tracing::info!("Call rejected by {}", rejecter_id);
                    self.enter_ended(EndCause::Error(CallError::RemoteTermination {
                        by: rejecter_id,
                        kind: TerminationKind::Rejected,
                    }));
                }
            }

            SignalingEvent::CallEnded { ender_id } => {
                if self.state().is_active() && self.is_remote(&ender_id) {
                    tracing::info!("Call ended by {}", ender_id);
                    self.enter_ended(EndCause::Error(CallError::RemoteTermination {
                        by: ender_id,
                        kind: TerminationKind::Ended,
                    }));
                }
            }

            SignalingEvent::NegotiationSignal { payload, sender_id } => {
                if !self.state().is_active() {
                    tracing::debug!("Dropping negotiation payload, no active call");
                    return;
                }
                if let Some(sender) = sender_id {
                    if !self.is_remote(&sender) {
                        return;
                    }
                }
                match self.negotiator.as_ref() {
                    Some(negotiator) => negotiator.signal(payload),
                    None => self.inbound_backlog.push(payload),
                }
            }

            SignalingEvent::RelayError { code, message } => {
                self.emit(CallEvent::RelayError { code, message });
            }

            SignalingEvent::Disconnected => {
                tracing::error!("Lost connection to signaling relay");
                self.signaling = None;
                self.epoch += 1;
                let reason = "signaling relay connection lost".to_string();
                if self.state().is_active() {
                    self.enter_ended(EndCause::Error(CallError::Connection(reason)));
                } else {
                    self.emit(CallEvent::Error(CallError::Connection(reason)));
                }
            }
        }
    }

    fn on_negotiator(&mut self, event: NegotiatorEvent) {
        match event {
            NegotiatorEvent::OutboundSignal(payload) => {
                if !self.announced {
                    self.outbound_backlog.push(payload);
                    return;
                }
                if let Some(client) = self.signaling.as_ref() {
                    if let Err(e) = client.send_negotiation(payload) {
                        tracing::warn!("Failed to forward negotiation payload: {}", e);
                    }
                }
            }
            NegotiatorEvent::RemoteStream(info) => {
                self.remote_stream = Some(info.clone());
                self.emit(CallEvent::RemoteStream(info));
            }
            NegotiatorEvent::Connect => {
                if self.state() == CallState::Calling {
                    self.enter_connected();
                }
            }
            NegotiatorEvent::Close => match self.state() {
                CallState::Calling | CallState::Connected => {
                    self.send_end();
                    self.enter_ended(EndCause::NegotiatorClosed);
                }
                CallState::Incoming => {
                    let err = CallError::Negotiation("peer connection closed".to_string());
                    self.abort_answer(err);
                }
                _ => {}
            },
            NegotiatorEvent::Error(err) => match self.state() {
                CallState::Calling | CallState::Connected => {
                    self.send_end();
                    self.enter_ended(EndCause::Error(err.into()));
                }
                CallState::Incoming => self.abort_answer(err.into()),
                _ => {}
            },
        }
    }

    /// Der Peer ist vor dem Annehmen weggebrochen: ablehnen und beenden
    fn abort_answer(&mut self, err: CallError) {
        if let Some(op) = self.pending.take() {
            self.respond(op.reply, Err(err.clone()));
        }
        self.send_reject();
        self.enter_ended(EndCause::Error(err));
    }

    fn is_remote(&self, participant_id: &str) -> bool {
        let matches = self.remote_id() == Some(participant_id);
        if !matches {
            tracing::warn!(
                "Ignoring signal from {}, expected {:?}",
                participant_id,
                self.remote_id()
            );
        }
        matches
    }

    // ========================================================================
    // TRANSITIONS
    // ========================================================================

    fn enter_connected(&mut self) {
        let generation = self.generation;
        let inputs = self.inputs.clone();
        self.timer.start(move |elapsed| {
            let _ = inputs.send(Input::Tick {
                generation,
                elapsed,
            });
        });
        if let Some(session) = self.session.as_mut() {
            session.connected_at = Some(Utc::now());
        }
        self.set_state(CallState::Connected);
    }

    /// Übergang nach `ended`, höchstens einmal pro Sitzung
    fn enter_ended(&mut self, cause: EndCause) {
        if !self.state().is_active() {
            return;
        }
        tracing::info!("Ending call: {:?}", cause);

        let duration = self.timer.stop().unwrap_or(0);
        if let Some(session) = self.session.as_mut() {
            session.ended_at = Some(Utc::now());
            session.duration_seconds = duration;
        }
        self.generation += 1;
        self.cleanup();
        self.set_state(CallState::Ended);

        if let EndCause::Error(err) = cause {
            self.emit(CallEvent::Error(err));
        }

        let linger = self.config.ended_linger();
        if linger.is_zero() {
            self.reset_to_idle();
        } else {
            let generation = self.generation;
            let inputs = self.inputs.clone();
            tokio::spawn(async move {
                tokio::time::sleep(linger).await;
                let _ = inputs.send(Input::ResetIdle { generation });
            });
        }
    }

    fn reset_to_idle(&mut self) {
        if self.state() != CallState::Ended {
            return;
        }
        self.cleanup();
        self.generation += 1;
        let finished = self.session.take();
        self.status.write().last = finished;
        self.set_state(CallState::Idle);
    }

    /// Gibt alle Sitzungsressourcen frei (idempotent)
    fn cleanup(&mut self) {
        self.timer.stop();
        if let Some(negotiator) = self.negotiator.take() {
            negotiator.close();
        }
        if let Some(stream) = self.stream.take() {
            self.media.release(&stream);
        }
        self.remote_stream = None;
        self.inbound_backlog.clear();
        self.outbound_backlog.clear();
        self.announced = false;
        self.muted = false;
        if let Some(op) = self.pending.take() {
            self.respond(op.reply, Err(StateErrorKind::SessionChanged.into()));
        }
    }

    fn flush_backlogs(&mut self) {
        let outbound = std::mem::take(&mut self.outbound_backlog);
        if let Some(client) = self.signaling.as_ref() {
            for payload in outbound {
                if let Err(e) = client.send_negotiation(payload) {
                    tracing::warn!("Failed to forward negotiation payload: {}", e);
                }
            }
        }

        let inbound = std::mem::take(&mut self.inbound_backlog);
        if let Some(negotiator) = self.negotiator.as_ref() {
            for payload in inbound {
                negotiator.signal(payload);
            }
        }
    }

    // ========================================================================
    // SIGNALING HELPERS
    // ========================================================================

    fn session_route(&self) -> Option<(String, String)> {
        self.session
            .as_ref()
            .map(|s| (s.remote_participant_id.clone(), s.room_id.clone()))
    }

    fn send_start(&self) -> Result<(), CallError> {
        let client = self
            .signaling
            .as_ref()
            .ok_or_else(|| CallError::Connection("not connected".to_string()))?;
        let (target, room) = self
            .session_route()
            .ok_or(CallError::State(StateErrorKind::NoActiveCall))?;
        client.start_call(&target, &room)?;
        Ok(())
    }

    fn send_answer(&self) -> Result<(), CallError> {
        let client = self
            .signaling
            .as_ref()
            .ok_or_else(|| CallError::Connection("not connected".to_string()))?;
        let (caller, room) = self
            .session_route()
            .ok_or(CallError::State(StateErrorKind::NoActiveCall))?;
        client.answer_call(&caller, &room)?;
        Ok(())
    }

    /// Best effort: die Gegenseite über die Ablehnung informieren
    fn send_reject(&self) {
        if let (Some(client), Some((caller, room))) = (self.signaling.as_ref(), self.session_route())
        {
            if let Err(e) = client.reject_call(&caller, &room) {
                tracing::warn!("Failed to send reject-call: {}", e);
            }
        }
    }

    /// Best effort: `end-call` senden, falls die Gegenseite vom Anruf weiß
    fn send_end(&self) {
        if !self.announced && self.state() != CallState::Connected {
            return;
        }
        if let Some(client) = self.signaling.as_ref() {
            if let Err(e) = client.end_call() {
                tracing::warn!("Failed to send end-call: {}", e);
            }
        }
    }

    // ========================================================================
    // PREPARATION
    // ========================================================================

    /// Mikrofon + Negotiator vorbereiten, gebunden an die aktuelle Generation
    fn spawn_prepare(&self, initiator: bool) {
        let generation = self.generation;
        let media = self.media.clone();
        let factory = Arc::clone(&self.negotiators);
        let inputs = self.inputs.clone();

        let sink_inputs = self.inputs.clone();
        let sink = NegotiatorSink::new(move |event| {
            let _ = sink_inputs.send(Input::Negotiator { generation, event });
        });

        tokio::spawn(async move {
            let result = prepare(media, factory, initiator, sink).await;
            let _ = inputs.send(Input::Prepared { generation, result });
        });
    }

    // ========================================================================
    // STATUS
    // ========================================================================

    fn publish(&self) {
        let mut status = self.status.write();
        status.state = self.state();
        status.connected_since = if status.state == CallState::Connected {
            self.timer.started_at()
        } else {
            None
        };
        status.duration = self
            .session
            .as_ref()
            .map(|s| s.duration_seconds)
            .unwrap_or(0);
        status.has_local_stream = self.stream.is_some();
        status.has_remote_stream = self.remote_stream.is_some();
        status.muted = self.muted;
        status.initialized = self.signaling.is_some();
        status.current = self.session.clone();
    }
}
