//! In-Memory Kollaborateure für Integrationstests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pulse_call::call_engine::{
    LocalAudioTrack, MediaDevices, MediaError, MediaStreamHandle, NegotiationError,
    NegotiationPayload, Negotiator, NegotiatorEvent, NegotiatorFactory, NegotiatorSink,
};
use pulse_call::signaling::{RelayConnector, RelayLink, SignalingError};
use pulse_call::{CallConfig, CallError, CallEvent, CallSessionManager, CallState};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

// ============================================================================
// MEDIA
// ============================================================================

#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    pub opened: AtomicUsize,
    gate: Mutex<Option<oneshot::Receiver<()>>>,
}

impl FakeDevices {
    /// Hält das nächste Öffnen an, bis der Sender feuert oder fällt
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.gate.lock() = Some(rx);
        tx
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn open_microphone(&self) -> Result<MediaStreamHandle, MediaError> {
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied("denied".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(MediaStreamHandle::new(LocalAudioTrack::new(), || {}))
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

#[derive(Clone)]
pub struct FakePeer {
    pub initiator: bool,
    pub sink: NegotiatorSink,
    pub received: Arc<Mutex<Vec<NegotiationPayload>>>,
    pub closed: Arc<AtomicBool>,
}

impl FakePeer {
    pub fn received(&self) -> Vec<Value> {
        self.received
            .lock()
            .iter()
            .map(|p| p.as_value().clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeNegotiator {
    received: Arc<Mutex<Vec<NegotiationPayload>>>,
    closed: Arc<AtomicBool>,
}

impl Negotiator for FakeNegotiator {
    fn signal(&self, payload: NegotiationPayload) {
        self.received.lock().push(payload);
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Der Initiator erzeugt beim Anlegen sofort ein Offer
#[derive(Default)]
pub struct FakeNegotiators {
    pub fail_next: AtomicBool,
    /// Wird beim nächsten Anlegen direkt über den Sink gemeldet
    pub emit_on_create: Mutex<Option<NegotiatorEvent>>,
    peers: Mutex<Vec<FakePeer>>,
}

impl FakeNegotiators {
    pub fn peers(&self) -> Vec<FakePeer> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> FakePeer {
        self.peers.lock().last().cloned().expect("no negotiator created")
    }
}

pub fn offer() -> Value {
    json!({"type": "offer", "sdp": "v=0 fake-offer"})
}

#[async_trait]
impl NegotiatorFactory for FakeNegotiators {
    async fn create(
        &self,
        initiator: bool,
        _local: &MediaStreamHandle,
        sink: NegotiatorSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(NegotiationError::Setup("no codecs".into()));
        }
        let peer = FakePeer {
            initiator,
            sink: sink.clone(),
            received: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
        };
        self.peers.lock().push(peer.clone());
        if initiator {
            sink.emit(NegotiatorEvent::OutboundSignal(NegotiationPayload::new(offer())));
        }
        if let Some(event) = self.emit_on_create.lock().take() {
            sink.emit(event);
        }
        Ok(Box::new(FakeNegotiator {
            received: peer.received,
            closed: peer.closed,
        }))
    }
}

// ============================================================================
// RELAY
// ============================================================================

/// Gegenseite einer Relay-Verbindung aus Sicht des Tests
pub struct RemoteRelay {
    sent: mpsc::Receiver<String>,
    inject: Option<mpsc::Sender<String>>,
}

impl RemoteRelay {
    /// Nächste Nachricht des Clients
    pub async fn next_sent(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(5), self.sent.recv())
            .await
            .expect("timed out waiting for client message")
            .expect("client link closed");
        serde_json::from_str(&text).expect("client sent invalid json")
    }

    /// Nächste Nachricht eines bestimmten Typs, andere werden übersprungen
    pub async fn next_of_type(&mut self, kind: &str) -> Value {
        loop {
            let msg = self.next_sent().await;
            if msg["type"] == kind {
                return msg;
            }
        }
    }

    /// Alle bisher gesendeten Nachrichten
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(serde_json::from_str(&text).expect("client sent invalid json"));
        }
        out
    }

    pub async fn inject(&self, msg: Value) {
        self.inject
            .as_ref()
            .expect("relay already dropped")
            .send(msg.to_string())
            .await
            .expect("client stopped reading");
    }

    /// Simuliert den Verbindungsabbruch durch das Relay
    pub fn drop_connection(&mut self) {
        self.inject = None;
    }
}

#[derive(Default)]
pub struct MemoryRelay {
    pub connects: AtomicUsize,
    pub refuse: AtomicBool,
    remote: Mutex<Option<RemoteRelay>>,
}

impl MemoryRelay {
    pub fn take_remote(&self) -> RemoteRelay {
        self.remote.lock().take().expect("client never connected")
    }
}

#[async_trait]
impl RelayConnector for MemoryRelay {
    async fn connect(&self, _url: &str, queue: usize) -> Result<RelayLink, SignalingError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SignalingError::ConnectionFailed("connection refused".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(queue);
        let (in_tx, in_rx) = mpsc::channel(queue);
        *self.remote.lock() = Some(RemoteRelay {
            sent: out_rx,
            inject: Some(in_tx),
        });
        Ok(RelayLink {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

// ============================================================================
// HARNESS
// ============================================================================

pub struct Harness {
    pub manager: CallSessionManager,
    pub events: broadcast::Receiver<CallEvent>,
    pub devices: Arc<FakeDevices>,
    pub negotiators: Arc<FakeNegotiators>,
    pub relay: Arc<MemoryRelay>,
}

pub fn test_config() -> CallConfig {
    CallConfig {
        signaling_url: "ws://relay.test".into(),
        ended_linger_ms: 500,
        heartbeat_secs: None,
        ..CallConfig::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CallConfig) -> Self {
        let devices = Arc::new(FakeDevices::default());
        let negotiators = Arc::new(FakeNegotiators::default());
        let relay = Arc::new(MemoryRelay::default());
        let manager = CallSessionManager::new(
            config,
            devices.clone(),
            negotiators.clone(),
            relay.clone(),
        );
        let events = manager.subscribe();
        Self {
            manager,
            events,
            devices,
            negotiators,
            relay,
        }
    }

    /// Initialisiert als `user` und gibt die Relay-Gegenseite zurück
    pub async fn connect(&mut self, user: &str) -> RemoteRelay {
        self.manager
            .initialize(user, "room-1")
            .await
            .expect("initialize failed");
        let mut remote = self.relay.take_remote();
        let join = remote.next_sent().await;
        assert_eq!(join["type"], "join-room");
        remote
    }

    /// Wartet auf den nächsten Zustandswechsel nach `state`
    pub async fn wait_for_state(&mut self, state: CallState) {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(CallEvent::StateChanged(s)) if s == state => return,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {}", state));
    }

    /// Wartet auf den nächsten gemeldeten Fehler
    pub async fn wait_for_error(&mut self) -> CallError {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(CallEvent::Error(err)) => return err,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for an error event")
    }

    /// Wartet auf den nächsten Dauer-Tick
    pub async fn next_tick(&mut self) -> u64 {
        let events = &mut self.events;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(CallEvent::DurationTick(secs)) => return secs,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for a duration tick")
    }

    /// Alle bisher angefallenen Events
    pub fn drain_events(&mut self) -> Vec<CallEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Lässt die Engine alle anstehenden Events abarbeiten
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn incoming_call(caller: &str) -> Value {
    json!({"type": "incoming-call", "callerId": caller, "roomId": "room-1"})
}

pub fn call_answered(answerer: &str) -> Value {
    json!({"type": "call-answered", "answererId": answerer})
}

pub fn call_rejected(rejecter: &str) -> Value {
    json!({"type": "call-rejected", "rejecterId": rejecter})
}

pub fn call_ended(ender: &str) -> Value {
    json!({"type": "call-ended", "enderId": ender})
}

pub fn negotiation(sender: &str, payload: Value) -> Value {
    json!({"type": "negotiation-signal", "payload": payload, "senderId": sender})
}
