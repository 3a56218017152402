//! Signaling Client
//!
//! Verwaltet die Verbindung zum Relay:
//! - Raum betreten (`join-room`)
//! - Nachrichten signieren und senden
//! - Eingehende Nachrichten parsen und als `SignalingEvent` weiterleiten
//! - Heartbeat-Keeping
//!
//! Es gibt keine automatische Reconnection. Ein Verbindungsabbruch wird als
//! `SignalingEvent::Disconnected` gemeldet.

use super::messages::*;
use super::transport::RelayConnector;
use crate::crypto::SigningIdentity;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Relay connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to signaling relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// SIGNALING EVENTS
// ============================================================================

/// Events die vom SignalingClient ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// Eingehender Anruf
    IncomingCall {
        caller_id: String,
        room_id: Option<String>,
    },

    /// Anruf angenommen
    CallAnswered { answerer_id: String },

    /// Anruf abgelehnt
    CallRejected { rejecter_id: String },

    /// Anruf beendet
    CallEnded { ender_id: String },

    /// Aushandlungs-Blob erhalten
    NegotiationSignal {
        payload: NegotiationPayload,
        sender_id: Option<String>,
    },

    /// Fehler vom Relay (nicht fatal)
    RelayError { code: i32, message: String },

    /// Verbindung getrennt
    Disconnected,
}

impl SignalingEvent {
    fn from_relay(msg: RelayMessage) -> Option<Self> {
        let event = match msg {
            RelayMessage::IncomingCall { caller_id, room_id } => {
                SignalingEvent::IncomingCall { caller_id, room_id }
            }
            RelayMessage::CallAnswered { answerer_id } => {
                SignalingEvent::CallAnswered { answerer_id }
            }
            RelayMessage::CallRejected { rejecter_id } => {
                SignalingEvent::CallRejected { rejecter_id }
            }
            RelayMessage::CallEnded { ender_id } => SignalingEvent::CallEnded { ender_id },
            RelayMessage::NegotiationSignal { payload, sender_id } => {
                SignalingEvent::NegotiationSignal { payload, sender_id }
            }
            RelayMessage::Error { code, message } => {
                tracing::error!("Relay error {}: {}", code, message);
                SignalingEvent::RelayError { code, message }
            }
            // Heartbeat-Response - nichts zu tun
            RelayMessage::Pong => return None,
        };
        Some(event)
    }
}

// ============================================================================
// CLIENT STATE
// ============================================================================

#[derive(Debug, Clone, Default)]
struct ClientState {
    is_connected: bool,
    user_id: Option<String>,
    room_id: Option<String>,
}

// ============================================================================
// SIGNALING CLIENT
// ============================================================================

/// Client für die Kommunikation mit dem Signaling-Relay
pub struct SignalingClient {
    server_url: String,
    connector: Arc<dyn RelayConnector>,
    identity: Arc<SigningIdentity>,
    queue: usize,
    heartbeat: Option<Duration>,
    state: Arc<RwLock<ClientState>>,
    tx: Option<mpsc::Sender<String>>,
}

impl SignalingClient {
    /// Erstellt einen neuen SignalingClient
    pub fn new(
        server_url: String,
        connector: Arc<dyn RelayConnector>,
        identity: Arc<SigningIdentity>,
    ) -> Self {
        Self {
            server_url,
            connector,
            identity,
            queue: 100,
            heartbeat: None,
            state: Arc::new(RwLock::new(ClientState::default())),
            tx: None,
        }
    }

    /// Größe der ausgehenden Queue
    pub fn with_queue(mut self, queue: usize) -> Self {
        self.queue = queue.max(1);
        self
    }

    /// Heartbeat-Intervall, `None` schaltet ihn ab
    pub fn with_heartbeat(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat = interval;
        self
    }

    /// Prüft ob verbunden
    pub fn is_connected(&self) -> bool {
        self.state.read().is_connected
    }

    pub fn user_id(&self) -> Option<String> {
        self.state.read().user_id.clone()
    }

    pub fn room_id(&self) -> Option<String> {
        self.state.read().room_id.clone()
    }

    /// Verbindet mit dem Relay und betritt den Raum
    ///
    /// Gibt den Event-Stream dieser Verbindung zurück. Er endet mit
    /// `SignalingEvent::Disconnected`, wenn das Relay die Verbindung verliert.
    pub async fn connect(
        &mut self,
        user_id: String,
        room_id: String,
    ) -> Result<mpsc::UnboundedReceiver<SignalingEvent>, SignalingError> {
        let link = self.connector.connect(&self.server_url, self.queue).await?;
        let mut inbound = link.inbound;
        self.tx = Some(link.outbound.clone());

        {
            let mut state = self.state.write();
            state.is_connected = true;
            state.user_id = Some(user_id.clone());
            state.room_id = Some(room_id.clone());
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Read-Task starten
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                let msg = match serde_json::from_str::<RelayMessage>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        tracing::warn!("Ignoring unparsable relay message: {}", e);
                        continue;
                    }
                };
                tracing::debug!("Relay message: {:?}", msg);
                if let Some(event) = SignalingEvent::from_relay(msg) {
                    if event_tx.send(event).is_err() {
                        return;
                    }
                }
            }

            state.write().is_connected = false;
            tracing::info!("Signaling relay disconnected");
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        self.send(ClientMessage::JoinRoom {
            user_id: user_id.clone(),
            room_id,
            public_key: self.identity.public_key_base64(),
        })?;

        if let Some(interval) = self.heartbeat {
            self.start_heartbeat(&link.outbound, interval);
        }

        tracing::info!("Joined signaling room as {}", user_id);
        Ok(event_rx)
    }

    /// Trennt die Verbindung, ausstehende Nachrichten werden noch geschrieben
    pub fn disconnect(&mut self) {
        if self.tx.take().is_some() {
            tracing::info!("Disconnecting from signaling relay");
        }
        self.state.write().is_connected = false;
    }

    /// Sendet eine Nachricht (non-blocking, verwendet try_send)
    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        let tx = self.tx.as_ref().ok_or(SignalingError::NotConnected)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }

        let kind = message.kind();
        let sealed = {
            let state = self.state.read();
            seal(
                &self.identity,
                state.user_id.as_deref(),
                state.room_id.as_deref(),
                &message,
            )?
        };

        tx.try_send(sealed)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        tracing::debug!("Sent {}", kind);
        Ok(())
    }

    /// Lokale User-ID, nur gültig nach `connect`
    fn local_id(&self) -> Result<String, SignalingError> {
        self.user_id().ok_or(SignalingError::NotConnected)
    }

    /// Ruft `target_user_id` an
    pub fn start_call(&self, target_user_id: &str, room_id: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::StartCall {
            target_user_id: target_user_id.to_string(),
            room_id: room_id.to_string(),
            caller_id: self.local_id()?,
        })
    }

    /// Nimmt den Anruf von `caller_id` an
    pub fn answer_call(&self, caller_id: &str, room_id: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::AnswerCall {
            caller_id: caller_id.to_string(),
            room_id: room_id.to_string(),
            answerer_id: self.local_id()?,
        })
    }

    /// Lehnt den Anruf von `caller_id` ab
    pub fn reject_call(&self, caller_id: &str, room_id: &str) -> Result<(), SignalingError> {
        self.send(ClientMessage::RejectCall {
            caller_id: caller_id.to_string(),
            room_id: room_id.to_string(),
            rejecter_id: self.local_id()?,
        })
    }

    /// Beendet den laufenden Anruf
    pub fn end_call(&self) -> Result<(), SignalingError> {
        self.send(ClientMessage::EndCall {
            ender_id: self.local_id()?,
        })
    }

    /// Leitet einen Aushandlungs-Blob an die Gegenseite weiter
    pub fn send_negotiation(&self, payload: NegotiationPayload) -> Result<(), SignalingError> {
        self.send(ClientMessage::NegotiationSignal { payload })
    }

    /// Startet den Heartbeat-Task
    ///
    /// Hält nur einen schwachen Sender, damit `disconnect` die Verbindung
    /// wirklich schließt.
    fn start_heartbeat(&self, outbound: &mpsc::Sender<String>, interval: Duration) {
        let weak = outbound.downgrade();
        let identity = Arc::clone(&self.identity);
        let state = Arc::clone(&self.state);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // Der erste Tick kommt sofort
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(tx) = weak.upgrade() else {
                    tracing::info!("Heartbeat: link closed, stopping heartbeat task");
                    break;
                };

                let sealed = {
                    let state = state.read();
                    if !state.is_connected {
                        break;
                    }
                    let Some(user_id) = state.user_id.clone() else {
                        break;
                    };
                    seal(
                        &identity,
                        Some(&user_id),
                        state.room_id.as_deref(),
                        &ClientMessage::Heartbeat { user_id: user_id.clone() },
                    )
                };

                match sealed {
                    Ok(msg) => {
                        if let Err(e) = tx.try_send(msg) {
                            tracing::warn!("Failed to send heartbeat: {}", e);
                        }
                    }
                    Err(e) => tracing::warn!("Failed to seal heartbeat: {}", e),
                }
            }
        });
    }
}

/// Ergänzt den Envelope und signiert die Nachricht
///
/// Felder der Nachricht selbst (z.B. `roomId` bei `start-call`) haben
/// Vorrang vor den Envelope-Feldern.
fn seal(
    identity: &SigningIdentity,
    sender_id: Option<&str>,
    room_id: Option<&str>,
    message: &ClientMessage,
) -> Result<String, SignalingError> {
    let mut envelope =
        serde_json::to_value(message).map_err(|e| SignalingError::SendFailed(e.to_string()))?;

    let Some(obj) = envelope.as_object_mut() else {
        return Err(SignalingError::SendFailed(
            "message is not a JSON object".to_string(),
        ));
    };
    if let Some(sender_id) = sender_id {
        obj.entry("senderId")
            .or_insert_with(|| Value::String(sender_id.to_string()));
    }
    if let Some(room_id) = room_id {
        obj.entry("roomId")
            .or_insert_with(|| Value::String(room_id.to_string()));
    }
    obj.insert(
        "timestamp".to_string(),
        Value::Number(Utc::now().timestamp_millis().into()),
    );

    let signature = identity.sign_envelope(&envelope);
    if let Some(obj) = envelope.as_object_mut() {
        obj.insert("signature".to_string(), Value::String(signature));
    }

    serde_json::to_string(&envelope).map_err(|e| SignalingError::SendFailed(e.to_string()))
}

impl std::fmt::Debug for SignalingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingClient")
            .field("server_url", &self.server_url)
            .field("state", &*self.state.read())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_envelope;
    use crate::signaling::transport::RelayLink;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Connector, der die Gegenseite des Links an den Test herausgibt
    #[derive(Default)]
    struct LoopbackConnector {
        remote: Mutex<Option<(mpsc::Receiver<String>, mpsc::Sender<String>)>>,
    }

    #[async_trait]
    impl RelayConnector for LoopbackConnector {
        async fn connect(&self, _url: &str, queue: usize) -> Result<RelayLink, SignalingError> {
            let (out_tx, out_rx) = mpsc::channel(queue);
            let (in_tx, in_rx) = mpsc::channel(queue);
            *self.remote.lock() = Some((out_rx, in_tx));
            Ok(RelayLink {
                outbound: out_tx,
                inbound: in_rx,
            })
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl RelayConnector for FailingConnector {
        async fn connect(&self, _url: &str, _queue: usize) -> Result<RelayLink, SignalingError> {
            Err(SignalingError::ConnectionFailed("refused".into()))
        }
    }

    fn client(connector: Arc<dyn RelayConnector>) -> (SignalingClient, Arc<SigningIdentity>) {
        let identity = Arc::new(SigningIdentity::generate());
        (
            SignalingClient::new("ws://relay".into(), connector, Arc::clone(&identity)),
            identity,
        )
    }

    #[tokio::test]
    async fn test_connect_sends_signed_join() {
        let connector = Arc::new(LoopbackConnector::default());
        let (mut client, identity) = client(connector.clone());

        let _events = client.connect("alice".into(), "room-1".into()).await.unwrap();
        let (mut sent, _inject) = connector.remote.lock().take().unwrap();

        let join: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(join["type"], "join-room");
        assert_eq!(join["userId"], "alice");
        assert_eq!(join["roomId"], "room-1");
        assert_eq!(join["senderId"], "alice");
        assert_eq!(join["publicKey"], identity.public_key_base64());
        assert!(verify_envelope(&identity.public_key_base64(), &join).is_ok());
    }

    #[tokio::test]
    async fn test_message_room_takes_precedence_over_envelope() {
        let connector = Arc::new(LoopbackConnector::default());
        let (mut client, _) = client(connector.clone());
        let _events = client.connect("alice".into(), "lobby".into()).await.unwrap();
        let (mut sent, _inject) = connector.remote.lock().take().unwrap();
        let _join = sent.recv().await.unwrap();

        client.start_call("bob", "room-7").unwrap();
        let msg: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "start-call");
        assert_eq!(msg["targetUserId"], "bob");
        assert_eq!(msg["callerId"], "alice");
        assert_eq!(msg["roomId"], "room-7");

        client.end_call().unwrap();
        let msg: Value = serde_json::from_str(&sent.recv().await.unwrap()).unwrap();
        assert_eq!(msg["type"], "end-call");
        assert_eq!(msg["enderId"], "alice");
        assert_eq!(msg["roomId"], "lobby");
    }

    #[tokio::test]
    async fn test_inbound_dispatch_and_disconnect() {
        let connector = Arc::new(LoopbackConnector::default());
        let (mut client, _) = client(connector.clone());
        let mut events = client.connect("alice".into(), "room-1".into()).await.unwrap();
        let (_sent, inject) = connector.remote.lock().take().unwrap();

        inject
            .send(r#"{"type":"incoming-call","callerId":"carol"}"#.into())
            .await
            .unwrap();
        inject.send("garbage".into()).await.unwrap();
        inject.send(r#"{"type":"pong"}"#.into()).await.unwrap();
        inject
            .send(r#"{"type":"call-ended","enderId":"carol"}"#.into())
            .await
            .unwrap();
        drop(inject);

        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::IncomingCall {
                caller_id: "carol".into(),
                room_id: None
            })
        );
        assert_eq!(
            events.recv().await,
            Some(SignalingEvent::CallEnded {
                ender_id: "carol".into()
            })
        );
        assert_eq!(events.recv().await, Some(SignalingEvent::Disconnected));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let (client, _) = client(Arc::new(LoopbackConnector::default()));
        assert!(matches!(
            client.end_call(),
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (mut client, _) = client(Arc::new(FailingConnector));
        assert!(matches!(
            client.connect("alice".into(), "room-1".into()).await,
            Err(SignalingError::ConnectionFailed(_))
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_closes_link() {
        let connector = Arc::new(LoopbackConnector::default());
        let (mut client, _) = client(connector.clone());
        let _events = client.connect("alice".into(), "room-1".into()).await.unwrap();
        let (mut sent, _inject) = connector.remote.lock().take().unwrap();
        let _join = sent.recv().await.unwrap();

        client.disconnect();
        assert_eq!(sent.recv().await, None);
        assert!(matches!(
            client.end_call(),
            Err(SignalingError::NotConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_is_signed_and_stops_on_disconnect() {
        let connector = Arc::new(LoopbackConnector::default());
        let (client, identity) = client(connector.clone());
        let mut client = client.with_heartbeat(Some(Duration::from_secs(25)));
        let _events = client.connect("alice".into(), "room-1".into()).await.unwrap();
        let (mut sent, _inject) = connector.remote.lock().take().unwrap();
        let _join = sent.recv().await.unwrap();

        tokio::time::sleep(Duration::from_secs(26)).await;
        let beat: Value = serde_json::from_str(&sent.try_recv().unwrap()).unwrap();
        assert_eq!(beat["type"], "heartbeat");
        assert_eq!(beat["userId"], "alice");
        assert!(verify_envelope(&identity.public_key_base64(), &beat).is_ok());
        assert!(sent.try_recv().is_err());

        client.disconnect();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sent.recv().await, None);
    }
}
