//! WebRTC Negotiator
//!
//! Implementiert den Peer Connection Negotiator mit webrtc-rs.
//! Blobs auf dem Draht:
//! - `{"type": "offer" | "answer", "sdp": "..."}`
//! - `{"candidate": {"candidate": "...", "sdpMid": ..., "sdpMLineIndex": ...}}`

use super::audio::{MediaStreamHandle, SAMPLE_RATE};
use super::negotiator::{
    NegotiationError, NegotiationPayload, Negotiator, NegotiatorEvent, NegotiatorFactory,
    NegotiatorSink, RemoteStreamInfo,
};
use crate::config::CallConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

/// Blob-Format dieses Negotiators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WirePayload {
    Description {
        #[serde(rename = "type")]
        kind: String,
        sdp: String,
    },
    Candidate {
        candidate: RTCIceCandidateInit,
    },
}

impl WirePayload {
    fn into_payload(self) -> Result<NegotiationPayload, NegotiationError> {
        serde_json::to_value(self)
            .map(NegotiationPayload::new)
            .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))
    }
}

fn webrtc_err(e: webrtc::Error) -> NegotiationError {
    NegotiationError::Transport(e.to_string())
}

enum DriverCommand {
    Signal(NegotiationPayload),
    Close,
}

// ============================================================================
// FACTORY
// ============================================================================

/// Erzeugt WebRTC Peer Connections mit Opus-Audio-Track
#[derive(Debug, Clone)]
pub struct WebRtcNegotiatorFactory {
    ice_servers: Vec<RTCIceServer>,
    timeout: Duration,
}

impl WebRtcNegotiatorFactory {
    pub fn new(stun_urls: Vec<String>, timeout: Duration) -> Self {
        let ice_servers = if stun_urls.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: stun_urls,
                ..Default::default()
            }]
        };
        Self {
            ice_servers,
            timeout,
        }
    }

    pub fn from_config(config: &CallConfig) -> Self {
        Self::new(config.stun_urls.clone(), config.negotiation_timeout())
    }

    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(config)
            .await
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl NegotiatorFactory for WebRtcNegotiatorFactory {
    async fn create(
        &self,
        initiator: bool,
        local: &MediaStreamHandle,
        sink: NegotiatorSink,
    ) -> Result<Box<dyn Negotiator>, NegotiationError> {
        let pc = self.create_peer_connection().await?;
        let connected = Arc::new(AtomicBool::new(false));
        register_handlers(&pc, &sink, &connected);

        // TODO: Capture-Frames (LocalAudioTrack::read_frame) Opus-kodiert auf
        // diesen Track schreiben, sobald ein Opus-Encoder im Build verfügbar ist.
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            local.track().id().to_string(),
            local.id().to_string(),
        ));
        pc.add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::Setup(e.to_string()))?;

        if initiator {
            let offer = pc.create_offer(None).await.map_err(webrtc_err)?;
            pc.set_local_description(offer.clone())
                .await
                .map_err(webrtc_err)?;
            sink.emit(NegotiatorEvent::OutboundSignal(
                WirePayload::Description {
                    kind: "offer".to_string(),
                    sdp: offer.sdp,
                }
                .into_payload()?,
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        spawn_watchdog(self.timeout, Arc::clone(&connected), tx.downgrade(), sink.clone());
        tokio::spawn(drive(pc, rx, sink));

        tracing::info!("Peer connection created (initiator: {})", initiator);
        Ok(Box::new(WebRtcNegotiator { tx }))
    }
}

// ============================================================================
// NEGOTIATOR
// ============================================================================

/// Handle auf eine laufende WebRTC-Aushandlung
///
/// Fällt der Handle weg, schließt der Driver-Task die Peer Connection.
struct WebRtcNegotiator {
    tx: mpsc::UnboundedSender<DriverCommand>,
}

impl Negotiator for WebRtcNegotiator {
    fn signal(&self, payload: NegotiationPayload) {
        if self.tx.send(DriverCommand::Signal(payload)).is_err() {
            tracing::warn!("Dropping negotiation payload, peer connection already closed");
        }
    }

    fn close(&self) {
        let _ = self.tx.send(DriverCommand::Close);
    }
}

/// Arbeitet eingehende Blobs der Reihe nach ab
async fn drive(
    pc: Arc<RTCPeerConnection>,
    mut rx: mpsc::UnboundedReceiver<DriverCommand>,
    sink: NegotiatorSink,
) {
    while let Some(command) = rx.recv().await {
        match command {
            DriverCommand::Signal(payload) => {
                if let Err(e) = apply_remote(&pc, payload, &sink).await {
                    tracing::error!("Failed to apply negotiation payload: {}", e);
                    sink.emit(NegotiatorEvent::Error(e));
                }
            }
            DriverCommand::Close => break,
        }
    }

    if let Err(e) = pc.close().await {
        tracing::warn!("Failed to close peer connection: {}", e);
    }
    tracing::info!("Peer connection closed");
}

async fn apply_remote(
    pc: &RTCPeerConnection,
    payload: NegotiationPayload,
    sink: &NegotiatorSink,
) -> Result<(), NegotiationError> {
    let wire: WirePayload = serde_json::from_value(payload.into_value())
        .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))?;

    match wire {
        WirePayload::Description { kind, sdp } if kind == "offer" => {
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))?;
            pc.set_remote_description(offer).await.map_err(webrtc_err)?;

            let answer = pc.create_answer(None).await.map_err(webrtc_err)?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(webrtc_err)?;
            sink.emit(NegotiatorEvent::OutboundSignal(
                WirePayload::Description {
                    kind: "answer".to_string(),
                    sdp: answer.sdp,
                }
                .into_payload()?,
            ));
        }
        WirePayload::Description { kind, sdp } if kind == "answer" => {
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))?;
            pc.set_remote_description(answer).await.map_err(webrtc_err)?;
        }
        WirePayload::Description { kind, .. } => {
            return Err(NegotiationError::InvalidPayload(format!(
                "unsupported description type '{}'",
                kind
            )));
        }
        WirePayload::Candidate { candidate } => {
            pc.add_ice_candidate(candidate).await.map_err(webrtc_err)?;
        }
    }
    Ok(())
}

/// Registriert Event Handler für die Peer Connection
fn register_handlers(pc: &RTCPeerConnection, sink: &NegotiatorSink, connected: &Arc<AtomicBool>) {
    let state_sink = sink.clone();
    let connected = Arc::clone(connected);
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        match s {
            RTCPeerConnectionState::Connected => {
                connected.store(true, Ordering::SeqCst);
                state_sink.emit(NegotiatorEvent::Connect);
            }
            RTCPeerConnectionState::Failed => {
                state_sink.emit(NegotiatorEvent::Error(NegotiationError::Transport(
                    "peer connection failed".to_string(),
                )));
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Closed => {
                state_sink.emit(NegotiatorEvent::Close);
            }
            _ => {}
        }
        Box::pin(async {})
    }));

    let candidate_sink = sink.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json().map(|candidate| WirePayload::Candidate { candidate }) {
                Ok(wire) => match wire.into_payload() {
                    Ok(payload) => candidate_sink.emit(NegotiatorEvent::OutboundSignal(payload)),
                    Err(e) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                },
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    let track_sink = sink.clone();
    pc.on_track(Box::new(move |track, _, _| {
        let info = RemoteStreamInfo {
            stream_id: track.stream_id(),
            track_id: track.id(),
            codec: track.codec().capability.mime_type,
        };
        tracing::info!("Received remote track: {:?}", info);
        track_sink.emit(NegotiatorEvent::RemoteStream(info));
        Box::pin(async {})
    }));
}

/// Meldet einen Timeout, wenn der Pfad nicht rechtzeitig steht
fn spawn_watchdog(
    timeout: Duration,
    connected: Arc<AtomicBool>,
    alive: mpsc::WeakUnboundedSender<DriverCommand>,
    sink: NegotiatorSink,
) {
    if timeout.is_zero() {
        return;
    }
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        if !connected.load(Ordering::SeqCst) && alive.upgrade().is_some() {
            tracing::warn!("Negotiation timed out after {:?}", timeout);
            sink.emit(NegotiatorEvent::Error(NegotiationError::Timeout(
                timeout.as_secs(),
            )));
        }
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_description_payload() {
        let wire: WirePayload =
            serde_json::from_value(json!({ "type": "offer", "sdp": "v=0\r\n" })).unwrap();
        assert!(matches!(wire, WirePayload::Description { ref kind, .. } if kind == "offer"));
    }

    #[test]
    fn test_parse_candidate_payload() {
        let wire: WirePayload = serde_json::from_value(json!({
            "candidate": {
                "candidate": "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }))
        .unwrap();
        match wire {
            WirePayload::Candidate { candidate } => {
                assert!(candidate.candidate.starts_with("candidate:1"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_description_roundtrips_as_opaque_payload() {
        let payload = WirePayload::Description {
            kind: "answer".into(),
            sdp: "v=0\r\n".into(),
        }
        .into_payload()
        .unwrap();
        assert_eq!(payload.as_value(), &json!({ "type": "answer", "sdp": "v=0\r\n" }));
    }

    #[tokio::test]
    async fn test_initiator_emits_offer() {
        use crate::call_engine::audio::LocalAudioTrack;
        use parking_lot::Mutex;

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&events);
        let sink = NegotiatorSink::new(move |event| recorded.lock().push(event));

        let factory = WebRtcNegotiatorFactory::new(Vec::new(), Duration::ZERO);
        let handle = MediaStreamHandle::new(LocalAudioTrack::new(), || {});
        let negotiator = factory.create(true, &handle, sink).await.unwrap();

        let offer = events.lock().iter().find_map(|e| match e {
            NegotiatorEvent::OutboundSignal(p) => Some(p.clone()),
            _ => None,
        });
        let offer = offer.expect("initiator must emit an offer");
        assert_eq!(offer.as_value()["type"], "offer");
        negotiator.close();
    }

    #[tokio::test]
    async fn test_unanswered_offer_times_out() {
        use crate::call_engine::audio::LocalAudioTrack;
        use parking_lot::Mutex;

        let events = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&events);
        let sink = NegotiatorSink::new(move |event| recorded.lock().push(event));

        let factory = WebRtcNegotiatorFactory::new(Vec::new(), Duration::from_secs(1));
        let handle = MediaStreamHandle::new(LocalAudioTrack::new(), || {});
        let negotiator = factory.create(true, &handle, sink).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let errors: Vec<_> = events
            .lock()
            .iter()
            .filter(|e| matches!(e, NegotiatorEvent::Error(_)))
            .cloned()
            .collect();
        assert_eq!(
            errors,
            vec![NegotiatorEvent::Error(NegotiationError::Timeout(1))]
        );
        negotiator.close();
    }
}
