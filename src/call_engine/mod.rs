//! Call Engine Module - Anrufsteuerung
//!
//! Dieses Modul verwaltet:
//! - Die Zustandsmaschine eines 1:1 Audio-Anrufs
//! - Lokale Mikrofon-Streams
//! - Die Aushandlung der direkten Audio-Verbindung (WebRTC)
//! - Die Gesprächsdauer

mod audio;
mod engine;
mod error;
mod negotiator;
mod session;
mod timer;
mod webrtc;

pub use audio::{
    CpalMediaDevices, LocalAudioTrack, MediaDevices, MediaError, MediaSessionManager,
    MediaStreamHandle, CHANNELS, FRAME_SIZE, SAMPLE_RATE,
};
pub use engine::CallSessionManager;
pub use error::{CallError, StateErrorKind, TerminationKind};
pub use negotiator::{
    NegotiationError, NegotiationPayload, Negotiator, NegotiatorEvent, NegotiatorFactory,
    NegotiatorSink, RemoteStreamInfo,
};
pub use session::{CallDirection, CallEvent, CallSession, CallState, CallStatus};
pub use timer::{format_duration, CallTimer};
pub use webrtc::WebRtcNegotiatorFactory;
