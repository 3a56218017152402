//! Media Session Manager - Mikrofon Capture
//!
//! Verwendet cpal für Cross-Platform Audio Input. Der `MediaStreamHandle`
//! gehört exklusiv der laufenden Sitzung und wird genau einmal freigegeben.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für den Capture-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// LOCAL AUDIO TRACK
// ============================================================================

/// Der aufgenommene Audio-Track
///
/// Klone teilen sich denselben Zustand, so kann der Negotiator den Track
/// lesen, während der Stream selbst beim Media Session Manager bleibt.
#[derive(Clone)]
pub struct LocalAudioTrack {
    id: String,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
    capture: Arc<Mutex<HeapRb<f32>>>,
    level: Arc<Mutex<f32>>,
}

impl LocalAudioTrack {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
            capture: Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE))),
            level: Arc::new(Mutex::new(0.0)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// `false` solange stummgeschaltet
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `false` sobald der Stream freigegeben wurde
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Eingangspegel (RMS, 0.0 - 1.0)
    pub fn level(&self) -> f32 {
        *self.level.lock()
    }

    /// Schreibt aufgenommene Samples, verwirft sie wenn stumm oder beendet
    pub fn push_samples(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let rms = (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt();
        *self.level.lock() = rms.min(1.0);

        if !self.is_enabled() || !self.is_live() {
            return;
        }
        let mut buffer = self.capture.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Liest einen vollen Frame (`FRAME_SIZE` Samples), falls vorhanden
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture.lock();
        if buffer.occupied_len() < FRAME_SIZE {
            return None;
        }
        Some((0..FRAME_SIZE).filter_map(|_| buffer.try_pop()).collect())
    }
}

impl Default for LocalAudioTrack {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM HANDLE
// ============================================================================

type StopFn = Box<dyn FnOnce() + Send>;

/// Handle auf den lokalen Mikrofon-Stream
///
/// Nicht klonbar: es gibt genau einen Besitzer. Das Freigeben ist
/// idempotent, spätestens `Drop` gibt den Stream frei.
pub struct MediaStreamHandle {
    id: Uuid,
    track: LocalAudioTrack,
    stop: Mutex<Option<StopFn>>,
    ledger: Option<Arc<AtomicUsize>>,
}

impl MediaStreamHandle {
    /// `on_stop` läuft genau einmal, beim ersten Freigeben
    pub fn new(track: LocalAudioTrack, on_stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            track,
            stop: Mutex::new(Some(Box::new(on_stop))),
            ledger: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn track(&self) -> &LocalAudioTrack {
        &self.track
    }

    /// Anzahl noch aktiver Tracks (0 nach dem Freigeben)
    pub fn active_tracks(&self) -> usize {
        usize::from(self.track.is_live())
    }

    /// Gibt `true` zurück, wenn dieser Aufruf den Stream gestoppt hat
    fn stop(&self) -> bool {
        let Some(stop) = self.stop.lock().take() else {
            return false;
        };
        self.track.live.store(false, Ordering::SeqCst);
        stop();
        if let Some(ledger) = &self.ledger {
            ledger.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }
}

impl Drop for MediaStreamHandle {
    fn drop(&mut self) {
        if self.stop() {
            tracing::debug!("Media stream {} released on drop", self.id);
        }
    }
}

impl std::fmt::Debug for MediaStreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreamHandle")
            .field("id", &self.id)
            .field("track", &self.track)
            .finish()
    }
}

// ============================================================================
// MEDIA DEVICES
// ============================================================================

/// Quelle für lokale Audio-Streams
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Öffnet das Mikrofon, schlägt bei fehlender Berechtigung fehl
    async fn open_microphone(&self) -> Result<MediaStreamHandle, MediaError>;
}

// ============================================================================
// MEDIA SESSION MANAGER
// ============================================================================

/// Erwirbt und gibt lokale Audio-Streams frei
#[derive(Clone)]
pub struct MediaSessionManager {
    devices: Arc<dyn MediaDevices>,
    live: Arc<AtomicUsize>,
}

impl MediaSessionManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Erwirbt einen Mikrofon-Stream (einzige suspendierende Operation)
    pub async fn acquire(&self) -> Result<MediaStreamHandle, MediaError> {
        let mut handle = self.devices.open_microphone().await?;
        if handle.track.is_live() && handle.ledger.is_none() {
            self.live.fetch_add(1, Ordering::SeqCst);
            handle.ledger = Some(Arc::clone(&self.live));
        }
        tracing::info!("Acquired local audio stream {}", handle.id);
        Ok(handle)
    }

    /// Gibt den Stream frei, no-op wenn bereits freigegeben
    pub fn release(&self, handle: &MediaStreamHandle) {
        if handle.stop() {
            tracing::info!("Released local audio stream {}", handle.id);
        }
    }

    /// Schaltet den aufgenommenen Track stumm oder wieder an
    pub fn set_muted(&self, handle: &MediaStreamHandle, muted: bool) {
        handle.track.enabled.store(!muted, Ordering::SeqCst);
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self, handle: &MediaStreamHandle) -> bool {
        !handle.track.is_enabled()
    }

    /// Anzahl der aktuell gehaltenen Streams
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSessionManager")
            .field("live_streams", &self.live_streams())
            .finish()
    }
}

// ============================================================================
// CPAL BACKEND
// ============================================================================

/// Standard-Mikrofon über cpal
///
/// cpal-Streams sind nicht `Send`, daher lebt jeder Stream auf einem eigenen
/// Thread, bis sein Handle freigegeben wird.
#[derive(Debug, Default, Clone)]
pub struct CpalMediaDevices;

#[async_trait]
impl MediaDevices for CpalMediaDevices {
    async fn open_microphone(&self) -> Result<MediaStreamHandle, MediaError> {
        let track = LocalAudioTrack::new();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let capture_track = track.clone();
        std::thread::Builder::new()
            .name("pulse-capture".to_string())
            .spawn(move || {
                let stream = match build_capture_stream(capture_track) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    // Aufrufer ist weg, Stream sofort wieder schließen
                    return;
                }
                // Blockiert bis zum Freigeben (oder bis der Handle verschwindet)
                let _ = stop_rx.recv();
                drop(stream);
                tracing::info!("Audio capture stopped");
            })
            .map_err(|e| MediaError::StreamBuildError(e.to_string()))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(MediaStreamHandle::new(track, move || {
                let _ = stop_tx.send(());
            })),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MediaError::StreamBuildError(
                "capture thread exited".to_string(),
            )),
        }
    }
}

fn build_capture_stream(track: LocalAudioTrack) -> Result<cpal::Stream, MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;
    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let source_rate = config.sample_rate.0;
    let channels = config.channels as usize;
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = downmix(data, channels);
                track.push_samples(&resample(&mono, source_rate, SAMPLE_RATE));
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaError::PermissionDenied(e.to_string())
            }
            other => MediaError::StreamBuildError(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaError::StreamPlayError(e.to_string()))?;
    Ok(stream)
}

/// Mittelt alle Kanäle eines Frames zu Mono
fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || data.is_empty() {
        return data.to_vec();
    }
    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaError> {
    let configs: Vec<SupportedStreamConfigRange> = device
        .supported_input_configs()
        .map_err(|e| match e {
            cpal::SupportedStreamConfigsError::DeviceNotAvailable => {
                MediaError::PermissionDenied(e.to_string())
            }
            other => MediaError::UnsupportedConfig(other.to_string()),
        })?
        .collect();

    // Priorität: F32 mit 48kHz > F32 mit höchster Rate
    let target = cpal::SampleRate(SAMPLE_RATE);
    let f32_configs = configs
        .iter()
        .filter(|c| c.sample_format() == SampleFormat::F32);

    let mut fallback: Option<StreamConfig> = None;
    for config in f32_configs {
        if config.min_sample_rate() <= target && config.max_sample_rate() >= target {
            return Ok(config.clone().with_sample_rate(target).into());
        }
        fallback.get_or_insert_with(|| config.clone().with_max_sample_rate().into());
    }

    fallback.ok_or_else(|| {
        MediaError::UnsupportedConfig("No f32 input configuration available".to_string())
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingDevices {
        opened: AtomicU32,
        stopped: Arc<AtomicU32>,
    }

    #[async_trait]
    impl MediaDevices for CountingDevices {
        async fn open_microphone(&self) -> Result<MediaStreamHandle, MediaError> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            let stopped = Arc::clone(&self.stopped);
            Ok(MediaStreamHandle::new(LocalAudioTrack::new(), move || {
                stopped.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn manager() -> (MediaSessionManager, Arc<AtomicU32>) {
        let stopped = Arc::new(AtomicU32::new(0));
        let devices = CountingDevices {
            opened: AtomicU32::new(0),
            stopped: Arc::clone(&stopped),
        };
        (MediaSessionManager::new(Arc::new(devices)), stopped)
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (media, stopped) = manager();
        let handle = media.acquire().await.unwrap();
        assert_eq!(media.live_streams(), 1);
        assert_eq!(handle.active_tracks(), 1);

        media.release(&handle);
        media.release(&handle);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(media.live_streams(), 0);
        assert_eq!(handle.active_tracks(), 0);

        drop(handle);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drop_releases_stream() {
        let (media, stopped) = manager();
        let handle = media.acquire().await.unwrap();
        drop(handle);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(media.live_streams(), 0);
    }

    #[tokio::test]
    async fn test_mute_drops_captured_samples() {
        let (media, _) = manager();
        let handle = media.acquire().await.unwrap();
        let samples = vec![0.5f32; FRAME_SIZE];

        media.set_muted(&handle, true);
        assert!(media.is_muted(&handle));
        handle.track().push_samples(&samples);
        assert!(handle.track().read_frame().is_none());
        // Der Pegel wird auch stumm weiter gemessen
        assert!(handle.track().level() > 0.4);

        media.set_muted(&handle, false);
        handle.track().push_samples(&samples);
        assert_eq!(handle.track().read_frame().map(|f| f.len()), Some(FRAME_SIZE));
    }

    #[test]
    fn test_resample_and_downmix() {
        assert_eq!(resample(&[1.0, 2.0], 48000, 48000), vec![1.0, 2.0]);
        assert_eq!(resample(&[0.0; 480], 24000, 48000).len(), 960);
        assert_eq!(downmix(&[1.0, 3.0, 2.0, 4.0], 2), vec![2.0, 3.0]);
    }
}
