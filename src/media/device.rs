//! Mikrofon-Backend über cpal
//!
//! cpal Streams sind nicht `Send`. Jeder Capture-Stream lebt deshalb auf
//! einem eigenen Thread, der beim Stoppen des Tracks beendet wird.

use super::acquirer::{DeviceAccess, MediaAccessError, MediaConstraints};
use super::stream::{MediaStream, MediaTrack, TrackInfo, TrackKind};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig, SupportedStreamConfigRange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Bevorzugte Sample Rate (48kHz, passend zu Opus)
pub const SAMPLE_RATE: u32 = 48000;

// ============================================================================
// CPAL DEVICES
// ============================================================================

/// `DeviceAccess` für das Standard-Eingabegerät des Systems.
///
/// Liefert nur Audio. Video-Anfragen schlagen mit `DeviceUnavailable` fehl.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalDevices;

impl CpalDevices {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl DeviceAccess for CpalDevices {
    async fn request(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        if constraints.video {
            return Err(MediaAccessError::DeviceUnavailable(
                "video capture is not supported by the audio backend".to_string(),
            ));
        }
        if !constraints.audio {
            return Err(MediaAccessError::NoTracksRequested);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        std::thread::Builder::new()
            .name("peercall-capture".to_string())
            .spawn(move || run_capture(ready_tx, stop_rx))
            .map_err(|e| MediaAccessError::Device(e.to_string()))?;

        let label = ready_rx
            .await
            .map_err(|_| MediaAccessError::Device("capture thread exited".to_string()))??;

        let track = MediaTrack::new(
            TrackInfo::new(TrackKind::Audio, label),
            Box::new(move || {
                let _ = stop_tx.send(());
            }),
        );

        Ok(MediaStream::new(
            uuid::Uuid::new_v4().to_string(),
            vec![track],
        ))
    }
}

/// Öffnet das Mikrofon und hält den Stream bis zum Stop-Signal
fn run_capture(
    ready: oneshot::Sender<Result<String, MediaAccessError>>,
    stop: oneshot::Receiver<()>,
) {
    let captured = Arc::new(AtomicU64::new(0));

    let stream = match open_input(Arc::clone(&captured)) {
        Ok((label, stream)) => {
            if ready.send(Ok(label)).is_err() {
                // Aufrufer ist weg, Stream sofort wieder schließen
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Fehlender Sender zählt ebenfalls als Stop
    let _ = stop.blocking_recv();
    drop(stream);

    tracing::info!(
        "Audio capture stopped after {} samples",
        captured.load(Ordering::Relaxed)
    );
}

fn open_input(captured: Arc<AtomicU64>) -> Result<(String, cpal::Stream), MediaAccessError> {
    let host = cpal::default_host();
    let device = host.default_input_device().ok_or_else(|| {
        MediaAccessError::DeviceUnavailable("no audio input device found".to_string())
    })?;

    let label = device
        .name()
        .unwrap_or_else(|_| "Default microphone".to_string());
    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture on '{}': {} Hz, {} channels",
        label,
        config.sample_rate.0,
        config.channels
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                captured.fetch_add(data.len() as u64, Ordering::Relaxed);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                MediaAccessError::DeviceUnavailable(e.to_string())
            }
            other => MediaAccessError::Device(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaAccessError::Device(e.to_string()))?;

    Ok((label, stream))
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaAccessError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaAccessError::DeviceUnavailable(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt 48kHz F32 wenn möglich, sonst die beste F32-Konfiguration
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaAccessError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let mut f32_configs: Vec<SupportedStreamConfigRange> = configs
        .into_iter()
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .collect();

    if let Some(pos) = f32_configs
        .iter()
        .position(|c| c.min_sample_rate() <= target_rate && c.max_sample_rate() >= target_rate)
    {
        return Ok(f32_configs.swap_remove(pos).with_sample_rate(target_rate).into());
    }

    if !f32_configs.is_empty() {
        return Ok(f32_configs.swap_remove(0).with_max_sample_rate().into());
    }

    Err(MediaAccessError::DeviceUnavailable(
        "no f32 capture configuration available".to_string(),
    ))
}
