//! Media Acquirer
//!
//! Fordert bei jedem Aufruf einen frischen Geräte-Zugriff an. Es gibt
//! bewusst kein Caching: ein früherer Grant garantiert nicht, dass das
//! Gerät noch verfügbar ist.

use super::stream::{MediaStream, TrackKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("At least one of audio or video must be requested")]
    NoTracksRequested,

    #[error("{0}")]
    Device(String),
}

// ============================================================================
// CONSTRAINTS
// ============================================================================

/// Welche Capture-Geräte angefordert werden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    pub fn wants(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

// ============================================================================
// DEVICE ACCESS
// ============================================================================

/// Plattform-Zugriff auf Capture-Geräte.
///
/// `request` suspendiert bis die Plattform den Zugriff gewährt oder
/// verweigert. Bei Erfolg gehört der Stream dem Aufrufer.
#[async_trait]
pub trait DeviceAccess: Send + Sync {
    async fn request(&self, constraints: MediaConstraints)
        -> Result<MediaStream, MediaAccessError>;
}

// ============================================================================
// MEDIA ACQUIRER
// ============================================================================

/// Wrapper um `DeviceAccess` mit Validierung und Logging
#[derive(Clone)]
pub struct MediaAcquirer {
    devices: Arc<dyn DeviceAccess>,
}

impl MediaAcquirer {
    pub fn new(devices: Arc<dyn DeviceAccess>) -> Self {
        Self { devices }
    }

    /// Fordert einen neuen Stream an
    pub async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaAccessError> {
        if constraints.is_empty() {
            return Err(MediaAccessError::NoTracksRequested);
        }

        tracing::debug!(
            "Requesting local media (audio: {}, video: {})",
            constraints.audio,
            constraints.video
        );

        let stream = match self.devices.request(constraints).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("Local media request failed: {}", e);
                return Err(e);
            }
        };

        if stream.tracks().is_empty() {
            tracing::warn!("Device granted stream {} without tracks", stream.id());
            stream.release();
            return Err(MediaAccessError::DeviceUnavailable(
                "no capture tracks granted".to_string(),
            ));
        }

        for kind in [TrackKind::Audio, TrackKind::Video] {
            if constraints.wants(kind) && !stream.has_kind(kind) {
                tracing::warn!("Requested {} track missing from stream {}", kind, stream.id());
            }
        }

        tracing::info!(
            "Local media acquired: stream {} with {} track(s)",
            stream.id(),
            stream.tracks().len()
        );
        Ok(stream)
    }
}

impl std::fmt::Debug for MediaAcquirer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaAcquirer").finish_non_exhaustive()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::stream::{MediaTrack, TrackInfo};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Gerät, das vorbereitete Antworten der Reihe nach ausliefert
    struct ScriptedDevices {
        requests: AtomicUsize,
        empty_grant: bool,
        deny: Mutex<Option<MediaAccessError>>,
        stops: Arc<AtomicUsize>,
    }

    impl ScriptedDevices {
        fn granting() -> Self {
            Self {
                requests: AtomicUsize::new(0),
                empty_grant: false,
                deny: Mutex::new(None),
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl DeviceAccess for ScriptedDevices {
        async fn request(
            &self,
            constraints: MediaConstraints,
        ) -> Result<MediaStream, MediaAccessError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.deny.lock().clone() {
                return Err(err);
            }
            if self.empty_grant {
                return Ok(MediaStream::new("empty", Vec::new()));
            }
            let mut tracks = Vec::new();
            for kind in [TrackKind::Audio, TrackKind::Video] {
                if constraints.wants(kind) {
                    let stops = Arc::clone(&self.stops);
                    tracks.push(MediaTrack::new(
                        TrackInfo::new(kind, "scripted"),
                        Box::new(move || {
                            stops.fetch_add(1, Ordering::SeqCst);
                        }),
                    ));
                }
            }
            Ok(MediaStream::new("scripted", tracks))
        }
    }

    #[tokio::test]
    async fn test_acquire_requests_fresh_grant_every_time() {
        let devices = Arc::new(ScriptedDevices::granting());
        let acquirer = MediaAcquirer::new(devices.clone());

        let first = acquirer.acquire(MediaConstraints::default()).await.unwrap();
        let second = acquirer.acquire(MediaConstraints::default()).await.unwrap();

        assert_eq!(devices.requests.load(Ordering::SeqCst), 2);
        assert_eq!(first.tracks().len(), 2);
        first.release();
        second.release();
        assert_eq!(devices.stops.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_acquire_rejects_empty_constraints() {
        let devices = Arc::new(ScriptedDevices::granting());
        let acquirer = MediaAcquirer::new(devices.clone());

        let result = acquirer
            .acquire(MediaConstraints {
                audio: false,
                video: false,
            })
            .await;

        assert_eq!(result.unwrap_err(), MediaAccessError::NoTracksRequested);
        assert_eq!(devices.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_acquire_passes_denial_through() {
        let devices = Arc::new(ScriptedDevices::granting());
        *devices.deny.lock() = Some(MediaAccessError::PermissionDenied(
            "user dismissed prompt".to_string(),
        ));
        let acquirer = MediaAcquirer::new(devices);

        let err = acquirer
            .acquire(MediaConstraints::audio_only())
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "Permission denied: user dismissed prompt");
    }

    #[tokio::test]
    async fn test_acquire_treats_empty_grant_as_failure() {
        let mut devices = ScriptedDevices::granting();
        devices.empty_grant = true;
        let acquirer = MediaAcquirer::new(Arc::new(devices));

        let err = acquirer
            .acquire(MediaConstraints::default())
            .await
            .unwrap_err();

        assert!(matches!(err, MediaAccessError::DeviceUnavailable(_)));
    }
}
