//! Media Stream Handles
//!
//! Ein `MediaStream` besitzt seine Tracks exklusiv. Freigegeben wird
//! ausschließlich über `release()`, das den Handle konsumiert. Ein Drop
//! ohne Release stoppt keine Hardware, sondern loggt nur eine Warnung.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wird beim Stoppen eines Tracks genau einmal aufgerufen
pub type StopHook = Box<dyn FnOnce() + Send + 'static>;

// ============================================================================
// TRACK TYPES
// ============================================================================

/// Art eines Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Beschreibung eines Tracks (für UI und Negotiation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub label: String,
}

impl TrackInfo {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
        }
    }
}

/// Beschreibung eines Streams, die an die Presentation Shell geht
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    pub tracks: Vec<TrackInfo>,
}

// ============================================================================
// MEDIA TRACK
// ============================================================================

/// Ein einzelner Audio- oder Video-Track
pub struct MediaTrack {
    info: TrackInfo,
    stop: Option<StopHook>,
}

impl MediaTrack {
    /// Track mit Hook, der die zugrunde liegende Hardware stoppt
    pub fn new(info: TrackInfo, stop: StopHook) -> Self {
        Self {
            info,
            stop: Some(stop),
        }
    }

    /// Track ohne eigene Ressource (z.B. Remote-Track aus der Negotiation)
    pub fn detached(info: TrackInfo) -> Self {
        Self { info, stop: None }
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub fn kind(&self) -> TrackKind {
        self.info.kind
    }

    /// Stoppt den Track
    fn stop(mut self) {
        if let Some(hook) = self.stop.take() {
            hook();
        }
        tracing::debug!("Track {} ({}) stopped", self.info.id, self.info.kind);
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("info", &self.info)
            .field("has_stop_hook", &self.stop.is_some())
            .finish()
    }
}

// ============================================================================
// MEDIA STREAM
// ============================================================================

/// Owned Handle auf einen laufenden Capture- oder Playback-Stream
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_kind(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind() == kind)
    }

    /// Beschreibung für die Presentation Shell
    pub fn info(&self) -> StreamInfo {
        StreamInfo {
            id: self.id.clone(),
            tracks: self.tracks.iter().map(|t| t.info.clone()).collect(),
        }
    }

    /// Gibt den Stream frei und stoppt alle Tracks.
    ///
    /// Gibt die Anzahl gestoppter Tracks zurück.
    pub fn release(mut self) -> usize {
        let tracks = std::mem::take(&mut self.tracks);
        let count = tracks.len();
        for track in tracks {
            track.stop();
        }
        tracing::debug!("Media stream {} released ({} tracks)", self.id, count);
        count
    }
}

impl Drop for MediaStream {
    fn drop(&mut self) {
        if !self.tracks.is_empty() {
            tracing::warn!(
                "Media stream {} dropped without release, {} track(s) still running",
                self.id,
                self.tracks.len()
            );
        }
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.tracks)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counted_track(kind: TrackKind, counter: &Arc<AtomicUsize>) -> MediaTrack {
        let counter = Arc::clone(counter);
        MediaTrack::new(
            TrackInfo::new(kind, "test"),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_release_stops_every_track_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stream = MediaStream::new(
            "local",
            vec![
                counted_track(TrackKind::Audio, &stops),
                counted_track(TrackKind::Video, &stops),
            ],
        );

        assert_eq!(stream.release(), 2);
        assert_eq!(stops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_without_release_does_not_stop_tracks() {
        let stops = Arc::new(AtomicUsize::new(0));
        let stream = MediaStream::new("leaky", vec![counted_track(TrackKind::Audio, &stops)]);

        drop(stream);

        assert_eq!(stops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_info_lists_tracks() {
        let stream = MediaStream::new(
            "remote",
            vec![
                MediaTrack::detached(TrackInfo::new(TrackKind::Audio, "mic")),
                MediaTrack::detached(TrackInfo::new(TrackKind::Video, "cam")),
            ],
        );

        let info = stream.info();
        assert_eq!(info.id, "remote");
        assert_eq!(info.tracks.len(), 2);
        assert!(stream.has_kind(TrackKind::Video));
        assert_eq!(stream.release(), 2);
    }
}
