//! Media Module - Lokale Capture-Geräte und Stream-Handles
//!
//! Dieses Modul verwaltet:
//! - Media Stream Handles (explizites Release, kein implizites Stoppen)
//! - Geräte-Zugriff über das `DeviceAccess` Trait
//! - Den Media Acquirer (frischer Device-Grant bei jedem Aufruf)
//! - Optional: Mikrofon-Backend über cpal (Feature `audio-capture`)

mod acquirer;
#[cfg(feature = "audio-capture")]
mod device;
mod stream;

pub use acquirer::{DeviceAccess, MediaAccessError, MediaAcquirer, MediaConstraints};
#[cfg(feature = "audio-capture")]
pub use device::CpalDevices;
pub use stream::{MediaStream, MediaTrack, StopHook, StreamInfo, TrackInfo, TrackKind};
