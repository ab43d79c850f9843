//! Local capture devices.

use amcore::calls::DeviceError;
use amcore::types::CallKind;
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// One live capture track owned by the platform.
pub trait MediaTrack: Send + Sync {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
}

impl CaptureRequest {
    pub fn for_kind(kind: CallKind) -> Self {
        Self {
            audio: true,
            video: kind.wants_video(),
        }
    }
}

/// Raw platform failure, classified by [`DeviceError::classify`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFailure {
    pub name: String,
    pub message: String,
}

impl CaptureFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Platform capture API.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open(
        &self,
        request: CaptureRequest,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CaptureFailure>;
}

/// An acquired local media stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct CaptureHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    id: u64,
    kind: CallKind,
    tracks: Vec<Arc<dyn MediaTrack>>,
    released: AtomicBool,
}

impl CaptureHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> CallKind {
        self.inner.kind
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.inner.tracks
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::SeqCst)
    }

    pub fn has_video(&self) -> bool {
        self.inner.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Audio, enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_enabled(TrackKind::Video, enabled);
    }

    fn set_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.inner.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
        }
    }
}

impl PartialEq for CaptureHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("tracks", &self.inner.tracks.len())
            .field("released", &self.is_released())
            .finish()
    }
}

/// Acquires and releases capture handles, keeping count of the live ones.
pub struct MediaGate {
    backend: Arc<dyn CaptureBackend>,
    live: AtomicUsize,
    next_id: AtomicU64,
}

impl MediaGate {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self {
            backend,
            live: AtomicUsize::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// Audio is always requested; video only for video calls.
    pub async fn acquire(&self, kind: CallKind) -> Result<CaptureHandle, DeviceError> {
        let request = CaptureRequest::for_kind(kind);
        let tracks = match self.backend.open(request).await {
            Ok(tracks) => tracks,
            Err(failure) => {
                let error = DeviceError::classify(&failure.name, &failure.message);
                warn!("Media acquisition failed: {error} ({})", failure.name);
                return Err(error);
            }
        };
        if tracks.is_empty() {
            return Err(DeviceError::NotFound);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!("Acquired capture handle {id} with {} track(s)", tracks.len());
        Ok(CaptureHandle {
            inner: Arc::new(HandleInner {
                id,
                kind,
                tracks,
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Stops every track of `handle`. Releasing twice is a no-op.
    pub fn release(&self, handle: &CaptureHandle) {
        if handle.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for track in &handle.inner.tracks {
            track.stop();
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!("Released capture handle {}", handle.inner.id);
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calls::sim::SimulatedCapture;

    #[tokio::test]
    async fn test_voice_call_captures_audio_only() {
        let capture = Arc::new(SimulatedCapture::new());
        let gate = MediaGate::new(capture.clone());
        let handle = gate.acquire(CallKind::Voice).await.unwrap();
        assert!(!handle.has_video());
        assert_eq!(capture.last_request(), Some(CaptureRequest { audio: true, video: false }));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let gate = MediaGate::new(Arc::new(SimulatedCapture::new()));
        let handle = gate.acquire(CallKind::Video).await.unwrap();
        assert_eq!(gate.live_handles(), 1);
        gate.release(&handle);
        gate.release(&handle);
        assert_eq!(gate.live_handles(), 0);
        assert!(handle.tracks().iter().all(|t| !t.is_enabled()));
    }

    #[tokio::test]
    async fn test_platform_failures_are_classified() {
        let capture = Arc::new(SimulatedCapture::new());
        let gate = MediaGate::new(capture.clone());
        capture.fail_with(CaptureFailure::new("NotReadableError", "Could not start video source"));
        assert_eq!(gate.acquire(CallKind::Video).await, Err(DeviceError::Busy));
        capture.fail_with(CaptureFailure::new("NotAllowedError", ""));
        assert_eq!(
            gate.acquire(CallKind::Voice).await,
            Err(DeviceError::PermissionDenied)
        );
        assert_eq!(gate.live_handles(), 0);
    }

    #[tokio::test]
    async fn test_mute_flips_audio_tracks_only() {
        let gate = MediaGate::new(Arc::new(SimulatedCapture::new()));
        let handle = gate.acquire(CallKind::Video).await.unwrap();
        handle.set_audio_enabled(false);
        for track in handle.tracks() {
            assert_eq!(track.is_enabled(), track.kind() == TrackKind::Video);
        }
    }
}
