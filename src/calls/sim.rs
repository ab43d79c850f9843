//! Simulated collaborators: a capture backend with injectable failures and
//! a loopback peer transport that records what the link does to it. Used by
//! the demo binary and the tests.

use super::media::{CaptureBackend, CaptureFailure, CaptureRequest, MediaTrack, TrackKind};
use super::peer::{
    PeerConfig, PeerConnectionState, PeerError, PeerEvent, PeerTransport, PeerTransportFactory,
    RemoteMedia,
};
use amcore::types::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Candidates emitted per local description.
const GATHERED_CANDIDATES: u16 = 2;

pub struct SimTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl SimTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for SimTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        if !self.is_stopped() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.enabled.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct SimulatedCapture {
    failure: Mutex<Option<CaptureFailure>>,
    last_request: Mutex<Option<CaptureRequest>>,
    opened: AtomicU64,
}

impl SimulatedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent `open` fails with `failure`.
    pub fn fail_with(&self, failure: CaptureFailure) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = Some(failure);
        }
    }

    pub fn succeed(&self) {
        if let Ok(mut slot) = self.failure.lock() {
            *slot = None;
        }
    }

    pub fn last_request(&self) -> Option<CaptureRequest> {
        self.last_request.lock().ok().and_then(|r| *r)
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CaptureBackend for SimulatedCapture {
    async fn open(
        &self,
        request: CaptureRequest,
    ) -> Result<Vec<Arc<dyn MediaTrack>>, CaptureFailure> {
        if let Ok(mut last) = self.last_request.lock() {
            *last = Some(request);
        }
        if let Some(failure) = self.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(failure);
        }
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if request.audio {
            tracks.push(Arc::new(SimTrack::new(format!("audio-{n}"), TrackKind::Audio)));
        }
        if request.video {
            tracks.push(Arc::new(SimTrack::new(format!("video-{n}"), TrackKind::Video)));
        }
        Ok(tracks)
    }
}

#[derive(Default)]
struct LoopbackState {
    tracks: Vec<TrackKind>,
    local: Option<SessionDescription>,
    remote: Vec<SessionDescription>,
    applied: Vec<IceCandidate>,
}

/// A transport that negotiates with itself. Setting the local description
/// gathers a couple of host candidates; setting the remote description
/// reports remote media and a connected state.
pub struct LoopbackTransport {
    id: u64,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: Mutex<LoopbackState>,
    closed: AtomicBool,
}

impl LoopbackTransport {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.state.lock().map(|s| s.tracks.clone()).unwrap_or_default()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().ok().and_then(|s| s.local.clone())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().ok().and_then(|s| s.remote.last().cloned())
    }

    pub fn remote_description_count(&self) -> usize {
        self.state.lock().map(|s| s.remote.len()).unwrap_or_default()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().map(|s| s.applied.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reports one more gathered candidate, as a late trickle would.
    pub fn emit_local_candidate(&self, candidate: IceCandidate) {
        if !self.is_closed() {
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LoopbackState>, PeerError> {
        self.state
            .lock()
            .map_err(|_| PeerError::Negotiation("transport state poisoned".to_string()))
    }

    fn describe(&self, kind: SdpKind) -> Result<SessionDescription, PeerError> {
        let state = self.lock()?;
        let media: Vec<_> = state
            .tracks
            .iter()
            .map(|k| match k {
                TrackKind::Audio => "m=audio",
                TrackKind::Video => "m=video",
            })
            .collect();
        let sdp = format!("v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\n{}", self.id, media.join("\r\n"));
        Ok(SessionDescription { kind, sdp })
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.check_open()?;
        self.lock()?.tracks.push(track.kind());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        self.describe(SdpKind::Offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        if self.lock()?.remote.is_empty() {
            return Err(PeerError::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }
        self.describe(SdpKind::Answer)
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        self.lock()?.local = Some(desc.clone());
        for n in 0..GATHERED_CANDIDATES {
            let candidate = IceCandidate::new(format!(
                "candidate:{n} 1 UDP 2130706431 192.168.{}.{} {} typ host",
                self.id % 250,
                n + 1,
                50000 + n
            ))
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0);
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
        Ok(())
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        let tracks = {
            let mut state = self.lock()?;
            state.remote.push(desc.clone());
            let mut tracks = vec![TrackKind::Audio];
            if desc.sdp.contains("m=video") {
                tracks.push(TrackKind::Video);
            }
            tracks
        };
        let _ = self.events.send(PeerEvent::RemoteMedia(RemoteMedia {
            stream_id: format!("remote-{}", self.id),
            tracks,
        }));
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = self.lock()?;
        if state.remote.is_empty() {
            return Err(PeerError::Candidate(
                "remote description not set".to_string(),
            ));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(PeerError::Candidate(format!(
                "malformed candidate line {:?}",
                candidate.candidate
            )));
        }
        state.applied.push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self
                .events
                .send(PeerEvent::ConnectionState(PeerConnectionState::Closed));
        }
    }
}

/// Creates [`LoopbackTransport`]s and keeps them around for inspection.
#[derive(Default)]
pub struct LoopbackTransportFactory {
    created: Mutex<Vec<Arc<LoopbackTransport>>>,
    next_id: AtomicU64,
    fail_create: AtomicBool,
}

impl LoopbackTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn last_transport(&self) -> Option<Arc<LoopbackTransport>> {
        self.created.lock().ok().and_then(|c| c.last().cloned())
    }

    pub fn transports(&self) -> Vec<Arc<LoopbackTransport>> {
        self.created.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn open_transports(&self) -> usize {
        self.transports().iter().filter(|t| !t.is_closed()).count()
    }
}

#[async_trait]
impl PeerTransportFactory for LoopbackTransportFactory {
    async fn create_transport(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), PeerError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::Create("transport unavailable".to_string()));
        }
        if config.ice_servers.is_empty() {
            log::debug!("Creating loopback transport without ICE servers");
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(LoopbackTransport {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            events: tx,
            state: Mutex::new(LoopbackState::default()),
            closed: AtomicBool::new(false),
        });
        if let Ok(mut created) = self.created.lock() {
            created.push(transport.clone());
        }
        Ok((transport, rx))
    }
}
