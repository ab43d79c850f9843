//! Peer transport wrapper.
//!
//! A [`PeerLink`] owns exactly one native transport per call attempt. The
//! factory hands back the transport together with the receiver of its
//! [`PeerEvent`]s.

use super::media::{CaptureHandle, MediaTrack, TrackKind};
use amcore::calls::{Admission, CandidateBuffer, ProtocolError};
use amcore::types::{CandidateRecord, IceCandidate, SessionDescription, UserId};
use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("failed to create peer transport: {0}")]
    Create(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("peer link is closed")]
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Media received from the remote peer. Owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub stream_id: String,
    pub tracks: Vec<TrackKind>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    LocalCandidate(IceCandidate),
    RemoteMedia(RemoteMedia),
    ConnectionState(PeerConnectionState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

/// Native peer connection.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create_transport(
        &self,
        config: &PeerConfig,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<PeerEvent>), PeerError>;
}

pub struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    closed: bool,
}

impl PeerLink {
    pub async fn open(
        factory: &dyn PeerTransportFactory,
        config: &PeerConfig,
    ) -> Result<Self, PeerError> {
        let (transport, events) = factory.create_transport(config).await?;
        Ok(Self {
            transport,
            events,
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn add_local_tracks(&self, handle: &CaptureHandle) -> Result<(), PeerError> {
        self.ensure_open()?;
        for track in handle.tracks() {
            self.transport.add_track(track.clone()).await?;
        }
        Ok(())
    }

    /// Creates the offer and sets it as the local description, which starts
    /// candidate gathering.
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let offer = self.transport.create_offer().await?;
        self.transport.set_local_description(&offer).await?;
        Ok(offer)
    }

    /// Only valid once the remote offer is applied.
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(&answer).await?;
        Ok(answer)
    }

    /// Applies the remote offer or answer, then flushes every candidate
    /// buffered before it into the transport, in arrival order.
    pub async fn apply_remote_description(
        &self,
        desc: &SessionDescription,
        buffer: &mut CandidateBuffer,
    ) -> Result<(), super::CallError> {
        if buffer.remote_description_applied() {
            return Err(ProtocolError::DuplicateRemoteDescription.into());
        }
        self.ensure_open()?;
        self.transport.set_remote_description(desc).await?;

        let flushed = buffer.flush()?;
        if !flushed.is_empty() {
            debug!("Flushing {} buffered remote candidate(s)", flushed.len());
        }
        for (record_id, candidate) in flushed {
            if let Err(e) = self.transport.add_ice_candidate(&candidate).await {
                warn!("Skipping buffered candidate {record_id}: {e}");
            }
        }
        Ok(())
    }

    /// Applies or buffers a remote candidate. Returns whether it reached the
    /// transport. A candidate the transport rejects is logged and skipped;
    /// a closed link leaves the buffer untouched.
    pub async fn admit_remote_candidate(
        &self,
        record: &CandidateRecord,
        self_id: &UserId,
        buffer: &mut CandidateBuffer,
    ) -> bool {
        if self.closed {
            debug!("Dropping remote candidate {} on a closed link", record.record_id);
            return false;
        }
        match buffer.admit(record, self_id) {
            Admission::Apply(candidate) => {
                match self.transport.add_ice_candidate(&candidate).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("Skipping remote candidate {}: {e}", record.record_id);
                        false
                    }
                }
            }
            Admission::Buffered => {
                debug!(
                    "Buffered remote candidate {} until the remote description is set",
                    record.record_id
                );
                false
            }
            Admission::Duplicate | Admission::Own => false,
        }
    }

    pub fn try_next_event(&mut self) -> Option<PeerEvent> {
        if self.closed {
            return None;
        }
        self.events.try_recv().ok()
    }

    /// Waits for the next transport event. Never resolves once the link is
    /// closed or the transport dropped its sender.
    pub async fn next_event(&mut self) -> PeerEvent {
        if !self.closed
            && let Some(event) = self.events.recv().await
        {
            return event;
        }
        std::future::pending().await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        self.transport.close().await;
        debug!("Peer link closed");
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}
