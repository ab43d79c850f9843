//! Peer-to-peer call signaling and session lifecycle.
//!
//! The offer, the answer and every network-path candidate travel through
//! the session and candidate stores; each peer watches their change feeds
//! and drives its own [`CallSession`].
//!
//! # Architecture
//!
//! - [`MediaGate`]: local capture devices
//! - [`PeerLink`]: one peer transport per call attempt
//! - [`SignalingChannel`]: inbound and per-call change feeds
//! - [`CallSession`]: runs the [`CallMachine`] against the collaborators
//! - [`CallHandle`]: the session in its own task, driven over channels
//! - [`history`]: missed calls and recent calls
//! - [`sim`]: simulated capture and transport

mod error;
mod handle;
pub mod history;
mod media;
mod peer;
mod session;
mod signaling;
pub mod sim;

pub use amcore::calls::{
    BusyPolicy, CallDirection, CallInput, CallMachine, CallNotice, CandidateBuffer, Command,
    DeviceError, Effect, LocalStatus, ProtocolError, SetupFailure, SignalingError,
};
pub use error::CallError;
pub use handle::{CallHandle, CallRequest};
pub use history::{CallLogEntry, missed_call_count, recent_calls};
pub use media::{
    CaptureBackend, CaptureFailure, CaptureHandle, CaptureRequest, MediaGate, MediaTrack,
    TrackKind,
};
pub use peer::{
    PeerConfig, PeerConnectionState, PeerError, PeerEvent, PeerLink, PeerTransport,
    PeerTransportFactory, RemoteMedia,
};
pub use session::{CallSession, CallView, Collaborators, SessionInput};
pub use signaling::{LostFeed, SignalingChannel};
