//! Call-related error types.

use super::peer::PeerError;
use amcore::calls::{ProtocolError, SetupFailure};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallError {
    /// `start`/`accept` failed; the call was cleaned up and a notice sent.
    #[error("call setup failed: {0}")]
    Setup(#[from] SetupFailure),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error("not signed in")]
    NotSignedIn,

    #[error("call session closed")]
    SessionClosed,
}

impl CallError {
    /// Text for a transient notification, where one applies.
    pub fn user_message(&self) -> Option<&'static str> {
        match self {
            Self::Setup(failure) => Some(failure.user_message()),
            _ => None,
        }
    }
}
