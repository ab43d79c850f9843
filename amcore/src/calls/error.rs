//! Error taxonomy of the call core.

use thiserror::Error;

/// Failure to acquire a local capture device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("capture device is busy")]
    Busy,
    #[error("capture permission denied")]
    PermissionDenied,
    #[error("no capture device found")]
    NotFound,
    #[error("capture failed: {0}")]
    Other(String),
}

impl DeviceError {
    /// Maps a platform media error name onto the taxonomy.
    pub fn classify(name: &str, message: &str) -> Self {
        match name {
            "NotReadableError" | "TrackStartError" => Self::Busy,
            "NotAllowedError" | "SecurityError" | "PermissionDeniedError" => {
                Self::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => Self::NotFound,
            _ => Self::Other(if message.is_empty() {
                name.to_string()
            } else {
                format!("{name}: {message}")
            }),
        }
    }

    /// Text for the transient notification shown to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Busy => "Camera/Mic is busy. Please close other apps using it.",
            Self::PermissionDenied => "Permission denied. Please allow access to camera/mic.",
            Self::NotFound => "No camera/mic found.",
            Self::Other(_) => "Call failed",
        }
    }
}

/// Failure talking to the session/candidate stores or their feeds.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("store write failed: {0}")]
    StoreWriteFailed(String),
    #[error("subscribe failed: {0}")]
    SubscribeFailed(String),
}

impl SignalingError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::StoreWriteFailed(_) => "Call failed",
            Self::SubscribeFailed(_) => "Connection error: Calls may not work",
        }
    }
}

/// Programmer-facing errors. Correct UI gating never produces these; they
/// are reported and the offending input is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("remote description already applied")]
    DuplicateRemoteDescription,
    #[error("invalid transition {attempted} in state {current_state}")]
    InvalidTransition {
        current_state: String,
        attempted: String,
    },
}

impl ProtocolError {
    pub fn invalid(current_state: impl std::fmt::Debug, attempted: impl Into<String>) -> Self {
        Self::InvalidTransition {
            current_state: format!("{current_state:?}"),
            attempted: attempted.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_platform_errors() {
        assert_eq!(DeviceError::classify("NotReadableError", ""), DeviceError::Busy);
        assert_eq!(
            DeviceError::classify("NotAllowedError", "denied by user"),
            DeviceError::PermissionDenied
        );
        assert_eq!(DeviceError::classify("NotFoundError", ""), DeviceError::NotFound);
        assert_eq!(
            DeviceError::classify("AbortError", "boom"),
            DeviceError::Other("AbortError: boom".into())
        );
    }

    #[test]
    fn test_user_messages() {
        assert_eq!(DeviceError::NotFound.user_message(), "No camera/mic found.");
        assert_eq!(DeviceError::Other("x".into()).user_message(), "Call failed");
    }
}
