use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier of a call session row, assigned by the session store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 32 hex character id, the shape the hosted store hands out.
    pub fn generate() -> Self {
        let bytes: [u8; 16] = rand::random();
        Self(hex::encode_upper(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Store-assigned id of a candidate row. The change feed may redeliver the
/// same insert, so this is the de-duplication key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Voice,
    Video,
}

impl CallKind {
    pub fn wants_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Voice => "voice",
            Self::Video => "video",
        })
    }
}

/// Persisted status of a session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Ringing,
    Active,
    Declined,
    Ended,
    Missed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Ended | Self::Missed)
    }

    /// Forward-only transitions; nothing leaves a terminal status.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Ringing, Active | Declined | Ended | Missed) | (Active, Ended)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ringing => "ringing",
            Self::Active => "active",
            Self::Declined => "declined",
            Self::Ended => "ended",
            Self::Missed => "missed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// A negotiated-media descriptor, exchanged once per call attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One discovered network path, in the JSON shape the peer transport emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The candidate line (e.g. "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn with_username_fragment(mut self, ufrag: impl Into<String>) -> Self {
        self.username_fragment = Some(ufrag.into());
        self
    }
}

/// A call session row as stored by the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub kind: CallKind,
    pub status: SessionStatus,
    pub offer: SessionDescription,
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_new(id: SessionId, new: NewSession, now: DateTime<Utc>) -> Self {
        Self {
            id,
            caller_id: new.caller_id,
            receiver_id: new.receiver_id,
            kind: new.kind,
            status: new.status,
            offer: new.offer,
            answer: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The other participant, seen from `user`.
    pub fn peer_of(&self, user: &UserId) -> &UserId {
        if &self.caller_id == user {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }

    /// Applies a partial update, enforcing the row invariants: forward-only
    /// status, and an answer written at most once together with the
    /// `ringing -> active` flip.
    pub fn apply_patch(
        &mut self,
        patch: &SessionPatch,
        now: DateTime<Utc>,
    ) -> Result<(), PatchRejected> {
        if let Some(next) = patch.status
            && next != self.status
            && !self.status.can_transition_to(next)
        {
            return Err(PatchRejected::Status {
                from: self.status,
                to: next,
            });
        }
        if patch.answer.is_some() {
            if self.answer.is_some() {
                return Err(PatchRejected::AnswerAlreadySet);
            }
            if !(self.status == SessionStatus::Ringing
                && patch.status == Some(SessionStatus::Active))
            {
                return Err(PatchRejected::AnswerWithoutAccept);
            }
        }

        if let Some(status) = patch.status {
            self.status = status;
        }
        if let Some(answer) = &patch.answer {
            self.answer = Some(answer.clone());
        }
        self.updated_at = now;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchRejected {
    #[error("status cannot move from {from} to {to}")]
    Status {
        from: SessionStatus,
        to: SessionStatus,
    },
    #[error("answer already set")]
    AnswerAlreadySet,
    #[error("answer must accompany the ringing -> active flip")]
    AnswerWithoutAccept,
}

/// Fields the caller provides when creating a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub caller_id: UserId,
    pub receiver_id: UserId,
    pub kind: CallKind,
    pub status: SessionStatus,
    pub offer: SessionDescription,
}

impl NewSession {
    pub fn ringing(
        caller_id: UserId,
        receiver_id: UserId,
        kind: CallKind,
        offer: SessionDescription,
    ) -> Self {
        Self {
            caller_id,
            receiver_id,
            kind,
            status: SessionStatus::Ringing,
            offer,
        }
    }
}

/// Partial update of a session row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self {
            status: Some(status),
            answer: None,
        }
    }

    pub fn accept(answer: SessionDescription) -> Self {
        Self {
            status: Some(SessionStatus::Active),
            answer: Some(answer),
        }
    }
}

/// An appended candidate row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub record_id: RecordId,
    pub session_id: SessionId,
    pub author_id: UserId,
    pub candidate: IceCandidate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCandidate {
    pub session_id: SessionId,
    pub author_id: UserId,
    pub candidate: IceCandidate,
}

/// What the UI shows for the other party.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayInfo {
    pub name: String,
    pub avatar_url: Option<String>,
}
