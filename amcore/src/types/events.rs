use crate::types::call::{CandidateRecord, SessionId, SessionRecord};
use serde::Serialize;

/// A change observed on one of the external feeds.
///
/// Feeds are at-least-once and unordered relative to each other, so the
/// same event may show up twice and an update may overtake the candidate
/// inserts it causally follows.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FeedEvent {
    /// A session row was inserted.
    SessionInserted(SessionRecord),
    /// A session row was updated; carries the row after the update.
    SessionUpdated(SessionRecord),
    /// A candidate row was appended.
    CandidateInserted(CandidateRecord),
}

impl FeedEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionInserted(record) | Self::SessionUpdated(record) => &record.id,
            Self::CandidateInserted(record) => &record.session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionInserted(_) => "session_inserted",
            Self::SessionUpdated(_) => "session_updated",
            Self::CandidateInserted(_) => "candidate_inserted",
        }
    }
}
