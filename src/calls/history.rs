//! Call history read from the session store.

use crate::store::SessionStore;
use crate::store::error::Result;
use amcore::calls::CallDirection;
use amcore::types::{CallKind, SessionId, SessionStatus, UserId};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallLogEntry {
    pub session_id: SessionId,
    pub peer_id: UserId,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub status: SessionStatus,
    pub at: DateTime<Utc>,
}

/// Calls `user` received and never picked up.
pub async fn missed_call_count(store: &dyn SessionStore, user: &UserId) -> Result<usize> {
    Ok(store
        .list_for_participant(user)
        .await?
        .iter()
        .filter(|s| &s.receiver_id == user && s.status == SessionStatus::Missed)
        .count())
}

/// Newest first, at most `limit` entries.
pub async fn recent_calls(
    store: &dyn SessionStore,
    user: &UserId,
    limit: usize,
) -> Result<Vec<CallLogEntry>> {
    let mut sessions = store.list_for_participant(user).await?;
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(sessions
        .into_iter()
        .take(limit)
        .map(|s| CallLogEntry {
            peer_id: s.peer_of(user).clone(),
            direction: if &s.caller_id == user {
                CallDirection::Outgoing
            } else {
                CallDirection::Incoming
            },
            session_id: s.id,
            kind: s.kind,
            status: s.status,
            at: s.created_at,
        })
        .collect())
}
