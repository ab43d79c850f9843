use amcore::store::error::Result;
use amcore::types::{
    CandidateRecord, DisplayInfo, FeedEvent, NewCandidate, NewSession, SessionId, SessionPatch,
    SessionRecord, UserId,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Which session rows a subscription observes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionFilter {
    /// Inserts of rows addressed to this receiver (inbound call discovery).
    ReceiverInserts(UserId),
    /// Updates of one row.
    Updates(SessionId),
}

/// A live change-feed subscription.
///
/// Delivery is at-least-once with no ordering guarantee relative to other
/// subscriptions. Closing is idempotent; dropping the subscription closes it.
#[derive(Debug)]
pub struct Subscription {
    label: String,
    events: Option<mpsc::UnboundedReceiver<FeedEvent>>,
}

impl Subscription {
    pub fn new(label: impl Into<String>, events: mpsc::UnboundedReceiver<FeedEvent>) -> Self {
        Self {
            label: label.into(),
            events: Some(events),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_open(&self) -> bool {
        self.events.is_some()
    }

    /// Returns an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<FeedEvent> {
        self.events.as_mut()?.try_recv().ok()
    }

    /// Waits for the next event. `None` once the feed is gone or closed.
    pub async fn recv(&mut self) -> Option<FeedEvent> {
        match self.events.as_mut() {
            Some(events) => events.recv().await,
            None => None,
        }
    }

    pub fn close(&mut self) {
        if let Some(mut events) = self.events.take() {
            events.close();
        }
    }
}

/// Durable call session rows.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Inserts a row; the store assigns the id and timestamps.
    async fn create(&self, session: NewSession) -> Result<SessionRecord>;

    /// Applies a partial update. Fails with `NotFound` for an unknown id and
    /// `Conflict` when the patch breaks the row invariants.
    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<SessionRecord>;

    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>>;

    /// Every row where `user` is caller or receiver (call history).
    async fn list_for_participant(&self, user: &UserId) -> Result<Vec<SessionRecord>>;

    async fn subscribe(&self, filter: SessionFilter) -> Result<Subscription>;
}

/// Append-only candidate rows.
#[async_trait]
pub trait CandidateStore: Send + Sync {
    async fn append(&self, candidate: NewCandidate) -> Result<CandidateRecord>;

    /// Rows already persisted for `session_id`, minus those written by
    /// `excluding_author`, in insertion order.
    async fn query(
        &self,
        session_id: &SessionId,
        excluding_author: &UserId,
    ) -> Result<Vec<CandidateRecord>>;

    /// Inserts for one session.
    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription>;
}

/// Profile lookups for the party on the other end of a call.
#[async_trait]
pub trait ProfileDirectory: Send + Sync {
    async fn display_info(&self, user: &UserId) -> Result<Option<DisplayInfo>>;
}

/// Everything the call core needs from the hosted backend.
pub trait CallBackend: SessionStore + CandidateStore + ProfileDirectory + Send + Sync {}

impl<T> CallBackend for T where T: SessionStore + CandidateStore + ProfileDirectory + Send + Sync {}
