use crate::store::generic::GenericMemoryStore;
use crate::store::traits::*;
use amcore::store::error::{Result, StoreError};
use amcore::types::{
    CandidateRecord, DisplayInfo, FeedEvent, NewCandidate, NewSession, RecordId, SessionId,
    SessionPatch, SessionRecord, UserId,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};

type Subscribers<K> = RwLock<Vec<(K, mpsc::UnboundedSender<FeedEvent>)>>;

/// In-process stand-in for the hosted session/candidate stores and their
/// change feeds. Clones share state, so two peers can talk through one.
#[derive(Clone)]
pub struct InMemoryCallStore {
    inner: Arc<Inner>,
}

struct Inner {
    sessions: GenericMemoryStore<SessionId, SessionRecord>,
    candidates: RwLock<Vec<CandidateRecord>>,
    next_record_id: AtomicU64,
    profiles: DashMap<UserId, DisplayInfo>,
    session_subscribers: Subscribers<SessionFilter>,
    candidate_subscribers: Subscribers<SessionId>,
    fail_writes: AtomicBool,
    fail_subscribe: AtomicBool,
    hold_updates: AtomicBool,
    held_updates: RwLock<Vec<SessionRecord>>,
}

impl Default for InMemoryCallStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: GenericMemoryStore::new(),
                candidates: RwLock::new(Vec::new()),
                next_record_id: AtomicU64::new(1),
                profiles: DashMap::new(),
                session_subscribers: RwLock::new(Vec::new()),
                candidate_subscribers: RwLock::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
                fail_subscribe: AtomicBool::new(false),
                hold_updates: AtomicBool::new(false),
                held_updates: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn insert_profile(&self, user: impl Into<UserId>, info: DisplayInfo) {
        self.inner.profiles.insert(user.into(), info);
    }

    /// Makes every subsequent create/update/append fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes every subsequent subscribe fail.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.inner.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// While held, session update events are queued instead of delivered.
    pub fn set_hold_updates(&self, hold: bool) {
        self.inner.hold_updates.store(hold, Ordering::SeqCst);
    }

    /// Delivers every queued update and stops holding.
    pub async fn release_held_updates(&self) {
        self.set_hold_updates(false);
        let held: Vec<_> = self.inner.held_updates.write().await.drain(..).collect();
        for record in held {
            self.fan_out_update(record).await;
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.sessions.len().await
    }

    pub async fn sessions(&self) -> Vec<SessionRecord> {
        let mut sessions = self.inner.sessions.values().await;
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    pub async fn candidates_for(&self, session_id: &SessionId) -> Vec<CandidateRecord> {
        self.inner
            .candidates
            .read()
            .await
            .iter()
            .filter(|c| &c.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Live subscriptions across every feed.
    pub async fn open_subscriptions(&self) -> usize {
        let sessions = self
            .inner
            .session_subscribers
            .read()
            .await
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count();
        let candidates = self
            .inner
            .candidate_subscribers
            .read()
            .await
            .iter()
            .filter(|(_, tx)| !tx.is_closed())
            .count();
        sessions + candidates
    }

    /// Drops the store side of every live subscription, the way a lost
    /// realtime connection would.
    pub async fn drop_subscriptions(&self) {
        self.inner.session_subscribers.write().await.clear();
        self.inner.candidate_subscribers.write().await.clear();
    }

    /// Delivers an already appended candidate a second time.
    pub async fn redeliver_candidate(&self, record: &CandidateRecord) {
        self.fan_out_candidate(record.clone()).await;
    }

    /// Delivers the current row of `id` as an update again.
    pub async fn redeliver_session_update(&self, id: &SessionId) {
        if let Some(record) = self.inner.sessions.get(id).await {
            self.fan_out_update(record).await;
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.inner.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("store rejected the write".to_string()));
        }
        Ok(())
    }

    fn check_subscribable(&self) -> Result<()> {
        if self.inner.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::Subscription("feed unavailable".to_string()));
        }
        Ok(())
    }

    async fn fan_out_insert(&self, record: SessionRecord) {
        let mut subscribers = self.inner.session_subscribers.write().await;
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (filter, tx) in subscribers.iter() {
            if matches!(filter, SessionFilter::ReceiverInserts(user) if *user == record.receiver_id)
            {
                let _ = tx.send(FeedEvent::SessionInserted(record.clone()));
            }
        }
    }

    async fn fan_out_update(&self, record: SessionRecord) {
        if self.inner.hold_updates.load(Ordering::SeqCst) {
            self.inner.held_updates.write().await.push(record);
            return;
        }
        let mut subscribers = self.inner.session_subscribers.write().await;
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (filter, tx) in subscribers.iter() {
            if matches!(filter, SessionFilter::Updates(id) if *id == record.id) {
                let _ = tx.send(FeedEvent::SessionUpdated(record.clone()));
            }
        }
    }

    async fn fan_out_candidate(&self, record: CandidateRecord) {
        let mut subscribers = self.inner.candidate_subscribers.write().await;
        subscribers.retain(|(_, tx)| !tx.is_closed());
        for (session_id, tx) in subscribers.iter() {
            if *session_id == record.session_id {
                let _ = tx.send(FeedEvent::CandidateInserted(record.clone()));
            }
        }
    }
}

#[async_trait]
impl SessionStore for InMemoryCallStore {
    async fn create(&self, session: NewSession) -> Result<SessionRecord> {
        self.check_writable()?;
        let record = SessionRecord::from_new(SessionId::generate(), session, Utc::now());
        self.inner
            .sessions
            .put(record.id.clone(), record.clone())
            .await;
        debug!(
            "Created session {} ({} -> {})",
            record.id, record.caller_id, record.receiver_id
        );
        self.fan_out_insert(record.clone()).await;
        Ok(record)
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> Result<SessionRecord> {
        self.check_writable()?;
        let now = Utc::now();
        let outcome = self
            .inner
            .sessions
            .modify(id, |record| {
                record.apply_patch(&patch, now).map(|()| record.clone())
            })
            .await;
        match outcome {
            None => Err(StoreError::NotFound(format!("session {id}"))),
            Some(Err(rejected)) => Err(StoreError::Conflict(format!("session {id}: {rejected}"))),
            Some(Ok(record)) => {
                debug!("Updated session {} to {}", record.id, record.status);
                self.fan_out_update(record.clone()).await;
                Ok(record)
            }
        }
    }

    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.inner.sessions.get(id).await)
    }

    async fn list_for_participant(&self, user: &UserId) -> Result<Vec<SessionRecord>> {
        Ok(self
            .sessions()
            .await
            .into_iter()
            .filter(|s| s.involves(user))
            .collect())
    }

    async fn subscribe(&self, filter: SessionFilter) -> Result<Subscription> {
        self.check_subscribable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let label = format!("sessions:{filter:?}");
        self.inner.session_subscribers.write().await.push((filter, tx));
        Ok(Subscription::new(label, rx))
    }
}

#[async_trait]
impl CandidateStore for InMemoryCallStore {
    async fn append(&self, candidate: NewCandidate) -> Result<CandidateRecord> {
        self.check_writable()?;
        let record = CandidateRecord {
            record_id: RecordId(self.inner.next_record_id.fetch_add(1, Ordering::SeqCst)),
            session_id: candidate.session_id,
            author_id: candidate.author_id,
            candidate: candidate.candidate,
        };
        self.inner.candidates.write().await.push(record.clone());
        self.fan_out_candidate(record.clone()).await;
        Ok(record)
    }

    async fn query(
        &self,
        session_id: &SessionId,
        excluding_author: &UserId,
    ) -> Result<Vec<CandidateRecord>> {
        Ok(self
            .inner
            .candidates
            .read()
            .await
            .iter()
            .filter(|c| &c.session_id == session_id && &c.author_id != excluding_author)
            .cloned()
            .collect())
    }

    async fn subscribe(&self, session_id: &SessionId) -> Result<Subscription> {
        self.check_subscribable()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let label = format!("candidates:{session_id}");
        self.inner
            .candidate_subscribers
            .write()
            .await
            .push((session_id.clone(), tx));
        Ok(Subscription::new(label, rx))
    }
}

#[async_trait]
impl ProfileDirectory for InMemoryCallStore {
    async fn display_info(&self, user: &UserId) -> Result<Option<DisplayInfo>> {
        Ok(self.inner.profiles.get(user).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amcore::types::{CallKind, IceCandidate, SessionDescription, SessionStatus};

    fn ringing() -> NewSession {
        NewSession::ringing(
            "alice".into(),
            "bob".into(),
            CallKind::Video,
            SessionDescription::offer("v=0 offer"),
        )
    }

    #[tokio::test]
    async fn test_receiver_feed_sees_inserts_addressed_to_it() {
        let store = InMemoryCallStore::new();
        let mut bob = SessionStore::subscribe(&store, SessionFilter::ReceiverInserts("bob".into()))
            .await
            .unwrap();
        let mut carol =
            SessionStore::subscribe(&store, SessionFilter::ReceiverInserts("carol".into()))
                .await
                .unwrap();

        let record = store.create(ringing()).await.unwrap();
        assert_eq!(bob.try_recv(), Some(FeedEvent::SessionInserted(record)));
        assert_eq!(carol.try_recv(), None);
    }

    #[tokio::test]
    async fn test_update_enforces_row_invariants() {
        let store = InMemoryCallStore::new();
        let record = store.create(ringing()).await.unwrap();

        store
            .update(&record.id, SessionPatch::status(SessionStatus::Declined))
            .await
            .unwrap();
        let err = store
            .update(&record.id, SessionPatch::status(SessionStatus::Active))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let missing = store
            .update(&SessionId::new("nope"), SessionPatch::status(SessionStatus::Ended))
            .await
            .unwrap_err();
        assert!(matches!(missing, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_excludes_author_and_keeps_order() {
        let store = InMemoryCallStore::new();
        let record = store.create(ringing()).await.unwrap();
        for (author, n) in [("alice", 1), ("bob", 2), ("alice", 3)] {
            store
                .append(NewCandidate {
                    session_id: record.id.clone(),
                    author_id: author.into(),
                    candidate: IceCandidate::new(format!("candidate:{n}")),
                })
                .await
                .unwrap();
        }
        let from_alice = store.query(&record.id, &"bob".into()).await.unwrap();
        let lines: Vec<_> = from_alice.iter().map(|c| c.candidate.candidate.as_str()).collect();
        assert_eq!(lines, vec!["candidate:1", "candidate:3"]);
    }

    #[tokio::test]
    async fn test_closed_subscriptions_are_not_counted() {
        let store = InMemoryCallStore::new();
        let mut sub = CandidateStore::subscribe(&store, &SessionId::new("S1"))
            .await
            .unwrap();
        assert_eq!(store.open_subscriptions().await, 1);
        sub.close();
        sub.close();
        assert!(!sub.is_open());
        assert_eq!(store.open_subscriptions().await, 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = InMemoryCallStore::new();
        store.set_fail_writes(true);
        assert!(store.create(ringing()).await.is_err());
        store.set_fail_writes(false);
        store.set_fail_subscribe(true);
        assert!(
            SessionStore::subscribe(&store, SessionFilter::ReceiverInserts("bob".into()))
                .await
                .is_err()
        );
    }
}
