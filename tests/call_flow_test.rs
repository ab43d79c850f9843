use amora::calls::sim::{LoopbackTransport, LoopbackTransportFactory, SimulatedCapture};
use amora::calls::{
    BusyPolicy, CallError, CallNotice, CaptureFailure, DeviceError, LocalStatus, ProtocolError,
    SessionInput, SetupFailure, missed_call_count,
};
use amora::store::error::Result as StoreResult;
use amora::store::{
    CallBackend, CandidateStore, InMemoryCallStore, ProfileDirectory, SessionFilter, SessionStore,
    Subscription,
};
use amora::types::{
    CallKind, CandidateRecord, DisplayInfo, FeedEvent, IceCandidate, NewCandidate, NewSession,
    SessionId, SessionPatch, SessionRecord, SessionStatus, UserId,
};
use amora::{CallConfig, CallSession, Collaborators};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct Peer {
    session: CallSession,
    capture: Arc<SimulatedCapture>,
    transports: Arc<LoopbackTransportFactory>,
    notices: broadcast::Receiver<CallNotice>,
}

impl Peer {
    async fn new(store: &Arc<InMemoryCallStore>, user: &str, config: CallConfig) -> Self {
        Self::with_backend(store.clone(), user, config).await
    }

    async fn with_backend(backend: Arc<dyn CallBackend>, user: &str, config: CallConfig) -> Self {
        let capture = Arc::new(SimulatedCapture::new());
        let transports = Arc::new(LoopbackTransportFactory::new());
        let mut session = CallSession::new(
            user.into(),
            config,
            Collaborators {
                backend,
                capture: capture.clone(),
                transports: transports.clone(),
            },
        );
        session.sign_in().await.unwrap();
        let notices = session.notices();
        Self {
            session,
            capture,
            transports,
            notices,
        }
    }

    fn status(&self) -> LocalStatus {
        self.session.status()
    }

    fn transport(&self) -> Arc<LoopbackTransport> {
        self.transports.last_transport().expect("no transport created")
    }

    fn drain_notices(&mut self) -> Vec<CallNotice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            notices.push(notice);
        }
        notices
    }

    fn assert_released(&self) {
        assert_eq!(self.status(), LocalStatus::Idle);
        assert_eq!(self.session.media_gate().live_handles(), 0);
        assert!(!self.session.has_call_feed());
        assert_eq!(self.transports.open_transports(), 0);
        let view = self.session.view();
        assert!(view.session_id.is_none());
        assert!(view.local_media.is_none());
        assert!(view.remote_media.is_none());
        assert!(view.remote_display_info.is_none());
    }
}

fn setup_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn store_with_profiles() -> Arc<InMemoryCallStore> {
    let store = Arc::new(InMemoryCallStore::new());
    for (id, name) in [("alice", "Alice"), ("bob", "Bob"), ("carol", "Carol")] {
        store.insert_profile(
            id,
            DisplayInfo {
                name: name.to_string(),
                avatar_url: None,
            },
        );
    }
    store
}

/// Pumps every peer until nothing is left to deliver.
async fn settle(peers: &mut [&mut Peer]) {
    for _ in 0..100 {
        let mut handled = 0;
        for peer in peers.iter_mut() {
            handled += peer.session.pump().await;
        }
        if handled == 0 {
            return;
        }
    }
    panic!("peers did not settle");
}

async fn only_session(store: &InMemoryCallStore) -> SessionRecord {
    let sessions = store.sessions().await;
    assert_eq!(sessions.len(), 1, "expected exactly one session");
    sessions.into_iter().next().unwrap()
}

/// Waits for and handles the feed losses of one peer.
async fn recover_lost_feeds(peer: &mut Peer, count: usize) {
    for _ in 0..count {
        let input = tokio::time::timeout(Duration::from_secs(1), peer.session.next_input())
            .await
            .expect("lost feed was not reported");
        assert!(matches!(input, SessionInput::FeedLost(_)), "got {input:?}");
        peer.session.handle(input).await;
    }
}

/// A receiver that declines every call in the same write as its creation,
/// before the caller can subscribe to the row.
struct InstantDecline(Arc<InMemoryCallStore>);

#[async_trait]
impl SessionStore for InstantDecline {
    async fn create(&self, session: NewSession) -> StoreResult<SessionRecord> {
        let record = self.0.create(session).await?;
        self.0
            .update(&record.id, SessionPatch::status(SessionStatus::Declined))
            .await?;
        Ok(record)
    }

    async fn update(&self, id: &SessionId, patch: SessionPatch) -> StoreResult<SessionRecord> {
        self.0.update(id, patch).await
    }

    async fn get(&self, id: &SessionId) -> StoreResult<Option<SessionRecord>> {
        SessionStore::get(self.0.as_ref(), id).await
    }

    async fn list_for_participant(&self, user: &UserId) -> StoreResult<Vec<SessionRecord>> {
        self.0.list_for_participant(user).await
    }

    async fn subscribe(&self, filter: SessionFilter) -> StoreResult<Subscription> {
        SessionStore::subscribe(self.0.as_ref(), filter).await
    }
}

#[async_trait]
impl CandidateStore for InstantDecline {
    async fn append(&self, candidate: NewCandidate) -> StoreResult<CandidateRecord> {
        self.0.append(candidate).await
    }

    async fn query(
        &self,
        session_id: &SessionId,
        excluding_author: &UserId,
    ) -> StoreResult<Vec<CandidateRecord>> {
        self.0.query(session_id, excluding_author).await
    }

    async fn subscribe(&self, session_id: &SessionId) -> StoreResult<Subscription> {
        CandidateStore::subscribe(self.0.as_ref(), session_id).await
    }
}

#[async_trait]
impl ProfileDirectory for InstantDecline {
    async fn display_info(&self, user: &UserId) -> StoreResult<Option<DisplayInfo>> {
        self.0.display_info(user).await
    }
}

async fn session_from(store: &InMemoryCallStore, caller: &str) -> SessionRecord {
    store
        .sessions()
        .await
        .into_iter()
        .find(|s| s.caller_id.as_str() == caller)
        .expect("no session from caller")
}

#[tokio::test]
async fn test_start_rings_receiver_without_activating() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    assert_eq!(alice.status(), LocalStatus::Outgoing);
    assert_eq!(alice.session.media_gate().live_handles(), 1);

    let record = only_session(&store).await;
    assert_eq!(record.status, SessionStatus::Ringing);
    assert!(record.answer.is_none());

    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(bob.status(), LocalStatus::Incoming);
    assert_eq!(alice.status(), LocalStatus::Outgoing);
    assert_eq!(bob.session.media_gate().live_handles(), 0);

    let view = bob.session.view();
    assert_eq!(view.session_id, Some(record.id.clone()));
    assert_eq!(view.remote_display_info.map(|d| d.name), Some("Alice".to_string()));
    assert!(view.is_video_off);

    // Caller trickled its candidates as they were gathered.
    let candidates = store.candidates_for(&record.id).await;
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.author_id.as_str() == "alice"));
}

#[tokio::test]
async fn test_accept_activates_both_peers() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.session.accept().await.unwrap();
    assert_eq!(bob.status(), LocalStatus::Active);

    let record = only_session(&store).await;
    assert_eq!(record.status, SessionStatus::Active);
    assert!(record.answer.is_some());

    // One round trip through the store is enough for the caller.
    alice.session.pump().await;
    assert_eq!(alice.status(), LocalStatus::Active);

    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.transport().remote_description(), record.answer);
    assert_eq!(bob.transport().remote_description(), Some(record.offer.clone()));
    assert_eq!(alice.transport().applied_candidates().len(), 2);
    assert_eq!(bob.transport().applied_candidates().len(), 2);

    for peer in [&alice, &bob] {
        let view = peer.session.view();
        assert!(view.remote_media.is_some());
        assert!(view.local_media.is_some());
        assert!(!view.is_video_off);
    }
    assert_eq!(
        alice.session.view().remote_display_info.map(|d| d.name),
        Some("Bob".to_string())
    );
}

#[tokio::test]
async fn test_redelivered_early_candidate_is_applied_once() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    let session_id = only_session(&store).await.id;

    // Records 1 and 2 are alice's; burn 3..=6 on another session.
    for n in 3..=6 {
        store
            .append(NewCandidate {
                session_id: SessionId::new("elsewhere"),
                author_id: "carol".into(),
                candidate: IceCandidate::new(format!("candidate:{n}")),
            })
            .await
            .unwrap();
    }
    let early = store
        .append(NewCandidate {
            session_id: session_id.clone(),
            author_id: "bob".into(),
            candidate: IceCandidate::new("candidate:7 1 UDP 1694498815 203.0.113.7 40007 typ srflx"),
        })
        .await
        .unwrap();
    assert_eq!(early.record_id.0, 7);
    store.redeliver_candidate(&early).await;

    settle(&mut [&mut alice]).await;
    assert_eq!(alice.session.buffer().pending_len(), 1);
    assert!(alice.transport().applied_candidates().is_empty());

    bob.session.accept().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Active);
    let applied = alice.transport().applied_candidates();
    assert_eq!(
        applied.iter().filter(|c| **c == early.candidate).count(),
        1
    );
    assert_eq!(alice.session.buffer().pending_len(), 0);

    // Late redelivery after the flush changes nothing.
    store.redeliver_candidate(&early).await;
    settle(&mut [&mut alice]).await;
    assert_eq!(alice.transport().applied_candidates().len(), applied.len());
}

#[tokio::test]
async fn test_candidates_before_answer_wait_for_it() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;

    store.set_hold_updates(true);
    bob.session.accept().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Outgoing);
    assert_eq!(alice.session.buffer().pending_len(), 2);
    assert!(alice.transport().applied_candidates().is_empty());

    store.release_held_updates().await;
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Active);
    assert_eq!(alice.transport().applied_candidates().len(), 2);

    // A redelivered answer does not apply a second remote description.
    let session_id = only_session(&store).await.id;
    store.redeliver_session_update(&session_id).await;
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.transport().remote_description_count(), 1);
    assert_eq!(alice.status(), LocalStatus::Active);
}

#[tokio::test]
async fn test_busy_camera_on_start_creates_nothing() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    alice
        .capture
        .fail_with(CaptureFailure::new("NotReadableError", "Could not start video source"));

    let err = alice
        .session
        .start("bob".into(), CallKind::Video)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Setup(SetupFailure::Device(DeviceError::Busy))
    ));
    assert_eq!(alice.status(), LocalStatus::Idle);
    assert_eq!(store.session_count().await, 0);
    assert_eq!(alice.session.media_gate().live_handles(), 0);

    let notices = alice.drain_notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(
        notices[0].user_message(),
        "Camera/Mic is busy. Please close other apps using it."
    );

    // The failure is not sticky.
    alice.capture.succeed();
    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    assert_eq!(alice.status(), LocalStatus::Outgoing);
}

#[tokio::test]
async fn test_end_while_active_releases_both_peers() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.session.accept().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Active);
    bob.drain_notices();

    alice.session.end().await.unwrap();
    alice.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ended);

    settle(&mut [&mut alice, &mut bob]).await;
    bob.assert_released();
    assert_eq!(
        bob.drain_notices(),
        vec![CallNotice::RemoteFinished(SessionStatus::Ended)]
    );

    // Only the two inbound feeds remain.
    assert_eq!(store.open_subscriptions().await, 2);
    assert!(alice.capture.opened() > 0);
}

#[tokio::test]
async fn test_second_start_while_outgoing_is_rejected() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    let err = alice
        .session
        .start("carol".into(), CallKind::Voice)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Protocol(ProtocolError::InvalidTransition { .. })
    ));
    assert_eq!(store.session_count().await, 1);
    assert_eq!(alice.session.media_gate().live_handles(), 1);
    assert_eq!(alice.capture.opened(), 1);
    assert_eq!(alice.status(), LocalStatus::Outgoing);
}

#[tokio::test]
async fn test_reject_declines_for_both() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.session.reject().await.unwrap();
    bob.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Declined);

    settle(&mut [&mut alice, &mut bob]).await;
    alice.assert_released();
    let notices = alice.drain_notices();
    assert_eq!(notices, vec![CallNotice::RemoteFinished(SessionStatus::Declined)]);
    assert_eq!(notices[0].user_message(), "Call declined");
}

#[tokio::test]
async fn test_caller_cancel_stops_ringing() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    alice.session.end().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;

    bob.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ended);
}

#[tokio::test]
async fn test_accept_device_failure_leaves_session_untouched() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.capture
        .fail_with(CaptureFailure::new("NotAllowedError", "Permission denied"));

    let err = bob.session.accept().await.unwrap_err();
    assert_eq!(
        err.user_message(),
        Some("Permission denied. Please allow access to camera/mic.")
    );
    bob.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ringing);

    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Outgoing);
}

#[tokio::test]
async fn test_end_and_reject_when_idle_are_no_ops() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;

    alice.session.end().await.unwrap();
    alice.session.reject().await.unwrap();
    alice.session.end().await.unwrap();
    alice.assert_released();
    assert!(alice.drain_notices().is_empty());
    assert_eq!(store.session_count().await, 0);
}

#[tokio::test]
async fn test_toggles_flip_tracks_and_view() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;

    assert!(alice.session.toggle_mute().is_err());
    alice.session.start("bob".into(), CallKind::Video).await.unwrap();

    assert!(alice.session.toggle_mute().unwrap());
    assert!(alice.session.toggle_video().unwrap());
    let view = alice.session.view();
    assert!(view.is_muted);
    assert!(view.is_video_off);

    assert!(!alice.session.toggle_mute().unwrap());
    assert!(!alice.session.view().is_muted);

    alice.session.end().await.unwrap();
    let view = alice.session.view();
    assert!(!view.is_muted);
    assert!(!view.is_video_off);
}

#[tokio::test]
async fn test_start_requires_sign_in_and_refuses_self() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;

    assert!(matches!(
        alice.session.start("alice".into(), CallKind::Voice).await,
        Err(CallError::Protocol(_))
    ));

    alice.session.sign_out().await;
    assert!(matches!(
        alice.session.start("bob".into(), CallKind::Voice).await,
        Err(CallError::NotSignedIn)
    ));
    assert_eq!(store.open_subscriptions().await, 0);
    assert_eq!(store.session_count().await, 0);
}

#[tokio::test]
async fn test_sign_out_ends_current_call() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.session.sign_out().await;

    bob.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ended);
    settle(&mut [&mut alice, &mut bob]).await;
    alice.assert_released();
}

#[tokio::test]
async fn test_inbound_call_while_busy_is_ignored_by_default() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;
    let mut carol = Peer::new(&store, "carol", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;
    carol.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    let alice_session = alice.session.view().session_id;
    assert_eq!(bob.session.view().session_id, alice_session);
    assert_eq!(carol.status(), LocalStatus::Outgoing);
    assert_eq!(
        session_from(&store, "carol").await.status,
        SessionStatus::Ringing
    );
}

#[tokio::test]
async fn test_inbound_call_while_busy_can_be_declined() {
    setup_logging();
    let store = store_with_profiles();
    let declining = CallConfig {
        busy_policy: BusyPolicy::AutoDecline,
        ..CallConfig::default()
    };
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", declining).await;
    let mut carol = Peer::new(&store, "carol", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;
    carol.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob, &mut carol]).await;

    assert_eq!(bob.status(), LocalStatus::Incoming);
    carol.assert_released();
    assert_eq!(
        carol.drain_notices(),
        vec![CallNotice::RemoteFinished(SessionStatus::Declined)]
    );
    assert_eq!(
        session_from(&store, "alice").await.status,
        SessionStatus::Ringing
    );
    assert_eq!(
        session_from(&store, "carol").await.status,
        SessionStatus::Declined
    );
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_marked_missed() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;

    tokio::time::advance(Duration::from_secs(44)).await;
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Outgoing);
    assert_eq!(bob.status(), LocalStatus::Incoming);

    tokio::time::advance(Duration::from_secs(2)).await;
    settle(&mut [&mut alice, &mut bob]).await;
    alice.assert_released();
    bob.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Missed);
    assert_eq!(alice.drain_notices(), vec![CallNotice::NoAnswer]);
    assert_eq!(
        missed_call_count(store.as_ref(), &"bob".into()).await.unwrap(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn test_ring_timeout_can_be_disabled() {
    setup_logging();
    let store = store_with_profiles();
    let config = CallConfig {
        ring_timeout_secs: 0,
        ..CallConfig::default()
    };
    let mut alice = Peer::new(&store, "alice", config.clone()).await;
    let mut bob = Peer::new(&store, "bob", config).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    tokio::time::advance(Duration::from_secs(600)).await;
    settle(&mut [&mut alice, &mut bob]).await;

    assert_eq!(alice.status(), LocalStatus::Outgoing);
    assert_eq!(bob.status(), LocalStatus::Incoming);
}

#[tokio::test]
async fn test_store_outage_on_start_reports_failure() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    store.set_fail_writes(true);

    let err = alice
        .session
        .start("bob".into(), CallKind::Voice)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CallError::Setup(SetupFailure::Signaling(_))
    ));
    alice.assert_released();
    assert_eq!(alice.drain_notices().len(), 1);
}

#[tokio::test]
async fn test_feed_outage_on_start_closes_the_orphaned_session() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    store.set_fail_subscribe(true);

    assert!(
        alice
            .session
            .start("bob".into(), CallKind::Voice)
            .await
            .is_err()
    );
    alice.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ended);
    assert_eq!(
        SessionStore::list_for_participant(store.as_ref(), &"bob".into())
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_redelivered_insert_after_reject_does_not_ring_again() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    let mut original = only_session(&store).await;
    bob.session.reject().await.unwrap();
    bob.assert_released();

    // The feed replays the insert as it was first delivered.
    original.status = SessionStatus::Ringing;
    original.answer = None;
    bob.session
        .handle(SessionInput::Feed(FeedEvent::SessionInserted(original)))
        .await;
    bob.assert_released();
    assert!(matches!(bob.session.accept().await, Err(CallError::Protocol(_))));
    assert_eq!(only_session(&store).await.status, SessionStatus::Declined);
}

#[tokio::test]
async fn test_decline_written_before_caller_subscribes_still_reaches_caller() {
    setup_logging();
    let store = store_with_profiles();
    let backend = Arc::new(InstantDecline(store.clone()));
    let mut alice = Peer::with_backend(backend, "alice", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Video).await.unwrap();
    alice.assert_released();
    assert_eq!(
        alice.drain_notices(),
        vec![CallNotice::RemoteFinished(SessionStatus::Declined)]
    );
    assert_eq!(only_session(&store).await.status, SessionStatus::Declined);
}

#[tokio::test]
async fn test_caller_hangup_before_receiver_subscribes_stops_ringing() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    // Bob has the insert queued but has not handled it yet.
    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    alice.session.end().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;

    bob.assert_released();
    assert_eq!(
        bob.drain_notices(),
        vec![CallNotice::RemoteFinished(SessionStatus::Ended)]
    );
}

#[tokio::test]
async fn test_lost_feeds_are_reopened_mid_call() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    bob.session.accept().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    assert_eq!(alice.status(), LocalStatus::Active);

    store.drop_subscriptions().await;
    recover_lost_feeds(&mut alice, 2).await;
    recover_lost_feeds(&mut bob, 2).await;
    assert_eq!(store.open_subscriptions().await, 6);
    assert_eq!(alice.status(), LocalStatus::Active);
    assert!(alice.drain_notices().is_empty());

    bob.session.end().await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;
    alice.assert_released();
    assert_eq!(
        alice.drain_notices(),
        vec![CallNotice::RemoteFinished(SessionStatus::Ended)]
    );
}

#[tokio::test]
async fn test_unrecoverable_feed_loss_ends_the_call_and_tells_the_user() {
    setup_logging();
    let store = store_with_profiles();
    let mut alice = Peer::new(&store, "alice", CallConfig::default()).await;
    let mut bob = Peer::new(&store, "bob", CallConfig::default()).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    settle(&mut [&mut alice, &mut bob]).await;

    store.set_fail_subscribe(true);
    store.drop_subscriptions().await;
    recover_lost_feeds(&mut alice, 2).await;

    alice.assert_released();
    assert_eq!(only_session(&store).await.status, SessionStatus::Ended);
    let notices = alice.drain_notices();
    assert_eq!(notices.len(), 2);
    assert!(
        notices
            .iter()
            .all(|n| n.user_message() == "Connection error: Calls may not work")
    );
}

#[tokio::test]
async fn test_out_of_range_ring_timeout_leaves_timer_unarmed() {
    setup_logging();
    let store = store_with_profiles();
    let config = CallConfig {
        ring_timeout_secs: u64::MAX,
        ..CallConfig::default()
    };
    let mut alice = Peer::new(&store, "alice", config).await;

    alice.session.start("bob".into(), CallKind::Voice).await.unwrap();
    alice.session.pump().await;
    assert_eq!(alice.status(), LocalStatus::Outgoing);
}
