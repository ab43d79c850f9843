//! Call session driver.
//!
//! [`CallSession`] owns one user's call state. Every command, feed event,
//! transport event and timer expiry becomes a [`CallInput`] for the
//! [`CallMachine`]; the [`Effect`]s it returns are carried out here against
//! the collaborators, and their results are fed back as further inputs.

use super::error::CallError;
use super::media::{CaptureBackend, CaptureHandle, MediaGate};
use super::peer::{PeerConnectionState, PeerEvent, PeerLink, PeerTransportFactory, RemoteMedia};
use super::signaling::{LostFeed, SignalingChannel};
use crate::config::CallConfig;
use crate::store::{CallBackend, CandidateStore, ProfileDirectory, SessionStore};
use crate::store::error::StoreError;
use amcore::calls::{
    Admission, CallDirection, CallInput, CallMachine, CallNotice, CandidateBuffer, Command,
    Completion, Effect, LocalStatus, SetupFailure, SignalingError,
};
use amcore::types::{
    CallKind, CandidateRecord, DisplayInfo, FeedEvent, IceCandidate, NewCandidate, NewSession,
    SessionDescription, SessionId, SessionPatch, SessionRecord, SessionStatus, UserId,
};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

const NOTICE_CAPACITY: usize = 100;

/// Everything a [`CallSession`] talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn CallBackend>,
    pub capture: Arc<dyn CaptureBackend>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

/// Read-only projection of the session for rendering.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CallView {
    pub status: LocalStatus,
    pub session_id: Option<SessionId>,
    pub kind: Option<CallKind>,
    pub direction: Option<CallDirection>,
    pub remote_display_info: Option<DisplayInfo>,
    /// Id of the local capture handle, while one is held.
    pub local_media: Option<u64>,
    /// Remote stream id, once remote media arrived.
    pub remote_media: Option<String>,
    pub is_muted: bool,
    pub is_video_off: bool,
}

/// One thing the session woke up for.
#[derive(Debug)]
pub enum SessionInput {
    Feed(FeedEvent),
    FeedLost(LostFeed),
    Peer(PeerEvent),
    RingTimeout,
}

pub struct CallSession {
    machine: CallMachine,
    config: CallConfig,
    backend: Arc<dyn CallBackend>,
    media: Arc<MediaGate>,
    transports: Arc<dyn PeerTransportFactory>,
    signaling: SignalingChannel,
    buffer: CandidateBuffer,
    link: Option<PeerLink>,
    local_media: Option<CaptureHandle>,
    remote_media: Option<RemoteMedia>,
    remote_display: Option<DisplayInfo>,
    ring_deadline: Option<Instant>,
    setup_failure: Option<SetupFailure>,
    /// Row and candidate state read after a call feed opened, replayed as
    /// feed events.
    catch_up: Vec<FeedEvent>,
    signed_in: bool,
    view_tx: watch::Sender<CallView>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallSession {
    pub fn new(self_id: UserId, config: CallConfig, collaborators: Collaborators) -> Self {
        let (view_tx, _) = watch::channel(CallView::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            machine: CallMachine::new(self_id.clone(), config.busy_policy),
            signaling: SignalingChannel::new(collaborators.backend.clone(), self_id),
            config,
            backend: collaborators.backend,
            media: Arc::new(MediaGate::new(collaborators.capture)),
            transports: collaborators.transports,
            buffer: CandidateBuffer::new(),
            link: None,
            local_media: None,
            remote_media: None,
            remote_display: None,
            ring_deadline: None,
            setup_failure: None,
            catch_up: Vec::new(),
            signed_in: false,
            view_tx,
            notices,
        }
    }

    pub fn self_id(&self) -> &UserId {
        self.machine.self_id()
    }

    pub fn status(&self) -> LocalStatus {
        self.machine.status()
    }

    pub fn machine(&self) -> &CallMachine {
        &self.machine
    }

    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    pub fn view(&self) -> CallView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe_view(&self) -> watch::Receiver<CallView> {
        self.view_tx.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub(crate) fn notice_sender(&self) -> broadcast::Sender<CallNotice> {
        self.notices.clone()
    }

    pub fn media_gate(&self) -> Arc<MediaGate> {
        self.media.clone()
    }

    pub fn has_call_feed(&self) -> bool {
        self.signaling.call_feed_session().is_some()
    }

    pub fn is_signed_in(&self) -> bool {
        self.signed_in
    }

    pub fn buffer(&self) -> &CandidateBuffer {
        &self.buffer
    }

    /// Opens the inbound-call feed.
    pub async fn sign_in(&mut self) -> Result<(), CallError> {
        self.signaling
            .open_inbound()
            .await
            .map_err(|e| CallError::Setup(e.into()))?;
        self.signed_in = true;
        info!("{} signed in for calls", self.self_id());
        Ok(())
    }

    /// Ends any current call, then closes the inbound-call feed.
    pub async fn sign_out(&mut self) {
        if let Err(e) = self.end().await {
            warn!("Ending call on sign-out failed: {e}");
        }
        self.signaling.close_inbound();
        self.signed_in = false;
        info!("{} signed out of calls", self.self_id());
    }

    pub async fn start(&mut self, receiver: UserId, kind: CallKind) -> Result<(), CallError> {
        if !self.signed_in {
            return Err(CallError::NotSignedIn);
        }
        info!("Starting {kind} call to {receiver}");
        self.command(Command::Start { receiver, kind }).await
    }

    pub async fn accept(&mut self) -> Result<(), CallError> {
        self.command(Command::Accept).await
    }

    pub async fn reject(&mut self) -> Result<(), CallError> {
        self.command(Command::Reject).await
    }

    pub async fn end(&mut self) -> Result<(), CallError> {
        self.command(Command::End).await
    }

    /// Returns the new muted flag.
    pub fn toggle_mute(&mut self) -> Result<bool, CallError> {
        self.toggle(Command::ToggleMute)?;
        Ok(self.machine.is_muted())
    }

    /// Returns the new video-off flag.
    pub fn toggle_video(&mut self) -> Result<bool, CallError> {
        self.toggle(Command::ToggleVideo)?;
        Ok(self.machine.is_video_off())
    }

    /// Handles every input that is ready without waiting and returns how
    /// many there were.
    pub async fn pump(&mut self) -> usize {
        let mut handled = 0;
        loop {
            let input = if self.ring_expired() {
                SessionInput::RingTimeout
            } else if let Some(event) = self.link.as_mut().and_then(PeerLink::try_next_event) {
                SessionInput::Peer(event)
            } else if let Some(event) = self.signaling.try_next() {
                SessionInput::Feed(event)
            } else {
                return handled;
            };
            self.handle(input).await;
            handled += 1;
        }
    }

    /// Waits for the next feed event, transport event or ring timeout.
    pub async fn next_input(&mut self) -> SessionInput {
        let deadline = self.ring_deadline;
        tokio::select! {
            event = self.signaling.next() => match event {
                Ok(event) => SessionInput::Feed(event),
                Err(lost) => SessionInput::FeedLost(lost),
            },
            event = next_peer_event(self.link.as_mut()) => SessionInput::Peer(event),
            () = sleep_until(deadline) => SessionInput::RingTimeout,
        }
    }

    /// Handles one input. Errors are logged and the input dropped.
    pub async fn handle(&mut self, input: SessionInput) {
        let result = match input {
            SessionInput::Feed(event) => {
                debug!("Feed event {} for session {}", event.name(), event.session_id());
                self.dispatch(event.into()).await
            }
            SessionInput::FeedLost(lost) => self.on_feed_lost(lost).await,
            SessionInput::Peer(event) => self.on_peer_event(event).await,
            SessionInput::RingTimeout => {
                self.ring_deadline = None;
                info!("Ring timeout while {:?}", self.status());
                self.dispatch(CallInput::RingTimeout).await
            }
        };
        if let Err(e) = result {
            warn!("Dropped input: {e}");
        }
    }

    async fn command(&mut self, command: Command) -> Result<(), CallError> {
        let name = command.name();
        self.setup_failure = None;
        if let Err(e) = self.dispatch(command.into()).await {
            warn!("{name} rejected: {e}");
            return Err(e);
        }
        match self.setup_failure.take() {
            Some(failure) => Err(CallError::Setup(failure)),
            None => Ok(()),
        }
    }

    fn toggle(&mut self, command: Command) -> Result<(), CallError> {
        let effects = self.machine.apply(command.into())?;
        for effect in effects {
            match effect {
                Effect::SetAudioEnabled(enabled) => self.set_audio_enabled(enabled),
                Effect::SetVideoEnabled(enabled) => self.set_video_enabled(enabled),
                other => warn!("Unexpected effect from toggle: {other:?}"),
            }
        }
        self.publish_view();
        Ok(())
    }

    /// Runs `input` and every follow-up input its effects produce. Only an
    /// error from `input` itself is returned.
    async fn dispatch(&mut self, input: CallInput) -> Result<(), CallError> {
        let mut queue = VecDeque::from([input]);
        let mut first = true;
        while let Some(input) = queue.pop_front() {
            match self.machine.apply(input) {
                Ok(effects) => {
                    for effect in effects {
                        if let Some(follow_up) = self.execute(effect).await {
                            queue.push_back(follow_up);
                        }
                        queue.extend(self.catch_up.drain(..).map(CallInput::from));
                    }
                }
                Err(e) if first => {
                    self.publish_view();
                    return Err(e.into());
                }
                Err(e) => warn!("Dropped follow-up input: {e}"),
            }
            first = false;
        }
        self.publish_view();
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> Option<CallInput> {
        match effect {
            Effect::BeginOutgoing { receiver, kind } => {
                let completion = match self.begin_outgoing(receiver, kind).await {
                    Ok(record) => Completion::OutgoingReady(record),
                    Err(failure) => Completion::SetupFailed(failure),
                };
                Some(CallInput::Completed(completion))
            }
            Effect::BeginAnswer {
                session_id,
                kind,
                offer,
            } => {
                let completion = match self.begin_answer(&session_id, kind, &offer).await {
                    Ok(()) => Completion::AnswerSent,
                    Err(failure) => Completion::SetupFailed(failure),
                };
                Some(CallInput::Completed(completion))
            }
            Effect::OpenCallFeed(session_id) => {
                match self.signaling.open_call_feed(&session_id).await {
                    Ok(()) => {
                        self.catch_up = self.read_back(&session_id).await;
                        None
                    }
                    Err(e) => {
                        warn!("Could not open call feed for {session_id}: {e}");
                        Some(CallInput::Completed(Completion::SetupFailed(e.into())))
                    }
                }
            }
            Effect::FetchDisplayInfo(user) => {
                match self.backend.display_info(&user).await {
                    Ok(Some(info)) => self.remote_display = Some(info),
                    Ok(None) => debug!("No profile for {user}"),
                    Err(e) => warn!("Profile lookup for {user} failed: {e}"),
                }
                None
            }
            Effect::PersistStatus { session_id, status } => {
                self.persist_status(&session_id, status).await;
                None
            }
            Effect::ApplyRemoteAnswer(answer) => self.apply_remote_answer(&answer).await,
            Effect::AdmitCandidate(record) => {
                self.admit_candidate(&record).await;
                None
            }
            Effect::PublishCandidate {
                session_id,
                candidate,
            } => {
                self.publish_candidate(session_id, candidate).await;
                None
            }
            Effect::SetAudioEnabled(enabled) => {
                self.set_audio_enabled(enabled);
                None
            }
            Effect::SetVideoEnabled(enabled) => {
                self.set_video_enabled(enabled);
                None
            }
            Effect::ArmRingTimer => {
                self.ring_deadline = self.config.ring_timeout().and_then(|timeout| {
                    let deadline = Instant::now().checked_add(timeout);
                    if deadline.is_none() {
                        warn!("Ring timeout of {timeout:?} is out of range, not arming");
                    }
                    deadline
                });
                None
            }
            Effect::DisarmRingTimer => {
                self.ring_deadline = None;
                None
            }
            Effect::Notify(notice) => {
                self.notify(notice);
                None
            }
            Effect::Cleanup => {
                self.cleanup().await;
                Some(CallInput::TeardownComplete)
            }
        }
    }

    /// Media, link, offer, ringing row, call feed. Whatever got acquired
    /// before a failure is released by the cleanup that follows it. Anything
    /// the receiver wrote before the feed opened is queued in `catch_up`.
    async fn begin_outgoing(
        &mut self,
        receiver: UserId,
        kind: CallKind,
    ) -> Result<SessionRecord, SetupFailure> {
        let handle = self.media.acquire(kind).await?;
        self.local_media = Some(handle.clone());

        let link = PeerLink::open(self.transports.as_ref(), &self.config.peer_config())
            .await
            .map_err(transport_failure)?;
        let link = self.link.insert(link);
        link.add_local_tracks(&handle)
            .await
            .map_err(transport_failure)?;
        let offer = link.create_offer().await.map_err(transport_failure)?;

        let new_session = NewSession::ringing(self.self_id().clone(), receiver, kind, offer);
        let record = self
            .backend
            .create(new_session)
            .await
            .map_err(|e| SignalingError::StoreWriteFailed(e.to_string()))?;
        info!("Session {} ringing {}", record.id, record.receiver_id);

        if let Err(e) = self.signaling.open_call_feed(&record.id).await {
            // Nobody will ever see an answer; close the row.
            if let Err(persist) = self
                .backend
                .update(&record.id, SessionPatch::status(SessionStatus::Ended))
                .await
            {
                debug!("Could not close orphaned session {}: {persist}", record.id);
            }
            return Err(e.into());
        }
        self.catch_up = self.read_back(&record.id).await;
        Ok(record)
    }

    /// Reads what a freshly opened call feed may have missed: a row that is
    /// already answered or finished, and the remote candidates so far.
    /// Replays are harmless since the machine and the buffer ignore repeats.
    async fn read_back(&self, session_id: &SessionId) -> Vec<FeedEvent> {
        let mut events = Vec::new();
        match self.backend.get(session_id).await {
            Ok(Some(row)) if row.status.is_terminal() || row.answer.is_some() => {
                debug!("Session {session_id} is already {}", row.status);
                events.push(FeedEvent::SessionUpdated(row));
            }
            Ok(_) => {}
            Err(e) => debug!("Could not read back session {session_id}: {e}"),
        }
        match self.backend.query(session_id, self.self_id()).await {
            Ok(records) => events.extend(records.into_iter().map(FeedEvent::CandidateInserted)),
            Err(e) => debug!("Could not read back candidates of {session_id}: {e}"),
        }
        events
    }

    /// Re-subscribes a feed the store dropped. When that fails the user is
    /// told, and a call that can no longer hear its peer is ended.
    async fn on_feed_lost(&mut self, lost: LostFeed) -> Result<(), CallError> {
        match lost {
            LostFeed::Inbound => {
                if !self.signed_in {
                    return Ok(());
                }
                match self.signaling.open_inbound().await {
                    Ok(()) => info!("Inbound call feed reopened for {}", self.self_id()),
                    Err(e) => {
                        warn!("Inbound call feed lost: {e}");
                        self.notify(CallNotice::PersistFailed(e));
                    }
                }
                Ok(())
            }
            LostFeed::Call(session_id) => {
                let current = self.machine.current_session() == Some(&session_id);
                if !current || self.status() == LocalStatus::Ending {
                    return Ok(());
                }
                match self.signaling.open_call_feed(&session_id).await {
                    Ok(()) => {
                        info!("Call feed reopened for session {session_id}");
                        for event in self.read_back(&session_id).await {
                            self.dispatch(event.into()).await?;
                        }
                        Ok(())
                    }
                    Err(e) => {
                        warn!("Call feed for session {session_id} lost: {e}");
                        self.notify(CallNotice::PersistFailed(e));
                        self.dispatch(Command::End.into()).await
                    }
                }
            }
        }
    }

    /// Media, link, offer applied, candidates seeded, answer persisted.
    async fn begin_answer(
        &mut self,
        session_id: &SessionId,
        kind: CallKind,
        offer: &SessionDescription,
    ) -> Result<(), SetupFailure> {
        let handle = self.media.acquire(kind).await?;
        self.local_media = Some(handle.clone());

        let link = PeerLink::open(self.transports.as_ref(), &self.config.peer_config())
            .await
            .map_err(transport_failure)?;
        let link = self.link.insert(link);
        link.add_local_tracks(&handle)
            .await
            .map_err(transport_failure)?;
        link.apply_remote_description(offer, &mut self.buffer)
            .await
            .map_err(|e| SetupFailure::Transport(e.to_string()))?;

        // The call feed is already open, so anything inserted after this
        // query arrives through it and is de-duplicated by record id.
        let existing = self
            .backend
            .query(session_id, self.machine.self_id())
            .await
            .map_err(|e| SignalingError::SubscribeFailed(e.to_string()))?;
        debug!("Seeding {} existing remote candidate(s)", existing.len());
        for record in &existing {
            link.admit_remote_candidate(record, self.machine.self_id(), &mut self.buffer)
                .await;
        }

        let answer = link.create_answer().await.map_err(transport_failure)?;
        self.backend
            .update(session_id, SessionPatch::accept(answer))
            .await
            .map_err(|e| SignalingError::StoreWriteFailed(e.to_string()))?;
        info!("Answered session {session_id}");
        Ok(())
    }

    async fn apply_remote_answer(&mut self, answer: &SessionDescription) -> Option<CallInput> {
        let Some(link) = self.link.as_ref() else {
            warn!("Answer arrived without a peer link");
            return Some(Command::End.into());
        };
        match link.apply_remote_description(answer, &mut self.buffer).await {
            Ok(()) => {
                info!("Remote answer applied");
                None
            }
            Err(e) => {
                warn!("Could not apply remote answer: {e}");
                Some(Command::End.into())
            }
        }
    }

    async fn admit_candidate(&mut self, record: &CandidateRecord) {
        let self_id = self.machine.self_id();
        match self.link.as_ref() {
            Some(link) => {
                link.admit_remote_candidate(record, self_id, &mut self.buffer)
                    .await;
            }
            // Incoming and not yet accepted: hold on to it for the answer.
            None => {
                if let Admission::Apply(_) = self.buffer.admit(record, self_id) {
                    warn!("Candidate {} ready with no peer link", record.record_id);
                }
            }
        }
    }

    async fn publish_candidate(&mut self, session_id: SessionId, candidate: IceCandidate) {
        let new = NewCandidate {
            session_id,
            author_id: self.self_id().clone(),
            candidate,
        };
        match self.backend.append(new).await {
            Ok(record) => debug!("Published local candidate {}", record.record_id),
            Err(e) => warn!("Could not publish local candidate: {e}"),
        }
    }

    async fn persist_status(&mut self, session_id: &SessionId, status: SessionStatus) {
        match self
            .backend
            .update(session_id, SessionPatch::status(status))
            .await
        {
            Ok(_) => debug!("Persisted {status} for {session_id}"),
            // The other side got there first.
            Err(StoreError::Conflict(reason)) => debug!("Not persisting {status}: {reason}"),
            Err(e) => {
                warn!("Persisting {status} for {session_id} failed: {e}");
                self.notify(CallNotice::PersistFailed(SignalingError::StoreWriteFailed(
                    e.to_string(),
                )));
            }
        }
    }

    async fn on_peer_event(&mut self, event: PeerEvent) -> Result<(), CallError> {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.dispatch(CallInput::LocalCandidate(candidate)).await
            }
            PeerEvent::RemoteMedia(media) => {
                info!(
                    "Remote media {} arrived with {} track(s)",
                    media.stream_id,
                    media.tracks.len()
                );
                self.remote_media = Some(media);
                self.publish_view();
                Ok(())
            }
            PeerEvent::ConnectionState(state) => {
                match state {
                    PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                        warn!("Peer connection {state:?}")
                    }
                    _ => debug!("Peer connection {state:?}"),
                }
                Ok(())
            }
        }
    }

    fn notify(&mut self, notice: CallNotice) {
        info!("Notice: {}", notice.user_message());
        if let CallNotice::SetupFailed(failure) = &notice {
            self.setup_failure = Some(failure.clone());
        }
        // No receivers is fine.
        let _ = self.notices.send(notice);
    }

    fn set_audio_enabled(&self, enabled: bool) {
        if let Some(handle) = &self.local_media {
            handle.set_audio_enabled(enabled);
        }
    }

    fn set_video_enabled(&self, enabled: bool) {
        if let Some(handle) = &self.local_media {
            handle.set_video_enabled(enabled);
        }
    }

    async fn cleanup(&mut self) {
        if let Some(handle) = self.local_media.take() {
            self.media.release(&handle);
        }
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.signaling.close_call_feed();
        self.buffer.clear();
        self.remote_media = None;
        self.remote_display = None;
        self.ring_deadline = None;
        debug!("Call resources released");
    }

    fn ring_expired(&self) -> bool {
        self.ring_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    fn publish_view(&self) {
        let call = self.machine.current_call();
        let view = CallView {
            status: self.machine.status(),
            session_id: call.map(|c| c.session_id.clone()),
            kind: call.map(|c| c.kind),
            direction: call.map(|c| c.direction),
            remote_display_info: self.remote_display.clone(),
            local_media: self.local_media.as_ref().map(CaptureHandle::id),
            remote_media: self.remote_media.as_ref().map(|m| m.stream_id.clone()),
            is_muted: self.machine.is_muted(),
            is_video_off: self.machine.is_video_off(),
        };
        self.view_tx.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }
}

fn transport_failure(e: super::peer::PeerError) -> SetupFailure {
    SetupFailure::Transport(e.to_string())
}

async fn next_peer_event(link: Option<&mut PeerLink>) -> PeerEvent {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
