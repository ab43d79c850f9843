//! Call state machine.
//!
//! [`reduce`] is a pure function of the current [`CallMachine`] and one
//! [`CallInput`]: it returns the next machine and the [`Effect`]s the
//! runtime must carry out. Results of asynchronous effects come back in as
//! [`CallInput::Completed`], so every transition goes through here.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use super::error::{DeviceError, ProtocolError, SignalingError};
use crate::types::{
    CallKind, CandidateRecord, FeedEvent, IceCandidate, SessionDescription, SessionId,
    SessionRecord, SessionStatus, UserId,
};

/// How many finished sessions are remembered to drop redelivered inserts.
const FINISHED_CAPACITY: usize = 32;

/// UI-facing status of the local peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalStatus {
    #[default]
    Idle,
    Outgoing,
    Incoming,
    Active,
    /// Teardown in progress.
    Ending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// What to do with an inbound call while another call is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Drop it; the caller keeps ringing until it gives up or times out.
    #[default]
    Ignore,
    /// Persist `declined` on the new session.
    AutoDecline,
}

/// The call currently owned by this peer.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentCall {
    pub session_id: SessionId,
    pub peer_id: UserId,
    pub kind: CallKind,
    pub direction: CallDirection,
    pub offer: SessionDescription,
    /// Caller: remote answer applied. Receiver: own answer persisted.
    pub answered: bool,
    /// A local capture handle exists for this call.
    pub media_live: bool,
}

/// UI commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start { receiver: UserId, kind: CallKind },
    Accept,
    Reject,
    End,
    ToggleMute,
    ToggleVideo,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "Start",
            Self::Accept => "Accept",
            Self::Reject => "Reject",
            Self::End => "End",
            Self::ToggleMute => "ToggleMute",
            Self::ToggleVideo => "ToggleVideo",
        }
    }
}

/// Why a `start`/`accept` could not complete.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupFailure {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("peer transport failed: {0}")]
    Transport(String),
}

impl SetupFailure {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Device(e) => e.user_message(),
            Self::Signaling(e) => e.user_message(),
            Self::Transport(_) => "Call failed",
        }
    }
}

/// Results of asynchronous effects, fed back into the machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// Media acquired, offer created, session persisted, feed open.
    OutgoingReady(SessionRecord),
    /// Offer applied, answer created and persisted.
    AnswerSent,
    SetupFailed(SetupFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallInput {
    Command(Command),
    Feed(FeedEvent),
    /// The peer transport gathered a local candidate.
    LocalCandidate(IceCandidate),
    Completed(Completion),
    RingTimeout,
    TeardownComplete,
}

impl From<Command> for CallInput {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

impl From<FeedEvent> for CallInput {
    fn from(event: FeedEvent) -> Self {
        Self::Feed(event)
    }
}

/// User-visible transient notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallNotice {
    SetupFailed(SetupFailure),
    /// The session reached a terminal status written by the other side.
    RemoteFinished(SessionStatus),
    /// Nobody answered our outgoing call.
    NoAnswer,
    /// An incoming call rang out without being answered.
    MissedIncoming,
    /// Talking to the store failed outside of call setup: a status write
    /// or a feed that could not be re-subscribed.
    PersistFailed(SignalingError),
}

impl CallNotice {
    pub fn user_message(&self) -> String {
        match self {
            Self::SetupFailed(failure) => failure.user_message().to_string(),
            Self::RemoteFinished(status) => format!("Call {status}"),
            Self::NoAnswer => "No answer".to_string(),
            Self::MissedIncoming => "Missed call".to_string(),
            Self::PersistFailed(_) => "Connection error: Calls may not work".to_string(),
        }
    }
}

/// Side effects requested by the machine, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Acquire media, open a peer link, create the offer, persist a ringing
    /// session and open its feed. Answers with a [`Completion`].
    BeginOutgoing { receiver: UserId, kind: CallKind },
    /// Acquire media, open a peer link, apply the offer, seed candidates,
    /// create and persist the answer. Answers with a [`Completion`].
    BeginAnswer {
        session_id: SessionId,
        kind: CallKind,
        offer: SessionDescription,
    },
    OpenCallFeed(SessionId),
    FetchDisplayInfo(UserId),
    PersistStatus {
        session_id: SessionId,
        status: SessionStatus,
    },
    ApplyRemoteAnswer(SessionDescription),
    AdmitCandidate(CandidateRecord),
    PublishCandidate {
        session_id: SessionId,
        candidate: IceCandidate,
    },
    SetAudioEnabled(bool),
    SetVideoEnabled(bool),
    ArmRingTimer,
    DisarmRingTimer,
    Notify(CallNotice),
    /// Release every per-call resource, then feed back
    /// [`CallInput::TeardownComplete`].
    Cleanup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallMachine {
    self_id: UserId,
    busy_policy: BusyPolicy,
    status: LocalStatus,
    call: Option<CurrentCall>,
    muted: bool,
    video_off: bool,
    finished: VecDeque<SessionId>,
}

/// Computes the next machine and its effects. On error the input is
/// rejected and `state` stays authoritative.
pub fn reduce(
    state: &CallMachine,
    input: CallInput,
) -> Result<(CallMachine, Vec<Effect>), ProtocolError> {
    let mut next = state.clone();
    let effects = next.transition(input)?;
    Ok((next, effects))
}

impl CallMachine {
    pub fn new(self_id: UserId, busy_policy: BusyPolicy) -> Self {
        Self {
            self_id,
            busy_policy,
            status: LocalStatus::Idle,
            call: None,
            muted: false,
            video_off: false,
            finished: VecDeque::with_capacity(FINISHED_CAPACITY),
        }
    }

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    pub fn status(&self) -> LocalStatus {
        self.status
    }

    pub fn current_call(&self) -> Option<&CurrentCall> {
        self.call.as_ref()
    }

    pub fn current_session(&self) -> Option<&SessionId> {
        self.call.as_ref().map(|c| &c.session_id)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_video_off(&self) -> bool {
        self.video_off
    }

    /// Whether `id` was torn down or declined by this peer recently.
    pub fn has_finished(&self, id: &SessionId) -> bool {
        self.finished.contains(id)
    }

    /// Applies `input` in place. Shorthand for [`reduce`] followed by
    /// adopting the returned machine.
    pub fn apply(&mut self, input: CallInput) -> Result<Vec<Effect>, ProtocolError> {
        let (next, effects) = reduce(self, input)?;
        *self = next;
        Ok(effects)
    }

    fn transition(&mut self, input: CallInput) -> Result<Vec<Effect>, ProtocolError> {
        match input {
            CallInput::Command(command) => self.on_command(command),
            CallInput::Feed(event) => Ok(self.on_feed(event)),
            CallInput::LocalCandidate(candidate) => Ok(self.on_local_candidate(candidate)),
            CallInput::Completed(completion) => self.on_completed(completion),
            CallInput::RingTimeout => Ok(self.on_ring_timeout()),
            CallInput::TeardownComplete => {
                if matches!(self.status, LocalStatus::Ending | LocalStatus::Idle) {
                    self.reset();
                    Ok(Vec::new())
                } else {
                    Err(ProtocolError::invalid(self.status, "TeardownComplete"))
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) -> Result<Vec<Effect>, ProtocolError> {
        match (self.status, command) {
            (LocalStatus::Idle, Command::Start { receiver, kind }) => {
                if receiver == self.self_id {
                    return Err(ProtocolError::invalid(self.status, "Start(self)"));
                }
                Ok(vec![Effect::BeginOutgoing { receiver, kind }])
            }
            (LocalStatus::Incoming, Command::Accept) => {
                let call = self.call_ref("Accept")?;
                if call.media_live {
                    return Err(ProtocolError::invalid(self.status, "Accept(again)"));
                }
                Ok(vec![Effect::BeginAnswer {
                    session_id: call.session_id.clone(),
                    kind: call.kind,
                    offer: call.offer.clone(),
                }])
            }
            (LocalStatus::Incoming, Command::Reject) => {
                Ok(self.teardown(Some(SessionStatus::Declined), None))
            }
            (
                LocalStatus::Outgoing | LocalStatus::Incoming | LocalStatus::Active,
                Command::End,
            ) => Ok(self.teardown(Some(SessionStatus::Ended), None)),
            // Nothing to end: idempotent.
            (LocalStatus::Idle | LocalStatus::Ending, Command::End | Command::Reject) => {
                Ok(Vec::new())
            }
            (_, Command::ToggleMute) if self.media_live() => {
                self.muted = !self.muted;
                Ok(vec![Effect::SetAudioEnabled(!self.muted)])
            }
            (_, Command::ToggleVideo) if self.media_live() => {
                self.video_off = !self.video_off;
                Ok(vec![Effect::SetVideoEnabled(!self.video_off)])
            }
            (status, command) => Err(ProtocolError::invalid(status, command.name())),
        }
    }

    fn on_feed(&mut self, event: FeedEvent) -> Vec<Effect> {
        match event {
            FeedEvent::SessionInserted(record) => self.on_session_inserted(record),
            FeedEvent::SessionUpdated(record) => self.on_session_updated(record),
            FeedEvent::CandidateInserted(record) => {
                if !self.owns_session(&record.session_id) || self.status == LocalStatus::Ending {
                    debug!("Ignoring candidate for stale session {}", record.session_id);
                    return Vec::new();
                }
                if record.author_id == self.self_id {
                    return Vec::new();
                }
                vec![Effect::AdmitCandidate(record)]
            }
        }
    }

    fn on_session_inserted(&mut self, record: SessionRecord) -> Vec<Effect> {
        if record.receiver_id != self.self_id
            || record.caller_id == self.self_id
            || record.status != SessionStatus::Ringing
        {
            debug!(
                "Ignoring session insert {} (receiver {}, status {})",
                record.id, record.receiver_id, record.status
            );
            return Vec::new();
        }
        if self.has_finished(&record.id) {
            debug!("Ignoring redelivered insert of finished session {}", record.id);
            return Vec::new();
        }

        if self.status != LocalStatus::Idle {
            if self.owns_session(&record.id) {
                return Vec::new();
            }
            return match self.busy_policy {
                BusyPolicy::Ignore => {
                    debug!("Busy, ignoring inbound call {}", record.id);
                    Vec::new()
                }
                BusyPolicy::AutoDecline => {
                    debug!("Busy, declining inbound call {}", record.id);
                    self.remember_finished(record.id.clone());
                    vec![Effect::PersistStatus {
                        session_id: record.id,
                        status: SessionStatus::Declined,
                    }]
                }
            };
        }

        let caller = record.caller_id.clone();
        let session_id = record.id.clone();
        self.status = LocalStatus::Incoming;
        self.video_off = !record.kind.wants_video();
        self.call = Some(CurrentCall {
            session_id: record.id,
            peer_id: record.caller_id,
            kind: record.kind,
            direction: CallDirection::Incoming,
            offer: record.offer,
            answered: false,
            media_live: false,
        });
        vec![
            Effect::OpenCallFeed(session_id),
            Effect::FetchDisplayInfo(caller),
            Effect::ArmRingTimer,
        ]
    }

    fn on_session_updated(&mut self, record: SessionRecord) -> Vec<Effect> {
        if !self.owns_session(&record.id) || self.status == LocalStatus::Ending {
            debug!("Ignoring update for stale session {}", record.id);
            return Vec::new();
        }

        if record.status.is_terminal() {
            return self.teardown(None, Some(CallNotice::RemoteFinished(record.status)));
        }

        match (self.status, &record.answer) {
            (LocalStatus::Outgoing, Some(answer)) if record.status == SessionStatus::Active => {
                let answer = answer.clone();
                self.status = LocalStatus::Active;
                if let Some(call) = self.call.as_mut() {
                    call.answered = true;
                }
                vec![Effect::DisarmRingTimer, Effect::ApplyRemoteAnswer(answer)]
            }
            _ => {
                debug!(
                    "No transition for update of {} (status {}) while {:?}",
                    record.id, record.status, self.status
                );
                Vec::new()
            }
        }
    }

    fn on_local_candidate(&mut self, candidate: IceCandidate) -> Vec<Effect> {
        match (&self.call, self.status) {
            (
                Some(call),
                LocalStatus::Outgoing | LocalStatus::Incoming | LocalStatus::Active,
            ) if call.media_live => vec![Effect::PublishCandidate {
                session_id: call.session_id.clone(),
                candidate,
            }],
            _ => {
                debug!("Dropping local candidate gathered while {:?}", self.status);
                Vec::new()
            }
        }
    }

    fn on_completed(&mut self, completion: Completion) -> Result<Vec<Effect>, ProtocolError> {
        match (self.status, completion) {
            (LocalStatus::Idle, Completion::OutgoingReady(record)) => {
                if record.caller_id != self.self_id {
                    return Err(ProtocolError::invalid(self.status, "OutgoingReady(foreign)"));
                }
                let receiver = record.receiver_id.clone();
                self.status = LocalStatus::Outgoing;
                self.muted = false;
                self.video_off = !record.kind.wants_video();
                self.call = Some(CurrentCall {
                    session_id: record.id,
                    peer_id: record.receiver_id,
                    kind: record.kind,
                    direction: CallDirection::Outgoing,
                    offer: record.offer,
                    answered: false,
                    media_live: true,
                });
                Ok(vec![Effect::FetchDisplayInfo(receiver), Effect::ArmRingTimer])
            }
            (LocalStatus::Incoming, Completion::AnswerSent) => {
                self.status = LocalStatus::Active;
                if let Some(call) = self.call.as_mut() {
                    call.answered = true;
                    call.media_live = true;
                }
                Ok(vec![Effect::DisarmRingTimer])
            }
            (LocalStatus::Idle, Completion::SetupFailed(failure)) => Ok(vec![
                Effect::Notify(CallNotice::SetupFailed(failure)),
                Effect::Cleanup,
            ]),
            (LocalStatus::Incoming, Completion::SetupFailed(failure)) => {
                // The caller sees the outcome through its own timeout path.
                Ok(self.teardown(None, Some(CallNotice::SetupFailed(failure))))
            }
            (status, completion) => Err(ProtocolError::invalid(
                status,
                format!("Completed({completion:?})"),
            )),
        }
    }

    fn on_ring_timeout(&mut self) -> Vec<Effect> {
        let media_live = self.call.as_ref().map(|c| c.media_live);
        match (self.status, media_live) {
            (LocalStatus::Outgoing, Some(_)) => {
                self.teardown(Some(SessionStatus::Missed), Some(CallNotice::NoAnswer))
            }
            (LocalStatus::Incoming, Some(false)) => {
                self.teardown(None, Some(CallNotice::MissedIncoming))
            }
            _ => Vec::new(),
        }
    }

    fn teardown(&mut self, persist: Option<SessionStatus>, notice: Option<CallNotice>) -> Vec<Effect> {
        let mut effects = Vec::with_capacity(3);
        if let Some(call) = &self.call {
            let session_id = call.session_id.clone();
            if let Some(status) = persist {
                effects.push(Effect::PersistStatus {
                    session_id: session_id.clone(),
                    status,
                });
            }
            self.remember_finished(session_id);
        }
        if let Some(notice) = notice {
            effects.push(Effect::Notify(notice));
        }
        effects.push(Effect::Cleanup);
        self.status = LocalStatus::Ending;
        effects
    }

    fn reset(&mut self) {
        self.status = LocalStatus::Idle;
        self.call = None;
        self.muted = false;
        self.video_off = false;
    }

    fn remember_finished(&mut self, id: SessionId) {
        if self.finished.contains(&id) {
            return;
        }
        if self.finished.len() == FINISHED_CAPACITY {
            self.finished.pop_front();
        }
        self.finished.push_back(id);
    }

    fn media_live(&self) -> bool {
        self.status != LocalStatus::Ending && self.call.as_ref().is_some_and(|c| c.media_live)
    }

    fn owns_session(&self, id: &SessionId) -> bool {
        self.current_session() == Some(id)
    }

    fn call_ref(&self, attempted: &str) -> Result<&CurrentCall, ProtocolError> {
        self.call
            .as_ref()
            .ok_or_else(|| ProtocolError::invalid(self.status, attempted))
    }
}
