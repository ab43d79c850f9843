//! Change-feed subscriptions of one signed-in user.
//!
//! Two kinds of subscription are held:
//!
//! - the inbound feed: session inserts addressed to the local user, open
//!   from sign-in to sign-out
//! - the call feed: updates of the current session plus candidate inserts
//!   for it, open for the lifetime of one call attempt
//!
//! Both feeds deliver at-least-once with no ordering between them; the
//! state machine sorts that out. A feed the store drops is closed and
//! reported as a [`LostFeed`].

use crate::store::{CallBackend, CandidateStore, SessionFilter, SessionStore, Subscription};
use amcore::calls::SignalingError;
use amcore::types::{FeedEvent, SessionId, UserId};
use log::{debug, warn};
use std::sync::Arc;

struct CallFeed {
    session_id: SessionId,
    updates: Subscription,
    candidates: Subscription,
}

impl CallFeed {
    fn close(&mut self) {
        self.updates.close();
        self.candidates.close();
    }
}

/// A feed the store closed underneath the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LostFeed {
    Inbound,
    Call(SessionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Updates,
    Candidates,
    Inbound,
}

pub struct SignalingChannel {
    backend: Arc<dyn CallBackend>,
    self_id: UserId,
    inbound: Option<Subscription>,
    call: Option<CallFeed>,
}

impl SignalingChannel {
    pub fn new(backend: Arc<dyn CallBackend>, self_id: UserId) -> Self {
        Self {
            backend,
            self_id,
            inbound: None,
            call: None,
        }
    }

    pub fn is_inbound_open(&self) -> bool {
        self.inbound.as_ref().is_some_and(Subscription::is_open)
    }

    pub fn call_feed_session(&self) -> Option<&SessionId> {
        self.call.as_ref().map(|feed| &feed.session_id)
    }

    pub async fn open_inbound(&mut self) -> Result<(), SignalingError> {
        if self.is_inbound_open() {
            return Ok(());
        }
        let subscription = SessionStore::subscribe(
            self.backend.as_ref(),
            SessionFilter::ReceiverInserts(self.self_id.clone()),
        )
        .await
        .map_err(|e| SignalingError::SubscribeFailed(e.to_string()))?;
        debug!("Inbound call feed open for {}", self.self_id);
        self.inbound = Some(subscription);
        Ok(())
    }

    pub fn close_inbound(&mut self) {
        if let Some(mut inbound) = self.inbound.take() {
            inbound.close();
            debug!("Inbound call feed closed for {}", self.self_id);
        }
    }

    /// Opens the per-call feed for `session_id`, replacing any previous one.
    pub async fn open_call_feed(&mut self, session_id: &SessionId) -> Result<(), SignalingError> {
        self.close_call_feed();

        let mut updates = SessionStore::subscribe(
            self.backend.as_ref(),
            SessionFilter::Updates(session_id.clone()),
        )
        .await
        .map_err(|e| SignalingError::SubscribeFailed(e.to_string()))?;
        let candidates =
            match CandidateStore::subscribe(self.backend.as_ref(), session_id).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    updates.close();
                    return Err(SignalingError::SubscribeFailed(e.to_string()));
                }
            };

        debug!("Call feed open for session {session_id}");
        self.call = Some(CallFeed {
            session_id: session_id.clone(),
            updates,
            candidates,
        });
        Ok(())
    }

    pub fn close_call_feed(&mut self) {
        if let Some(mut feed) = self.call.take() {
            feed.close();
            debug!("Call feed closed for session {}", feed.session_id);
        }
    }

    /// Returns an already delivered event, if any, without waiting.
    pub fn try_next(&mut self) -> Option<FeedEvent> {
        if let Some(feed) = self.call.as_mut() {
            if let Some(event) = feed.updates.try_recv() {
                return Some(event);
            }
            if let Some(event) = feed.candidates.try_recv() {
                return Some(event);
            }
        }
        self.inbound.as_mut()?.try_recv()
    }

    /// Waits for the next event on any open feed. Never resolves while no
    /// feed is open. A dropped feed is closed and returned as the error.
    pub async fn next(&mut self) -> Result<FeedEvent, LostFeed> {
        loop {
            let (source, event) = {
                let (updates, candidates) = match self.call.as_mut() {
                    Some(feed) => (Some(&mut feed.updates), Some(&mut feed.candidates)),
                    None => (None, None),
                };
                let inbound = self.inbound.as_mut();
                tokio::select! {
                    event = recv_or_pending(updates) => (Source::Updates, event),
                    event = recv_or_pending(candidates) => (Source::Candidates, event),
                    event = recv_or_pending(inbound) => (Source::Inbound, event),
                }
            };
            match event {
                Some(event) => return Ok(event),
                None => {
                    if let Some(lost) = self.feed_lost(source) {
                        return Err(lost);
                    }
                }
            }
        }
    }

    fn feed_lost(&mut self, source: Source) -> Option<LostFeed> {
        warn!("{source:?} feed closed by the store");
        match source {
            Source::Inbound => {
                self.close_inbound();
                Some(LostFeed::Inbound)
            }
            Source::Updates | Source::Candidates => {
                let session_id = self.call.as_ref().map(|feed| feed.session_id.clone());
                self.close_call_feed();
                session_id.map(LostFeed::Call)
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close_call_feed();
        self.close_inbound();
    }
}

async fn recv_or_pending(subscription: Option<&mut Subscription>) -> Option<FeedEvent> {
    match subscription {
        Some(subscription) if subscription.is_open() => subscription.recv().await,
        _ => std::future::pending().await,
    }
}
