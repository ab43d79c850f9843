//! Actor front-end for a [`CallSession`].
//!
//! The session moves into its own task; UI commands arrive on an `mpsc`
//! channel with a `oneshot` reply and are serialized with feed and
//! transport events in one `select!` loop.

use super::error::CallError;
use super::session::{CallSession, CallView};
use amcore::calls::CallNotice;
use amcore::types::{CallKind, UserId};
use log::{debug, info};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

const REQUEST_BUFFER: usize = 32;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

#[derive(Debug)]
pub enum CallRequest {
    SignIn(Reply<()>),
    SignOut(oneshot::Sender<()>),
    Start {
        receiver: UserId,
        kind: CallKind,
        reply: Reply<()>,
    },
    Accept(Reply<()>),
    Reject(Reply<()>),
    End(Reply<()>),
    ToggleMute(Reply<bool>),
    ToggleVideo(Reply<bool>),
}

/// Cloneable handle to a spawned session. The task signs out and exits once
/// every handle is dropped.
#[derive(Clone)]
pub struct CallHandle {
    requests: mpsc::Sender<CallRequest>,
    view: watch::Receiver<CallView>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallSession {
    pub fn spawn(self) -> (CallHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_BUFFER);
        let handle = CallHandle {
            requests: requests_tx,
            view: self.subscribe_view(),
            notices: self.notice_sender(),
        };
        let task = tokio::spawn(run_session(self, requests_rx));
        (handle, task)
    }
}

enum Wake {
    Request(Option<CallRequest>),
    Input(super::session::SessionInput),
}

async fn run_session(mut session: CallSession, mut requests: mpsc::Receiver<CallRequest>) {
    debug!("Call session task for {} started", session.self_id());
    loop {
        let wake = tokio::select! {
            request = requests.recv() => Wake::Request(request),
            input = session.next_input() => Wake::Input(input),
        };
        match wake {
            Wake::Request(Some(request)) => serve(&mut session, request).await,
            Wake::Request(None) => break,
            Wake::Input(input) => session.handle(input).await,
        }
    }
    session.sign_out().await;
    info!("Call session task for {} stopped", session.self_id());
}

async fn serve(session: &mut CallSession, request: CallRequest) {
    // A dropped reply receiver only means the caller stopped waiting.
    match request {
        CallRequest::SignIn(reply) => {
            let _ = reply.send(session.sign_in().await);
        }
        CallRequest::SignOut(reply) => {
            session.sign_out().await;
            let _ = reply.send(());
        }
        CallRequest::Start {
            receiver,
            kind,
            reply,
        } => {
            let _ = reply.send(session.start(receiver, kind).await);
        }
        CallRequest::Accept(reply) => {
            let _ = reply.send(session.accept().await);
        }
        CallRequest::Reject(reply) => {
            let _ = reply.send(session.reject().await);
        }
        CallRequest::End(reply) => {
            let _ = reply.send(session.end().await);
        }
        CallRequest::ToggleMute(reply) => {
            let _ = reply.send(session.toggle_mute());
        }
        CallRequest::ToggleVideo(reply) => {
            let _ = reply.send(session.toggle_video());
        }
    }
}

impl CallHandle {
    pub async fn sign_in(&self) -> Result<(), CallError> {
        self.request(CallRequest::SignIn).await
    }

    pub async fn sign_out(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(CallRequest::SignOut(tx))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)
    }

    pub async fn start(&self, receiver: impl Into<UserId>, kind: CallKind) -> Result<(), CallError> {
        let receiver = receiver.into();
        self.request(|reply| CallRequest::Start {
            receiver,
            kind,
            reply,
        })
        .await
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.request(CallRequest::Accept).await
    }

    pub async fn reject(&self) -> Result<(), CallError> {
        self.request(CallRequest::Reject).await
    }

    pub async fn end(&self) -> Result<(), CallError> {
        self.request(CallRequest::End).await
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(CallRequest::ToggleMute).await
    }

    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(CallRequest::ToggleVideo).await
    }

    /// Latest projection.
    pub fn view(&self) -> CallView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallView> {
        self.view.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> CallRequest,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(build(tx))
            .await
            .map_err(|_| CallError::SessionClosed)?;
        rx.await.map_err(|_| CallError::SessionClosed)?
    }
}
