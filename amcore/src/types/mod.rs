pub mod call;
pub mod events;

pub use call::{
    CallKind, CandidateRecord, DisplayInfo, IceCandidate, NewCandidate, NewSession,
    PatchRejected, RecordId, SdpKind, SessionDescription, SessionId, SessionPatch, SessionRecord,
    SessionStatus, UserId,
};
pub use events::FeedEvent;
