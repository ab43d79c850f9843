pub use amcore::types;

pub mod calls;
pub mod config;
pub mod store;

pub use calls::{CallHandle, CallSession, CallView, Collaborators};
pub use config::CallConfig;
