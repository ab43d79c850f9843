//! Platform-agnostic core of the call stack: the shared data model, the
//! change-feed event types, the error taxonomy and the pure call state
//! machine. Nothing in here touches an async runtime.

pub mod calls;
pub mod store;
pub mod types;
