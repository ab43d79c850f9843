pub mod generic;
pub mod memory;
pub mod traits;

pub use amcore::store::error;
pub use memory::InMemoryCallStore;
pub use traits::{
    CallBackend, CandidateStore, ProfileDirectory, SessionFilter, SessionStore, Subscription,
};
