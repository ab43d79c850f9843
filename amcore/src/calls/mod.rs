//! Runtime-independent pieces of the call core.
//!
//! - [`CallMachine`] / [`reduce`]: the lifecycle state machine
//! - [`CandidateBuffer`]: remote candidate ordering and de-duplication
//! - [`DeviceError`], [`SignalingError`], [`ProtocolError`]: the error taxonomy

mod candidates;
mod error;
mod state;

pub use candidates::{Admission, CandidateBuffer};
pub use error::{DeviceError, ProtocolError, SignalingError};
pub use state::{
    BusyPolicy, CallDirection, CallInput, CallMachine, CallNotice, Command, Completion,
    CurrentCall, Effect, LocalStatus, SetupFailure, reduce,
};
