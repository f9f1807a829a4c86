//! Tamper detection and the security gate.
//!
//! [`TamperDetectionEngine`] answers "does this process look instrumented";
//! [`SecurityStateMachine`] turns those answers into a one-way compromise
//! decision that every other component consults through [`SecurityGate`].

pub mod state_machine;
pub mod tamper;

pub use state_machine::{SecurityGate, SecurityState, SecurityStateMachine, ViolationCallback};
pub use tamper::{TamperCheck, TamperDetectionEngine, TamperError};
