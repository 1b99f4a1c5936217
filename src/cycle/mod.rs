//! Dispensing-run bookkeeping.
//!
//! ```text
//! cycle
//! ├── machine   - synchronous run ledger (phases, records, clamping)
//! └── worker    - async task driving the machine from the weight feed
//! ```
//!
//! The machine is plain state with no I/O so the arithmetic is testable in
//! isolation. The worker owns it, consumes weight samples routed off the
//! broker and fans results out to the UI (watch) and backend (broadcast).

pub mod machine;
pub mod worker;

pub use machine::{
    BackendRow, CycleRecord, CycleStateMachine, RunPhase, SampleOutcome, StartError, StartNotice,
};
pub use worker::{CycleCommandError, CycleEvent, CycleHandle, RunSnapshot};
