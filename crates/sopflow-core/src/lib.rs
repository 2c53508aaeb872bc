pub mod approval;
pub mod config;
pub mod error;
pub mod event;
pub mod sop;
pub mod state;
pub mod traits;
pub mod types;

pub use approval::{ApprovalDecision, ApprovalRequest, Verdict};
pub use config::AppConfig;
pub use error::{FailureKind, Result, SopError};
pub use event::EventBus;
pub use sop::{Backoff, RetryPolicy, Sop, Step, ToolRef, END_TARGET};
pub use state::{
    AttemptRecord, ExecutionContext, ExecutionState, FailureDetail, RunReport, StepOutcome,
    SNAPSHOT_VERSION,
};
pub use traits::{Reasoner, SnapshotStore, Tool};
pub use types::*;
