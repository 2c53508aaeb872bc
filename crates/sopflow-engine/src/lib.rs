pub mod approval;
pub mod condition;
pub mod context;
pub mod engine;
pub mod manager;
pub mod retry;
pub mod run_log;
pub mod snapshot;
pub mod validate;

pub use approval::{ApprovalGate, GateDecision};
pub use engine::{Engine, EngineSettings};
pub use manager::RunManager;
pub use retry::{RetryController, RetryOutcome};
pub use run_log::RunLogger;
pub use snapshot::{MemorySnapshotStore, SqliteSnapshotStore};
pub use validate::validate;
