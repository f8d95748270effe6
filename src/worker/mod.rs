//! Worker system — one translation loop per registered server.
//!
//! - `state` — lifecycle state machine (Stopped → Starting → Running → Stopping)
//! - `worker` — the loop task: claim, translate, commit or release

pub mod state;
#[allow(clippy::module_inception)]
pub mod worker;

pub use state::WorkerStatus;
pub use worker::{Worker, WorkerDeps, WorkerSnapshot};
