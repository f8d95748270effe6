//! Persistence layer — libSQL-backed server registry and translation queues.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Job, JobId, JobKind, JobSource, JobStatus, Server, ServerRegistry};
