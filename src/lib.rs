// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod ingest;
pub mod metrics;

pub use crate::api::{create_router, AppState};
pub use crate::ingest::pipeline::Ingestor;
pub use crate::ingest::scheduler::Scheduler;
