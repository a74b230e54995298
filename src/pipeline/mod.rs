//! Per-call conversation pipeline: orchestrator, analyzer, and the typed
//! messages that connect the call's tasks.

pub mod analyzer;
pub mod coordinator;
pub mod messages;
