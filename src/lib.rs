//! Wren: real-time telephony voice companion.
//!
//! Bridges an inbound telephony media stream to a streaming language
//! model, speaking the replies back with sub-second perceived latency:
//! Caller audio → STT → LLM (function-calling) → TTS → Caller
//!
//! # Architecture
//!
//! Each call is a set of cooperating tasks connected by typed channels:
//! - **Media bridge**: telephony websocket read/write loops (`server`)
//! - **STT adapter**: streaming recognition with buffering and reconnect
//! - **LLM adapter**: streaming completion, segmentation, tool dispatch
//! - **TTS adapter**: ordered, paced, circuit-broken synthesis
//! - **Coordinator**: the per-call select loop that owns interruption
//!
//! The memory store and conversation journal are process-wide, backed by
//! one embedded SQLite database.

pub mod breaker;
pub mod config;
pub mod db;
pub mod error;
pub mod journal;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod retry;
pub mod server;
pub mod stt;
pub mod telephony;
pub mod tts;

pub use config::AppConfig;
pub use error::{AgentError, Result};
pub use pipeline::coordinator::CallDeps;
