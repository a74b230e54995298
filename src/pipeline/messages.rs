//! Message types passed between the per-call tasks.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Instant;

/// Per-call session state, created on the telephony `start` frame and
/// exclusively owned by that call's coordinator task.
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Vendor-supplied call id.
    pub call_sid: String,
    /// Vendor-supplied media stream id.
    pub stream_sid: String,
    /// Wall-clock start, for persistence.
    pub started_at: DateTime<Utc>,
    /// Monotonic start, for duration math.
    pub started_mono: Instant,
    /// TTS voice configured for this call.
    pub voice_model: String,
    /// Number of finalized transcriptions so far.
    pub transcription_count: u32,
}

impl CallSession {
    /// New session from the `start` frame's identifiers.
    pub fn new(call_sid: String, stream_sid: String, voice_model: String) -> Self {
        Self {
            call_sid,
            stream_sid,
            started_at: Utc::now(),
            started_mono: Instant::now(),
            voice_model,
            transcription_count: 0,
        }
    }
}

/// Inbound events forwarded from the telephony read loop to the
/// coordinator.
#[derive(Debug)]
pub enum BridgeInbound {
    /// Decoded caller audio.
    Media(Bytes),
    /// Playback-completion acknowledgement.
    Mark(String),
    /// The vendor closed the stream.
    Stop,
}

/// Frames queued to the telephony write loop.
#[derive(Debug)]
pub enum OutboundFrame {
    /// Synthesized audio plus the mark label that will track its playback.
    Audio {
        /// Mark label registered once the audio is on the wire.
        label: String,
        /// Raw μ-law audio (base64-encoded at the wire boundary).
        audio: Bytes,
    },
    /// Flush the vendor-side playback buffer.
    Clear,
    /// Hand the call to a human; playback has already drained.
    Handoff {
        /// Destination number.
        number: String,
        /// Model-stated reason.
        reason: String,
    },
}
