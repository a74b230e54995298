//! Telephony websocket wire frames.
//!
//! The vendor speaks JSON frames tagged by an `event` field. Audio payloads
//! are base64-encoded 8 kHz 8-bit μ-law; encoding and decoding happen here,
//! at the wire boundary, so everything upstream handles binary.

pub mod marks;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};

/// A frame on the telephony media socket, inbound or outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TelephonyFrame {
    /// Handshake frame sent by the vendor before `start`.
    Connected {
        /// Vendor protocol tag.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    /// Session metadata; the call begins here.
    Start {
        /// Session metadata block.
        start: StartMeta,
        /// Frame sequence number.
        #[serde(
            rename = "sequenceNumber",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sequence_number: Option<String>,
    },
    /// One chunk of caller or agent audio.
    Media {
        /// The audio payload block.
        media: MediaPayload,
        /// Stream this frame belongs to (outbound frames must set it).
        #[serde(
            rename = "streamSid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stream_sid: Option<String>,
    },
    /// Playback-completion acknowledgement, or an outbound mark request.
    Mark {
        /// The mark label block.
        mark: MarkName,
        /// Stream this frame belongs to.
        #[serde(
            rename = "streamSid",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        stream_sid: Option<String>,
        /// Frame sequence number.
        #[serde(
            rename = "sequenceNumber",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sequence_number: Option<String>,
    },
    /// Session end.
    Stop {
        /// Stop metadata block, if the vendor sent one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<StopMeta>,
    },
    /// Outbound request to flush the vendor-side playback buffer.
    Clear {
        /// Stream to flush.
        #[serde(rename = "streamSid")]
        stream_sid: String,
    },
}

/// Metadata carried by the `start` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartMeta {
    /// Opaque media stream id.
    pub stream_sid: String,
    /// Opaque call id.
    pub call_sid: String,
    /// Account the call belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    /// Media tracks present on the stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<String>>,
    /// Negotiated media format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_format: Option<MediaFormat>,
}

/// Media format block inside `start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFormat {
    /// Codec name (`audio/x-mulaw`).
    pub encoding: String,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u32,
}

/// Payload block of a `media` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaPayload {
    /// Base64-encoded μ-law audio.
    pub payload: String,
    /// Track label (`inbound` / `outbound`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track: Option<String>,
    /// Vendor chunk counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<String>,
    /// Vendor timestamp in ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl MediaPayload {
    /// Decode the base64 payload into raw μ-law bytes.
    ///
    /// # Errors
    ///
    /// Returns a telephony error when the payload is not valid base64.
    pub fn decode(&self) -> Result<Vec<u8>> {
        BASE64
            .decode(&self.payload)
            .map_err(|e| AgentError::Telephony(format!("bad media payload: {e}")))
    }
}

/// Label block of a `mark` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkName {
    /// The mark label.
    pub name: String,
}

/// Metadata carried by the `stop` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopMeta {
    /// Account the call belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_sid: Option<String>,
    /// Opaque call id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
}

/// Build an outbound `media` frame from raw audio bytes.
///
/// The audio is base64-encoded here; this is the only encode site.
pub fn outbound_media(stream_sid: &str, audio: &[u8]) -> TelephonyFrame {
    TelephonyFrame::Media {
        media: MediaPayload {
            payload: BASE64.encode(audio),
            track: None,
            chunk: None,
            timestamp: None,
        },
        stream_sid: Some(stream_sid.to_owned()),
    }
}

/// Build an outbound `mark` frame.
pub fn outbound_mark(stream_sid: &str, label: &str) -> TelephonyFrame {
    TelephonyFrame::Mark {
        mark: MarkName {
            name: label.to_owned(),
        },
        stream_sid: Some(stream_sid.to_owned()),
        sequence_number: None,
    }
}

/// Build an outbound `clear` frame.
pub fn outbound_clear(stream_sid: &str) -> TelephonyFrame {
    TelephonyFrame::Clear {
        stream_sid: stream_sid.to_owned(),
    }
}
