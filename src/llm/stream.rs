//! Decoder for the vendor's streamed completion bytes.
//!
//! The completions stream arrives as SSE-framed `data:` payloads
//! separated by blank lines. Nothing here is a general-purpose SSE
//! layer: the decoder goes straight from raw bytes to the three things
//! a turn acts on, namely assistant text deltas (fed to the segment
//! splitter), the round's finish reason, and tool-call fragments, which
//! it stitches together internally until the round asks for them.
//!
//! Framing details the vendor relies on: a payload may span several
//! `data:` lines, keep-alive comments (`: ...`) and `event:`/`id:`
//! fields carry nothing for this API, line endings may be CRLF, and the
//! stream closes with a `data: [DONE]` sentinel.

use std::collections::BTreeMap;

use serde_json::Value;

use super::ToolCallRequest;

/// One actionable item decoded from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StreamItem {
    /// Assistant text delta.
    Text(String),
    /// The round's `finish_reason`.
    Finish(String),
    /// The `[DONE]` sentinel; no further payloads follow.
    Done,
}

/// Incremental decoder for one streaming round.
///
/// Feed network chunks with [`feed`](Self::feed); once a `tool_calls`
/// finish is seen, [`take_tool_calls`](Self::take_tool_calls) yields the
/// assembled invocations in index order.
#[derive(Debug, Default)]
pub(crate) struct CompletionDecoder {
    /// Bytes received but not yet terminated by a blank line.
    pending: String,
    /// Tool-call fragments keyed by the vendor's call index.
    calls: BTreeMap<u64, ToolCallRequest>,
}

impl CompletionDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Absorb a network chunk, returning the items it completed.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<StreamItem> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));

        let mut items = Vec::new();
        while let Some((block_end, break_width)) = find_event_break(&self.pending) {
            let payload = join_data_lines(&self.pending[..block_end]);
            self.pending.drain(..block_end + break_width);
            if !payload.is_empty() {
                self.decode_payload(&payload, &mut items);
            }
        }
        items
    }

    /// Decode whatever is left after the byte stream ends.
    ///
    /// Some servers omit the final blank line; the trailing block is
    /// treated as complete.
    pub(crate) fn finish(&mut self) -> Vec<StreamItem> {
        let tail = std::mem::take(&mut self.pending);
        let payload = join_data_lines(&tail);
        let mut items = Vec::new();
        if !payload.is_empty() {
            self.decode_payload(&payload, &mut items);
        }
        items
    }

    /// The round's assembled tool invocations, ordered by vendor index.
    pub(crate) fn take_tool_calls(&mut self) -> Vec<ToolCallRequest> {
        std::mem::take(&mut self.calls).into_values().collect()
    }

    fn decode_payload(&mut self, payload: &str, items: &mut Vec<StreamItem>) {
        if payload.trim() == "[DONE]" {
            items.push(StreamItem::Done);
            return;
        }
        // One mangled payload must not kill the turn; skip it.
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            return;
        };
        let Some(choices) = value.get("choices").and_then(|c| c.as_array()) else {
            return;
        };

        for choice in choices {
            if let Some(delta) = choice.get("delta") {
                if let Some(text) = delta.get("content").and_then(|c| c.as_str())
                    && !text.is_empty()
                {
                    items.push(StreamItem::Text(text.to_owned()));
                }
                for fragment in delta
                    .get("tool_calls")
                    .and_then(|tc| tc.as_array())
                    .into_iter()
                    .flatten()
                {
                    self.absorb_tool_fragment(fragment);
                }
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|f| f.as_str()) {
                items.push(StreamItem::Finish(reason.to_owned()));
            }
        }
    }

    /// Merge one incremental tool-call fragment.
    ///
    /// The vendor streams the id and function name once and the argument
    /// string in pieces, all keyed by index.
    fn absorb_tool_fragment(&mut self, fragment: &Value) {
        let index = fragment.get("index").and_then(|i| i.as_u64()).unwrap_or(0);
        let call = self.calls.entry(index).or_insert_with(|| ToolCallRequest {
            call_id: String::new(),
            name: String::new(),
            arguments: String::new(),
        });

        if let Some(id) = fragment.get("id").and_then(|i| i.as_str())
            && !id.is_empty()
        {
            call.call_id = id.to_owned();
        }
        if let Some(function) = fragment.get("function") {
            if let Some(name) = function.get("name").and_then(|n| n.as_str())
                && !name.is_empty()
            {
                call.name = name.to_owned();
            }
            if let Some(args) = function.get("arguments").and_then(|a| a.as_str()) {
                call.arguments.push_str(args);
            }
        }
    }
}

/// Locate the first complete event block in the buffer.
///
/// Returns the block's end offset and the width of the blank line that
/// terminates it (`\n\n` or `\n\r\n`), or `None` while the block is
/// still arriving.
fn find_event_break(buf: &str) -> Option<(usize, usize)> {
    let bytes = buf.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'\n' {
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\n') => return Some((i, 2)),
            Some(b'\r') if bytes.get(i + 2) == Some(&b'\n') => return Some((i, 3)),
            _ => {}
        }
    }
    None
}

/// Collapse a block's `data:` lines into one payload.
///
/// Comments and non-data fields contribute nothing; multi-line payloads
/// are rejoined with `\n` as the protocol prescribes.
fn join_data_lines(block: &str) -> String {
    let mut payload = String::new();
    for line in block.lines() {
        // The block is cut before the break's first `\n`, so under CRLF
        // framing the last line still carries its `\r`.
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(value) = line.strip_prefix("data:") else {
            continue;
        };
        let value = value.strip_prefix(' ').unwrap_or(value);
        if !payload.is_empty() {
            payload.push('\n');
        }
        payload.push_str(value);
    }
    payload
}
