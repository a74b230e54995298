//! Inbound telephony websocket endpoint and media bridge.
//!
//! The vendor connects one websocket per call. The read loop here parses
//! wire frames and forwards them to the call's coordinator; the write
//! loop frames synthesized audio back out, registering a playback mark
//! after every chunk. Both loops are serialized with respect to each
//! other only through the shared mark tracker, which they alone mutate.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::pipeline::coordinator::{CallDeps, run_call};
use crate::pipeline::messages::{BridgeInbound, OutboundFrame};
use crate::telephony::marks::MarkTracker;
use crate::telephony::{TelephonyFrame, outbound_clear, outbound_mark, outbound_media};

/// Capacity of the outbound frame queue to the write loop.
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// Capacity of the inbound event queue to the coordinator.
const INBOUND_CHANNEL_SIZE: usize = 256;

/// Build the HTTP application: one websocket route for the media stream.
pub fn build_router(deps: CallDeps) -> Router {
    Router::new()
        .route("/media", get(media_ws))
        .with_state(deps)
}

async fn media_ws(ws: WebSocketUpgrade, State(deps): State<CallDeps>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, deps))
}

/// Media bridge read loop for one connection.
///
/// `start` constructs the per-call pipeline; `media`, `mark`, and `stop`
/// feed it. Malformed frames are logged and dropped. When the socket
/// closes, the coordinator is told to stop and awaited so persistence
/// completes before the handler returns.
async fn handle_connection(socket: WebSocket, deps: CallDeps) {
    let (ws_sink, mut ws_stream) = socket.split();
    let mut ws_sink = Some(ws_sink);
    let mut bridge_tx: Option<mpsc::Sender<BridgeInbound>> = None;
    let mut call_task: Option<tokio::task::JoinHandle<()>> = None;

    while let Some(message) = ws_stream.next().await {
        let raw = match message {
            Ok(Message::Text(raw)) => raw,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let frame = match serde_json::from_str::<TelephonyFrame>(&raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping malformed telephony frame");
                continue;
            }
        };

        match frame {
            TelephonyFrame::Connected { .. } => debug!("telephony handshake"),
            TelephonyFrame::Start { start, .. } => {
                if bridge_tx.is_some() {
                    warn!("duplicate start frame ignored");
                    continue;
                }
                let Some(sink) = ws_sink.take() else {
                    continue;
                };
                let marks = MarkTracker::new();
                let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_SIZE);
                let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_SIZE);

                tokio::spawn(write_loop(
                    sink,
                    outbound_rx,
                    marks.clone(),
                    start.stream_sid.clone(),
                ));
                call_task = Some(tokio::spawn(run_call(
                    deps.clone(),
                    start,
                    inbound_rx,
                    outbound_tx,
                    marks,
                )));
                bridge_tx = Some(inbound_tx);
            }
            TelephonyFrame::Media { media, .. } => {
                let Some(tx) = &bridge_tx else { continue };
                match media.decode() {
                    Ok(audio) => {
                        let _ = tx.send(BridgeInbound::Media(audio.into())).await;
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable media frame"),
                }
            }
            TelephonyFrame::Mark { mark, .. } => {
                if let Some(tx) = &bridge_tx {
                    let _ = tx.send(BridgeInbound::Mark(mark.name)).await;
                }
            }
            TelephonyFrame::Stop { .. } => {
                info!("stop frame received");
                break;
            }
            TelephonyFrame::Clear { .. } => {
                // Clear is outbound-only; a vendor echo is harmless.
                debug!("ignoring inbound clear frame");
            }
        }
    }

    if let Some(tx) = bridge_tx.take() {
        let _ = tx.send(BridgeInbound::Stop).await;
    }
    if let Some(task) = call_task {
        // Persistence runs before run_call returns; the detached
        // emotional-metrics task does not hold this handler.
        if task.await.is_err() {
            warn!("call task panicked");
        }
    }
    debug!("connection handler finished");
}

/// Telephony write loop: audio chunk, then its mark, then registration.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound_rx: mpsc::Receiver<OutboundFrame>,
    marks: MarkTracker,
    stream_sid: String,
) {
    while let Some(frame) = outbound_rx.recv().await {
        match frame {
            OutboundFrame::Audio { label, audio } => {
                let media = outbound_media(&stream_sid, &audio);
                let mark = outbound_mark(&stream_sid, &label);
                if send_frame(&mut sink, &media).await.is_err()
                    || send_frame(&mut sink, &mark).await.is_err()
                {
                    warn!("telephony socket write failed");
                    return;
                }
                marks.add(label);
            }
            OutboundFrame::Clear => {
                if send_frame(&mut sink, &outbound_clear(&stream_sid)).await.is_err() {
                    warn!("telephony socket write failed");
                    return;
                }
            }
            OutboundFrame::Handoff { number, reason } => {
                // The dial-out itself goes over the vendor's REST API; the
                // media stream's part of a handoff is to end cleanly.
                info!(number, reason, "handing call off");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        }
    }
    debug!("write loop finished");
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &TelephonyFrame,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(json.into())).await
}
