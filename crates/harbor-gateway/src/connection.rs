//! One gateway connection: a duplex, message-framed channel. Inbound
//! frames are dispatched to command handlers; outbound frames carry the
//! responses interleaved with pushed events from the resumable buffer.
//!
//! Each connection runs one reader task and one writer task joined by a
//! bounded queue. A queue that cannot drain is fatal for this connection
//! only; the sync pipeline never blocks on a slow front end.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use harbor_types::{Command, InboundFrame, OutboundFrame, PushEvent};

use crate::commands::CommandError;
use crate::gateway::Gateway;

/// Resume parameters a client presents at connect time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResumeQuery {
    /// The run identifier of the server the cursor was acknowledged
    /// against. A mismatch always yields a full snapshot.
    pub run_id: Option<String>,
    /// Highest buffer id the client received before disconnecting.
    pub last_received_event: Option<i64>,
}

pub async fn handle_connection(socket: WebSocket, gateway: Gateway, query: ResumeQuery) {
    let conn_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    info!("connection {conn_id} open");

    // preamble: run marker, client state, current sync status
    let mut preamble = vec![gateway.run_marker()];
    preamble.extend(gateway.client_state());
    preamble.push(PushEvent::SyncStatus {
        status: gateway.sync_status(),
    });
    for event in &preamble {
        if send_push(&mut sink, 0, event).await.is_err() {
            return;
        }
    }

    let (live_tx, mut live_rx) = mpsc::channel(gateway.config().outbound_queue);

    // replay when the client presents our run id and a resumable cursor,
    // otherwise stream a full snapshot
    let resumed = match (&query.run_id, query.last_received_event) {
        (Some(run_id), Some(cursor)) if run_id == gateway.run_id() => {
            match gateway.buffer().subscribe(cursor, live_tx.clone()) {
                Ok((sub, replay)) => {
                    debug!(
                        "connection {conn_id} resumed at {cursor}, replaying {}",
                        replay.len()
                    );
                    for entry in replay {
                        if send_push(&mut sink, entry.id, &entry.event).await.is_err() {
                            gateway.buffer().detach(sub);
                            return;
                        }
                        gateway.buffer().ack(sub, entry.id);
                    }
                    Some(sub)
                }
                Err(e) => {
                    debug!("connection {conn_id} cannot resume: {e}");
                    None
                }
            }
        }
        _ => None,
    };

    let subscriber = match resumed {
        Some(sub) => sub,
        None => {
            // register before paging so nothing published mid-snapshot is
            // lost; it queues on the live channel until the writer drains it
            let sub = gateway.buffer().subscribe_live(live_tx.clone());
            if send_snapshot(&mut sink, &gateway).await.is_err() {
                gateway.buffer().clear(sub);
                return;
            }
            sub
        }
    };
    drop(live_tx);

    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(gateway.config().outbound_queue);
    let closing = CancellationToken::new();
    let fatal = Arc::new(AtomicBool::new(false));
    let activity = Arc::new(AtomicBool::new(true));

    // writer: pushed events, responses, keepalive with idle detection
    let write_gateway = gateway.clone();
    let write_closing = closing.clone();
    let write_fatal = fatal.clone();
    let write_activity = activity.clone();
    let mut send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(write_gateway.config().keepalive);
        keepalive.tick().await;
        let mut silent_ticks: u8 = 0;

        loop {
            tokio::select! {
                entry = live_rx.recv() => {
                    // a closed live channel means the buffer dropped us
                    let Some(entry) = entry else { break };
                    if send_push(&mut sink, entry.id, &entry.event).await.is_err() {
                        break;
                    }
                    write_gateway.buffer().ack(subscriber, entry.id);
                }
                frame = out_rx.recv() => {
                    let Some(frame) = frame else { break };
                    if send_frame(&mut sink, &frame).await.is_err() {
                        break;
                    }
                }
                _ = keepalive.tick() => {
                    if write_activity.swap(false, Ordering::AcqRel) {
                        silent_ticks = 0;
                    } else {
                        silent_ticks += 1;
                        if silent_ticks >= 2 {
                            warn!("connection {conn_id} idle, closing");
                            write_fatal.store(true, Ordering::Release);
                            break;
                        }
                    }
                    if send_push(&mut sink, 0, &write_gateway.image_token()).await.is_err() {
                        break;
                    }
                }
                _ = write_closing.cancelled() => {
                    warn!("connection {conn_id} outbound queue full, force-closing");
                    break;
                }
            }
        }
    });

    // reader: frame parsing and dispatch
    let read_gateway = gateway.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            activity.store(true, Ordering::Release);
            match message {
                Message::Text(text) => {
                    handle_frame(&read_gateway, conn_id, &out_tx, &closing, &fatal, &text).await;
                }
                Message::Close(_) => break,
                // pings are answered by the websocket layer
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    gateway.requests().cancel_all(conn_id);
    if write_fatal.load(Ordering::Acquire) {
        gateway.buffer().clear(subscriber);
    } else {
        gateway.buffer().detach(subscriber);
    }
    info!("connection {conn_id} closed");
}

/// Streams the full initial snapshot: rooms newest-first in pages, then
/// the completion marker.
async fn send_snapshot(
    sink: &mut SplitSink<WebSocket, Message>,
    gateway: &Gateway,
) -> Result<(), axum::Error> {
    let page = gateway.config().snapshot_page;
    let mut offset = 0;
    loop {
        let rooms = match gateway.store().list_rooms(page, offset) {
            Ok(rooms) => rooms,
            Err(e) => {
                warn!("snapshot aborted: {e}");
                break;
            }
        };
        let done = (rooms.len() as u32) < page;
        if !rooms.is_empty() {
            send_push(sink, 0, &PushEvent::InitialRooms { rooms }).await?;
        }
        if done {
            break;
        }
        offset += page;
    }
    send_push(sink, 0, &PushEvent::InitComplete).await
}

async fn handle_frame(
    gateway: &Gateway,
    conn_id: Uuid,
    out_tx: &mpsc::Sender<OutboundFrame>,
    closing: &CancellationToken,
    fatal: &Arc<AtomicBool>,
    text: &str,
) {
    let frame = match serde_json::from_str::<InboundFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(
                "connection {conn_id} bad frame: {e} -- raw: {}",
                &text[..text.len().min(200)]
            );
            // echo an error when the envelope at least carried a request id
            if let Some(request_id) = serde_json::from_str::<Value>(text)
                .ok()
                .and_then(|v| v.get("request_id").and_then(Value::as_i64))
            {
                respond(
                    out_tx,
                    closing,
                    fatal,
                    OutboundFrame::error(request_id, format!("bad frame: {e}")),
                );
            }
            return;
        }
    };

    match frame.command {
        Command::Cancel { request_id } => {
            let found = gateway.requests().cancel(conn_id, request_id);
            respond(
                out_tx,
                closing,
                fatal,
                OutboundFrame::response(
                    frame.request_id,
                    serde_json::json!({ "cancelled": found }),
                ),
            );
        }
        command => {
            let Some(guard) = gateway.requests().register(conn_id, frame.request_id) else {
                respond(
                    out_tx,
                    closing,
                    fatal,
                    OutboundFrame::error(frame.request_id, "request id already in flight"),
                );
                return;
            };

            trace!("connection {conn_id} request {}", frame.request_id);
            // handlers run detached so a slow pagination never blocks the
            // reader, or a cancel aimed at it
            let gateway = gateway.clone();
            let out_tx = out_tx.clone();
            let closing = closing.clone();
            let fatal = fatal.clone();
            tokio::spawn(async move {
                let result = tokio::select! {
                    result = gateway.commands().dispatch(command, guard.token()) => result,
                    _ = guard.token().cancelled() => Err(CommandError::Cancelled),
                };
                let reply = match result {
                    Ok(data) => OutboundFrame::response(frame.request_id, data),
                    Err(e) => OutboundFrame::error(frame.request_id, e.to_string()),
                };
                respond(&out_tx, &closing, &fatal, reply);
                drop(guard);
            });
        }
    }
}

/// Queues an outbound frame. A full queue is fatal for this connection:
/// the writer is told to close rather than backpressure the engine.
fn respond(
    out_tx: &mpsc::Sender<OutboundFrame>,
    closing: &CancellationToken,
    fatal: &Arc<AtomicBool>,
    frame: OutboundFrame,
) {
    match out_tx.try_send(frame) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            fatal.store(true, Ordering::Release);
            closing.cancel();
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {}
    }
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &OutboundFrame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sink.send(Message::Text(text.into())).await
}

async fn send_push(
    sink: &mut SplitSink<WebSocket, Message>,
    request_id: i64,
    event: &PushEvent,
) -> Result<(), axum::Error> {
    let frame = OutboundFrame::push(request_id, event).map_err(axum::Error::new)?;
    send_frame(sink, &frame).await
}
