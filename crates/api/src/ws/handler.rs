use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use stemsplit_events::Subscription;

use crate::error::AppResult;
use crate::handlers::jobs::parse_job_id;
use crate::state::AppState;
use crate::ws::heartbeat::heartbeat_interval;

/// GET /api/v1/jobs/{id}/events
///
/// Upgrade to a WebSocket streaming the job's progress events as JSON text
/// frames. The subscription is taken before the upgrade so an unknown or
/// already finished job answers 404 instead of an empty stream.
pub async fn job_events(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let job_id = parse_job_id(&id)?;
    let subscription = state.jobs.subscribe(job_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, subscription)))
}

/// Manage a single progress connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Spawns a sender task forwarding progress events and heartbeats.
///   2. Processes inbound messages on the current task.
///   3. Stops both halves when either side finishes.
async fn handle_socket(socket: WebSocket, subscription: Subscription) {
    let job_id = subscription.job_id();
    tracing::info!(job_id = %job_id, "Progress stream connected");

    let (sink, mut stream) = socket.split();
    let mut send_task = tokio::spawn(forward_events(sink, subscription));

    // Receiver loop: the client only ever sends pongs and close frames.
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = stream.next().await {
            match result {
                Ok(Message::Close(_)) => break,
                Ok(Message::Pong(_)) => {
                    tracing::trace!(job_id = %job_id, "Pong received");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(job_id = %job_id, error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::info!(job_id = %job_id, "Progress stream disconnected");
}

/// Write events to the sink until the terminal event, then close.
async fn forward_events(mut sink: SplitSink<WebSocket, Message>, mut subscription: Subscription) {
    let job_id = subscription.job_id();
    let mut heartbeat = heartbeat_interval();

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to encode progress event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    tracing::debug!(job_id = %job_id, "WebSocket sink closed");
                    return;
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    tracing::debug!(job_id = %job_id, "WebSocket sink closed");
                    return;
                }
            }
        }
    }

    if subscription.missed() > 0 {
        tracing::warn!(job_id = %job_id, missed = subscription.missed(), "Subscriber missed progress events");
    }
    let _ = sink.send(Message::Close(None)).await;
}
