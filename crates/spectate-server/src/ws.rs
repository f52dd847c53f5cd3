use std::sync::Arc;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use spectate_protocol::{BrokerEvent, EventStreamMessage, WorkloadId};

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    workload: Option<WorkloadId>,
}

/// GET /ws/events?workload= - live broker events, optionally for one workload.
pub async fn events(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    // Subscribe before the upgrade so nothing published meanwhile is missed.
    let rx = state.broker.subscribe();
    let shutdown = state.shutdown.clone();
    ws.on_upgrade(move |socket| events_task(socket, rx, query.workload, shutdown))
}

async fn events_task(
    socket: WebSocket,
    rx: broadcast::Receiver<BrokerEvent>,
    workload: Option<WorkloadId>,
    shutdown: CancellationToken,
) {
    if let Err(err) = events_inner(socket, rx, workload, shutdown).await {
        tracing::debug!("event stream closed with error: {err}");
    }
}

async fn events_inner(
    socket: WebSocket,
    mut rx: broadcast::Receiver<BrokerEvent>,
    workload: Option<WorkloadId>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut ws_tx, mut ws_rx) = socket.split();
    send(
        &mut ws_tx,
        &EventStreamMessage::Subscribed {
            workload: workload.clone(),
        },
    )
    .await?;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            recv = rx.recv() => match recv {
                Ok(event) => {
                    let wanted = workload
                        .as_deref()
                        .is_none_or(|w| event.workload_id() == Some(w));
                    if wanted {
                        send(&mut ws_tx, &EventStreamMessage::Event(event)).await?;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event subscriber lagged");
                    send(&mut ws_tx, &EventStreamMessage::Lagged { skipped }).await?;
                }
                Err(RecvError::Closed) => break,
            },
            maybe_msg = ws_rx.next() => {
                let Some(msg) = maybe_msg else {
                    break;
                };
                match msg? {
                    Message::Close(_) => break,
                    Message::Ping(v) => ws_tx.send(Message::Pong(v)).await?,
                    Message::Text(_) | Message::Binary(_) | Message::Pong(_) => {}
                }
            }
        }
    }

    let _ = ws_tx.send(Message::Close(None)).await;
    Ok(())
}

async fn send(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    msg: &EventStreamMessage,
) -> Result<()> {
    ws_tx
        .send(Message::Text(serde_json::to_string(msg)?.into()))
        .await?;
    Ok(())
}
