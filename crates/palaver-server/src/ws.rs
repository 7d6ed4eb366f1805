//! WebSocket upgrade and the connection lifecycle.
//!
//! The upgrade handler trusts the `uid` query parameter: authentication
//! happens in the fronting layer before a request reaches this path.
//! Each accepted socket becomes one connection endpoint whose read and
//! write loops run over the split socket halves; the broker's
//! coordinating loop owns registration and teardown.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use palaver_broker::{run_read_loop, run_write_loop, ConnectionEndpoint};
use palaver_shared::constants::MAX_FRAME_SIZE;
use palaver_shared::ids::UserId;
use palaver_store::Repository;

use crate::api::AppState;

#[derive(Deserialize)]
pub struct WsParams {
    uid: String,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let user_id = match UserId::parse(&params.uid) {
        Ok(user_id) => user_id,
        Err(e) => {
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    ws.max_frame_size(MAX_FRAME_SIZE)
        .max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| serve_socket(state, user_id, socket))
}

async fn serve_socket(state: AppState, user_id: UserId, socket: WebSocket) {
    let endpoint = ConnectionEndpoint::new(user_id.clone(), state.config.outbound_queue);
    let (handle, outbound_rx) = endpoint.into_parts();

    if let Err(e) = state.broker.register_client(handle.clone()).await {
        warn!(user = %user_id, error = %e, "registration rejected");
        return;
    }
    info!(user = %user_id, "websocket session open");

    let (ws_sink, ws_stream) = socket.split();

    // Protocol-level ping/pong and close frames are transport noise; the
    // endpoint loops deal in raw payload bytes only.
    let frames = ws_stream.filter_map(|item| {
        future::ready(match item {
            Ok(Message::Text(text)) => Some(Ok(Bytes::from(text.into_bytes()))),
            Ok(Message::Binary(data)) => Some(Ok(Bytes::from(data))),
            Ok(_) => None,
            Err(e) => Some(Err(e)),
        })
    });
    let sink = ws_sink.with(|payload: Bytes| future::ready(Ok::<_, axum::Error>(to_ws_message(payload))));

    let repository: std::sync::Arc<dyn Repository> = state.repository.clone();
    let write_task = tokio::spawn(run_write_loop(
        handle.clone(),
        outbound_rx,
        sink,
        repository,
    ));

    run_read_loop(
        handle.clone(),
        state.broker.clone(),
        frames,
        state.config.overflow_buffer,
    )
    .await;

    // The read side is done (socket closed, errored, or displaced): the
    // logout path removes the registry entry and closes both queues.
    if let Err(e) = state.broker.unregister_client(handle.clone()).await {
        debug!(user = %user_id, error = %e, "unregister skipped");
        // Broker already closed; tear the write loop down directly.
        handle.close();
    }

    if let Err(e) = write_task.await {
        warn!(user = %user_id, error = %e, "write loop ended abnormally");
    }
    info!(user = %user_id, "websocket session closed");
}

/// Frames are JSON; send them as text when valid UTF-8, binary otherwise.
fn to_ws_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(e) => Message::Binary(e.into_bytes()),
    }
}
