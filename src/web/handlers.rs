//! HTTP and WebSocket request handlers.

use super::AppState;
use crate::control::{
    Channel, ChannelResponder, ControlDispatcher, ControlRequest, ControlResponse, OneshotResponder, ResultCode,
};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// Push channel
// ============================================================================

pub async fn handle_control_socket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.dispatcher))
}

/// Each text frame is one request, dispatched on its own task so a slow
/// probe never holds up other requests on the same session.
async fn handle_socket(socket: WebSocket, dispatcher: Arc<ControlDispatcher>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ControlResponse>();

    tracing::debug!("Control session opened");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlRequest>(text.as_str()) {
                            Ok(request) => {
                                let dispatcher = dispatcher.clone();
                                let responder = ChannelResponder::new(tx.clone());
                                tokio::spawn(async move {
                                    if let Err(e) = dispatcher.dispatch(request, Channel::Push, Box::new(responder)).await {
                                        tracing::debug!("Dropping response: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                tracing::warn!("Malformed control frame: {}", e);
                                let _ = tx.send(ControlResponse::malformed(
                                    text.as_str(),
                                    format!("InvalidInput: {}", e),
                                ));
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            Some(response) = rx.recv() => {
                match serde_json::to_string(&response) {
                    Ok(text) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::error!("Failed to encode response: {}", e),
                }
            }
        }
    }

    tracing::debug!("Control session closed");
}

// ============================================================================
// Administrative channel
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AdminQuery {
    #[serde(default)]
    pub op: String,
}

pub async fn handle_admin_get(State(state): State<AppState>, Query(query): Query<AdminQuery>) -> Response {
    run_admin(&state, query.op, Map::new()).await
}

pub async fn handle_admin_post(
    State(state): State<AppState>,
    Query(query): Query<AdminQuery>,
    body: Bytes,
) -> Response {
    let payload = if body.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice::<Map<String, Value>>(&body) {
            Ok(payload) => payload,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "result": ResultCode::Error, "error": format!("InvalidInput: {}", e) })),
                )
                    .into_response()
            }
        }
    };

    run_admin(&state, query.op, payload).await
}

async fn run_admin(state: &AppState, op: String, payload: Map<String, Value>) -> Response {
    let request = ControlRequest {
        action: "admin".to_string(),
        operation: op,
        payload,
        ..Default::default()
    };

    let (responder, rx) = OneshotResponder::new();
    if let Err(e) = state
        .dispatcher
        .dispatch(request, Channel::Admin, Box::new(responder))
        .await
    {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    match rx.await {
        Ok(response) => admin_response(response),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no response").into_response(),
    }
}

/// `probe` answers with the bare probe result; every other operation
/// answers with `result` plus its payload fields.
fn admin_response(response: ControlResponse) -> Response {
    if let Some(probe) = response.body.probe {
        return Json(probe).into_response();
    }

    let status = match response.result {
        ResultCode::Ok => StatusCode::OK,
        ResultCode::NotFound => StatusCode::NOT_FOUND,
        ResultCode::Error | ResultCode::Unsupported => StatusCode::BAD_REQUEST,
    };

    let mut value = match serde_json::to_value(&response.body) {
        Ok(value) => value,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if let Value::Object(fields) = &mut value {
        fields.insert("result".to_string(), json!(response.result));
    }

    (status, Json(value)).into_response()
}
