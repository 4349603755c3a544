use std::collections::BTreeMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::protocol::ViewerCommand;
use crate::relay::{RelayHub, RelayTarget, UpstreamConnector};

/// Relay hubs by kind, e.g. `browser` or `desktop`.
#[derive(Clone, Default)]
pub struct RelayRegistry {
    hubs: BTreeMap<String, RelayHub>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_targets(
        targets: impl IntoIterator<Item = RelayTarget>,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Self {
        let mut registry = Self::new();
        for target in targets {
            registry.insert(RelayHub::new(target, connector.clone()));
        }
        registry
    }

    pub fn insert(&mut self, hub: RelayHub) {
        self.hubs.insert(hub.target().kind.clone(), hub);
    }

    pub fn get(&self, kind: &str) -> Option<&RelayHub> {
        self.hubs.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.hubs.keys().map(String::as_str)
    }
}

/// `GET /relay/:kind` upgrades to a viewer WebSocket.
pub fn relay_router(registry: RelayRegistry) -> Router {
    Router::new()
        .route("/relay/:kind", get(relay_handler))
        .with_state(Arc::new(registry))
}

async fn relay_handler(
    ws: WebSocketUpgrade,
    Path(kind): Path<String>,
    State(registry): State<Arc<RelayRegistry>>,
) -> Response {
    let Some(hub) = registry.get(&kind).cloned() else {
        return (StatusCode::NOT_FOUND, format!("unknown relay kind: {kind}")).into_response();
    };
    ws.on_upgrade(move |socket| viewer_socket(socket, hub))
}

async fn viewer_socket(socket: WebSocket, hub: RelayHub) {
    let handle = match hub.join() {
        Ok(handle) => handle,
        Err(error) => {
            warn!(error = %error, "viewer join failed");
            return;
        }
    };
    let viewer = handle.id;
    let mut events = handle.events;
    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(error) => {
                    warn!(error = %error, "failed to encode viewer event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let command_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            match message {
                Message::Text(text) => match serde_json::from_str::<ViewerCommand>(&text) {
                    Ok(ViewerCommand::DisconnectRequest) => break,
                    Ok(command) => command_hub.handle_command(viewer, command),
                    Err(error) => {
                        debug!(viewer, error = %error, "ignoring malformed viewer message");
                    }
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    };
    hub.leave(viewer);
}
