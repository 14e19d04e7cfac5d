#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

#[derive(Clone, Default)]
struct RelayState {
    peers: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>>,
    frames: Arc<Mutex<Vec<Value>>>,
}

/// Minimal relay with the production routing rules, served over a real socket.
pub struct TestRelay {
    addr: SocketAddr,
    state: RelayState,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    pub async fn start() -> Self {
        let state = RelayState::default();
        let router = Router::new()
            .route("/signal", get(ws_handler))
            .with_state(state.clone());
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("listener bind");
        let addr = listener.local_addr().expect("local addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });
        Self {
            addr,
            state,
            shutdown: Some(shutdown_tx),
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/signal", self.addr)
    }

    /// Frames received from `id`, as raw JSON.
    pub fn frames_from(&self, id: &str) -> Vec<Value> {
        self.state
            .frames
            .lock()
            .iter()
            .filter(|frame| frame.get("from").and_then(Value::as_str) == Some(id))
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.state.peers.lock().contains_key(id)
    }

    pub async fn wait_registered(&self, id: &str) {
        while !self.is_registered(id) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub async fn wait_unregistered(&self, id: &str) {
        while self.is_registered(id) {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    pub fn send_raw(&self, id: &str, text: &str) -> bool {
        match self.state.peers.lock().get(id) {
            Some(tx) => tx.send(WsMessage::Text(text.to_string())).is_ok(),
            None => false,
        }
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<RelayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut self_id: Option<String> = None;
    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(frame) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        state.frames.lock().push(frame.clone());

        match frame.get("type").and_then(Value::as_str) {
            Some("join") => {
                if let Some(id) = frame.get("from").and_then(Value::as_str) {
                    state.peers.lock().insert(id.to_string(), tx.clone());
                    self_id = Some(id.to_string());
                    let _ = tx.send(WsMessage::Text(json!({"type": "joined"}).to_string()));
                }
            }
            Some("offer" | "answer" | "candidate") => {
                let to = frame.get("to").and_then(Value::as_str).unwrap_or_default();
                let target = state.peers.lock().get(to).cloned();
                match target {
                    Some(target) => {
                        let _ = target.send(WsMessage::Text(text));
                    }
                    None => {
                        let error = json!({"type": "error", "message": format!("peer {to} is not connected")});
                        let _ = tx.send(WsMessage::Text(error.to_string()));
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(id) = self_id {
        state.peers.lock().remove(&id);
    }
    send_task.abort();
}
