//! In-process relay for tests and demos.
//!
//! Speaks the same frames as the real relay: registers a participant on
//! `join`, answers `joined`, and forwards offers, answers and candidates
//! verbatim to whoever registered under `to`. Unknown recipients get an
//! `error` frame back.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::channel::mpsc::{UnboundedReceiver, UnboundedSender, unbounded};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use url::Url;

use super::{Connector, FrameSink, FrameStream};
use crate::error::CallError;
use crate::protocol::{ParticipantId, SignalingMessage};

/// Whether dial attempts are let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Hold,
    Accept,
    Refuse,
}

type ClientTx = UnboundedSender<Result<String, CallError>>;

struct Registration {
    connection: u64,
    tx: ClientTx,
}

struct RelayInner {
    gate: watch::Sender<Gate>,
    peers: Mutex<HashMap<ParticipantId, Registration>>,
    received: Mutex<Vec<SignalingMessage>>,
    registered: Notify,
    dials: AtomicU64,
    connections: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(Gate::Accept);
        Self {
            inner: Arc::new(RelayInner {
                gate,
                peers: Mutex::new(HashMap::new()),
                received: Mutex::new(Vec::new()),
                registered: Notify::new(),
                dials: AtomicU64::new(0),
                connections: AtomicU64::new(0),
            }),
        }
    }

    /// Parks new dial attempts until [`accept`](Self::accept) or [`refuse`](Self::refuse).
    pub fn hold(&self) {
        self.inner.gate.send_replace(Gate::Hold);
    }

    pub fn accept(&self) {
        self.inner.gate.send_replace(Gate::Accept);
    }

    pub fn refuse(&self) {
        self.inner.gate.send_replace(Gate::Refuse);
    }

    pub fn dials(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    pub fn is_registered(&self, id: &ParticipantId) -> bool {
        self.inner.peers.lock().contains_key(id)
    }

    pub async fn wait_registered(&self, id: &ParticipantId) {
        loop {
            let notified = self.inner.registered.notified();
            if self.is_registered(id) {
                return;
            }
            notified.await;
        }
    }

    /// Every parsed frame received from `id`, in arrival order.
    pub fn sent_by(&self, id: &ParticipantId) -> Vec<SignalingMessage> {
        self.inner
            .received
            .lock()
            .iter()
            .filter(|message| message.sender() == Some(id))
            .cloned()
            .collect()
    }

    /// Pushes a raw frame to a registered participant.
    pub fn inject(&self, id: &ParticipantId, frame: &str) -> bool {
        match self.inner.peers.lock().get(id) {
            Some(registration) => registration.tx.unbounded_send(Ok(frame.to_string())).is_ok(),
            None => false,
        }
    }

    /// Drops the participant's connection as if the relay went away.
    pub fn disconnect(&self, id: &ParticipantId) {
        if let Some(registration) = self.inner.peers.lock().remove(id) {
            registration.tx.close_channel();
        }
    }
}

#[async_trait]
impl Connector for MemoryRelay {
    async fn dial(&self, url: &Url) -> Result<(FrameSink, FrameStream), CallError> {
        self.inner.dials.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.inner.gate.subscribe();
        let gate = gate
            .wait_for(|gate| *gate != Gate::Hold)
            .await
            .map(|gate| *gate)
            .map_err(|_| CallError::Transport("relay shut down".into()))?;
        if gate == Gate::Refuse {
            return Err(CallError::Transport(format!("connection to {url} refused")));
        }

        let connection = self.inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = unbounded::<String>();
        let (inbound_tx, inbound_rx) = unbounded::<Result<String, CallError>>();
        tokio::spawn(serve(Arc::clone(&self.inner), connection, outbound_rx, inbound_tx));

        let sink: FrameSink =
            Box::pin(outbound_tx.sink_map_err(|err| CallError::Transport(err.to_string())));
        let stream: FrameStream = Box::pin(inbound_rx);
        Ok((sink, stream))
    }
}

async fn serve(
    inner: Arc<RelayInner>,
    connection: u64,
    mut frames: UnboundedReceiver<String>,
    client: ClientTx,
) {
    while let Some(frame) = frames.next().await {
        let message = match SignalingMessage::decode(&frame) {
            Ok(message) => message,
            Err(err) => {
                reply(&client, &SignalingMessage::Error {
                    message: format!("malformed frame: {err}"),
                });
                continue;
            }
        };
        inner.received.lock().push(message.clone());

        match &message {
            SignalingMessage::Join { from } => {
                inner.peers.lock().insert(
                    from.clone(),
                    Registration {
                        connection,
                        tx: client.clone(),
                    },
                );
                reply(&client, &SignalingMessage::Joined);
                inner.registered.notify_waiters();
            }
            SignalingMessage::Offer { to, .. }
            | SignalingMessage::Answer { to, .. }
            | SignalingMessage::Candidate { to, .. } => {
                let delivered = inner
                    .peers
                    .lock()
                    .get(to)
                    .map(|target| target.tx.unbounded_send(Ok(frame.clone())).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    reply(&client, &SignalingMessage::Error {
                        message: format!("peer {to} is not connected"),
                    });
                }
            }
            SignalingMessage::Joined | SignalingMessage::Error { .. } => {
                tracing::debug!(
                    target = "peercall::relay",
                    kind = message.kind(),
                    "ignoring relay-only frame from client"
                );
            }
        }
    }

    inner
        .peers
        .lock()
        .retain(|_, registration| registration.connection != connection);
}

fn reply(client: &ClientTx, message: &SignalingMessage) {
    match message.encode() {
        Ok(text) => {
            let _ = client.unbounded_send(Ok(text));
        }
        Err(err) => tracing::warn!(target = "peercall::relay", error = %err, "failed to encode reply"),
    }
}
