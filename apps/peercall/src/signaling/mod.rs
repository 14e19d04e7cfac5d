//! Lifecycle of the single persistent connection to the signaling relay.
//!
//! The channel knows nothing about negotiation. It dials through a
//! [`Connector`], announces itself with `join`, publishes its state on a
//! `watch` channel and hands every inbound frame to one registered handler as
//! a [`ChannelEvent`] tagged with the connection id that produced it.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

use crate::error::CallError;
use crate::protocol::{ParticipantId, SignalingMessage};

pub mod memory;
pub mod websocket;

pub use memory::MemoryRelay;
pub use websocket::WebSocketConnector;

/// Outbound half of a dialed transport: one text frame per item.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = CallError> + Send>>;
/// Inbound half of a dialed transport. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, CallError>> + Send>>;

#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, url: &Url) -> Result<(FrameSink, FrameStream), CallError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Opening,
    Open,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelState::Closed => "closed",
            ChannelState::Opening => "opening",
            ChannelState::Open => "open",
        };
        f.write_str(label)
    }
}

/// Snapshot for a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStatus {
    pub state: ChannelState,
    pub joined: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened { connection: u64 },
    Message { connection: u64, message: SignalingMessage },
    Closed { connection: u64 },
}

impl ChannelEvent {
    pub fn connection(&self) -> u64 {
        match self {
            ChannelEvent::Opened { connection }
            | ChannelEvent::Message { connection, .. }
            | ChannelEvent::Closed { connection } => *connection,
        }
    }
}

type Handler = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

struct Link {
    connection: u64,
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
}

struct Shared {
    state: watch::Sender<ChannelState>,
    joined: AtomicBool,
    link: Mutex<Link>,
    handler: Mutex<Option<Handler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn current(&self) -> u64 {
        self.link.lock().connection
    }

    /// Returns `false` if `connection` was retired while dialing.
    fn mark_open(&self, connection: u64, outbound: mpsc::UnboundedSender<SignalingMessage>) -> bool {
        let mut link = self.link.lock();
        if link.connection != connection || *self.state.borrow() != ChannelState::Opening {
            return false;
        }
        link.outbound = Some(outbound);
        self.state.send_replace(ChannelState::Open);
        true
    }

    fn mark_closed(&self, connection: u64) -> bool {
        let mut link = self.link.lock();
        if link.connection != connection {
            return false;
        }
        link.outbound = None;
        self.joined.store(false, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            let changed = *state != ChannelState::Closed;
            *state = ChannelState::Closed;
            changed
        })
    }

    fn mark_joined(&self, connection: u64) {
        if self.current() == connection {
            self.joined.store(true, Ordering::SeqCst);
        }
    }

    fn dispatch(&self, event: ChannelEvent) {
        let handler = self.handler.lock().clone();
        match handler {
            Some(handler) => handler(event),
            None => tracing::debug!(
                target = "peercall::signaling",
                connection = event.connection(),
                "no handler registered; dropping channel event"
            ),
        }
    }
}

pub struct SignalingChannel {
    self_id: ParticipantId,
    url: Url,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    pub fn new(self_id: ParticipantId, url: Url, connector: Arc<dyn Connector>) -> Self {
        let (state, _) = watch::channel(ChannelState::Closed);
        Self {
            self_id,
            url,
            connector,
            shared: Arc::new(Shared {
                state,
                joined: AtomicBool::new(false),
                link: Mutex::new(Link {
                    connection: 0,
                    outbound: None,
                }),
                handler: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts a connection attempt unless one is already opening or open.
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let connection = {
            let mut link = self.shared.link.lock();
            if *self.shared.state.borrow() != ChannelState::Closed {
                tracing::trace!(
                    target = "peercall::signaling",
                    connection = link.connection,
                    "connect ignored; channel already active"
                );
                return;
            }
            link.connection += 1;
            link.outbound = None;
            self.shared.joined.store(false, Ordering::SeqCst);
            self.shared.state.send_replace(ChannelState::Opening);
            link.connection
        };
        tracing::debug!(
            target = "peercall::signaling",
            connection,
            url = %self.url,
            "opening signaling channel"
        );

        let task = tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            Arc::clone(&self.connector),
            self.url.clone(),
            self.self_id.clone(),
            connection,
        ));
        let mut tasks = self.shared.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(task);
    }

    /// Resolves once the channel is open, or fails when it closes or `timeout` elapses.
    pub async fn await_ready(&self, timeout: Duration) -> Result<(), CallError> {
        let mut state = self.shared.state.subscribe();
        let current = *state.borrow_and_update();
        match current {
            ChannelState::Open => return Ok(()),
            ChannelState::Closed => return Err(CallError::ChannelNotReady("channel is closed")),
            ChannelState::Opening => {}
        }

        let settled = tokio::time::timeout(timeout, async {
            state
                .wait_for(|state| *state != ChannelState::Opening)
                .await
                .map(|state| *state)
        })
        .await;
        match settled {
            Ok(Ok(ChannelState::Open)) => Ok(()),
            Ok(Ok(_)) => Err(CallError::ChannelNotReady("channel closed while opening")),
            Ok(Err(_)) => Err(CallError::ChannelNotReady("channel dropped")),
            Err(_) => {
                tracing::warn!(
                    target = "peercall::signaling",
                    timeout_ms = timeout.as_millis() as u64,
                    "signaling channel did not open in time"
                );
                Err(CallError::ChannelTimeout(timeout))
            }
        }
    }

    /// Queues `message` for the writer. Never buffers while the channel is not open.
    pub fn send(&self, message: SignalingMessage) -> Result<(), CallError> {
        let link = self.shared.link.lock();
        if *self.shared.state.borrow() != ChannelState::Open {
            return Err(CallError::ChannelNotReady("channel is not open"));
        }
        let outbound = link
            .outbound
            .as_ref()
            .ok_or(CallError::ChannelNotReady("channel has no writer"))?;
        tracing::trace!(
            target = "peercall::signaling",
            connection = link.connection,
            kind = message.kind(),
            "queue outbound frame"
        );
        outbound
            .send(message)
            .map_err(|_| CallError::ChannelNotReady("channel writer stopped"))
    }

    /// Replaces the dispatch target for inbound events.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        *self.shared.handler.lock() = Some(Arc::new(handler));
    }

    pub fn close(&self) {
        let (connection, changed) = {
            let mut link = self.shared.link.lock();
            link.connection += 1;
            link.outbound = None;
            self.shared.joined.store(false, Ordering::SeqCst);
            let changed = self.shared.state.send_if_modified(|state| {
                let changed = *state != ChannelState::Closed;
                *state = ChannelState::Closed;
                changed
            });
            (link.connection, changed)
        };
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
        if changed {
            tracing::debug!(target = "peercall::signaling", connection, "signaling channel closed");
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            state: self.state(),
            joined: self.shared.joined.load(Ordering::SeqCst),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    /// Id of the current (or most recently retired) connection.
    pub fn connection_id(&self) -> u64 {
        self.shared.current()
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        for task in self.shared.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    url: Url,
    self_id: ParticipantId,
    connection: u64,
) {
    let (mut sink, mut stream) = match connector.dial(&url).await {
        Ok(halves) => halves,
        Err(err) => {
            tracing::error!(
                target = "peercall::signaling",
                connection,
                url = %url,
                error = %err,
                "signaling connect failed"
            );
            if shared.mark_closed(connection) {
                shared.dispatch(ChannelEvent::Closed { connection });
            }
            return;
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    // Join is queued before the sender is published so it is always written first.
    let _ = outbound_tx.send(SignalingMessage::Join {
        from: self_id.clone(),
    });
    if !shared.mark_open(connection, outbound_tx) {
        tracing::debug!(target = "peercall::signaling", connection, "connection retired while dialing");
        let _ = sink.close().await;
        return;
    }
    tracing::info!(target = "peercall::signaling", connection, id = %self_id, "signaling channel open");
    shared.dispatch(ChannelEvent::Opened { connection });

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(message) = outbound else {
                    break;
                };
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "peercall::signaling", connection, error = %err, "failed to encode frame");
                        continue;
                    }
                };
                tracing::trace!(target = "peercall::signaling", connection, event = "ws_out", len = text.len());
                if let Err(err) = sink.send(text).await {
                    tracing::error!(target = "peercall::signaling", connection, error = %err, "signaling write failed");
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(text)) => handle_frame(&shared, connection, &text),
                    Some(Err(err)) => {
                        tracing::error!(target = "peercall::signaling", connection, error = %err, "signaling read failed");
                        break;
                    }
                    None => {
                        tracing::debug!(target = "peercall::signaling", connection, "relay closed the connection");
                        break;
                    }
                }
            }
        }
    }

    let _ = sink.close().await;
    if shared.mark_closed(connection) {
        tracing::info!(target = "peercall::signaling", connection, "signaling channel closed");
        shared.dispatch(ChannelEvent::Closed { connection });
    }
}

fn handle_frame(shared: &Shared, connection: u64, text: &str) {
    tracing::trace!(target = "peercall::signaling", connection, event = "ws_in", len = text.len());
    let message = match SignalingMessage::decode(text) {
        Ok(message) => message,
        Err(err) => {
            tracing::warn!(
                target = "peercall::signaling",
                connection,
                error = %err,
                "skipping malformed signaling frame"
            );
            return;
        }
    };
    if message == SignalingMessage::Joined {
        shared.mark_joined(connection);
        tracing::debug!(target = "peercall::signaling", connection, "relay acknowledged join");
    }
    shared.dispatch(ChannelEvent::Message {
        connection,
        message,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    use crate::protocol::SessionDescription;

    fn relay_url() -> Url {
        Url::parse("ws://relay.invalid/signal").unwrap()
    }

    fn channel(relay: &MemoryRelay, id: &str) -> (SignalingChannel, UnboundedReceiver<ChannelEvent>) {
        let channel = SignalingChannel::new(id.into(), relay_url(), Arc::new(relay.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        channel.on_message(move |event| {
            let _ = tx.send(event);
        });
        (channel, rx)
    }

    async fn next_message(rx: &mut UnboundedReceiver<ChannelEvent>) -> SignalingMessage {
        loop {
            match rx.recv().await {
                Some(ChannelEvent::Message { message, .. }) => return message,
                Some(_) => continue,
                None => panic!("channel handler dropped"),
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_opens_and_joins_first() {
        let relay = MemoryRelay::new();
        let (channel, mut events) = channel(&relay, "A");
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.connect();
        assert_eq!(channel.state(), ChannelState::Opening);
        channel.await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);

        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Opened { connection: 1 })
        );
        assert_eq!(next_message(&mut events).await, SignalingMessage::Joined);
        assert!(channel.status().joined);
        assert_eq!(
            relay.sent_by(&"A".into()),
            vec![SignalingMessage::Join { from: "A".into() }]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn connect_is_idempotent_while_active() {
        let relay = MemoryRelay::new();
        let (channel, _events) = channel(&relay, "A");
        channel.connect();
        channel.connect();
        channel.await_ready(Duration::from_secs(5)).await.unwrap();
        channel.connect();
        assert_eq!(channel.connection_id(), 1);
        assert_eq!(relay.dials(), 1);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn send_requires_open_channel() {
        let relay = MemoryRelay::new();
        let (channel, _events) = channel(&relay, "A");
        let err = channel
            .send(SignalingMessage::Join { from: "A".into() })
            .unwrap_err();
        assert!(matches!(err, CallError::ChannelNotReady(_)));

        relay.hold();
        channel.connect();
        let err = channel
            .send(SignalingMessage::Join { from: "A".into() })
            .unwrap_err();
        assert!(matches!(err, CallError::ChannelNotReady(_)));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn await_ready_fails_immediately_when_closed() {
        let relay = MemoryRelay::new();
        let (channel, _events) = channel(&relay, "A");
        let err = channel.await_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CallError::ChannelNotReady(_)));
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn await_ready_times_out_while_opening() {
        let relay = MemoryRelay::new();
        relay.hold();
        let (channel, _events) = channel(&relay, "A");
        channel.connect();

        let err = channel
            .await_ready(Duration::from_millis(5000))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::ChannelTimeout(t) if t == Duration::from_millis(5000)));
        assert_eq!(channel.state(), ChannelState::Opening);
    }

    #[test_timeout::tokio_timeout_test(paused)]
    async fn await_ready_succeeds_when_open_arrives_before_timeout() {
        let relay = MemoryRelay::new();
        relay.hold();
        let (channel, _events) = channel(&relay, "A");
        channel.connect();

        let gate = relay.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4000)).await;
            gate.accept();
        });
        channel.await_ready(Duration::from_millis(5000)).await.unwrap();
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn refused_dial_closes_and_fails_waiters() {
        let relay = MemoryRelay::new();
        relay.refuse();
        let (channel, mut events) = channel(&relay, "A");
        channel.connect();
        let err = channel.await_ready(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CallError::ChannelNotReady(_)));
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(
            events.recv().await,
            Some(ChannelEvent::Closed { connection: 1 })
        );
    }

    /// Collects the messages of every `error` level event.
    #[derive(Clone, Default)]
    struct ErrorEvents(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorEvents {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() != tracing::Level::ERROR {
                return;
            }
            let mut message = MessageField::default();
            event.record(&mut message);
            self.0.lock().push(message.0);
        }
    }

    #[derive(Default)]
    struct MessageField(String);

    impl tracing::field::Visit for MessageField {
        fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
            if field.name() == "message" {
                self.0 = format!("{value:?}");
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn failed_dial_is_logged_as_error() {
        use tracing_subscriber::layer::SubscriberExt;

        let errors = ErrorEvents::default();
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(errors.clone()),
        );
        let relay = MemoryRelay::new();
        relay.refuse();
        let (channel, _events) = channel(&relay, "A");
        channel.connect();
        assert!(channel.await_ready(Duration::from_secs(5)).await.is_err());

        assert_eq!(errors.0.lock().as_slice(), ["signaling connect failed"]);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn messages_are_routed_by_recipient() {
        let relay = MemoryRelay::new();
        let (a, _a_events) = channel(&relay, "A");
        let (b, mut b_events) = channel(&relay, "B");
        a.connect();
        b.connect();
        a.await_ready(Duration::from_secs(5)).await.unwrap();
        b.await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(next_message(&mut b_events).await, SignalingMessage::Joined);
        relay.wait_registered(&"B".into()).await;

        let offer = SignalingMessage::Offer {
            from: "A".into(),
            to: "B".into(),
            sdp: SessionDescription(json!({"type": "offer", "sdp": "v=0"})),
        };
        a.send(offer.clone()).unwrap();
        assert_eq!(next_message(&mut b_events).await, offer);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn malformed_frames_are_skipped() {
        let relay = MemoryRelay::new();
        let (channel, mut events) = channel(&relay, "A");
        channel.connect();
        channel.await_ready(Duration::from_secs(5)).await.unwrap();
        assert_eq!(next_message(&mut events).await, SignalingMessage::Joined);

        relay.inject(&"A".into(), "{not json");
        relay.inject(&"A".into(), r#"{"type":"error","message":"still here"}"#);
        assert_eq!(
            next_message(&mut events).await,
            SignalingMessage::Error {
                message: "still here".into()
            }
        );
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn relay_disconnect_closes_channel() {
        let relay = MemoryRelay::new();
        let (channel, mut events) = channel(&relay, "A");
        channel.connect();
        channel.await_ready(Duration::from_secs(5)).await.unwrap();
        relay.wait_registered(&"A".into()).await;

        let mut state = channel.subscribe();
        relay.disconnect(&"A".into());
        state
            .wait_for(|state| *state == ChannelState::Closed)
            .await
            .unwrap();
        assert!(!channel.status().joined);
        loop {
            if let Some(ChannelEvent::Closed { connection }) = events.recv().await {
                assert_eq!(connection, 1);
                break;
            }
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn close_retires_connection_and_allows_reconnect() {
        let relay = MemoryRelay::new();
        let (channel, _events) = channel(&relay, "A");
        channel.connect();
        channel.await_ready(Duration::from_secs(5)).await.unwrap();

        channel.close();
        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(matches!(
            channel.send(SignalingMessage::Join { from: "A".into() }),
            Err(CallError::ChannelNotReady(_))
        ));
        let retired = channel.connection_id();

        channel.connect();
        channel.await_ready(Duration::from_secs(5)).await.unwrap();
        assert!(channel.connection_id() > retired);
        assert_eq!(relay.dials(), 2);
    }
}
