use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{CallEvent, Controller, ControllerEvent, NegotiationState};
use crate::error::CallError;
use crate::protocol::ParticipantId;
use crate::signaling::ChannelStatus;

const COMMAND_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatus {
    pub self_id: ParticipantId,
    pub negotiation: NegotiationState,
    pub channel: ChannelStatus,
    pub remote: Option<ParticipantId>,
}

enum Command {
    Connect(oneshot::Sender<Result<(), CallError>>),
    PlaceCall {
        target: ParticipantId,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Hangup(oneshot::Sender<()>),
    Status(oneshot::Sender<CallStatus>),
}

enum Next {
    Command(Command),
    Event(ControllerEvent),
}

/// Cloneable front end to a controller running on its own task.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<CallEvent>,
}

impl CallHandle {
    pub async fn connect(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect(reply)).await?;
        rx.await.map_err(|_| CallError::ControllerGone)?
    }

    pub async fn place_call(&self, target: impl Into<ParticipantId>) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PlaceCall {
            target: target.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| CallError::ControllerGone)?
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Hangup(reply)).await?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    pub async fn status(&self) -> Result<CallStatus, CallError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await.map_err(|_| CallError::ControllerGone)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| CallError::ControllerGone)
    }
}

impl Controller {
    /// Moves the controller onto its own task. The task hangs up and exits
    /// once every handle is dropped.
    pub fn spawn(self) -> (CallHandle, JoinHandle<()>) {
        let (commands, rx) = mpsc::channel(COMMAND_CAPACITY);
        let handle = CallHandle {
            commands,
            events: self.notify.clone(),
        };
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::debug!(target = "peercall::negotiation", id = %self.config.self_id, "controller started");
        loop {
            let next = tokio::select! {
                command = commands.recv() => command.map(Next::Command),
                event = self.events_rx.recv() => event.map(Next::Event),
            };
            match next {
                Some(Next::Command(command)) => self.execute(command).await,
                Some(Next::Event(event)) => self.handle_event(event).await,
                None => break,
            }
        }
        self.hangup().await;
        tracing::debug!(target = "peercall::negotiation", "controller stopped");
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::PlaceCall { target, reply } => {
                let result = self.place_call(target).await;
                if let Err(err) = &result {
                    tracing::warn!(
                        target = "peercall::negotiation",
                        error = %err,
                        kind = err.kind(),
                        "place call failed"
                    );
                }
                let _ = reply.send(result);
            }
            Command::Hangup(reply) => {
                self.hangup().await;
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }
}
