//! Session supervisor: the single authority on "are we listening, and where".
//!
//! The supervisor owns at most one [`ChannelHandle`], writes the durable pair,
//! and publishes [`LifecycleEvent`]s. It runs as one task that handles one
//! input at a time, either a command from a control surface or an event from
//! the live channel session, so transitions never overlap.
//!
//! ```text
//! Idle --start--> Connecting --opened--> Active --stop|closed|failed--> Idle
//!                 Connecting --failed--> Idle
//! ```
//!
//! `Closing` is passed through while a live handle is let go, either by
//! `stop` or by `start` moving to another channel.
//!
//! A dropped connection is not retried. The user has to start again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::session::channel::{
    ChannelEnvelope, ChannelEvent, ChannelHandle, Connector, EventReceiver, EventSender,
    Generation, CLOSE_NORMAL,
};
use crate::session::error::SessionError;
use crate::session::lifecycle::{LifecycleBus, LifecycleEvent, LifecycleSubscription};
use crate::session::notify::AudioCue;
use crate::session::persistence::{
    DurableStore, ListenState, StoredValue, DESIRED_CONNECTED_KEY,
};
use crate::session::protocol::{ChannelId, SessionState, SupervisorStatus};

/// Server payload meaning "someone clicked"
pub const CLICK_SENTINEL: &str = "c";
/// Server keepalive payload
pub const HEARTBEAT: &str = "h";

const STOP_REASON: &str = "User stopped listening";
const COMMAND_QUEUE: usize = 32;

pub struct Supervisor {
    store: Arc<dyn DurableStore>,
    connector: Arc<dyn Connector>,
    cue: Arc<dyn AudioCue>,
    bus: LifecycleBus,
    events_tx: EventSender,
    events_rx: Option<EventReceiver>,
    state: SessionState,
    live: Option<ChannelHandle>,
    next_generation: Generation,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn DurableStore>,
        connector: Arc<dyn Connector>,
        cue: Arc<dyn AudioCue>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            store,
            connector,
            cue,
            bus: LifecycleBus::new(),
            events_tx,
            events_rx: Some(events_rx),
            state: SessionState::Idle,
            live: None,
            next_generation: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn subscribe(&self) -> LifecycleSubscription {
        self.bus.subscribe()
    }

    /// Channel of the live session, if there is one
    pub fn live_channel(&self) -> Option<&ChannelId> {
        self.live.as_ref().map(|h| h.channel_id())
    }

    /// Reconnect if the durable pair says we should be listening.
    ///
    /// Called once at process start, before any user command.
    pub fn on_restart(&mut self) -> Result<(), SessionError> {
        let persisted = self.load_state();
        if !persisted.desired_connected {
            tracing::info!(channel = %persisted.channel_id, "not resuming, listening was off");
            return Ok(());
        }

        match ChannelId::new(persisted.channel_id) {
            Ok(channel_id) => {
                tracing::info!(channel = %channel_id, "resuming listener after restart");
                self.start(channel_id);
                Ok(())
            }
            Err(_) => {
                // Never guess an id; turn the flag off instead
                let err = SessionError::InconsistentPersistedState;
                tracing::warn!(error = %err, "clearing desired_connected");
                self.persist(&ListenState::new(false, ""));
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Start listening on `channel_id`, replacing any session for another id.
    pub fn start(&mut self, channel_id: ChannelId) {
        if let Some(live) = &self.live {
            if live.channel_id() == &channel_id
                && matches!(self.state, SessionState::Connecting | SessionState::Active)
            {
                tracing::debug!(channel = %channel_id, state = %self.state, "already listening");
                return;
            }
        }

        if let Some(previous) = self.live.take() {
            self.transition(SessionState::Closing);
            tracing::info!(
                from = %previous.channel_id(),
                to = %channel_id,
                "switching channel"
            );
            previous.close(CLOSE_NORMAL, STOP_REASON);
        }

        self.persist(&ListenState::new(true, channel_id.as_str()));

        let generation = self.next_generation;
        self.next_generation += 1;
        self.last_error = None;
        self.live = Some(
            self.connector
                .open(&channel_id, generation, self.events_tx.clone()),
        );
        tracing::info!(channel = %channel_id, generation, "connecting");
        self.transition(SessionState::Connecting);
    }

    /// Stop listening. Safe to call with nothing running or while closing.
    pub fn stop(&mut self) {
        let had_session = match self.live.take() {
            Some(handle) => {
                self.transition(SessionState::Closing);
                tracing::info!(channel = %handle.channel_id(), "stopping listener");
                handle.close(CLOSE_NORMAL, STOP_REASON);
                true
            }
            None => false,
        };

        self.clear_desired();

        if had_session || self.state != SessionState::Idle {
            self.transition(SessionState::Idle);
            self.bus.publish(LifecycleEvent::Stopped);
        }
    }

    /// Apply one event from a channel session
    pub fn handle_channel_event(&mut self, envelope: ChannelEnvelope) {
        let is_live = self
            .live
            .as_ref()
            .is_some_and(|h| h.generation() == envelope.generation);
        if !is_live {
            tracing::debug!(
                generation = envelope.generation,
                event = ?envelope.event,
                "ignoring event from a session that is no longer live"
            );
            return;
        }

        let channel_id = envelope.channel_id;
        match envelope.event {
            ChannelEvent::Opened => {
                if self.state != SessionState::Connecting {
                    tracing::debug!(state = %self.state, "duplicate open ignored");
                    return;
                }
                self.persist(&ListenState::new(true, channel_id.as_str()));
                self.transition(SessionState::Active);
                tracing::info!(channel = %channel_id, "listening");
                self.bus.publish(LifecycleEvent::Started {
                    channel_id: channel_id.to_string(),
                });
            }
            ChannelEvent::Message(payload) => self.handle_message(&channel_id, &payload),
            ChannelEvent::Closed { code, reason } => {
                let err = (code != CLOSE_NORMAL).then(|| SessionError::RemoteClose {
                    channel_id: channel_id.to_string(),
                    reason: format!("code {} {}", code, reason).trim_end().to_string(),
                });
                match &err {
                    Some(err) => tracing::warn!(error = %err, "channel closed"),
                    None => tracing::info!(channel = %channel_id, "channel closed normally"),
                }
                self.end_session(err);
            }
            ChannelEvent::Failed(reason) => {
                let err = if self.state == SessionState::Connecting {
                    SessionError::ConnectFailure {
                        channel_id: channel_id.to_string(),
                        reason,
                    }
                } else {
                    SessionError::RemoteClose {
                        channel_id: channel_id.to_string(),
                        reason,
                    }
                };
                tracing::warn!(error = %err, "channel failed");
                self.end_session(Some(err));
            }
        }
    }

    fn handle_message(&self, channel_id: &ChannelId, payload: &str) {
        match payload {
            CLICK_SENTINEL => {
                tracing::info!(channel = %channel_id, "click!");
                self.cue.play();
            }
            HEARTBEAT => tracing::trace!(channel = %channel_id, "heartbeat"),
            other => tracing::debug!(channel = %channel_id, payload = other, "unhandled payload"),
        }
    }

    /// The live session ended on its own (closed or failed)
    fn end_session(&mut self, err: Option<SessionError>) {
        // The session already ended; dropping the handle just detaches its task
        self.live = None;
        self.last_error = err.map(|e| e.to_string());
        self.clear_desired();

        self.transition(SessionState::Idle);
        self.bus.publish(LifecycleEvent::Stopped);
    }

    pub fn status(&self) -> SupervisorStatus {
        let persisted = self.load_state();
        SupervisorStatus {
            state: self.state,
            live_channel: self.live_channel().map(|c| c.to_string()),
            desired_connected: persisted.desired_connected,
            channel_id: persisted.channel_id,
            last_error: self.last_error.clone(),
            updated_at: self.updated_at,
        }
    }

    fn transition(&mut self, to: SessionState) {
        if self.state != to {
            tracing::debug!(from = %self.state, to = %to, "state transition");
            self.state = to;
            self.updated_at = Utc::now();
        }
    }

    fn load_state(&self) -> ListenState {
        ListenState::load(self.store.as_ref()).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to read durable state");
            ListenState::default()
        })
    }

    /// Turn the durable flag off, keeping the remembered channel id
    fn clear_desired(&self) {
        match ListenState::load(self.store.as_ref()) {
            Ok(persisted) if !persisted.desired_connected => {}
            Ok(mut persisted) => {
                persisted.desired_connected = false;
                self.persist(&persisted);
            }
            Err(e) => {
                // Only the flag is known; writing the whole pair would blank the id
                tracing::error!(error = %e, "failed to read durable state");
                if let Err(e) = self
                    .store
                    .put(DESIRED_CONNECTED_KEY, StoredValue::Bool(false))
                {
                    tracing::error!(error = %e, "failed to write durable state");
                }
            }
        }
    }

    fn persist(&self, state: &ListenState) {
        // A failed write must not take the supervisor down; memory stays correct
        if let Err(e) = state.save(self.store.as_ref()) {
            tracing::error!(error = %e, "failed to write durable state");
        }
    }

    /// Run the supervisor on its own task
    pub fn spawn(mut self) -> (SupervisorHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE);
        let handle = SupervisorHandle {
            commands: commands_tx,
            bus: self.bus.clone(),
        };
        let events_rx = self.events_rx.take();
        let task = tokio::spawn(async move {
            if let Some(events_rx) = events_rx {
                self.run(commands_rx, events_rx).await;
            }
        });
        (handle, task)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: EventReceiver,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(envelope) = events.recv() => self.handle_channel_event(envelope),
            }
        }

        // Leave the durable pair alone so the next start resumes listening
        if let Some(handle) = self.live.take() {
            tracing::info!(channel = %handle.channel_id(), "closing listener for shutdown");
            handle.join().await;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Restart { reply } => {
                let result = self.on_restart();
                let _ = reply.send(result.map(|_| self.status()));
            }
            Command::Start { channel_id, reply } => {
                self.start(channel_id);
                let _ = reply.send(Ok(self.status()));
            }
            Command::Stop { reply } => {
                self.stop();
                let _ = reply.send(Ok(self.status()));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Shutdown => {}
        }
    }
}

type Reply = oneshot::Sender<Result<SupervisorStatus, SessionError>>;

enum Command {
    Restart { reply: Reply },
    Start { channel_id: ChannelId, reply: Reply },
    Stop { reply: Reply },
    Status { reply: Reply },
    Shutdown,
}

/// Cloneable control surface for a spawned [`Supervisor`]
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    bus: LifecycleBus,
}

impl SupervisorHandle {
    pub async fn on_restart(&self) -> Result<SupervisorStatus, SessionError> {
        self.request(|reply| Command::Restart { reply }).await
    }

    pub async fn start(&self, channel_id: ChannelId) -> Result<SupervisorStatus, SessionError> {
        self.request(|reply| Command::Start { channel_id, reply })
            .await
    }

    pub async fn stop(&self) -> Result<SupervisorStatus, SessionError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    pub async fn status(&self) -> Result<SupervisorStatus, SessionError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub fn subscribe(&self) -> LifecycleSubscription {
        self.bus.subscribe()
    }

    /// Ask the supervisor task to exit. The live socket is closed, the durable
    /// pair is left as is.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request(
        &self,
        build: impl FnOnce(Reply) -> Command,
    ) -> Result<SupervisorStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::SupervisorUnavailable)?;
        rx.await.map_err(|_| SessionError::SupervisorUnavailable)?
    }
}
