//! The authoritative session loop.
//!
//! One `Session` owns the canonical state, the client registry and the tick
//! clock. It runs as a single task driving a `tokio::select!` over the inbound
//! message queue and the tick timer, so every inbound message and every tick
//! is one atomic step with respect to canonical state: there are never two
//! interleaved mutations. Application hooks receive `&mut State` inside those
//! steps; that is the scoped-update discipline.
//!
//! Mutations made outside a tick (a join or command handler) are not sent
//! synchronously; the next tick's diff flushes them together with the
//! simulation results.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

use shared::channel::MessageChannel;
use shared::message::{ServerMessage, CONTROL_SIMULATE};
use shared::{DEFAULT_ACK_TIMEOUT_MS, DEFAULT_MAX_NAME_LENGTH};

use crate::connection::ClientConnection;
use crate::projection::ProjectionTable;
use crate::state_manager::{SyncOutput, UnreliableClientStateManager};

/// How the simulation tick is driven.
pub enum TickDriver {
    /// A fixed-interval timer owned by the session loop.
    Fixed(Duration),
    /// Ticks arrive as explicit handle messages, for externally driven
    /// servers and deterministic tests.
    Manual,
}

pub struct SessionConfig {
    pub tick_driver: TickDriver,
    pub ack_timeout: Duration,
    pub max_name_length: usize,
}

impl SessionConfig {
    pub fn fixed(tick_interval: Duration) -> Self {
        Self {
            tick_driver: TickDriver::Fixed(tick_interval),
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
        }
    }

    pub fn manual() -> Self {
        Self {
            tick_driver: TickDriver::Manual,
            ack_timeout: Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS),
            max_name_length: DEFAULT_MAX_NAME_LENGTH,
        }
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_max_name_length(mut self, max_name_length: usize) -> Self {
        self.max_name_length = max_name_length;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Starting,
    Running,
    Paused,
    Stopped,
}

/// Identity of a connected client as application hooks see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    /// Transport-assigned identifier, unique among connected clients.
    pub id: String,
    /// Validated display name, also unique among connected clients.
    pub name: String,
}

enum EventScope {
    Broadcast,
    Client(String),
}

/// Events queued by application hooks; delivered as `c` messages on the
/// reliable channel after the hook returns.
pub struct Events<E> {
    queued: Vec<(EventScope, E)>,
}

impl<E> Events<E> {
    fn new() -> Self {
        Self { queued: Vec::new() }
    }

    pub fn broadcast(&mut self, event: E) {
        self.queued.push((EventScope::Broadcast, event));
    }

    pub fn send_to(&mut self, client_id: impl Into<String>, event: E) {
        self.queued.push((EventScope::Client(client_id.into()), event));
    }
}

/// The application seam: simulation rules, command handling and per-client
/// visibility, plugged into the session loop.
pub trait Application: Send + 'static {
    type State: Serialize + Send;
    type Command: DeserializeOwned + Send;
    type Event: Serialize + Send;

    /// Declared once when the client is attached; a client cannot expand its
    /// own visibility afterwards.
    fn projection_for(&self, _client: &ClientInfo) -> ProjectionTable {
        ProjectionTable::include_all()
    }

    /// Advances the simulation by `elapsed`. May mutate canonical state.
    fn simulate(
        &mut self,
        state: &mut Self::State,
        events: &mut Events<Self::Event>,
        elapsed: Duration,
    );

    fn client_joined(
        &mut self,
        _state: &mut Self::State,
        _events: &mut Events<Self::Event>,
        _client: &ClientInfo,
    ) {
    }

    fn client_quit(
        &mut self,
        _state: &mut Self::State,
        _events: &mut Events<Self::Event>,
        _client: &ClientInfo,
    ) {
    }

    fn command(
        &mut self,
        _state: &mut Self::State,
        _events: &mut Events<Self::Event>,
        _client: &ClientInfo,
        _command: Self::Command,
    ) {
    }
}

/// Control and transport traffic into the session loop.
pub enum SessionMessage {
    Join {
        client_id: String,
        name: String,
        connection: ClientConnection,
    },
    Quit {
        client_id: String,
    },
    Command {
        client_id: String,
        payload: Value,
    },
    Acknowledge {
        client_id: String,
        tick: u64,
    },
    AttachUnreliable {
        client_id: String,
        channel: Box<dyn MessageChannel>,
    },
    Pause,
    Resume,
    Tick,
    Stop,
}

/// Cloneable handle posting messages into a running session. All operations
/// are fire-and-forget; anything posted after the session stops is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMessage>,
}

impl SessionHandle {
    pub fn join(&self, client_id: impl Into<String>, name: impl Into<String>, connection: ClientConnection) {
        self.post(SessionMessage::Join {
            client_id: client_id.into(),
            name: name.into(),
            connection,
        });
    }

    pub fn quit(&self, client_id: impl Into<String>) {
        self.post(SessionMessage::Quit {
            client_id: client_id.into(),
        });
    }

    pub fn command(&self, client_id: impl Into<String>, payload: Value) {
        self.post(SessionMessage::Command {
            client_id: client_id.into(),
            payload,
        });
    }

    pub fn acknowledge(&self, client_id: impl Into<String>, tick: u64) {
        self.post(SessionMessage::Acknowledge {
            client_id: client_id.into(),
            tick,
        });
    }

    pub fn attach_unreliable(&self, client_id: impl Into<String>, channel: Box<dyn MessageChannel>) {
        self.post(SessionMessage::AttachUnreliable {
            client_id: client_id.into(),
            channel,
        });
    }

    pub fn pause(&self) {
        self.post(SessionMessage::Pause);
    }

    pub fn resume(&self) {
        self.post(SessionMessage::Resume);
    }

    /// Drives one tick when the session uses `TickDriver::Manual`.
    pub fn tick(&self) {
        self.post(SessionMessage::Tick);
    }

    pub fn stop(&self) {
        self.post(SessionMessage::Stop);
    }

    fn post(&self, message: SessionMessage) {
        let _ = self.tx.send(message);
    }
}

struct ClientRecord {
    info: ClientInfo,
    joined_at: u64,
    manager: UnreliableClientStateManager,
    connection: ClientConnection,
}

pub struct Session<A: Application> {
    app: A,
    state: A::State,
    status: SessionStatus,
    config: SessionConfig,
    clients: HashMap<String, ClientRecord>,
    inbox: mpsc::UnboundedReceiver<SessionMessage>,
    started_at: Instant,
    last_tick: Instant,
    last_tick_time: u64,
    tick_count: u64,
}

impl<A: Application> Session<A> {
    pub fn new(app: A, initial_state: A::State, config: SessionConfig) -> (Self, SessionHandle) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let now = Instant::now();
        let session = Self {
            app,
            state: initial_state,
            status: SessionStatus::Starting,
            config,
            clients: HashMap::new(),
            inbox,
            started_at: now,
            last_tick: now,
            last_tick_time: 0,
            tick_count: 0,
        };
        (session, SessionHandle { tx })
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    /// Runs the session to completion (explicit stop, or every handle
    /// dropped).
    pub async fn run(mut self) {
        self.status = SessionStatus::Running;
        self.started_at = Instant::now();
        self.last_tick = self.started_at;
        info!("session running");

        let period = match self.config.tick_driver {
            TickDriver::Fixed(period) => Some(period),
            TickDriver::Manual => None,
        };
        match period {
            Some(period) => self.run_fixed(period).await,
            None => self.run_manual().await,
        }

        info!("session stopped");
    }

    async fn run_fixed(&mut self, period: Duration) {
        let mut timer = interval(period);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it.
        timer.tick().await;

        loop {
            tokio::select! {
                message = self.inbox.recv() => {
                    match message {
                        Some(message) => {
                            if self.handle_message(message) {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = timer.tick() => {
                    if self.status == SessionStatus::Running {
                        self.tick(Instant::now());
                    } else {
                        // Paused: keep the elapsed-time base fresh so resuming
                        // does not replay the pause as one giant timestep.
                        self.last_tick = Instant::now();
                    }
                }
            }
        }
    }

    async fn run_manual(&mut self) {
        while let Some(message) = self.inbox.recv().await {
            if self.handle_message(message) {
                break;
            }
        }
    }

    /// Returns true when the session must stop.
    fn handle_message(&mut self, message: SessionMessage) -> bool {
        match message {
            SessionMessage::Join {
                client_id,
                name,
                connection,
            } => self.handle_join(client_id, name, connection),
            SessionMessage::Quit { client_id } => self.handle_quit(&client_id),
            SessionMessage::Command { client_id, payload } => {
                self.handle_command(&client_id, payload)
            }
            SessionMessage::Acknowledge { client_id, tick } => {
                match self.clients.get_mut(&client_id) {
                    Some(record) => record.manager.acknowledge(tick),
                    None => debug!("acknowledgment from unknown client {client_id} dropped"),
                }
            }
            SessionMessage::AttachUnreliable { client_id, channel } => {
                if let Some(record) = self.clients.get_mut(&client_id) {
                    record.connection.attach_unreliable(channel);
                    info!("client {} switched to streaming updates", record.info.name);
                }
            }
            SessionMessage::Pause => {
                if self.status == SessionStatus::Running {
                    self.status = SessionStatus::Paused;
                    info!("session paused");
                }
            }
            SessionMessage::Resume => {
                if self.status == SessionStatus::Paused {
                    self.status = SessionStatus::Running;
                    self.last_tick = Instant::now();
                    info!("session resumed");
                }
            }
            SessionMessage::Tick => {
                if self.status == SessionStatus::Running {
                    self.tick(Instant::now());
                }
            }
            SessionMessage::Stop => {
                self.handle_stop();
                return true;
            }
        }
        false
    }

    fn handle_join(&mut self, client_id: String, name: String, connection: ClientConnection) {
        if self.clients.contains_key(&client_id) {
            warn!("rejecting join: client id {client_id} already connected");
            connection.send(&ServerMessage::Disconnect {
                reason: "Already connected".to_string(),
            });
            return;
        }

        if let Some(reason) = self.join_error(&name) {
            info!("rejecting join from {client_id}: {reason}");
            connection.send(&ServerMessage::Disconnect { reason });
            return;
        }

        info!("client {client_id} joined as {name}");

        // Instruct the client to establish its unreliable channel for
        // streaming state updates.
        connection.send(&ServerMessage::Control {
            operation: CONTROL_SIMULATE.to_string(),
        });

        let client = ClientInfo {
            id: client_id.clone(),
            name,
        };
        let joined_at = self.now_ms();
        let mut manager = UnreliableClientStateManager::new(
            self.app.projection_for(&client),
            self.config.ack_timeout.as_millis() as u64,
        );
        let snapshot = self.snapshot().unwrap_or(Value::Null);
        manager.attach(&snapshot, joined_at);

        self.clients.insert(
            client_id,
            ClientRecord {
                info: client.clone(),
                joined_at,
                manager,
                connection,
            },
        );

        let mut events = Events::new();
        self.app.client_joined(&mut self.state, &mut events, &client);
        self.flush_events(events);
        // State changes from the join hook reach every client on the next
        // tick, together with the new client's initial full state.
    }

    fn join_error(&self, name: &str) -> Option<String> {
        if name.is_empty() {
            return Some("A name is required".to_string());
        }
        if name.chars().count() > self.config.max_name_length {
            return Some("Your name is too long".to_string());
        }
        if self.clients.values().any(|record| record.info.name == name) {
            return Some("Your name is already in use".to_string());
        }
        None
    }

    fn handle_quit(&mut self, client_id: &str) {
        // Quit for an unknown client is an already-processed duplicate.
        let Some(record) = self.clients.remove(client_id) else {
            return;
        };

        info!(
            "client {} quit after {}ms",
            record.info.name,
            self.now_ms().saturating_sub(record.joined_at)
        );

        let mut events = Events::new();
        self.app
            .client_quit(&mut self.state, &mut events, &record.info);
        self.flush_events(events);
    }

    fn handle_command(&mut self, client_id: &str, payload: Value) {
        let Some(record) = self.clients.get(client_id) else {
            warn!("command from unrecognized client {client_id} dropped");
            return;
        };
        let client = record.info.clone();

        let command: A::Command = match serde_json::from_value(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("malformed command from {}: {e}", client.name);
                return;
            }
        };

        let mut events = Events::new();
        self.app
            .command(&mut self.state, &mut events, &client, command);
        self.flush_events(events);
    }

    fn handle_stop(&mut self) {
        info!("session stopping, disconnecting {} clients", self.clients.len());
        let stop = ServerMessage::Disconnect {
            reason: "This server has stopped".to_string(),
        };
        for record in self.clients.values() {
            record.connection.send(&stop);
        }
        self.clients.clear();
        self.status = SessionStatus::Stopped;
    }

    fn tick(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_tick);
        self.last_tick = now;
        // Tick times are strictly monotonic: patch ordering and the client's
        // staleness check both rely on no two ticks sharing a timestamp.
        let tick_time = self.now_ms().max(self.last_tick_time.saturating_add(1));
        self.last_tick_time = tick_time;
        self.tick_count += 1;

        let mut events = Events::new();
        self.app.simulate(&mut self.state, &mut events, elapsed);
        self.flush_events(events);

        let Some(snapshot) = self.snapshot() else {
            return;
        };

        for record in self.clients.values_mut() {
            let message = match record.manager.sync(tick_time, &snapshot) {
                SyncOutput::FullState(state) => ServerMessage::FullState {
                    state,
                    tick: tick_time,
                },
                SyncOutput::Delta(patches) => ServerMessage::DeltaState {
                    patches,
                    tick: tick_time,
                },
            };
            record.connection.send(&message);
        }

        if self.tick_count % 60 == 0 {
            debug!(
                "tick {} at {tick_time}ms: {} clients connected",
                self.tick_count,
                self.clients.len()
            );
        }
    }

    fn flush_events(&mut self, events: Events<A::Event>) {
        for (scope, event) in events.queued {
            let payload = match serde_json::to_value(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    error!("event failed to serialize: {e}");
                    continue;
                }
            };
            let message = ServerMessage::Event { payload };
            match scope {
                EventScope::Broadcast => {
                    for record in self.clients.values() {
                        record.connection.send(&message);
                    }
                }
                EventScope::Client(client_id) => {
                    if let Some(record) = self.clients.get(&client_id) {
                        record.connection.send(&message);
                    }
                }
            }
        }
    }

    fn snapshot(&self) -> Option<Value> {
        match serde_json::to_value(&self.state) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                error!("canonical state failed to serialize, skipping sync: {e}");
                None
            }
        }
    }

    fn now_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}
