//! Embedded transport: an in-process client connected over queue channels.
//!
//! This is the offline/local flavor of the transport seam: same message
//! flow as a remote peer (join, `simulate` control, unreliable-leg attach,
//! acknowledgments), minus the sockets. Used by tests, bots and
//! single-process deployments.

use log::warn;
use serde_json::Value;
use tokio::sync::mpsc;

use shared::channel::QueueChannel;
use shared::message::{ServerMessage, CONTROL_SIMULATE};
use shared::mirror::{MirrorOutcome, StateMirror};

use crate::connection::ClientConnection;
use crate::session::SessionHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum LocalEvent {
    /// The mirror advanced to this tick.
    StateChanged { tick: u64 },
    /// Application event from the server.
    Event(Value),
    /// The server terminated this client (admission rejection or stop).
    Disconnected(String),
}

/// In-process client: joins the session over queue channels, mirrors its
/// projected state and acknowledges every applied update.
pub struct LocalClient {
    client_id: String,
    session: SessionHandle,
    mirror: StateMirror,
    inbox: mpsc::UnboundedReceiver<Vec<u8>>,
    leg_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl LocalClient {
    /// Requests admission. The verdict arrives on the message stream: an
    /// accepted client starts receiving state, a rejected one gets
    /// `Disconnected` and nothing else.
    pub fn connect(
        session: &SessionHandle,
        client_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        let client_id = client_id.into();
        let (leg_tx, inbox) = mpsc::unbounded_channel();
        let connection = ClientConnection::new(Box::new(QueueChannel(leg_tx.clone())));
        session.join(client_id.clone(), name, connection);

        Self {
            client_id,
            session: session.clone(),
            mirror: StateMirror::new(),
            inbox,
            leg_tx,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The locally mirrored projection.
    pub fn state(&self) -> &Value {
        self.mirror.state()
    }

    pub fn send_command(&self, payload: Value) {
        self.session.command(self.client_id.clone(), payload);
    }

    pub fn quit(&self) {
        self.session.quit(self.client_id.clone());
    }

    /// Receives and applies the next update. Returns `None` once the server
    /// side has dropped the connection and the queue is drained.
    pub async fn recv(&mut self) -> Option<LocalEvent> {
        loop {
            let bytes = self.inbox.recv().await?;
            let message = match ServerMessage::decode(&bytes) {
                Ok(message) => message,
                Err(e) => {
                    warn!("embedded client received a malformed message: {e}");
                    continue;
                }
            };

            match message {
                ServerMessage::FullState { state, tick } => {
                    if let MirrorOutcome::Applied { tick } = self.mirror.apply_full(state, tick) {
                        self.session.acknowledge(self.client_id.clone(), tick);
                        return Some(LocalEvent::StateChanged { tick });
                    }
                }
                ServerMessage::DeltaState { patches, tick } => {
                    if let MirrorOutcome::Applied { tick } =
                        self.mirror.apply_delta(&patches, tick)
                    {
                        self.session.acknowledge(self.client_id.clone(), tick);
                        return Some(LocalEvent::StateChanged { tick });
                    }
                }
                ServerMessage::Event { payload } => return Some(LocalEvent::Event(payload)),
                ServerMessage::Disconnect { reason } => {
                    return Some(LocalEvent::Disconnected(reason))
                }
                ServerMessage::Control { operation } => {
                    if operation == CONTROL_SIMULATE {
                        // The embedded "unreliable" leg is simply another
                        // queue into the same inbox.
                        self.session.attach_unreliable(
                            self.client_id.clone(),
                            Box::new(QueueChannel(self.leg_tx.clone())),
                        );
                    }
                }
            }
        }
    }
}
