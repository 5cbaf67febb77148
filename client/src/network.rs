//! Remote server connection.
//!
//! TCP carries the reliable leg (join handshake, commands, events, errors and
//! any state sent before streaming begins). When the server sends the
//! `simulate` control, the client registers its UDP endpoint and state
//! updates plus acknowledgments switch to datagrams.
//!
//! If the register datagram is lost, the server never attaches the unreliable
//! leg and keeps resynchronizing over TCP: slower, but still convergent.

use log::{debug, info, warn};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use shared::channel::{read_frame, write_frame};
use shared::message::{ClientMessage, ProtocolError, ServerMessage, CONTROL_SIMULATE};
use shared::mirror::{MirrorOutcome, StateMirror};

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The mirror advanced to `tick`; `state` is the updated projection.
    StateChanged { tick: u64, state: Value },
    /// Application event from the server.
    Event(Value),
    /// The connection is gone (server disconnect, transport failure or EOF).
    Disconnected(String),
}

pub struct RemoteClient {
    events: mpsc::UnboundedReceiver<ClientEvent>,
    commands: mpsc::UnboundedSender<Value>,
}

impl RemoteClient {
    /// Connects to the server, performs the join handshake and spawns the
    /// connection driver. Admission rejection arrives as a `Disconnected`
    /// event.
    pub async fn connect(addr: &str, name: &str) -> std::io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let server_addr = stream.peer_addr()?;
        let (reader, mut writer) = stream.into_split();

        let join = encode(&ClientMessage::Join {
            name: name.to_string(),
        })?;
        write_frame(&mut writer, &join).await?;

        // Bound up front, silent until the server asks us to switch to
        // streaming.
        let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        udp.connect(server_addr).await?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (commands, command_rx) = mpsc::unbounded_channel();

        let driver = Driver {
            name: name.to_string(),
            reader,
            writer,
            udp,
            event_tx,
            command_rx,
            mirror: StateMirror::new(),
            streaming: false,
        };
        tokio::spawn(driver.run());

        info!("connected to {server_addr} as {name}");
        Ok(Self { events, commands })
    }

    /// Next connection event; `None` once the driver is gone and the queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        self.events.recv().await
    }

    /// Queues an application command for the reliable channel.
    pub fn send_command(&self, payload: Value) {
        let _ = self.commands.send(payload);
    }
}

fn encode(message: &ClientMessage) -> std::io::Result<Vec<u8>> {
    message
        .encode()
        .map_err(|e: ProtocolError| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

struct Driver {
    name: String,
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    udp: Arc<UdpSocket>,
    event_tx: mpsc::UnboundedSender<ClientEvent>,
    command_rx: mpsc::UnboundedReceiver<Value>,
    mirror: StateMirror,
    streaming: bool,
}

impl Driver {
    async fn run(mut self) {
        let mut datagram = [0u8; 64 * 1024];

        loop {
            tokio::select! {
                frame = read_frame(&mut self.reader) => {
                    match frame {
                        Ok(Some(bytes)) => {
                            if self.handle_server_message(&bytes).await {
                                break;
                            }
                        }
                        Ok(None) => {
                            self.report_disconnected("connection closed");
                            break;
                        }
                        Err(e) => {
                            self.report_disconnected(&format!("connection error: {e}"));
                            break;
                        }
                    }
                }
                received = self.udp.recv(&mut datagram) => {
                    match received {
                        Ok(len) => {
                            let bytes = datagram[..len].to_vec();
                            if self.handle_server_message(&bytes).await {
                                break;
                            }
                        }
                        Err(e) => debug!("udp receive error: {e}"),
                    }
                }
                command = self.command_rx.recv() => {
                    match command {
                        Some(payload) => {
                            if !self.send_command_frame(payload).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    }

    /// Returns true when the connection must shut down.
    async fn handle_server_message(&mut self, bytes: &[u8]) -> bool {
        let message = match ServerMessage::decode(bytes) {
            Ok(message) => message,
            Err(e) => {
                warn!("malformed message from the server: {e}");
                return false;
            }
        };

        match message {
            ServerMessage::FullState { state, tick } => {
                if let MirrorOutcome::Applied { tick } = self.mirror.apply_full(state, tick) {
                    self.acknowledge(tick).await;
                    self.surface_state(tick);
                }
                false
            }
            ServerMessage::DeltaState { patches, tick } => {
                match self.mirror.apply_delta(&patches, tick) {
                    MirrorOutcome::Applied { tick } => {
                        self.acknowledge(tick).await;
                        self.surface_state(tick);
                    }
                    // Withholding the acknowledgment is the resync request:
                    // the server's timeout brings the next full state.
                    MirrorOutcome::AwaitingResync | MirrorOutcome::Stale => {}
                }
                false
            }
            ServerMessage::Event { payload } => {
                let _ = self.event_tx.send(ClientEvent::Event(payload));
                false
            }
            ServerMessage::Disconnect { reason } => {
                self.report_disconnected(&reason);
                true
            }
            ServerMessage::Control { operation } => {
                if operation == CONTROL_SIMULATE {
                    self.switch_to_streaming().await;
                } else {
                    debug!("ignoring unknown control operation {operation}");
                }
                false
            }
        }
    }

    async fn switch_to_streaming(&mut self) {
        if self.streaming {
            return;
        }
        self.streaming = true;

        match encode(&ClientMessage::Join {
            name: self.name.clone(),
        }) {
            Ok(register) => {
                if let Err(e) = self.udp.send(&register).await {
                    warn!("failed to register the unreliable channel: {e}");
                }
            }
            Err(e) => warn!("failed to encode the register datagram: {e}"),
        }
    }

    async fn acknowledge(&mut self, tick: u64) {
        let Ok(bytes) = encode(&ClientMessage::Acknowledge { tick }) else {
            return;
        };

        if self.streaming {
            if let Err(e) = self.udp.send(&bytes).await {
                debug!("acknowledgment datagram failed: {e}");
            }
        } else if let Err(e) = write_frame(&mut self.writer, &bytes).await {
            debug!("acknowledgment frame failed: {e}");
        }
    }

    /// Returns false when the reliable leg is gone.
    async fn send_command_frame(&mut self, payload: Value) -> bool {
        match encode(&ClientMessage::Command { payload }) {
            Ok(bytes) => {
                if let Err(e) = write_frame(&mut self.writer, &bytes).await {
                    self.report_disconnected(&format!("connection error: {e}"));
                    return false;
                }
                true
            }
            Err(e) => {
                warn!("failed to encode command: {e}");
                true
            }
        }
    }

    fn surface_state(&self, tick: u64) {
        let _ = self.event_tx.send(ClientEvent::StateChanged {
            tick,
            state: self.mirror.state().clone(),
        });
    }

    fn report_disconnected(&self, reason: &str) {
        let _ = self
            .event_tx
            .send(ClientEvent::Disconnected(reason.to_string()));
    }
}
