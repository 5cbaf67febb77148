//! Remote transport gateway.
//!
//! Binds remote peers to the session. TCP carries the reliable leg as
//! length-prefixed frames; the first frame must be the `j` join handshake
//! with the peer's display name. UDP on the same port carries the unreliable
//! leg: after the server's `simulate` control, the client registers its
//! endpoint with a `j` datagram and state/acknowledgment traffic moves over
//! datagrams. Socket pumping happens in dedicated tasks; the session loop
//! only ever sees `SessionMessage`s.
//!
//! The connection-establishment handshake beyond this (rendezvous, NAT
//! traversal) is an external concern; the gateway assumes peers can reach the
//! bound address directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, RwLock};

use shared::channel::{read_frame, write_frame, ChannelError, MessageChannel, QueueChannel};
use shared::message::ClientMessage;

use crate::connection::ClientConnection;
use crate::session::SessionHandle;

/// Unreliable leg: datagrams funneled through the shared socket's send pump.
struct DatagramChannel {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    addr: SocketAddr,
}

impl MessageChannel for DatagramChannel {
    fn send(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.tx
            .send((self.addr, payload))
            .map_err(|_| ChannelError::Closed)
    }
}

#[derive(Default)]
struct Registry {
    /// Display name -> client id, consulted by UDP register datagrams.
    names: HashMap<String, String>,
    /// Registered UDP endpoint -> client id, for acknowledgment routing.
    addrs: HashMap<SocketAddr, String>,
}

pub struct Gateway {
    listener: TcpListener,
    udp: Arc<UdpSocket>,
    session: SessionHandle,
    registry: Arc<RwLock<Registry>>,
}

impl Gateway {
    /// Binds both transport legs on `addr` (same port, both protocols).
    pub async fn bind(addr: &str, session: SessionHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let udp = Arc::new(UdpSocket::bind(local_addr).await?);
        info!("gateway listening on {local_addr}");

        Ok(Self {
            listener,
            udp,
            session,
            registry: Arc::new(RwLock::new(Registry::default())),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts peers until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        let (udp_tx, udp_rx) = mpsc::unbounded_channel();
        spawn_udp_sender(Arc::clone(&self.udp), udp_rx);
        spawn_udp_receiver(
            Arc::clone(&self.udp),
            Arc::clone(&self.registry),
            self.session.clone(),
            udp_tx,
        );

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("peer connected from {peer_addr}");
            let session = self.session.clone();
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move {
                handle_peer(stream, peer_addr, session, registry).await;
            });
        }
    }
}

/// Processes the outgoing datagram queue.
fn spawn_udp_sender(
    socket: Arc<UdpSocket>,
    mut outbound: mpsc::UnboundedReceiver<(SocketAddr, Vec<u8>)>,
) {
    tokio::spawn(async move {
        while let Some((addr, payload)) = outbound.recv().await {
            if let Err(e) = socket.send_to(&payload, addr).await {
                debug!("udp send to {addr} failed: {e}");
            }
        }
    });
}

/// Listens for register datagrams and acknowledgments.
fn spawn_udp_receiver(
    socket: Arc<UdpSocket>,
    registry: Arc<RwLock<Registry>>,
    session: SessionHandle,
    udp_tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
) {
    tokio::spawn(async move {
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let (len, addr) = match socket.recv_from(&mut buffer).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("udp receive error: {e}");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
            };

            let message = match ClientMessage::decode(&buffer[..len]) {
                Ok(message) => message,
                Err(e) => {
                    warn!("malformed datagram from {addr}: {e}");
                    continue;
                }
            };

            match message {
                ClientMessage::Join { name } => {
                    let client_id = registry.read().await.names.get(&name).cloned();
                    match client_id {
                        Some(client_id) => {
                            registry.write().await.addrs.insert(addr, client_id.clone());
                            session.attach_unreliable(
                                client_id,
                                Box::new(DatagramChannel {
                                    tx: udp_tx.clone(),
                                    addr,
                                }),
                            );
                        }
                        None => warn!("udp register for unknown client name dropped"),
                    }
                }
                ClientMessage::Acknowledge { tick } => {
                    let client_id = registry.read().await.addrs.get(&addr).cloned();
                    match client_id {
                        Some(client_id) => session.acknowledge(client_id, tick),
                        None => debug!("acknowledgment from unregistered endpoint {addr} dropped"),
                    }
                }
                ClientMessage::Command { .. } => {
                    // Commands belong on the reliable channel.
                    warn!("dropping command received on the unreliable channel from {addr}");
                }
            }
        }
    });
}

async fn handle_peer(
    stream: TcpStream,
    peer_addr: SocketAddr,
    session: SessionHandle,
    registry: Arc<RwLock<Registry>>,
) {
    let (mut reader, writer) = stream.into_split();

    // The handshake frame carries the display name out-of-band from the
    // session's point of view.
    let name = match read_frame(&mut reader).await {
        Ok(Some(bytes)) => match ClientMessage::decode(&bytes) {
            Ok(ClientMessage::Join { name }) => name,
            Ok(_) | Err(_) => {
                warn!("peer {peer_addr} did not open with a join handshake");
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            debug!("handshake read from {peer_addr} failed: {e}");
            return;
        }
    };

    let client_id = peer_addr.to_string();
    {
        // Leave an existing holder of the name alone: the session is about to
        // reject this join anyway.
        let mut registry = registry.write().await;
        registry
            .names
            .entry(name.clone())
            .or_insert_with(|| client_id.clone());
    }

    let (reliable_tx, reliable_rx) = mpsc::unbounded_channel();
    spawn_frame_writer(writer, reliable_rx);

    session.join(
        client_id.clone(),
        name.clone(),
        ClientConnection::new(Box::new(QueueChannel(reliable_tx))),
    );

    loop {
        match read_frame(&mut reader).await {
            Ok(Some(bytes)) => match ClientMessage::decode(&bytes) {
                Ok(ClientMessage::Command { payload }) => {
                    session.command(client_id.clone(), payload)
                }
                Ok(ClientMessage::Acknowledge { tick }) => {
                    session.acknowledge(client_id.clone(), tick)
                }
                Ok(ClientMessage::Join { .. }) => {
                    warn!("duplicate join from {client_id} ignored")
                }
                Err(e) => warn!("malformed frame from {client_id}: {e}"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!("connection to {client_id} failed: {e}");
                break;
            }
        }
    }

    // Close and error funnel into this one notification; the session treats
    // a duplicate quit as a no-op.
    session.quit(client_id.clone());

    let mut registry = registry.write().await;
    if registry.names.get(&name) == Some(&client_id) {
        registry.names.remove(&name);
    }
    registry.addrs.retain(|_, id| *id != client_id);
}

fn spawn_frame_writer(mut writer: OwnedWriteHalf, mut outbound: mpsc::UnboundedReceiver<Vec<u8>>) {
    tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if let Err(e) = write_frame(&mut writer, &payload).await {
                debug!("frame write failed: {e}");
                break;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Application, Events, Session, SessionConfig};
    use serde_json::{json, Value};
    use shared::message::ServerMessage;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    struct NullApp;

    impl Application for NullApp {
        type State = Value;
        type Command = Value;
        type Event = Value;

        fn simulate(&mut self, _state: &mut Value, _events: &mut Events<Value>, _elapsed: Duration) {}
    }

    async fn start_gateway() -> (SessionHandle, SocketAddr) {
        let (session, handle) = Session::new(NullApp, json!({"up": true}), SessionConfig::manual());
        tokio::spawn(session.run());

        let gateway = Gateway::bind("127.0.0.1:0", handle.clone()).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = gateway.run().await;
        });

        (handle, addr)
    }

    #[tokio::test]
    async fn test_tcp_peer_joins_and_receives_state() {
        let (handle, addr) = start_gateway().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let join = ClientMessage::Join {
            name: "alice".to_string(),
        }
        .encode()
        .unwrap();
        write_frame(&mut stream, &join).await.unwrap();

        // Admission: the switch-to-streaming control comes first.
        let bytes = timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(matches!(
            ServerMessage::decode(&bytes).unwrap(),
            ServerMessage::Control { .. }
        ));

        // Before any unreliable leg exists, state arrives on the reliable leg.
        handle.tick();
        let bytes = timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match ServerMessage::decode(&bytes).unwrap() {
            ServerMessage::FullState { state, .. } => assert_eq!(state, json!({"up": true})),
            other => panic!("expected a full state, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_peer_without_join_handshake_is_dropped() {
        let (_handle, addr) = start_gateway().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let ack = ClientMessage::Acknowledge { tick: 1 }.encode().unwrap();
        write_frame(&mut stream, &ack).await.unwrap();
        stream.flush().await.unwrap();

        // The gateway closes the connection without admitting the peer.
        let result = timeout(Duration::from_secs(2), read_frame(&mut stream))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }
}
