//! Per-client transport binding.
//!
//! Binds a logical client to one reliable channel and, once the client has
//! switched to streaming, one unreliable channel. Routing rule: a message
//! goes out on the unreliable channel only if that channel exists and the
//! message is full or delta state; everything else, and all traffic before
//! the unreliable channel exists, uses the reliable channel.

use log::debug;
use shared::channel::{ChannelError, MessageChannel};
use shared::message::ServerMessage;

pub struct ClientConnection {
    reliable: Box<dyn MessageChannel>,
    unreliable: Option<Box<dyn MessageChannel>>,
}

impl ClientConnection {
    pub fn new(reliable: Box<dyn MessageChannel>) -> Self {
        Self {
            reliable,
            unreliable: None,
        }
    }

    /// Attaches the lazily established unreliable leg. The first attach wins;
    /// a duplicate register from the transport is ignored.
    pub fn attach_unreliable(&mut self, channel: Box<dyn MessageChannel>) {
        if self.unreliable.is_none() {
            self.unreliable = Some(channel);
        }
    }

    pub fn has_unreliable(&self) -> bool {
        self.unreliable.is_some()
    }

    /// Fire-and-forget send; a closed channel drops the message (state
    /// traffic is superseded next tick, and the transport surfaces the
    /// disconnect separately).
    pub fn send(&self, message: &ServerMessage) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("failed to encode outbound message: {e}");
                return;
            }
        };

        let channel: &dyn MessageChannel = match (&self.unreliable, message) {
            (
                Some(unreliable),
                ServerMessage::FullState { .. } | ServerMessage::DeltaState { .. },
            ) => unreliable.as_ref(),
            _ => self.reliable.as_ref(),
        };

        if let Err(ChannelError::Closed) = channel.send(bytes) {
            debug!("dropped message to a closed channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared::channel::QueueChannel;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    fn connection_with_reliable() -> (ClientConnection, UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientConnection::new(Box::new(QueueChannel(tx))), rx)
    }

    fn full_state() -> ServerMessage {
        ServerMessage::FullState {
            state: json!({"x": 0}),
            tick: 0,
        }
    }

    #[test]
    fn test_state_uses_reliable_before_unreliable_exists() {
        let (connection, mut reliable_rx) = connection_with_reliable();

        connection.send(&full_state());

        let bytes = reliable_rx.try_recv().unwrap();
        assert_eq!(ServerMessage::decode(&bytes).unwrap(), full_state());
    }

    #[test]
    fn test_state_switches_to_unreliable_once_attached() {
        let (mut connection, mut reliable_rx) = connection_with_reliable();
        let (unreliable_tx, mut unreliable_rx) = mpsc::unbounded_channel();
        connection.attach_unreliable(Box::new(QueueChannel(unreliable_tx)));

        connection.send(&full_state());
        connection.send(&ServerMessage::DeltaState {
            patches: Vec::new(),
            tick: 500,
        });

        assert!(reliable_rx.try_recv().is_err());
        assert!(unreliable_rx.try_recv().is_ok());
        assert!(unreliable_rx.try_recv().is_ok());
    }

    #[test]
    fn test_events_and_errors_stay_reliable() {
        let (mut connection, mut reliable_rx) = connection_with_reliable();
        let (unreliable_tx, mut unreliable_rx) = mpsc::unbounded_channel();
        connection.attach_unreliable(Box::new(QueueChannel(unreliable_tx)));

        connection.send(&ServerMessage::Event {
            payload: json!({"boom": true}),
        });
        connection.send(&ServerMessage::Disconnect {
            reason: "bye".to_string(),
        });
        connection.send(&ServerMessage::Control {
            operation: "simulate".to_string(),
        });

        assert!(unreliable_rx.try_recv().is_err());
        assert!(reliable_rx.try_recv().is_ok());
        assert!(reliable_rx.try_recv().is_ok());
        assert!(reliable_rx.try_recv().is_ok());
    }

    #[test]
    fn test_first_unreliable_attach_wins() {
        let (mut connection, _reliable_rx) = connection_with_reliable();
        let (first_tx, mut first_rx) = mpsc::unbounded_channel();
        let (second_tx, mut second_rx) = mpsc::unbounded_channel();

        connection.attach_unreliable(Box::new(QueueChannel(first_tx)));
        connection.attach_unreliable(Box::new(QueueChannel(second_tx)));

        connection.send(&full_state());
        assert!(first_rx.try_recv().is_ok());
        assert!(second_rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel_drops_silently() {
        let (connection, reliable_rx) = connection_with_reliable();
        drop(reliable_rx);

        // Must not panic or block.
        connection.send(&full_state());
    }
}
