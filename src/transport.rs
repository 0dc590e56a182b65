//! Transport abstraction.
//!
//! The core never touches sockets. It talks to a [`Transport`] that
//! delivers whole messages (datagram boundaries preserved), never blocks,
//! and identifies peers by stable [`ConnectionId`]s. Within one connection
//! the transport delivers messages in send order; between connections
//! there is no ordering.
//!
//! [`MemoryTransport`] is the in-process implementation used by tests and
//! by local server-plus-client setups: a server endpoint and any number of
//! client endpoints share synchronized queues.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::network::messages::Message;
use crate::ConnectionId;

/// A reliable, message-boundary-preserving, non-blocking datagram
/// transport.
pub trait Transport {
    /// Returns every message received since the last poll, tagged with the
    /// sending connection. Never blocks.
    fn poll(&mut self) -> Vec<(ConnectionId, Message)>;

    /// Queues a message to a connection. Messages to closed connections
    /// are dropped.
    fn send(&mut self, connection: ConnectionId, message: Message);

    /// Closes a connection. Messages already handed to the transport may
    /// still be delivered (a disconnect notice travels behind them);
    /// everything after the close is dropped.
    fn disconnect(&mut self, connection: ConnectionId);

    /// Whether the connection is still open.
    fn is_connected(&self, connection: ConnectionId) -> bool;
}

#[derive(Debug, Default)]
struct Shared {
    to_server: VecDeque<(ConnectionId, Message)>,
    to_clients: BTreeMap<ConnectionId, VecDeque<Message>>,
    closed: BTreeSet<ConnectionId>,
    next_connection: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Side {
    Server,
    Client(ConnectionId),
}

/// In-process transport endpoint. Create the server end with
/// [`MemoryTransport::new_server`], then client ends with
/// [`MemoryTransport::connect_client`]; all endpoints share the same
/// queues.
///
/// On a client endpoint, polled messages are tagged with the client's own
/// connection id (its only peer is the server), and `send` ignores the
/// connection argument.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
    side: Side,
}

impl MemoryTransport {
    /// Creates the server endpoint of a fresh in-process network.
    #[must_use]
    pub fn new_server() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            side: Side::Server,
        }
    }

    /// Creates a client endpoint connected to this server endpoint.
    /// Callable on the server end only.
    #[must_use]
    pub fn connect_client(&self) -> Self {
        let mut shared = self.shared.lock();
        let connection = ConnectionId::new(shared.next_connection);
        shared.next_connection += 1;
        shared.to_clients.insert(connection, VecDeque::new());
        Self {
            shared: Arc::clone(&self.shared),
            side: Side::Client(connection),
        }
    }

    /// The connection id a client endpoint appears as to the server.
    /// Returns [`ConnectionId::INVALID`] for the server endpoint.
    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        match self.side {
            Side::Server => ConnectionId::INVALID,
            Side::Client(connection) => connection,
        }
    }
}

impl Transport for MemoryTransport {
    fn poll(&mut self) -> Vec<(ConnectionId, Message)> {
        let mut shared = self.shared.lock();
        match self.side {
            Side::Server => shared.to_server.drain(..).collect(),
            Side::Client(connection) => shared
                .to_clients
                .get_mut(&connection)
                .map(|queue| queue.drain(..).map(|message| (connection, message)).collect())
                .unwrap_or_default(),
        }
    }

    fn send(&mut self, connection: ConnectionId, message: Message) {
        let mut shared = self.shared.lock();
        match self.side {
            Side::Server => {
                if shared.closed.contains(&connection) {
                    return;
                }
                if let Some(queue) = shared.to_clients.get_mut(&connection) {
                    queue.push_back(message);
                }
            },
            Side::Client(own) => {
                if shared.closed.contains(&own) {
                    return;
                }
                shared.to_server.push_back((own, message));
            },
        }
    }

    fn disconnect(&mut self, connection: ConnectionId) {
        let mut shared = self.shared.lock();
        let target = match self.side {
            Side::Server => connection,
            Side::Client(own) => own,
        };
        shared.closed.insert(target);
        // Anything queued toward the closed peer before the close still
        // arrives (the close travels behind it); inbound from the peer is
        // dropped, and all future traffic is refused.
        shared.to_server.retain(|(from, _)| *from != target);
    }

    fn is_connected(&self, connection: ConnectionId) -> bool {
        let shared = self.shared.lock();
        let target = match self.side {
            Side::Server => connection,
            Side::Client(own) => own,
        };
        !shared.closed.contains(&target) && shared.to_clients.contains_key(&target)
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::MessageId;

    fn message(id: MessageId) -> Message {
        Message::new(id)
    }

    #[test]
    fn client_to_server_delivery_preserves_order() {
        let server = MemoryTransport::new_server();
        let mut client = server.connect_client();
        let mut server = server;

        client.send(ConnectionId::INVALID, message(MessageId::Connect));
        client.send(ConnectionId::INVALID, message(MessageId::PlayerInput));

        let received = server.poll();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, client.connection_id());
        assert_eq!(received[0].1.message_id(), Ok(MessageId::Connect));
        assert_eq!(received[1].1.message_id(), Ok(MessageId::PlayerInput));
        // Queue is drained.
        assert!(server.poll().is_empty());
    }

    #[test]
    fn server_to_client_delivery_is_per_connection() {
        let server = MemoryTransport::new_server();
        let mut first = server.connect_client();
        let mut second = server.connect_client();
        let mut server = server;

        server.send(first.connection_id(), message(MessageId::EntityMove));
        assert_eq!(first.poll().len(), 1);
        assert!(second.poll().is_empty());
    }

    #[test]
    fn connection_ids_are_distinct() {
        let server = MemoryTransport::new_server();
        let first = server.connect_client();
        let second = server.connect_client();
        assert_ne!(first.connection_id(), second.connection_id());
        assert!(first.connection_id().is_valid());
    }

    #[test]
    fn disconnect_delivers_queued_then_blocks_traffic() {
        let server = MemoryTransport::new_server();
        let mut client = server.connect_client();
        let mut server = server;
        let connection = client.connection_id();

        server.send(connection, message(MessageId::Disconnect));
        server.disconnect(connection);
        // The close travels behind messages already queued: the peer still
        // learns why it was dropped.
        assert_eq!(client.poll().len(), 1);

        client.send(ConnectionId::INVALID, message(MessageId::PlayerInput));
        assert!(server.poll().is_empty(), "sends after close are dropped");
        server.send(connection, message(MessageId::EntityMove));
        assert!(client.poll().is_empty(), "sends to a closed peer are dropped");
        assert!(!server.is_connected(connection));
    }
}
