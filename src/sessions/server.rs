//! The authoritative server driver.
//!
//! One [`ServerSession`] owns the server's rewinder, connection table,
//! simulation, and transport, and advances them together at the fixed
//! update rate. The server never waits for client input: every tick it
//! arbitrates whatever arrived, predicts the rest by repetition, and keeps
//! going - real-time beats fidelity here, the clients reconcile.
//!
//! Handler failures are local to their message: a protocol error
//! disconnects the offending connection and the tick completes for
//! everyone else.

use crate::commands::GameplayCommand;
use crate::connection::ServerConnections;
use crate::network::client_server::{
    apply_connect_message, apply_player_input_message, ConnectRequest,
};
use crate::network::messages::{DisconnectReason, Message, MessageId};
use crate::network::server_client::{
    create_connection_accepted_message, create_disconnect_message,
    create_gameplay_commands_message, create_moves_message, create_world_snapshot_message,
};
use crate::rewinder::StateRewinder;
use crate::transport::Transport;
use crate::world::{GameWorld, Simulation, StepContext};
use crate::{
    report_violation, ConnectionId, NetcodeConfig, NetcodeError, NetworkEntityIdGenerator,
    SessionRole, UpdateIdx, Vec2, NETWORK_PROTOCOL_VERSION,
};
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// Spawn position of the first player to join.
const FIRST_PLAYER_SPAWN: Vec2 = Vec2 { x: 80.0, y: 202.0 };
/// Spawn position of every later player.
const OTHER_PLAYER_SPAWN: Vec2 = Vec2 { x: 130.0, y: 202.0 };

/// The authoritative game instance.
pub struct ServerSession<W, S, T> {
    config: NetcodeConfig,
    rewinder: StateRewinder<W>,
    simulation: S,
    transport: T,
    connections: ServerConnections,
    entity_ids: NetworkEntityIdGenerator,
    idle_ticks: u32,
    should_quit: bool,
}

impl<W, S, T> ServerSession<W, S, T>
where
    W: GameWorld,
    S: Simulation<W>,
    T: Transport,
{
    /// Creates a server session over an initial world.
    ///
    /// # Errors
    /// Returns configuration validation errors.
    pub fn new(
        world: W,
        simulation: S,
        transport: T,
        config: NetcodeConfig,
    ) -> Result<Self, NetcodeError> {
        config.validate()?;
        Ok(Self {
            config,
            rewinder: StateRewinder::new(SessionRole::Server, world),
            simulation,
            transport,
            connections: ServerConnections::new(),
            entity_ids: NetworkEntityIdGenerator::new(),
            idle_ticks: 0,
            should_quit: false,
        })
    }

    /// The update the server simulation has reached.
    #[must_use]
    pub fn current_update_idx(&self) -> UpdateIdx {
        self.rewinder.current_update_idx()
    }

    /// Whether the simulation is currently paused for lack of client
    /// traffic.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.idle_ticks >= self.config.server_idle_pause_updates
    }

    /// Whether the idle-shutdown policy has fired. The host should stop
    /// ticking and drop the session.
    #[must_use]
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    /// The connection table (read-only).
    #[must_use]
    pub fn connections(&self) -> &ServerConnections {
        &self.connections
    }

    /// The rewinder (read-only; tests and inspectors).
    #[must_use]
    pub fn rewinder(&self) -> &StateRewinder<W> {
        &self.rewinder
    }

    /// One fixed tick: drain and dispatch inbound messages, evaluate the
    /// idle policy, and - unless paused - advance the simulation by one
    /// update and send each client its moves and commands.
    pub fn tick(&mut self) {
        if self.should_quit {
            return;
        }

        let had_traffic = self.handle_messages();
        if had_traffic {
            self.idle_ticks = 0;
            self.connections
                .note_interaction(self.rewinder.current_update_idx());
        } else {
            self.idle_ticks = self.idle_ticks.saturating_add(1);
        }

        if self.idle_ticks >= self.config.server_idle_quit_updates {
            tracing::info!(
                idle_ticks = self.idle_ticks,
                "no client traffic; shutting down"
            );
            self.shutdown();
            return;
        }
        if self.is_paused() {
            return;
        }

        self.step_simulation();
        self.send_update_outputs();
    }

    /// Sends every client a `ServerShutdown` disconnect and stops.
    pub fn shutdown(&mut self) {
        let peers: Vec<ConnectionId> =
            self.connections.iter().map(|(connection, _)| connection).collect();
        for connection in peers {
            self.transport.send(
                connection,
                create_disconnect_message(DisconnectReason::ServerShutdown),
            );
            self.transport.disconnect(connection);
        }
        self.should_quit = true;
    }

    /// Drains the transport and dispatches each message. Returns whether
    /// any client traffic arrived.
    fn handle_messages(&mut self) -> bool {
        let inbound = self.transport.poll();
        let had_traffic = !inbound.is_empty();
        for (connection, message) in inbound {
            if let Err(error) = self.handle_message(connection, &message) {
                match error {
                    NetcodeError::Protocol { kind } => {
                        tracing::warn!(
                            connection = connection.as_u32(),
                            %kind,
                            "protocol error; disconnecting client"
                        );
                        self.drop_client(connection, DisconnectReason::Unknown { tag: u8::MAX });
                    },
                    NetcodeError::UnknownConnection { .. } => {
                        // Can happen when messages race a disconnect;
                        // nothing to do.
                        tracing::debug!(
                            connection = connection.as_u32(),
                            "message from unknown connection ignored"
                        );
                    },
                    other => {
                        tracing::warn!(
                            connection = connection.as_u32(),
                            error = %other,
                            "failed to handle message"
                        );
                    },
                }
            }
        }
        had_traffic
    }

    fn handle_message(
        &mut self,
        connection: ConnectionId,
        message: &Message,
    ) -> Result<(), NetcodeError> {
        match message.message_id()? {
            MessageId::Connect => {
                let request = apply_connect_message(message)?;
                self.handle_connect(connection, request);
                Ok(())
            },
            MessageId::Disconnect => {
                self.remove_client(connection);
                Ok(())
            },
            MessageId::PlayerInput => apply_player_input_message(
                &mut self.rewinder,
                &mut self.connections,
                message,
                connection,
            ),
            unexpected => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "client {} sent server-to-client message {:?}",
                    connection,
                    unexpected
                );
                Err(NetcodeError::Protocol {
                    kind: crate::error::ProtocolErrorKind::UnknownMessageId {
                        id: unexpected as u32,
                    },
                })
            },
        }
    }

    fn handle_connect(&mut self, connection: ConnectionId, request: ConnectRequest) {
        if request.client_protocol_version != NETWORK_PROTOCOL_VERSION {
            tracing::info!(
                connection = connection.as_u32(),
                client_version = request.client_protocol_version,
                server_version = NETWORK_PROTOCOL_VERSION,
                "rejecting connect: protocol version mismatch"
            );
            self.transport.send(
                connection,
                create_disconnect_message(DisconnectReason::IncompatibleNetworkProtocolVersion {
                    server_version: NETWORK_PROTOCOL_VERSION,
                    client_version: request.client_protocol_version,
                }),
            );
            self.transport.disconnect(connection);
            return;
        }

        let current = self.rewinder.current_update_idx();
        self.connections.add_client(connection);
        self.rewinder.register_connection(connection);

        self.transport.send(
            connection,
            create_connection_accepted_message(current.next(), request.client_timestamp_us),
        );
        // Everything that already exists, as a full replacement...
        self.transport.send(
            connection,
            create_world_snapshot_message(
                self.rewinder.current_world(),
                &self.connections,
                current,
                connection,
            ),
        );
        // ...and the newcomer's own player entity, scheduled for the next
        // tick so every peer creates it in the same update.
        let is_first_player = self.connections.len() == 1;
        let spawn = if is_first_player {
            FIRST_PLAYER_SPAWN
        } else {
            OTHER_PLAYER_SPAWN
        };
        let entity = self.entity_ids.generate_next();
        self.rewinder.append_external_command(
            current.next(),
            GameplayCommand::create_player_server_side(spawn, entity, connection),
        );
        if let Some(record) = self.connections.get_mut(connection) {
            record.player_entity = Some(entity);
        }
        tracing::info!(
            connection = connection.as_u32(),
            entity = entity.as_u64(),
            update = current.next().as_u32(),
            "client connected; player spawn scheduled"
        );
    }

    fn drop_client(&mut self, connection: ConnectionId, reason: DisconnectReason) {
        self.transport.send(connection, create_disconnect_message(reason));
        self.remove_client(connection);
    }

    fn remove_client(&mut self, connection: ConnectionId) {
        self.connections.remove_client(connection);
        self.rewinder.remove_connection(connection);
        self.transport.disconnect(connection);
        tracing::info!(connection = connection.as_u32(), "client removed");
    }

    fn step_simulation(&mut self) {
        let next = self.rewinder.current_update_idx().next();
        if let Err(error) = self.rewinder.advance_to_next_update(next) {
            // Unreachable by construction; logged by the rewinder.
            tracing::error!(error = %error, "server failed to advance");
            return;
        }

        let mut inputs = Vec::new();
        for connection in self.rewinder.connections().collect::<Vec<_>>() {
            if let Ok(input) = self.rewinder.get_or_predict_player_input(connection, next) {
                inputs.push((connection, input));
            }
        }
        let context = StepContext {
            update: next,
            inputs,
        };

        let external = self.rewinder.external_commands_for_step(next);
        let world = self.rewinder.current_world_mut();
        for command in &external {
            command.execute(world);
        }
        let generated = self.simulation.fixed_step(world, &context);
        for command in &generated {
            command.execute(world);
        }
        self.rewinder.write_simulated_commands(next, generated);
    }

    fn send_update_outputs(&mut self) {
        let update = self.rewinder.current_update_idx();
        let moves = self.rewinder.current_world().entity_moves();
        let command_record = self.rewinder.commands_for(update).cloned();

        for (connection, record) in self
            .connections
            .iter()
            .map(|(connection, record)| (connection, record.clone()))
            .collect::<Vec<_>>()
        {
            self.transport.send(
                connection,
                create_moves_message(
                    &moves,
                    update,
                    record.last_input_update_idx,
                    record.index_shift,
                ),
            );

            if let Some(commands) = &command_record {
                if !commands.is_empty() {
                    match create_gameplay_commands_message(
                        &commands.external,
                        &commands.gameplay_generated,
                        connection,
                        update,
                    ) {
                        Ok(message) => self.transport.send(connection, message),
                        Err(error) => {
                            tracing::error!(error = %error, "failed to build commands message");
                        },
                    }
                }
            }
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::client_server::create_connect_message;
    use crate::network::serialization as ser;
    use crate::transport::MemoryTransport;
    use crate::world::{EntityMove, PlayerSpawn, ProjectileSpawn};
    use crate::NetworkEntityId;

    #[derive(Debug, Clone, PartialEq, Default)]
    struct TestWorld {
        players: Vec<(u64, Vec2, u32)>,
    }

    impl GameWorld for TestWorld {
        fn spawn_player(&mut self, spawn: PlayerSpawn) {
            self.players.push((
                spawn.network_entity_id.as_u64(),
                spawn.position,
                spawn.owner_connection.as_u32(),
            ));
            self.players.sort_by_key(|(id, _, _)| *id);
        }
        fn spawn_projectile(&mut self, _spawn: ProjectileSpawn) {}
        fn despawn_all_networked(&mut self) {
            self.players.clear();
        }
        fn contains_entity(&self, id: NetworkEntityId) -> bool {
            self.players.iter().any(|(e, _, _)| *e == id.as_u64())
        }
        fn entity_moves(&self) -> Vec<EntityMove> {
            self.players
                .iter()
                .map(|(id, position, _)| EntityMove {
                    network_entity_id: NetworkEntityId::new(*id),
                    position: *position,
                    direction: Vec2::new(0.0, -1.0),
                })
                .collect()
        }
        fn apply_move(&mut self, entity_move: &EntityMove) {
            for (id, position, _) in &mut self.players {
                if *id == entity_move.network_entity_id.as_u64() {
                    *position = entity_move.position;
                }
            }
        }
        fn player_entity_for(&self, connection: ConnectionId) -> Option<NetworkEntityId> {
            self.players
                .iter()
                .find(|(_, _, owner)| *owner == connection.as_u32())
                .map(|(id, _, _)| NetworkEntityId::new(*id))
        }
        fn local_player_entity(&self) -> Option<NetworkEntityId> {
            None
        }
    }

    struct IdleSimulation;

    impl Simulation<TestWorld> for IdleSimulation {
        fn fixed_step(
            &mut self,
            _world: &mut TestWorld,
            _context: &StepContext,
        ) -> Vec<GameplayCommand> {
            Vec::new()
        }
    }

    fn server_with_client() -> (
        ServerSession<TestWorld, IdleSimulation, MemoryTransport>,
        MemoryTransport,
    ) {
        let hub = MemoryTransport::new_server();
        let client_end = hub.connect_client();
        let session = ServerSession::new(
            TestWorld::default(),
            IdleSimulation,
            hub,
            NetcodeConfig::default(),
        )
        .unwrap();
        (session, client_end)
    }

    #[test]
    fn version_mismatch_is_rejected_with_no_state() {
        let (mut session, mut client) = server_with_client();

        let mut connect = Message::new(MessageId::Connect);
        ser::append_u32(&mut connect.data, 2); // wrong version
        ser::append_u64(&mut connect.data, 1_000);
        client.send(ConnectionId::INVALID, connect);

        session.tick();

        let replies = client.poll();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1.message_id(), Ok(MessageId::Disconnect));
        let reason =
            crate::network::server_client::apply_disconnect_message(&replies[0].1).unwrap();
        assert_eq!(
            reason,
            DisconnectReason::IncompatibleNetworkProtocolVersion {
                server_version: 3,
                client_version: 2,
            }
        );
        assert!(session.connections().is_empty(), "no per-client state kept");
    }

    #[test]
    fn accepted_connect_gets_accept_snapshot_and_spawn() {
        let (mut session, mut client) = server_with_client();
        client.send(ConnectionId::INVALID, create_connect_message(5_000));

        session.tick();

        let replies = client.poll();
        // Accept, world snapshot, then the tick's moves (and the spawn
        // command executes next tick).
        assert!(replies.len() >= 2);
        assert_eq!(replies[0].1.message_id(), Ok(MessageId::ConnectionAccepted));
        assert_eq!(replies[1].1.message_id(), Ok(MessageId::WorldSnapshot));
        assert_eq!(session.connections().len(), 1);

        // The spawn command lands in the world on the following tick.
        session.tick();
        assert_eq!(session.rewinder().current_world().players.len(), 1);
        let record = session.connections().get(client.connection_id()).unwrap();
        assert!(record.player_entity.is_some());
    }

    #[test]
    fn first_and_second_player_spawn_points_differ() {
        let hub = MemoryTransport::new_server();
        let mut first = hub.connect_client();
        let mut second = hub.connect_client();
        let mut session = ServerSession::new(
            TestWorld::default(),
            IdleSimulation,
            hub,
            NetcodeConfig::default(),
        )
        .unwrap();

        first.send(ConnectionId::INVALID, create_connect_message(1));
        session.tick();
        second.send(ConnectionId::INVALID, create_connect_message(2));
        session.tick();
        session.tick();

        let world = session.rewinder().current_world();
        assert_eq!(world.players.len(), 2);
        assert_eq!(world.players[0].1, FIRST_PLAYER_SPAWN);
        assert_eq!(world.players[1].1, OTHER_PLAYER_SPAWN);
    }

    #[test]
    fn malformed_message_disconnects_only_the_offender() {
        let hub = MemoryTransport::new_server();
        let mut honest = hub.connect_client();
        let mut offender = hub.connect_client();
        let mut session = ServerSession::new(
            TestWorld::default(),
            IdleSimulation,
            hub,
            NetcodeConfig::default(),
        )
        .unwrap();

        honest.send(ConnectionId::INVALID, create_connect_message(1));
        offender.send(ConnectionId::INVALID, create_connect_message(2));
        session.tick();
        honest.poll();
        offender.poll();

        // The offender sends a truncated input message.
        let mut bad = Message::new(MessageId::PlayerInput);
        ser::append_u32(&mut bad.data, 100);
        offender.send(ConnectionId::INVALID, bad);
        session.tick();

        assert_eq!(session.connections().len(), 1);
        assert!(session.connections().contains(honest.connection_id()));
        let last = offender.poll();
        assert!(
            last.iter()
                .any(|(_, message)| message.message_id() == Ok(MessageId::Disconnect)),
            "offender was told to go away"
        );
        // The honest client keeps receiving moves.
        assert!(honest
            .poll()
            .iter()
            .any(|(_, message)| message.message_id() == Ok(MessageId::EntityMove)));
    }

    #[test]
    fn idle_pause_then_shutdown() {
        let config = NetcodeConfig::default();
        let (mut session, mut client) = server_with_client();
        client.send(ConnectionId::INVALID, create_connect_message(1));
        session.tick();
        let after_connect = session.current_update_idx();

        // Three silent ticks: the third one pauses the simulation.
        for _ in 0..config.server_idle_pause_updates {
            session.tick();
        }
        assert!(session.is_paused());
        let paused_at = session.current_update_idx();
        session.tick();
        assert_eq!(session.current_update_idx(), paused_at, "no ticks while paused");
        assert!(paused_at >= after_connect);

        // Silence through the quit threshold shuts the server down.
        for _ in 0..config.server_idle_quit_updates {
            session.tick();
        }
        assert!(session.should_quit());
        let inbox = client.poll();
        assert!(inbox
            .iter()
            .any(|(_, message)| message.message_id() == Ok(MessageId::Disconnect)));
    }

    #[test]
    fn traffic_resumes_a_paused_server() {
        let (mut session, mut client) = server_with_client();
        client.send(ConnectionId::INVALID, create_connect_message(1));
        session.tick();
        client.poll();

        for _ in 0..10 {
            session.tick();
        }
        assert!(session.is_paused());

        // Any client message unpauses.
        let message = crate::network::client_server::create_player_input_message(
            &StateRewinder::new(SessionRole::Client, TestWorld::default()),
            &NetcodeConfig::default(),
        )
        .unwrap();
        client.send(ConnectionId::INVALID, message);
        session.tick();
        assert!(!session.is_paused());
    }

    #[test]
    fn disconnect_message_removes_the_client() {
        let (mut session, mut client) = server_with_client();
        client.send(ConnectionId::INVALID, create_connect_message(1));
        session.tick();
        assert_eq!(session.connections().len(), 1);

        client.send(
            ConnectionId::INVALID,
            create_disconnect_message(DisconnectReason::ClientShutdown),
        );
        session.tick();
        assert!(session.connections().is_empty());
    }
}
