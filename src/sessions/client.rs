//! The predicted client driver.
//!
//! A [`ClientSession`] runs the same deterministic simulation as the
//! server, a few updates ahead of it, feeding the server its input window
//! every tick and reconciling whenever an authoritative message disagrees
//! with what it predicted. The host render loop consumes the
//! interpolation resets produced by reconciliation and the frame-length
//! correction produced by the timing-shift corrector.

use crate::commands::CommandRegistry;
use crate::connection::ClientConnectionState;
use crate::network::client_server::{create_connect_message, create_player_input_message};
use crate::network::messages::{Message, MessageId};
use crate::network::server_client::{
    apply_connection_accepted_message, apply_disconnect_message, apply_gameplay_commands_message,
    apply_moves_message, apply_world_snapshot_message,
};
use crate::reconciliation::{advance_client_update, reconcile, InterpolationReset};
use crate::rewinder::StateRewinder;
use crate::time_corrector::FrameTimeCorrector;
use crate::transport::Transport;
use crate::world::{GameWorld, Simulation};
use crate::{
    report_violation, ConnectionId, FrameInput, NetcodeConfig, NetcodeError, SessionRole,
    UpdateIdx,
};
use crate::telemetry::{ViolationKind, ViolationSeverity};

/// The predicted game instance.
pub struct ClientSession<W, S, T> {
    config: NetcodeConfig,
    rewinder: StateRewinder<W>,
    simulation: S,
    transport: T,
    registry: CommandRegistry,
    corrector: FrameTimeCorrector,
    state: ClientConnectionState,
    pending_resets: Vec<InterpolationReset>,
}

impl<W, S, T> ClientSession<W, S, T>
where
    W: GameWorld,
    S: Simulation<W>,
    T: Transport,
{
    /// Creates a client session over an initial (usually empty) world.
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
            corrector: FrameTimeCorrector::new(config.one_update_us),
            config,
            rewinder: StateRewinder::new(SessionRole::Client, world),
            simulation,
            transport,
            registry: CommandRegistry::with_builtin_commands(),
            state: ClientConnectionState::Disconnected,
            pending_resets: Vec::new(),
        })
    }

    /// The connection lifecycle state.
    #[must_use]
    pub fn state(&self) -> &ClientConnectionState {
        &self.state
    }

    /// The update the client simulation has reached.
    #[must_use]
    pub fn current_update_idx(&self) -> UpdateIdx {
        self.rewinder.current_update_idx()
    }

    /// The rewinder (read-only; tests and inspectors).
    #[must_use]
    pub fn rewinder(&self) -> &StateRewinder<W> {
        &self.rewinder
    }

    /// The frame-length correction the host clock should apply to its next
    /// frame, in microseconds.
    #[must_use]
    pub fn frame_correction_us(&self) -> i64 {
        self.corrector.frame_correction_us()
    }

    /// Takes the interpolation resets produced by reconciliations since
    /// the last call. The render layer restarts its smoothing from them.
    pub fn take_interpolation_resets(&mut self) -> Vec<InterpolationReset> {
        std::mem::take(&mut self.pending_resets)
    }

    /// Sends the connect handshake. `timestamp_now_us` is the local wall
    /// clock; the server echoes it back so the round trip can be measured.
    pub fn connect(&mut self, timestamp_now_us: u64) {
        self.transport
            .send(ConnectionId::INVALID, create_connect_message(timestamp_now_us));
        self.state = ClientConnectionState::Connecting;
        tracing::info!("connect sent");
    }

    /// Drains and dispatches inbound messages. `timestamp_now_us` is used
    /// to complete the handshake round-trip measurement.
    pub fn handle_messages(&mut self, timestamp_now_us: u64) {
        for (_, message) in self.transport.poll() {
            if let Err(error) = self.handle_message(timestamp_now_us, &message) {
                match error {
                    NetcodeError::StaleUpdate { requested, first_stored } => {
                        // A very late authoritative message; nothing to
                        // reconcile against any more.
                        tracing::debug!(
                            requested = requested.as_u32(),
                            first_stored = first_stored.as_u32(),
                            "ignoring stale authoritative message"
                        );
                    },
                    other => {
                        tracing::warn!(error = %other, "failed to handle server message");
                    },
                }
            }
        }
    }

    fn handle_message(
        &mut self,
        timestamp_now_us: u64,
        message: &Message,
    ) -> Result<(), NetcodeError> {
        match message.message_id()? {
            MessageId::ConnectionAccepted => {
                let update = apply_connection_accepted_message(
                    &mut self.rewinder,
                    timestamp_now_us,
                    &self.config,
                    message,
                )?;
                self.state = ClientConnectionState::Connected;
                tracing::info!(update = update.as_u32(), "connected");
                Ok(())
            },
            MessageId::Disconnect => {
                let reason = apply_disconnect_message(message)?;
                tracing::info!(%reason, "disconnected by peer");
                self.state = ClientConnectionState::Closed(reason);
                Ok(())
            },
            MessageId::EntityMove => {
                apply_moves_message(&mut self.rewinder, &mut self.corrector, message)
            },
            MessageId::GameplayCommand => {
                apply_gameplay_commands_message(&mut self.rewinder, &self.registry, message)
            },
            MessageId::WorldSnapshot => {
                apply_world_snapshot_message(&mut self.rewinder, &self.registry, message)
            },
            unexpected => {
                report_violation!(
                    ViolationSeverity::Warning,
                    ViolationKind::NetworkProtocol,
                    "server sent client-to-server message {:?}",
                    unexpected
                );
                Ok(())
            },
        }
    }

    /// One fixed update: reconcile any pending desync, sample the local
    /// input for the next update, send the input window to the server, and
    /// simulate the update.
    ///
    /// Does nothing until the handshake completes, and nothing after the
    /// connection closes.
    pub fn tick(&mut self, local_input: FrameInput) {
        if !self.state.is_connected() {
            return;
        }

        match reconcile(&mut self.rewinder, &mut self.simulation, &self.config) {
            Ok(resets) => self.pending_resets.extend(resets),
            Err(error) => {
                tracing::error!(error = %error, "reconciliation failed");
            },
        }

        let next = self.rewinder.current_update_idx().next();
        self.rewinder.set_input_for(next, local_input);

        match create_player_input_message(&self.rewinder, &self.config) {
            Ok(message) => self.transport.send(ConnectionId::INVALID, message),
            Err(error) => {
                tracing::error!(error = %error, "failed to build input message");
            },
        }

        if let Err(error) = advance_client_update(&mut self.rewinder, &mut self.simulation, next)
        {
            tracing::error!(error = %error, "client step failed");
            return;
        }
        self.corrector.on_update_advanced();
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::messages::DisconnectReason;
    use crate::network::server_client::{
        create_connection_accepted_message, create_disconnect_message, create_moves_message,
    };
    use crate::transport::MemoryTransport;
    use crate::world::{EntityMove, PlayerSpawn, ProjectileSpawn, StepContext};
    use crate::{NetworkEntityId, Vec2};

    #[derive(Debug, Clone, PartialEq, Default)]
    struct TestWorld {
        entities: Vec<(u64, Vec2)>,
    }

    impl GameWorld for TestWorld {
        fn spawn_player(&mut self, spawn: PlayerSpawn) {
            self.entities.push((spawn.network_entity_id.as_u64(), spawn.position));
            self.entities.sort_by_key(|(id, _)| *id);
        }
        fn spawn_projectile(&mut self, _spawn: ProjectileSpawn) {}
        fn despawn_all_networked(&mut self) {
            self.entities.clear();
        }
        fn contains_entity(&self, id: NetworkEntityId) -> bool {
            self.entities.iter().any(|(e, _)| *e == id.as_u64())
        }
        fn entity_moves(&self) -> Vec<EntityMove> {
            self.entities
                .iter()
                .map(|(id, position)| EntityMove {
                    network_entity_id: NetworkEntityId::new(*id),
                    position: *position,
                    direction: Vec2::new(0.0, -1.0),
                })
                .collect()
        }
        fn apply_move(&mut self, entity_move: &EntityMove) {
            for (id, position) in &mut self.entities {
                if *id == entity_move.network_entity_id.as_u64() {
                    *position = entity_move.position;
                }
            }
        }
        fn player_entity_for(&self, _connection: ConnectionId) -> Option<NetworkEntityId> {
            None
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
        ) -> Vec<crate::commands::GameplayCommand> {
            Vec::new()
        }
    }

    fn client_pair() -> (
        ClientSession<TestWorld, IdleSimulation, MemoryTransport>,
        MemoryTransport,
    ) {
        let hub = MemoryTransport::new_server();
        let client_end = hub.connect_client();
        let session = ClientSession::new(
            TestWorld::default(),
            IdleSimulation,
            client_end,
            NetcodeConfig::default(),
        )
        .unwrap();
        (session, hub)
    }

    #[test]
    fn connect_sends_the_handshake() {
        let (mut session, mut server_end) = client_pair();
        session.connect(42);
        assert_eq!(*session.state(), ClientConnectionState::Connecting);

        let inbound = server_end.poll();
        assert_eq!(inbound.len(), 1);
        assert_eq!(inbound[0].1.message_id(), Ok(MessageId::Connect));
    }

    #[test]
    fn accept_aligns_the_client_to_server_timeline() {
        let (mut session, mut server_end) = client_pair();
        session.connect(50_000_000);
        let connection = server_end.poll()[0].0;

        server_end.send(
            connection,
            create_connection_accepted_message(UpdateIdx::new(400), 50_000_000),
        );
        session.handle_messages(50_320_000);

        assert!(session.state().is_connected());
        assert_eq!(session.current_update_idx(), UpdateIdx::new(410));
    }

    #[test]
    fn ticks_before_connecting_do_nothing() {
        let (mut session, mut server_end) = client_pair();
        session.tick(FrameInput::default());
        assert_eq!(session.current_update_idx(), UpdateIdx::new(0));
        assert!(server_end.poll().is_empty());
    }

    #[test]
    fn connected_ticks_send_input_and_advance() {
        let (mut session, mut server_end) = client_pair();
        session.connect(0);
        let connection = server_end.poll()[0].0;
        server_end.send(
            connection,
            create_connection_accepted_message(UpdateIdx::new(10), 0),
        );
        session.handle_messages(0);

        session.tick(FrameInput::default());
        session.tick(FrameInput::default());
        assert_eq!(session.current_update_idx(), UpdateIdx::new(12));

        let inbound = server_end.poll();
        let input_messages: Vec<_> = inbound
            .iter()
            .filter(|(_, message)| message.message_id() == Ok(MessageId::PlayerInput))
            .collect();
        assert_eq!(input_messages.len(), 2);
    }

    #[test]
    fn disconnect_closes_the_session() {
        let (mut session, mut server_end) = client_pair();
        session.connect(0);
        let connection = server_end.poll()[0].0;
        server_end.send(
            connection,
            create_disconnect_message(DisconnectReason::ServerShutdown),
        );
        session.handle_messages(0);
        assert_eq!(
            *session.state(),
            ClientConnectionState::Closed(DisconnectReason::ServerShutdown)
        );

        // Ticking after close is inert.
        session.tick(FrameInput::default());
        assert_eq!(session.current_update_idx(), UpdateIdx::new(0));
    }

    #[test]
    fn stale_moves_are_ignored_quietly() {
        let (mut session, mut server_end) = client_pair();
        session.connect(0);
        let connection = server_end.poll()[0].0;
        server_end.send(
            connection,
            create_connection_accepted_message(UpdateIdx::new(100), 0),
        );
        session.handle_messages(0);

        // Moves for update 5, far below the rebased history start.
        server_end.send(
            connection,
            create_moves_message(&[], UpdateIdx::new(5), UpdateIdx::new(5), 0),
        );
        session.handle_messages(0);
        assert!(session.state().is_connected());
        assert_eq!(session.current_update_idx(), UpdateIdx::new(100));
    }
}
