//! Stub world and simulation used by the integration tests.
//!
//! Deliberately tiny but fully deterministic: entities are id-sorted, every
//! mutation is a pure function of inputs and commands, so server and client
//! instances produce byte-identical snapshots for identical histories.

use skirmish_netcode::commands::GameplayCommand;
use skirmish_netcode::world::{PlayerSpawn, ProjectileSpawn, StepContext};
use skirmish_netcode::{
    ConnectionId, EntityMove, GameWorld, NetworkEntityId, Simulation, Vec2,
};

/// One networked entity in the stub world.
#[derive(Debug, Clone, PartialEq)]
pub struct StubEntity {
    pub id: NetworkEntityId,
    pub position: Vec2,
    pub direction: Vec2,
    /// The connection controlling this entity, server side.
    pub owner_connection: ConnectionId,
    /// Whether the local peer controls this entity, client side.
    pub owned_locally: bool,
}

/// A minimal entity container satisfying the [`GameWorld`] determinism
/// contract: entities are kept in ascending network-id order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StubWorld {
    pub entities: Vec<StubEntity>,
}

impl StubWorld {
    pub fn entity(&self, id: NetworkEntityId) -> Option<&StubEntity> {
        self.entities.iter().find(|entity| entity.id == id)
    }
}

impl GameWorld for StubWorld {
    fn spawn_player(&mut self, spawn: PlayerSpawn) {
        self.entities.push(StubEntity {
            id: spawn.network_entity_id,
            position: spawn.position,
            direction: Vec2::new(0.0, -1.0),
            owner_connection: spawn.owner_connection,
            owned_locally: spawn.is_owner,
        });
        self.entities.sort_by_key(|entity| entity.id);
    }

    fn spawn_projectile(&mut self, spawn: ProjectileSpawn) {
        self.entities.push(StubEntity {
            id: spawn.network_entity_id,
            position: spawn.position,
            direction: spawn.direction,
            owner_connection: ConnectionId::INVALID,
            owned_locally: false,
        });
        self.entities.sort_by_key(|entity| entity.id);
    }

    fn despawn_all_networked(&mut self) {
        self.entities.clear();
    }

    fn contains_entity(&self, id: NetworkEntityId) -> bool {
        self.entity(id).is_some()
    }

    fn entity_moves(&self) -> Vec<EntityMove> {
        self.entities
            .iter()
            .map(|entity| EntityMove {
                network_entity_id: entity.id,
                position: entity.position,
                direction: entity.direction,
            })
            .collect()
    }

    fn apply_move(&mut self, entity_move: &EntityMove) {
        for entity in &mut self.entities {
            if entity.id == entity_move.network_entity_id {
                entity.position = entity_move.position;
                entity.direction = entity_move.direction;
            }
        }
    }

    fn player_entity_for(&self, connection: ConnectionId) -> Option<NetworkEntityId> {
        self.entities
            .iter()
            .find(|entity| entity.owner_connection == connection)
            .map(|entity| entity.id)
    }

    fn local_player_entity(&self) -> Option<NetworkEntityId> {
        self.entities
            .iter()
            .find(|entity| entity.owned_locally)
            .map(|entity| entity.id)
    }
}

/// Moves each player by its input axes, one world unit per axis unit per
/// update. Identical on server and client.
pub struct StubSimulation;

impl Simulation<StubWorld> for StubSimulation {
    fn fixed_step(
        &mut self,
        world: &mut StubWorld,
        context: &StepContext,
    ) -> Vec<GameplayCommand> {
        for (connection, input) in &context.inputs {
            let controlled = if connection.is_valid() {
                world.player_entity_for(*connection)
            } else {
                world.local_player_entity()
            };
            let Some(id) = controlled else {
                continue;
            };
            for entity in &mut world.entities {
                if entity.id == id {
                    entity.position.x += input.axis_value(0);
                    entity.position.y += input.axis_value(1);
                }
            }
        }
        Vec::new()
    }
}
