//! The abstract entity container the core drives.
//!
//! The concrete ECS lives outside this crate. The core only needs a narrow
//! slice of it: spawn and despawn networked entities by their server-issued
//! ids, read and overwrite the transforms of every networked entity, and
//! answer who controls which player entity. That slice is the [`GameWorld`]
//! trait; a snapshot of the world is whatever `Clone` produces.
//!
//! Entity relations are expressed through opaque [`NetworkEntityId`]s and
//! id-keyed lookups, never through references between components - lookups
//! are explicit and fallible.

use crate::{ConnectionId, FrameInput, NetworkEntityId, UpdateIdx};

/// A two-component vector in world units.
#[derive(Debug, Copy, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Vec2 {
    /// Horizontal component.
    pub x: f32,
    /// Vertical component.
    pub y: f32,
}

impl Vec2 {
    /// The zero vector.
    pub const ZERO: Vec2 = Vec2 { x: 0.0, y: 0.0 };

    /// Creates a vector from components.
    #[inline]
    #[must_use]
    pub const fn new(x: f32, y: f32) -> Self {
        Vec2 { x, y }
    }

    /// Euclidean length.
    #[inline]
    #[must_use]
    pub fn length(self) -> f32 {
        (self.x * self.x + self.y * self.y).sqrt()
    }

    /// Distance to another point.
    #[inline]
    #[must_use]
    pub fn distance(self, other: Vec2) -> f32 {
        (self - other).length()
    }
}

impl std::ops::Add for Vec2 {
    type Output = Vec2;

    #[inline]
    fn add(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl std::ops::Sub for Vec2 {
    type Output = Vec2;

    #[inline]
    fn sub(self, rhs: Vec2) -> Vec2 {
        Vec2::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Mul<f32> for Vec2 {
    type Output = Vec2;

    #[inline]
    fn mul(self, rhs: f32) -> Vec2 {
        Vec2::new(self.x * rhs, self.y * rhs)
    }
}

/// Position and facing of one networked entity at the end of an update.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct EntityMove {
    /// The entity this move belongs to.
    pub network_entity_id: NetworkEntityId,
    /// World position.
    pub position: Vec2,
    /// Facing direction (unit-ish, not quantised on the wire).
    pub direction: Vec2,
}

/// Parameters for spawning a player entity.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PlayerSpawn {
    /// Server-issued id of the new entity.
    pub network_entity_id: NetworkEntityId,
    /// Spawn position.
    pub position: Vec2,
    /// Whether the local peer controls this player (always `false` on the
    /// server; set per receiver on clients).
    pub is_owner: bool,
    /// The connection controlling this player, server side only.
    /// [`ConnectionId::INVALID`] on clients.
    pub owner_connection: ConnectionId,
}

/// Parameters for spawning a projectile entity.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ProjectileSpawn {
    /// Server-issued id of the new entity.
    pub network_entity_id: NetworkEntityId,
    /// Spawn position.
    pub position: Vec2,
    /// Flight direction.
    pub direction: Vec2,
    /// Speed in world units per update.
    pub speed: f32,
    /// The entity that fired the projectile.
    pub owner_network_entity_id: NetworkEntityId,
}

/// The entity container operations the netcode core relies on.
///
/// Implementations must be deterministic: two clones receiving the same
/// sequence of calls must stay byte-identical, and [`entity_moves`] must
/// report entities in ascending [`NetworkEntityId`] order.
///
/// [`entity_moves`]: GameWorld::entity_moves
pub trait GameWorld: Clone {
    /// Creates a player entity. The id must not already be present.
    fn spawn_player(&mut self, spawn: PlayerSpawn);

    /// Creates a projectile entity. The id must not already be present.
    fn spawn_projectile(&mut self, spawn: ProjectileSpawn);

    /// Removes every entity that carries a network id. Used before applying
    /// an authoritative world snapshot.
    fn despawn_all_networked(&mut self);

    /// Whether an entity with this network id currently exists.
    fn contains_entity(&self, id: NetworkEntityId) -> bool;

    /// Position and direction of every networked entity, in ascending
    /// network-entity-id order.
    fn entity_moves(&self) -> Vec<EntityMove>;

    /// Overwrites the transform of the entity named by the move. Unknown
    /// ids are ignored (the entity may have despawned locally).
    fn apply_move(&mut self, entity_move: &EntityMove);

    /// The player entity controlled by a connection, if one was spawned for
    /// it. Server-side lookup.
    fn player_entity_for(&self, connection: ConnectionId) -> Option<NetworkEntityId>;

    /// The player entity owned by the local peer, if any. Client-side
    /// lookup.
    fn local_player_entity(&self) -> Option<NetworkEntityId>;
}

/// Everything a simulation step may read: the update being simulated and
/// the arbitrated inputs, one entry per player.
///
/// On the server the inputs cover every connection; on the client there is
/// a single entry for the local player carrying [`ConnectionId::INVALID`].
#[derive(Debug, Clone)]
pub struct StepContext {
    /// The update being simulated.
    pub update: UpdateIdx,
    /// Arbitrated input per connection.
    pub inputs: Vec<(ConnectionId, FrameInput)>,
}

impl StepContext {
    /// The single local input on the client.
    #[must_use]
    pub fn local_input(&self) -> FrameInput {
        self.inputs
            .first()
            .map(|(_, input)| *input)
            .unwrap_or_default()
    }

    /// The input of a specific connection, default when absent.
    #[must_use]
    pub fn input_for(&self, connection: ConnectionId) -> FrameInput {
        self.inputs
            .iter()
            .find(|(conn, _)| *conn == connection)
            .map(|(_, input)| *input)
            .unwrap_or_default()
    }
}

/// One fixed step of the deterministic game simulation.
///
/// The rewinder drives this both for live frames and during resimulation
/// after a rollback, so the implementation must be a pure function of the
/// world state and the context: no wall-clock reads, no unordered-map
/// iteration, no process-global randomness.
pub trait Simulation<W: GameWorld> {
    /// Advances `world` by one update. Returns the gameplay commands the
    /// simulation produced this tick (e.g. projectile spawns); the caller
    /// records and executes them.
    fn fixed_step(
        &mut self,
        world: &mut W,
        context: &StepContext,
    ) -> Vec<crate::commands::GameplayCommand>;
}

// #########
// # TESTS #
// #########
