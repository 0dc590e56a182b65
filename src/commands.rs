//! Gameplay commands: deterministic, serialisable descriptions of discrete
//! world mutations.
//!
//! A command is executed identically on the server and on every client, and
//! is recorded in the per-update command log so resimulation after a
//! rollback replays exactly what happened. On the wire a command is its
//! `u16` kind tag followed by a kind-specific payload; the tag is the only
//! dispatch mechanism the protocol needs.
//!
//! Serialisation is receiver-dependent: the same `CreatePlayerEntity`
//! command tells exactly one client "this player is yours" via the
//! `is_owner` byte, and the owning connection id never leaves the server.

use std::collections::HashMap;

use crate::error::ProtocolErrorKind;
use crate::network::serialization as ser;
use crate::world::{GameWorld, PlayerSpawn, ProjectileSpawn};
use crate::{ConnectionId, NetworkEntityId, Vec2};

/// Kind tag of [`GameplayCommand::CreatePlayerEntity`].
pub const COMMAND_KIND_CREATE_PLAYER_ENTITY: u16 = 0;
/// Kind tag of [`GameplayCommand::CreateProjectile`].
pub const COMMAND_KIND_CREATE_PROJECTILE: u16 = 1;

/// A discrete, replayable world mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum GameplayCommand {
    /// Spawn a player entity.
    CreatePlayerEntity {
        /// Spawn position.
        position: Vec2,
        /// Server-issued id of the new entity.
        network_entity_id: NetworkEntityId,
        /// Whether the receiving peer controls this player. Always `false`
        /// in server-side instances; set per receiver on serialisation.
        is_owner: bool,
        /// The controlling connection. Server side only; never serialised.
        owner_connection: ConnectionId,
    },
    /// Spawn a projectile entity.
    CreateProjectile {
        /// Spawn position.
        position: Vec2,
        /// Flight direction.
        direction: Vec2,
        /// Speed in world units per update.
        speed: f32,
        /// Server-issued id of the new entity.
        network_entity_id: NetworkEntityId,
        /// The entity that fired the projectile.
        owner_network_entity_id: NetworkEntityId,
    },
}

impl GameplayCommand {
    /// A server-side player spawn (ownership is decided per receiver at
    /// serialisation time).
    #[must_use]
    pub fn create_player_server_side(
        position: Vec2,
        network_entity_id: NetworkEntityId,
        owner_connection: ConnectionId,
    ) -> Self {
        Self::CreatePlayerEntity {
            position,
            network_entity_id,
            is_owner: false,
            owner_connection,
        }
    }

    /// The stable numeric tag used for wire dispatch.
    #[must_use]
    pub const fn kind(&self) -> u16 {
        match self {
            Self::CreatePlayerEntity { .. } => COMMAND_KIND_CREATE_PLAYER_ENTITY,
            Self::CreateProjectile { .. } => COMMAND_KIND_CREATE_PROJECTILE,
        }
    }

    /// Applies the command to the world deterministically.
    pub fn execute<W: GameWorld>(&self, world: &mut W) {
        match *self {
            Self::CreatePlayerEntity {
                position,
                network_entity_id,
                is_owner,
                owner_connection,
            } => {
                world.spawn_player(PlayerSpawn {
                    network_entity_id,
                    position,
                    is_owner,
                    owner_connection,
                });
            },
            Self::CreateProjectile {
                position,
                direction,
                speed,
                network_entity_id,
                owner_network_entity_id,
            } => {
                world.spawn_projectile(ProjectileSpawn {
                    network_entity_id,
                    position,
                    direction,
                    speed,
                    owner_network_entity_id,
                });
            },
        }
    }

    /// Appends the command payload (without the kind tag) for a specific
    /// receiver. For player spawns the `is_owner` byte is computed against
    /// `receiver`; the owner connection itself stays on the server.
    pub fn server_serialize(&self, buf: &mut Vec<u8>, receiver: ConnectionId) {
        match *self {
            Self::CreatePlayerEntity {
                position,
                network_entity_id,
                owner_connection,
                ..
            } => {
                ser::append_u8(buf, u8::from(receiver == owner_connection));
                ser::append_u64(buf, network_entity_id.as_u64());
                ser::append_f32(buf, position.x);
                ser::append_f32(buf, position.y);
            },
            Self::CreateProjectile {
                position,
                direction,
                speed,
                network_entity_id,
                owner_network_entity_id,
            } => {
                ser::append_u64(buf, network_entity_id.as_u64());
                ser::append_f32(buf, position.x);
                ser::append_f32(buf, position.y);
                ser::append_f32(buf, speed);
                ser::append_u64(buf, owner_network_entity_id.as_u64());
                ser::append_f32(buf, direction.x);
                ser::append_f32(buf, direction.y);
            },
        }
    }
}

/// A deserialiser for one command kind: reads the kind-specific payload at
/// the cursor and reconstructs the command.
pub type CommandDeserializeFn =
    fn(&[u8], &mut usize) -> Result<GameplayCommand, ProtocolErrorKind>;

fn read_f32(buf: &[u8], cursor: &mut usize) -> Result<f32, ProtocolErrorKind> {
    let before = *cursor;
    match ser::read_f32(buf, cursor) {
        Some(value) => Ok(value),
        None if *cursor == before => Err(ProtocolErrorKind::TruncatedPayload {
            cursor: before,
            payload_len: buf.len(),
        }),
        None => Err(ProtocolErrorKind::NonFiniteFloat { cursor: before }),
    }
}

fn deserialize_create_player(
    buf: &[u8],
    cursor: &mut usize,
) -> Result<GameplayCommand, ProtocolErrorKind> {
    let is_owner = ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())? != 0;
    let network_entity_id = ser::require(ser::read_u64(buf, cursor), *cursor, buf.len())?;
    let x = read_f32(buf, cursor)?;
    let y = read_f32(buf, cursor)?;
    Ok(GameplayCommand::CreatePlayerEntity {
        position: Vec2::new(x, y),
        network_entity_id: NetworkEntityId::new(network_entity_id),
        is_owner,
        owner_connection: ConnectionId::INVALID,
    })
}

fn deserialize_create_projectile(
    buf: &[u8],
    cursor: &mut usize,
) -> Result<GameplayCommand, ProtocolErrorKind> {
    let network_entity_id = ser::require(ser::read_u64(buf, cursor), *cursor, buf.len())?;
    let x = read_f32(buf, cursor)?;
    let y = read_f32(buf, cursor)?;
    let speed = read_f32(buf, cursor)?;
    let owner = ser::require(ser::read_u64(buf, cursor), *cursor, buf.len())?;
    let direction_x = read_f32(buf, cursor)?;
    let direction_y = read_f32(buf, cursor)?;
    Ok(GameplayCommand::CreateProjectile {
        position: Vec2::new(x, y),
        direction: Vec2::new(direction_x, direction_y),
        speed,
        network_entity_id: NetworkEntityId::new(network_entity_id),
        owner_network_entity_id: NetworkEntityId::new(owner),
    })
}

/// Maps wire kind tags to deserialisers. Built once at startup; an
/// unregistered tag in a payload is a protocol error and closes the
/// offending connection.
#[derive(Clone)]
pub struct CommandRegistry {
    deserializers: HashMap<u16, CommandDeserializeFn>,
}

impl std::fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<u16> = self.deserializers.keys().copied().collect();
        kinds.sort_unstable();
        f.debug_struct("CommandRegistry").field("kinds", &kinds).finish()
    }
}

impl CommandRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            deserializers: HashMap::new(),
        }
    }

    /// A registry with every built-in command kind registered.
    #[must_use]
    pub fn with_builtin_commands() -> Self {
        let mut registry = Self::new();
        registry.register(COMMAND_KIND_CREATE_PLAYER_ENTITY, deserialize_create_player);
        registry.register(COMMAND_KIND_CREATE_PROJECTILE, deserialize_create_projectile);
        registry
    }

    /// Registers a deserialiser for a kind tag, replacing any previous one.
    pub fn register(&mut self, kind: u16, deserializer: CommandDeserializeFn) {
        self.deserializers.insert(kind, deserializer);
    }

    /// Reads one `(kind, payload)` command at the cursor.
    ///
    /// # Errors
    /// Returns [`ProtocolErrorKind::UnknownCommandKind`] for unregistered
    /// tags and decoding errors from the kind's deserialiser.
    pub fn deserialize(
        &self,
        buf: &[u8],
        cursor: &mut usize,
    ) -> Result<GameplayCommand, ProtocolErrorKind> {
        let kind = ser::require(ser::read_u16(buf, cursor), *cursor, buf.len())?;
        let deserializer = self
            .deserializers
            .get(&kind)
            .ok_or(ProtocolErrorKind::UnknownCommandKind { kind })?;
        deserializer(buf, cursor)
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::with_builtin_commands()
    }
}

// #########
// # TESTS #
// #########
