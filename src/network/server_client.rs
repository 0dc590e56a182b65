//! Server → client messages: `ConnectionAccepted`, `Disconnect`,
//! `EntityMove`, `GameplayCommand`, and `WorldSnapshot`.

use crate::commands::{CommandRegistry, GameplayCommand};
use crate::connection::ServerConnections;
use crate::error::ProtocolErrorKind;
use crate::network::messages::{DisconnectReason, Message, MessageId};
use crate::network::serialization as ser;
use crate::rewinder::history::MovementUpdateData;
use crate::rewinder::StateRewinder;
use crate::time_corrector::FrameTimeCorrector;
use crate::world::EntityMove;
use crate::{GameWorld, NetcodeConfig, NetcodeError, NetworkEntityId, UpdateIdx, Vec2};

/// Bit in the `EntityMove` flags byte: the payload carries the last known
/// input update index (the client's input stream has not reached the
/// update being reported).
const MOVES_FLAG_MISSING_INPUT: u8 = 1 << 0;
/// Bit in the `EntityMove` flags byte: the payload carries a timing shift.
const MOVES_FLAG_INDEX_SHIFT: u8 = 1 << 1;

// =============================================================================
// ConnectionAccepted
// =============================================================================

/// Builds the accept reply: the update the client should align to and the
/// client's own connect timestamp echoed back.
#[must_use]
pub fn create_connection_accepted_message(
    update_idx: UpdateIdx,
    forwarded_timestamp_us: u64,
) -> Message {
    let mut message = Message::new(MessageId::ConnectionAccepted);
    ser::append_u32(&mut message.data, update_idx.as_u32());
    ser::append_u64(&mut message.data, forwarded_timestamp_us);
    message
}

/// Applies the accept on the client: measures round-trip time from the
/// echoed timestamp, estimates how many updates ahead of the server it
/// should simulate (half the round trip), and rebases the rewinder onto
/// the resulting update index. The lead is capped at the snapshot ring
/// capacity.
///
/// Returns the update index the client now simulates at.
///
/// # Errors
/// Protocol error on a truncated payload.
pub fn apply_connection_accepted_message<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    timestamp_now_us: u64,
    config: &NetcodeConfig,
    message: &Message,
) -> Result<UpdateIdx, NetcodeError> {
    let buf = &message.data;
    let mut cursor = Message::PAYLOAD_START_POS;
    let accept_update =
        UpdateIdx::new(ser::require(ser::read_u32(buf, &mut cursor), cursor, buf.len())?);
    let sent_timestamp_us = ser::require(ser::read_u64(buf, &mut cursor), cursor, buf.len())?;

    let round_trip_us = timestamp_now_us.saturating_sub(sent_timestamp_us);
    let one_way_us = round_trip_us / 2;
    let lead_updates =
        u32::try_from(one_way_us.div_ceil(config.one_update_us)).unwrap_or(u32::MAX);

    let estimated = accept_update + lead_updates;
    let capped = accept_update + (config.stored_history_max - 1);
    let resulting = std::cmp::min(estimated, capped);

    tracing::info!(
        accept_update = accept_update.as_u32(),
        round_trip_ms = round_trip_us / 1000,
        resulting = resulting.as_u32(),
        "connection accepted"
    );

    // The server may still send authoritative data for the update before
    // the accept index, so the seeded history reaches back that far.
    rewinder.set_initial_client_update_idx(resulting, accept_update.saturating_sub(1));
    Ok(resulting)
}

// =============================================================================
// Disconnect
// =============================================================================

/// Builds a `Disconnect` message for the given reason.
#[must_use]
pub fn create_disconnect_message(reason: DisconnectReason) -> Message {
    let mut message = Message::new(MessageId::Disconnect);
    reason.append(&mut message.data);
    message
}

/// Parses a `Disconnect` message.
///
/// # Errors
/// Protocol error on a truncated payload.
pub fn apply_disconnect_message(message: &Message) -> Result<DisconnectReason, NetcodeError> {
    let mut cursor = Message::PAYLOAD_START_POS;
    Ok(DisconnectReason::read(&message.data, &mut cursor)?)
}

// =============================================================================
// EntityMove
// =============================================================================

/// Builds the per-client `EntityMove` message for one update: a flags
/// byte, the optional last-known-input and timing-shift fields, the update
/// index, and every networked entity's position and direction.
#[must_use]
pub fn create_moves_message(
    moves: &[EntityMove],
    update_idx: UpdateIdx,
    last_known_input_idx: UpdateIdx,
    index_shift: i32,
) -> Message {
    let has_missing_input =
        !last_known_input_idx.is_valid() || last_known_input_idx < update_idx;
    let has_index_shift = index_shift != 0;

    let mut flags = 0u8;
    if has_missing_input {
        flags |= MOVES_FLAG_MISSING_INPUT;
    }
    if has_index_shift {
        flags |= MOVES_FLAG_INDEX_SHIFT;
    }

    let mut message = Message::new(MessageId::EntityMove);
    ser::append_u8(&mut message.data, flags);
    if has_missing_input {
        let raw = if last_known_input_idx.is_valid() {
            last_known_input_idx.as_u32()
        } else {
            0
        };
        ser::append_u32(&mut message.data, raw);
    }
    if has_index_shift {
        ser::append_i32(&mut message.data, index_shift);
    }
    ser::append_u32(&mut message.data, update_idx.as_u32());

    for entity_move in moves {
        ser::append_u64(&mut message.data, entity_move.network_entity_id.as_u64());
        ser::append_f32(&mut message.data, entity_move.position.x);
        ser::append_f32(&mut message.data, entity_move.position.y);
        ser::append_f32(&mut message.data, entity_move.direction.x);
        ser::append_f32(&mut message.data, entity_move.direction.y);
    }
    message
}

fn read_finite_f32(buf: &[u8], cursor: &mut usize) -> Result<f32, ProtocolErrorKind> {
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

/// Applies an `EntityMove` message on the client: feeds the timing shift
/// to the frame-time corrector (zero when absent) and hands the sorted
/// authoritative movement record to the rewinder for desync comparison.
///
/// # Errors
/// - Protocol errors for malformed payloads.
/// - [`NetcodeError::StaleUpdate`] when the reported update was already
///   trimmed; callers log and ignore that.
pub fn apply_moves_message<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    corrector: &mut FrameTimeCorrector,
    message: &Message,
) -> Result<(), NetcodeError> {
    let buf = &message.data;
    let mut cursor = Message::PAYLOAD_START_POS;

    let flags = ser::require(ser::read_u8(buf, &mut cursor), cursor, buf.len())?;
    let has_missing_input = flags & MOVES_FLAG_MISSING_INPUT != 0;
    let has_index_shift = flags & MOVES_FLAG_INDEX_SHIFT != 0;

    let mut _last_known_input = None;
    if has_missing_input {
        _last_known_input = Some(ser::require(
            ser::read_u32(buf, &mut cursor),
            cursor,
            buf.len(),
        )?);
    }

    let mut index_shift = 0;
    if has_index_shift {
        index_shift = ser::require(ser::read_i32(buf, &mut cursor), cursor, buf.len())?;
        tracing::debug!(index_shift, "timing shift requested");
    }
    corrector.update_index_shift(index_shift);

    let update_idx =
        UpdateIdx::new(ser::require(ser::read_u32(buf, &mut cursor), cursor, buf.len())?);

    let mut authoritative = MovementUpdateData::default();
    while cursor < buf.len() {
        let entity =
            NetworkEntityId::new(ser::require(ser::read_u64(buf, &mut cursor), cursor, buf.len())?);
        let x = read_finite_f32(buf, &mut cursor)?;
        let y = read_finite_f32(buf, &mut cursor)?;
        let direction_x = read_finite_f32(buf, &mut cursor)?;
        let direction_y = read_finite_f32(buf, &mut cursor)?;
        authoritative.add_move(EntityMove {
            network_entity_id: entity,
            position: Vec2::new(x, y),
            direction: Vec2::new(direction_x, direction_y),
        });
    }
    authoritative.sort_hashes();

    rewinder.apply_authoritative_moves(update_idx, authoritative)
}

// =============================================================================
// GameplayCommand
// =============================================================================

fn append_commands(
    buf: &mut Vec<u8>,
    commands: &[&GameplayCommand],
    receiver: crate::ConnectionId,
) -> Result<(), ProtocolErrorKind> {
    ser::append_u16_checked(buf, commands.len(), "command_count")?;
    for command in commands {
        ser::append_u16(buf, command.kind());
        command.server_serialize(buf, receiver);
    }
    Ok(())
}

/// Builds a `GameplayCommand` message for one client and one update:
/// external commands first, then the simulation-generated ones, each as
/// its kind tag plus payload.
///
/// # Errors
/// Range error if an update somehow produced more than 65 535 commands.
pub fn create_gameplay_commands_message(
    external: &[GameplayCommand],
    gameplay_generated: &[GameplayCommand],
    receiver: crate::ConnectionId,
    update_idx: UpdateIdx,
) -> Result<Message, NetcodeError> {
    let mut message = Message::new(MessageId::GameplayCommand);
    ser::append_u32(&mut message.data, update_idx.as_u32());
    let ordered: Vec<&GameplayCommand> =
        external.iter().chain(gameplay_generated.iter()).collect();
    append_commands(&mut message.data, &ordered, receiver).map_err(NetcodeError::from)?;
    Ok(message)
}

fn read_command_list(
    registry: &CommandRegistry,
    buf: &[u8],
    cursor: &mut usize,
) -> Result<(UpdateIdx, Vec<GameplayCommand>), NetcodeError> {
    let update_idx = UpdateIdx::new(ser::require(ser::read_u32(buf, cursor), *cursor, buf.len())?);
    let count = usize::from(ser::require(ser::read_u16(buf, cursor), *cursor, buf.len())?);
    let mut commands = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        commands.push(registry.deserialize(buf, cursor)?);
    }
    Ok((update_idx, commands))
}

/// Applies a `GameplayCommand` message on the client: replaces the
/// external command list of the named update, arming the desync flag if
/// the update was already simulated with different commands.
///
/// # Errors
/// Protocol errors (unknown kind tags, truncation) and
/// [`NetcodeError::StaleUpdate`] for trimmed updates.
pub fn apply_gameplay_commands_message<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    registry: &CommandRegistry,
    message: &Message,
) -> Result<(), NetcodeError> {
    let mut cursor = Message::PAYLOAD_START_POS;
    let (update_idx, commands) = read_command_list(registry, &message.data, &mut cursor)?;
    tracing::debug!(
        update = update_idx.as_u32(),
        count = commands.len(),
        "authoritative commands received"
    );
    rewinder.apply_authoritative_commands(update_idx, commands)
}

// =============================================================================
// WorldSnapshot
// =============================================================================

/// Builds the full-world replacement sent to a freshly accepted client:
/// one `CreatePlayerEntity` command per existing player, serialised for
/// `receiver` (so its own player, if any, carries the owner bit).
#[must_use]
pub fn create_world_snapshot_message<W: GameWorld>(
    world: &W,
    connections: &ServerConnections,
    update_idx: UpdateIdx,
    receiver: crate::ConnectionId,
) -> Message {
    let positions: std::collections::BTreeMap<NetworkEntityId, Vec2> = world
        .entity_moves()
        .into_iter()
        .map(|entity_move| (entity_move.network_entity_id, entity_move.position))
        .collect();

    let mut commands = Vec::new();
    for (connection, record) in connections.iter() {
        let Some(player_entity) = record.player_entity else {
            continue;
        };
        let Some(position) = positions.get(&player_entity) else {
            continue;
        };
        commands.push(GameplayCommand::create_player_server_side(
            *position,
            player_entity,
            connection,
        ));
    }

    let mut message = Message::new(MessageId::WorldSnapshot);
    ser::append_u32(&mut message.data, update_idx.as_u32());
    let refs: Vec<&GameplayCommand> = commands.iter().collect();
    // The command count is bounded by the connection count; the checked
    // append cannot fail in practice.
    let _ = append_commands(&mut message.data, &refs, receiver);
    message
}

/// Applies a `WorldSnapshot` on the client: despawns every networked
/// entity, then executes the snapshot's commands - against every stored
/// snapshot, so a subsequent rollback resimulates from the replaced world
/// rather than from a pre-snapshot one.
///
/// # Errors
/// Protocol errors for malformed payloads; the world is untouched then.
pub fn apply_world_snapshot_message<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    registry: &CommandRegistry,
    message: &Message,
) -> Result<(), NetcodeError> {
    let mut cursor = Message::PAYLOAD_START_POS;
    let (update_idx, commands) = read_command_list(registry, &message.data, &mut cursor)?;
    tracing::info!(
        update = update_idx.as_u32(),
        players = commands.len(),
        "applying world snapshot"
    );

    rewinder.overwrite_all_snapshots(|world| {
        world.despawn_all_networked();
        for command in &commands {
            command.execute(world);
        }
    });
    Ok(())
}

// #########
// # TESTS #
// #########
