//! Client → server messages: `Connect` and `PlayerInput`.
//!
//! The `PlayerInput` apply path is the server's input arbitrator: it
//! orders the compressed input stream, drops stale and far-future windows,
//! fills receive-order gaps deterministically, and recomputes the
//! connection's timing shift from *every* arriving message - stale ones
//! included, since the shift is exactly what tells the client to stop
//! being stale.

use crate::connection::ServerConnections;
use crate::network::compressed_input;
use crate::network::messages::{Message, MessageId};
use crate::network::serialization as ser;
use crate::rewinder::StateRewinder;
use crate::{
    ConnectionId, GameWorld, NetcodeConfig, NetcodeError, UpdateIdx, NETWORK_PROTOCOL_VERSION,
};

/// How far ahead of the server's current update an input window may claim
/// to be before it is discarded as clock skew (or a buggy client).
pub const MAX_INPUT_UPDATES_AHEAD: u32 = 10;

/// Updates of input headroom the server wants in hand: one lost packet is
/// then invisible to the simulation.
pub const IDEAL_INPUT_HEADROOM: u32 = 2;

/// The parsed fields of a `Connect` message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// The protocol version the client speaks.
    pub client_protocol_version: u32,
    /// The client's wall-clock timestamp at send, microseconds. Echoed
    /// back verbatim in the accept so the client can measure round-trip
    /// time.
    pub client_timestamp_us: u64,
}

/// Builds a `Connect` message carrying this build's protocol version and
/// the client's current timestamp.
#[must_use]
pub fn create_connect_message(timestamp_now_us: u64) -> Message {
    let mut message = Message::new(MessageId::Connect);
    ser::append_u32(&mut message.data, NETWORK_PROTOCOL_VERSION);
    ser::append_u64(&mut message.data, timestamp_now_us);
    message
}

/// Parses a `Connect` message. Version checking is the caller's decision,
/// not the parser's.
///
/// # Errors
/// Protocol error on truncation.
pub fn apply_connect_message(message: &Message) -> Result<ConnectRequest, NetcodeError> {
    let buf = &message.data;
    let mut cursor = Message::PAYLOAD_START_POS;
    let client_protocol_version =
        ser::require(ser::read_u32(buf, &mut cursor), cursor, buf.len())?;
    let client_timestamp_us = ser::require(ser::read_u64(buf, &mut cursor), cursor, buf.len())?;
    Ok(ConnectRequest {
        client_protocol_version,
        client_timestamp_us,
    })
}

/// Builds the client's `PlayerInput` message: the newest
/// `max_input_history_send_size` inputs, delta-compressed, ending at the
/// input for the *next* update (which the client samples before
/// simulating it).
///
/// # Errors
/// Propagates encoding range errors (window length over 255).
pub fn create_player_input_message<W: GameWorld>(
    rewinder: &StateRewinder<W>,
    config: &NetcodeConfig,
) -> Result<Message, NetcodeError> {
    let last_input_update_idx = rewinder.current_update_idx().next();
    let window = rewinder.last_inputs(config.max_input_history_send_size, last_input_update_idx);

    let mut message = Message::new(MessageId::PlayerInput);
    ser::append_u32(&mut message.data, last_input_update_idx.as_u32());
    ser::append_u8_checked(&mut message.data, window.len(), "input_count")
        .map_err(NetcodeError::from)?;
    compressed_input::append_input_history(&mut message.data, &window)
        .map_err(NetcodeError::from)?;
    Ok(message)
}

/// Applies a received `PlayerInput` message for `connection` - the input
/// arbitration path.
///
/// Windows that end at or before the server's current update are stale and
/// contribute nothing but the timing-shift recomputation; windows claiming
/// more than [`MAX_INPUT_UPDATES_AHEAD`] updates of lead are discarded the
/// same way. Everything else lands in the rewinder, with receive-order
/// gaps filled by repeating the connection's last known input.
///
/// # Errors
/// - [`NetcodeError::UnknownConnection`] when no `Connect` preceded the
///   input; the caller ignores the message.
/// - Protocol errors for malformed windows; the caller disconnects the
///   sender.
pub fn apply_player_input_message<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    connections: &mut ServerConnections,
    message: &Message,
    connection: ConnectionId,
) -> Result<(), NetcodeError> {
    if !connections.contains(connection) {
        return Err(NetcodeError::UnknownConnection { connection });
    }

    let buf = &message.data;
    let mut cursor = Message::PAYLOAD_START_POS;
    let last_input_update_idx =
        UpdateIdx::new(ser::require(ser::read_u32(buf, &mut cursor), cursor, buf.len())?);
    let count = usize::from(ser::require(ser::read_u8(buf, &mut cursor), cursor, buf.len())?);

    let server_now = rewinder.current_update_idx();
    let has_new_input = last_input_update_idx > server_now;
    let from_far_future =
        last_input_update_idx > server_now + MAX_INPUT_UPDATES_AHEAD;

    if has_new_input && !from_far_future {
        let window = compressed_input::read_input_history(buf, count, &mut cursor)
            .map_err(NetcodeError::from)?;

        let count_u32 = u32::try_from(count).unwrap_or(u32::MAX);
        let first_received = last_input_update_idx.saturating_sub(count_u32.saturating_sub(1));
        // Updates at or before server_now were already simulated; start
        // from the newer of the two. Gaps between the connection's last
        // known input and the first stored update fill with repetition
        // inside the rewinder.
        let mut update = std::cmp::max(first_received, server_now.next());
        while update <= last_input_update_idx {
            let offset = usize::try_from(update.as_u32() - first_received.as_u32())
                .unwrap_or(usize::MAX);
            if let Some(input) = window.get(offset) {
                rewinder.add_player_input(connection, update, *input)?;
            }
            update += 1;
        }
        if let Some(record) = connections.get_mut(connection) {
            record.last_input_update_idx = rewinder.last_known_input_update_for(connection);
        }
        tracing::debug!(
            connection = connection.as_u32(),
            last_input = last_input_update_idx.as_u32(),
            server_now = server_now.as_u32(),
            "stored input window"
        );
    } else {
        tracing::debug!(
            connection = connection.as_u32(),
            last_input = last_input_update_idx.as_u32(),
            server_now = server_now.as_u32(),
            "ignoring stale or far-future input window"
        );
    }

    // Recomputed from every message: the shift is the signal that lets the
    // client correct exactly the condition that made this message stale.
    let ideal_last_input = server_now + IDEAL_INPUT_HEADROOM;
    let shift = (last_input_update_idx - ideal_last_input)
        .clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
    if let Some(record) = connections.get_mut(connection) {
        record.index_shift = shift;
    }
    Ok(())
}

// #########
// # TESTS #
// #########
