//! Wire-level properties: codec round trips, command execution parity
//! between server and client, and the protocol version gate.

mod common;

use common::stubs::StubWorld;
use skirmish_netcode::commands::{CommandRegistry, GameplayCommand};
use skirmish_netcode::input::KEY_SHOOT;
use skirmish_netcode::network::compressed_input::{append_input_history, read_input_history};
use skirmish_netcode::network::serialization as ser;
use skirmish_netcode::{
    ConnectionId, FrameInput, GameWorld, GameplayTimestamp, NetworkEntityId, Vec2,
    MAX_INPUT_HISTORY_SEND_SIZE, NETWORK_PROTOCOL_VERSION,
};

fn sample_window() -> Vec<FrameInput> {
    let mut window = Vec::new();
    for frame in 0..MAX_INPUT_HISTORY_SEND_SIZE {
        let mut input = FrameInput::default();
        input.set_axis_value(0, if frame < 4 { 1.0 } else { 0.0 });
        input.set_axis_value(1, -0.25);
        input.update_key(
            KEY_SHOOT,
            frame >= 6,
            GameplayTimestamp::new(frame as u32),
        );
        window.push(input);
    }
    window
}

/// P2: decode(encode(w)) == w for a full-size window.
#[test]
fn input_window_roundtrip() {
    let window = sample_window();
    let mut buf = Vec::new();
    append_input_history(&mut buf, &window).unwrap();

    let mut cursor = 0;
    let decoded = read_input_history(&buf, window.len(), &mut cursor).unwrap();
    assert_eq!(decoded.as_slice(), window.as_slice());
    assert_eq!(cursor, buf.len());
}

/// The compressed form beats the raw form for a typical window.
#[test]
fn input_window_actually_compresses() {
    let window = sample_window();
    let mut buf = Vec::new();
    append_input_history(&mut buf, &window).unwrap();
    // Raw: 10 frames x (2 axes x 4 bytes + 1 key x 5 bytes) = 130 bytes.
    assert!(buf.len() < 130, "compressed {} bytes", buf.len());
}

/// P3: a command round-tripped through serialisation produces the same
/// world delta on the client as the server's local execution.
#[test]
fn command_execution_parity() {
    let owner = ConnectionId::new(4);
    let commands = [
        GameplayCommand::create_player_server_side(
            Vec2::new(80.0, 202.0),
            NetworkEntityId::new(11),
            owner,
        ),
        GameplayCommand::CreateProjectile {
            position: Vec2::new(10.0, 20.0),
            direction: Vec2::new(0.0, -1.0),
            speed: 3.0,
            network_entity_id: NetworkEntityId::new(12),
            owner_network_entity_id: NetworkEntityId::new(11),
        },
    ];
    let registry = CommandRegistry::with_builtin_commands();

    for command in &commands {
        let mut server_world = StubWorld::default();
        command.execute(&mut server_world);

        let mut buf = Vec::new();
        ser::append_u16(&mut buf, command.kind());
        command.server_serialize(&mut buf, owner);
        let mut cursor = 0;
        let decoded = registry.deserialize(&buf, &mut cursor).unwrap();
        assert_eq!(cursor, buf.len());

        let mut client_world = StubWorld::default();
        decoded.execute(&mut client_world);

        // Identical entity set: ids, positions, directions.
        assert_eq!(server_world.entity_moves(), client_world.entity_moves());
    }
}

/// The owner bit is receiver-dependent and the owning connection never
/// crosses the wire.
#[test]
fn command_ownership_is_per_receiver() {
    let owner = ConnectionId::new(4);
    let command = GameplayCommand::create_player_server_side(
        Vec2::new(80.0, 202.0),
        NetworkEntityId::new(11),
        owner,
    );
    let registry = CommandRegistry::with_builtin_commands();

    let decode_for = |receiver: ConnectionId| {
        let mut buf = Vec::new();
        ser::append_u16(&mut buf, command.kind());
        command.server_serialize(&mut buf, receiver);
        let mut cursor = 0;
        registry.deserialize(&buf, &mut cursor).unwrap()
    };

    let mut owned_world = StubWorld::default();
    decode_for(owner).execute(&mut owned_world);
    assert_eq!(
        owned_world.local_player_entity(),
        Some(NetworkEntityId::new(11))
    );

    let mut other_world = StubWorld::default();
    decode_for(ConnectionId::new(9)).execute(&mut other_world);
    assert_eq!(other_world.local_player_entity(), None);
}

/// P4: the protocol version is 3 and rides the connect handshake.
#[test]
fn protocol_version_is_three() {
    assert_eq!(NETWORK_PROTOCOL_VERSION, 3);
    let message = skirmish_netcode::network::client_server::create_connect_message(0);
    let mut cursor = skirmish_netcode::network::messages::Message::PAYLOAD_START_POS;
    assert_eq!(ser::read_u32(&message.data, &mut cursor), Some(3));
}

/// Scenario: key groups ending at [3, 3, 10] fail the tiling check.
#[test]
fn non_tiling_window_is_rejected() {
    let mut buf = Vec::new();
    ser::append_u8(&mut buf, 0); // no non-zero axes
    for end in [3u8, 3, 10] {
        ser::append_u8(&mut buf, end);
        ser::append_u8(&mut buf, 0); // Inactive
        ser::append_u32(&mut buf, 0);
    }
    let mut cursor = 0;
    let result = read_input_history(&buf, 10, &mut cursor);
    assert!(result.is_err(), "non-monotonic tiling must be rejected");
}
