//! Delta-compressed player input windows.
//!
//! A window of up to [`MAX_INPUT_HISTORY_SEND_SIZE`] consecutive
//! [`FrameInput`]s, oldest first, is compressed with two observations:
//!
//! - most axes are zero in most frames, so only axes that are non-zero in
//!   *any* frame of the window are transmitted (each with its full value
//!   run), and
//! - keys change state far less often than once per frame, so per key the
//!   window is sent as run-length groups of identical
//!   `(state, last_flip_time)` pairs.
//!
//! A typical ten-frame window of one player's input fits in 20–50 bytes
//! against ~130 bytes raw.
//!
//! Decoders MUST reject a window whose key groups do not tile
//! `[0, window_len)` exactly - an end-frame index that fails to advance, or
//! that runs past the window, is a protocol error and disconnects the
//! sender.

use smallvec::SmallVec;

use crate::error::ProtocolErrorKind;
use crate::input::{KeyInfo, KeyState, INPUT_AXIS_COUNT, INPUT_KEY_COUNT};
use crate::network::serialization as ser;
use crate::{FrameInput, GameplayTimestamp, MAX_INPUT_HISTORY_SEND_SIZE};

/// An input window as produced by [`read_input_history`]; sized for the
/// send window so decoding never touches the heap.
pub type InputWindow = SmallVec<[FrameInput; MAX_INPUT_HISTORY_SEND_SIZE]>;

/// Appends the delta-compressed encoding of `window` (oldest first).
///
/// # Errors
/// Returns [`ProtocolErrorKind::ValueOutOfRange`] if the window is longer
/// than 255 frames; callers keep windows at
/// [`MAX_INPUT_HISTORY_SEND_SIZE`].
pub fn append_input_history(
    buf: &mut Vec<u8>,
    window: &[FrameInput],
) -> Result<(), ProtocolErrorKind> {
    if window.len() > usize::from(u8::MAX) {
        return Err(ProtocolErrorKind::ValueOutOfRange {
            field: "input_window_len",
        });
    }

    // Axes that are non-zero in at least one frame of the window.
    let mut axis_used = [false; INPUT_AXIS_COUNT];
    for input in window {
        for (axis, used) in axis_used.iter_mut().enumerate() {
            *used |= input.axis_value(axis) != 0.0;
        }
    }

    let used_count = axis_used.iter().filter(|used| **used).count();
    ser::append_u8_checked(buf, used_count, "non_zero_axis_count")?;

    for (axis, used) in axis_used.iter().enumerate() {
        if !*used {
            continue;
        }
        ser::append_u8_checked(buf, axis, "axis_index")?;
        for input in window {
            ser::append_f32(buf, input.axis_value(axis));
        }
    }

    // Per key, run-length groups of identical (state, last_flip) pairs.
    // Each group is written as its exclusive end frame followed by the
    // shared pair; the groups tile the window exactly.
    for key in 0..INPUT_KEY_COUNT {
        let mut frame = 0;
        while frame < window.len() {
            let info = window[frame].key_info(key);
            let mut end = frame + 1;
            while end < window.len() && window[end].key_info(key) == info {
                end += 1;
            }
            ser::append_u8_checked(buf, end, "key_group_end")?;
            ser::append_u8(buf, info.state.code());
            ser::append_u32(buf, info.last_flip_time.as_u32());
            frame = end;
        }
    }

    Ok(())
}

/// Decodes a window of `window_len` frames at `cursor`, advancing it past
/// the consumed bytes.
///
/// Axes not listed in the stream decode as zero.
///
/// # Errors
/// - [`ProtocolErrorKind::TruncatedPayload`] if the stream ends early.
/// - [`ProtocolErrorKind::InputWindowTiling`] if a key's groups fail to
///   tile `[0, window_len)` exactly.
/// - [`ProtocolErrorKind::UnknownKeyState`] for an unrecognised state code.
/// - [`ProtocolErrorKind::ValueOutOfRange`] for an axis index outside the
///   compiled-in axis count.
pub fn read_input_history(
    buf: &[u8],
    window_len: usize,
    cursor: &mut usize,
) -> Result<InputWindow, ProtocolErrorKind> {
    let mut window: InputWindow = SmallVec::new();
    window.resize(window_len, FrameInput::default());

    let used_count = ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())?;

    for _ in 0..used_count {
        let axis = usize::from(ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())?);
        if axis >= INPUT_AXIS_COUNT {
            return Err(ProtocolErrorKind::ValueOutOfRange { field: "axis_index" });
        }
        for input in window.iter_mut() {
            let before = *cursor;
            let value = match ser::read_f32(buf, cursor) {
                Some(value) => value,
                // An untouched cursor means the stream ended; an advanced
                // one means the field was present but non-finite.
                None if *cursor == before => {
                    return Err(ProtocolErrorKind::TruncatedPayload {
                        cursor: before,
                        payload_len: buf.len(),
                    });
                },
                None => {
                    return Err(ProtocolErrorKind::NonFiniteFloat { cursor: before });
                },
            };
            input.set_axis_value(axis, value);
        }
    }

    for key in 0..INPUT_KEY_COUNT {
        let mut next_frame = 0;
        while next_frame < window_len {
            let end_frame =
                usize::from(ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())?);
            let state_code = ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())?;
            let flip_raw = ser::require(ser::read_u32(buf, cursor), *cursor, buf.len())?;

            if end_frame <= next_frame || end_frame > window_len {
                return Err(ProtocolErrorKind::InputWindowTiling {
                    key_index: key,
                    end_frame,
                    window_len,
                });
            }
            let state = KeyState::from_code(state_code)
                .ok_or(ProtocolErrorKind::UnknownKeyState { code: state_code })?;
            let info = KeyInfo {
                state,
                last_flip_time: GameplayTimestamp::new(flip_raw),
            };

            for input in &mut window[next_frame..end_frame] {
                input.set_key_info(key, info);
            }
            next_frame = end_frame;
        }
    }

    Ok(window)
}

// #########
// # TESTS #
// #########


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_key_state() -> impl Strategy<Value = KeyState> {
        prop_oneof![
            Just(KeyState::Inactive),
            Just(KeyState::JustActivated),
            Just(KeyState::Active),
            Just(KeyState::JustDeactivated),
        ]
    }

    fn arb_frame_input() -> impl Strategy<Value = FrameInput> {
        (
            -1.0f32..=1.0,
            -1.0f32..=1.0,
            arb_key_state(),
            any::<u32>(),
        )
            .prop_map(|(horizontal, vertical, state, flip)| {
                let mut input = FrameInput::default();
                input.set_axis_value(0, horizontal);
                input.set_axis_value(1, vertical);
                input.set_key_info(
                    0,
                    KeyInfo {
                        state,
                        last_flip_time: GameplayTimestamp::new(flip),
                    },
                );
                input
            })
    }

    proptest! {
        /// Decode inverts encode for any window up to the send size.
        #[test]
        fn prop_roundtrip(window in proptest::collection::vec(
            arb_frame_input(),
            0..=MAX_INPUT_HISTORY_SEND_SIZE,
        )) {
            let mut buf = Vec::new();
            append_input_history(&mut buf, &window).unwrap();
            let mut cursor = 0;
            let decoded = read_input_history(&buf, window.len(), &mut cursor).unwrap();
            prop_assert_eq!(decoded.as_slice(), window.as_slice());
            prop_assert_eq!(cursor, buf.len());
        }

        /// Encoding is deterministic.
        #[test]
        fn prop_deterministic(window in proptest::collection::vec(
            arb_frame_input(),
            1..=MAX_INPUT_HISTORY_SEND_SIZE,
        )) {
            let mut first = Vec::new();
            let mut second = Vec::new();
            append_input_history(&mut first, &window).unwrap();
            append_input_history(&mut second, &window).unwrap();
            prop_assert_eq!(first, second);
        }
    }
}
