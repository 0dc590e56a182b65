//! Per-frame player input.
//!
//! A [`FrameInput`] is a fixed-size, trivially copyable record of one
//! player's input for one fixed update: a small array of analog axis values
//! and an array of key states with the timestamp of each key's last flip.
//! Identical records on server and client are a precondition for
//! deterministic resimulation, so the record has full `PartialEq` and a
//! zeroed `Default` that doubles as the "no input" value.

use crate::GameplayTimestamp;

/// Number of analog axes carried per frame (horizontal and vertical
/// movement).
pub const INPUT_AXIS_COUNT: usize = 2;

/// Number of digital keys carried per frame.
pub const INPUT_KEY_COUNT: usize = 1;

/// Index of the horizontal movement axis.
pub const AXIS_MOVE_HORIZONTAL: usize = 0;
/// Index of the vertical movement axis.
pub const AXIS_MOVE_VERTICAL: usize = 1;
/// Index of the shoot key.
pub const KEY_SHOOT: usize = 0;

/// State of one digital key within a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum KeyState {
    /// The key is up and was up last frame.
    #[default]
    Inactive = 0,
    /// The key went down this frame.
    JustActivated = 1,
    /// The key is down and was down last frame.
    Active = 2,
    /// The key went up this frame.
    JustDeactivated = 3,
}

impl KeyState {
    /// The stable wire code of this state.
    #[inline]
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Decodes a wire code, `None` for unknown codes.
    #[inline]
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Inactive),
            1 => Some(Self::JustActivated),
            2 => Some(Self::Active),
            3 => Some(Self::JustDeactivated),
            _ => None,
        }
    }

    /// Whether the key is held this frame (just pressed or still down).
    #[inline]
    #[must_use]
    pub const fn is_pressed(self) -> bool {
        matches!(self, Self::JustActivated | Self::Active)
    }
}

/// State and last-flip time of one key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct KeyInfo {
    /// The key's state this frame.
    pub state: KeyState,
    /// When the key last changed between pressed and released.
    pub last_flip_time: GameplayTimestamp,
}

/// One player's input for one fixed update.
///
/// The zeroed [`Default`] value represents "no input" and is also what
/// prediction falls back to before any real input is known.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct FrameInput {
    axes: [f32; INPUT_AXIS_COUNT],
    keys: [KeyInfo; INPUT_KEY_COUNT],
}

impl FrameInput {
    /// Returns the value of an axis, zero for out-of-range indices.
    #[inline]
    #[must_use]
    pub fn axis_value(&self, axis: usize) -> f32 {
        self.axes.get(axis).copied().unwrap_or(0.0)
    }

    /// Sets the value of an axis. Out-of-range indices are ignored.
    #[inline]
    pub fn set_axis_value(&mut self, axis: usize, value: f32) {
        if let Some(slot) = self.axes.get_mut(axis) {
            *slot = value;
        }
    }

    /// Returns the full key record, the default for out-of-range indices.
    #[inline]
    #[must_use]
    pub fn key_info(&self, key: usize) -> KeyInfo {
        self.keys.get(key).copied().unwrap_or_default()
    }

    /// Overwrites a key record wholesale (decode path). Out-of-range
    /// indices are ignored.
    #[inline]
    pub fn set_key_info(&mut self, key: usize, info: KeyInfo) {
        if let Some(slot) = self.keys.get_mut(key) {
            *slot = info;
        }
    }

    /// Transitions a key toward `pressed`, updating the edge state and the
    /// flip timestamp when the pressed-ness actually changes.
    pub fn update_key(&mut self, key: usize, pressed: bool, now: GameplayTimestamp) {
        let Some(slot) = self.keys.get_mut(key) else {
            return;
        };
        let was_pressed = slot.state.is_pressed();
        slot.state = match (was_pressed, pressed) {
            (false, true) => KeyState::JustActivated,
            (true, true) => KeyState::Active,
            (true, false) => KeyState::JustDeactivated,
            (false, false) => KeyState::Inactive,
        };
        if was_pressed != pressed {
            slot.last_flip_time = now;
        }
    }

    /// Whether the key went down this frame.
    #[inline]
    #[must_use]
    pub fn is_key_just_activated(&self, key: usize) -> bool {
        self.key_info(key).state == KeyState::JustActivated
    }

    /// Whether the key is held this frame.
    #[inline]
    #[must_use]
    pub fn is_key_active(&self, key: usize) -> bool {
        self.key_info(key).state.is_pressed()
    }
}

// #########
// # TESTS #
// #########
