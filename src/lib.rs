//! # Skirmish Netcode
//!
//! The netcode core of a two-dimensional client-server multiplayer action
//! game: the subsystem that keeps a server's authoritative simulation and
//! multiple clients' predicted simulations in agreement while the network
//! introduces delay, jitter, loss, and reordering.
//!
//! The crate is built from four cooperating pieces:
//!
//! - [`StateRewinder`] - a bounded ring of per-update world snapshots plus
//!   aligned input, movement, and gameplay-command histories.
//! - client prediction and [`reconciliation`] - running the client ahead of
//!   the server and resimulating from the first diverged update when an
//!   authoritative message disagrees with what was predicted.
//! - server input arbitration - ordering compressed client input streams,
//!   filling gaps deterministically, and publishing a timing-shift signal so
//!   clients can adjust their tick phase.
//! - the versioned wire protocol in [`network`] - connect, accept,
//!   disconnect, player input, entity moves, gameplay commands, and world
//!   snapshots.
//!
//! Everything else - rendering, audio, assets, the concrete entity
//! container - is an external collaborator. The core consumes an abstract
//! [`GameWorld`], a fixed-step [`clock`], and a datagram [`Transport`] that
//! preserves message boundaries.
//!
//! The simulation driven through the rewinder MUST be deterministic: given
//! the same previous snapshot, inputs, and commands, every peer must produce
//! byte-identical state. Desyncs are detected by comparing quantised
//! per-entity move hashes, not raw floats, so platform-specific float noise
//! below one world unit does not trigger rollbacks.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::{NetcodeError, ProtocolErrorKind};
pub use input::{FrameInput, KeyState, INPUT_AXIS_COUNT, INPUT_KEY_COUNT};
pub use rewinder::StateRewinder;
pub use sessions::client::ClientSession;
pub use sessions::server::ServerSession;
pub use transport::{MemoryTransport, Transport};
pub use world::{EntityMove, GameWorld, Simulation, Vec2};

pub mod clock;
pub mod commands;
pub mod connection;
pub mod error;
pub mod input;
pub mod reconciliation;
pub mod rewinder;
pub mod telemetry;
pub mod time_corrector;
pub mod transport;
pub mod world;

pub mod network {
    //! Wire protocol: primitive codec, compressed input windows, message
    //! framing, and one handler pair per message id.
    pub mod client_server;
    pub mod compressed_input;
    pub mod messages;
    pub mod serialization;
    pub mod server_client;
}

pub mod sessions {
    //! Role-specific fixed-step drivers built on top of the rewinder.
    pub mod client;
    pub mod server;
}

// #############
// # CONSTANTS #
// #############

/// Version of the wire protocol. Any change to any message layout, any
/// added or removed message, any change to a gameplay command's bytes, to
/// the input delta-compression scheme, or to the move-hash quantisation
/// requires bumping this number.
///
/// History:
/// - 0 - reserved invalid version
/// - 1 - initial version
/// - 2 - player entity created packet
/// - 3 - gameplay command packet, removed player entity created packet
pub const NETWORK_PROTOCOL_VERSION: u32 = 3;

/// Duration of one fixed simulation update, in microseconds (~60 Hz).
pub const ONE_FIXED_UPDATE_US: u64 = 16_000;

/// How many frames of input the client sends per update at most.
pub const MAX_INPUT_HISTORY_SEND_SIZE: usize = 10;

/// How many historical updates the client keeps around for rollback.
pub const STORED_HISTORY_MAX: u32 = 60;

/// Fixed updates without client traffic before the server pauses the
/// simulation (tolerates a developer breakpoint in a single client).
pub const SERVER_IDLE_PAUSE_UPDATES: u32 = 3;

/// Fixed updates without client traffic before the server shuts down
/// (about a minute at 60 Hz).
pub const SERVER_IDLE_QUIT_UPDATES: u32 = 3600;

/// Updates over which a reconciled position is smoothed on screen.
pub const INTERPOLATION_UPDATES: u32 = 12;

/// Position corrections larger than this many world units are smoothed
/// over [`INTERPOLATION_UPDATES`]; smaller differences are snapped
/// without smoothing.
pub const NO_INTERPOLATION_DISTANCE: f32 = 1.5;

/// Upper bound on how many fixed updates a single clock poll may yield;
/// prevents a death spiral when the host process stalls.
pub const MAX_TICKS_PER_POLL: u32 = 5;

/// Marks an unknown or unset update index.
pub const INVALID_UPDATE_IDX: u32 = u32::MAX;

// #############
// #   TYPES   #
// #############

/// Index of one fixed simulation update.
///
/// Update indices increase monotonically for the life of a game session;
/// wrap-around is not supported (a session must end before 2³² updates,
/// which is more than two years at 60 Hz). The sentinel
/// [`UpdateIdx::INVALID`] represents "unknown/unset".
///
/// # Examples
///
/// ```
/// use skirmish_netcode::UpdateIdx;
///
/// let u = UpdateIdx::new(41);
/// assert_eq!(u + 1, UpdateIdx::new(42));
/// assert!(u.is_valid());
/// assert!(!UpdateIdx::INVALID.is_valid());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct UpdateIdx(u32);

impl UpdateIdx {
    /// The invalid update index sentinel.
    pub const INVALID: UpdateIdx = UpdateIdx(INVALID_UPDATE_IDX);

    /// Wraps a raw index. The value is not validated; use
    /// [`is_valid`](UpdateIdx::is_valid) where the sentinel may occur.
    #[inline]
    #[must_use]
    pub const fn new(idx: u32) -> Self {
        UpdateIdx(idx)
    }

    /// Returns the raw index value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is the [`INVALID`](UpdateIdx::INVALID)
    /// sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != INVALID_UPDATE_IDX
    }

    /// The next update index.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        UpdateIdx(self.0 + 1)
    }

    /// The previous update index, or `None` at update zero.
    #[inline]
    #[must_use]
    pub const fn prev(self) -> Option<Self> {
        match self.0.checked_sub(1) {
            Some(v) => Some(UpdateIdx(v)),
            None => None,
        }
    }

    /// Subtraction that bottoms out at update zero.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u32) -> Self {
        UpdateIdx(self.0.saturating_sub(rhs))
    }

    /// `Some(self)` when valid, `None` for the sentinel.
    #[inline]
    #[must_use]
    pub const fn to_option(self) -> Option<Self> {
        if self.is_valid() {
            Some(self)
        } else {
            None
        }
    }
}

impl std::fmt::Display for UpdateIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "INVALID")
        }
    }
}

impl std::ops::Add<u32> for UpdateIdx {
    type Output = UpdateIdx;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        UpdateIdx(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for UpdateIdx {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<u32> for UpdateIdx {
    type Output = UpdateIdx;

    #[inline]
    fn sub(self, rhs: u32) -> Self::Output {
        UpdateIdx(self.0 - rhs)
    }
}

impl std::ops::Sub<UpdateIdx> for UpdateIdx {
    type Output = i64;

    #[inline]
    fn sub(self, rhs: UpdateIdx) -> Self::Output {
        i64::from(self.0) - i64::from(rhs.0)
    }
}

impl From<u32> for UpdateIdx {
    #[inline]
    fn from(value: u32) -> Self {
        UpdateIdx(value)
    }
}

impl From<UpdateIdx> for u32 {
    #[inline]
    fn from(idx: UpdateIdx) -> Self {
        idx.0
    }
}

impl PartialEq<u32> for UpdateIdx {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u32> for UpdateIdx {
    #[inline]
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A gameplay timestamp measured in fixed-update counts.
///
/// Convertible to and from update indices by addition; carried on the wire
/// inside key-state records so that "when did this key last flip" survives
/// rollback and resimulation unchanged.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct GameplayTimestamp(u32);

impl GameplayTimestamp {
    /// Wraps a raw fixed-update count.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        GameplayTimestamp(raw)
    }

    /// Returns the raw fixed-update count.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<UpdateIdx> for GameplayTimestamp {
    #[inline]
    fn from(idx: UpdateIdx) -> Self {
        GameplayTimestamp(idx.as_u32())
    }
}

/// Transport-local identifier of a connected peer, stable for the life of
/// the connection. Distinct from any [`NetworkEntityId`].
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct ConnectionId(u32);

impl ConnectionId {
    /// Reserved sentinel for "no connection".
    pub const INVALID: ConnectionId = ConnectionId(u32::MAX);

    /// Wraps a raw connection id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u32) -> Self {
        ConnectionId(raw)
    }

    /// Returns the raw connection id.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns `true` unless this is the reserved sentinel.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u32::MAX
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::INVALID
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "INVALID")
        }
    }
}

/// Server-issued identifier for an entity that must appear on multiple
/// peers. Monotonically increasing and unique across the session; clients
/// never mint these.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct NetworkEntityId(u64);

impl NetworkEntityId {
    /// Wraps a raw network entity id.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        NetworkEntityId(raw)
    }

    /// Returns the raw network entity id.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for NetworkEntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-owned mint for [`NetworkEntityId`]s.
#[derive(Debug, Clone, Default)]
pub struct NetworkEntityIdGenerator {
    next: u64,
}

impl NetworkEntityIdGenerator {
    /// Creates a generator starting at id zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next unique id.
    pub fn generate_next(&mut self) -> NetworkEntityId {
        let id = NetworkEntityId(self.next);
        self.next += 1;
        id
    }
}

/// Which end of the protocol a game instance is running as.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// The authoritative simulation.
    Server,
    /// A predicted simulation running ahead of the server.
    Client,
}

impl SessionRole {
    /// Returns `true` for the authoritative end.
    #[inline]
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, SessionRole::Server)
    }
}

// #############
// #  CONFIG   #
// #############

/// Runtime-tunable knobs of the netcode core.
///
/// Defaults match the reference deployment (60 Hz, one-second client
/// history, a ten-frame input window). The fixed update duration is
/// carried on the wire via the connect handshake, so differing deployments
/// stay compatible with themselves but not with each other.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct NetcodeConfig {
    /// Duration of one fixed update, in microseconds.
    pub one_update_us: u64,
    /// Window length for compressed input messages.
    pub max_input_history_send_size: usize,
    /// Client snapshot ring cap, in updates.
    pub stored_history_max: u32,
    /// Idle updates before the server pauses its simulation.
    pub server_idle_pause_updates: u32,
    /// Idle updates before the server exits.
    pub server_idle_quit_updates: u32,
    /// Updates to smooth a position reconciliation over.
    pub interpolation_updates: u32,
    /// World-unit displacement above which a correction is smoothed;
    /// smaller differences snap without smoothing.
    pub no_interpolation_distance: f32,
}

impl Default for NetcodeConfig {
    fn default() -> Self {
        Self {
            one_update_us: ONE_FIXED_UPDATE_US,
            max_input_history_send_size: MAX_INPUT_HISTORY_SEND_SIZE,
            stored_history_max: STORED_HISTORY_MAX,
            server_idle_pause_updates: SERVER_IDLE_PAUSE_UPDATES,
            server_idle_quit_updates: SERVER_IDLE_QUIT_UPDATES,
            interpolation_updates: INTERPOLATION_UPDATES,
            no_interpolation_distance: NO_INTERPOLATION_DISTANCE,
        }
    }
}

impl NetcodeConfig {
    /// Validates the configuration, returning the first violated constraint.
    ///
    /// # Errors
    /// Returns [`NetcodeError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), NetcodeError> {
        if self.one_update_us == 0 {
            return Err(NetcodeError::InvalidConfig {
                field: "one_update_us",
                reason: "must be non-zero",
            });
        }
        if self.max_input_history_send_size == 0 || self.max_input_history_send_size > 255 {
            return Err(NetcodeError::InvalidConfig {
                field: "max_input_history_send_size",
                reason: "must be in 1..=255 (the window length is sent as a u8)",
            });
        }
        if self.stored_history_max < 2 {
            return Err(NetcodeError::InvalidConfig {
                field: "stored_history_max",
                reason: "must be at least 2 to allow any rollback",
            });
        }
        if !self.no_interpolation_distance.is_finite() || self.no_interpolation_distance <= 0.0 {
            return Err(NetcodeError::InvalidConfig {
                field: "no_interpolation_distance",
                reason: "must be a positive finite distance",
            });
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod update_idx_tests {
    use super::*;

    #[test]
    fn new_roundtrips_raw_value() {
        let u = UpdateIdx::new(7);
        assert_eq!(u.as_u32(), 7);
        assert!(u.is_valid());
    }

    #[test]
    fn invalid_sentinel_is_not_valid() {
        assert!(!UpdateIdx::INVALID.is_valid());
        assert_eq!(UpdateIdx::INVALID.to_option(), None);
        assert_eq!(format!("{}", UpdateIdx::INVALID), "INVALID");
    }

    #[test]
    fn next_and_prev_are_inverse() {
        let u = UpdateIdx::new(10);
        assert_eq!(u.next().prev(), Some(u));
        assert_eq!(UpdateIdx::new(0).prev(), None);
    }

    #[test]
    fn ordering_matches_raw() {
        assert!(UpdateIdx::new(5) < UpdateIdx::new(6));
        assert!(UpdateIdx::new(5) < 6);
        assert_eq!(UpdateIdx::new(5), 5);
    }

    #[test]
    fn signed_difference() {
        assert_eq!(UpdateIdx::new(5) - UpdateIdx::new(8), -3);
        assert_eq!(UpdateIdx::new(8) - UpdateIdx::new(5), 3);
    }

    #[test]
    fn saturating_sub_stops_at_zero() {
        assert_eq!(UpdateIdx::new(3).saturating_sub(10), UpdateIdx::new(0));
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(NetcodeConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_update_duration_rejected() {
        let config = NetcodeConfig {
            one_update_us: 0,
            ..NetcodeConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(NetcodeError::InvalidConfig {
                field: "one_update_us",
                ..
            })
        ));
    }

    #[test]
    fn oversized_input_window_rejected() {
        let config = NetcodeConfig {
            max_input_history_send_size: 300,
            ..NetcodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_history_rejected() {
        let config = NetcodeConfig {
            stored_history_max: 1,
            ..NetcodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}

#[cfg(test)]
mod id_tests {
    use super::*;

    #[test]
    fn connection_id_sentinel() {
        assert!(!ConnectionId::INVALID.is_valid());
        assert!(ConnectionId::new(0).is_valid());
        assert_eq!(format!("{}", ConnectionId::INVALID), "INVALID");
        assert_eq!(format!("{}", ConnectionId::new(3)), "3");
    }

    #[test]
    fn entity_id_generator_is_monotonic() {
        let mut generator = NetworkEntityIdGenerator::new();
        let a = generator.generate_next();
        let b = generator.generate_next();
        let c = generator.generate_next();
        assert!(a < b && b < c);
        assert_eq!(a.as_u64(), 0);
    }

    #[test]
    fn timestamp_from_update_idx() {
        let ts = GameplayTimestamp::from(UpdateIdx::new(99));
        assert_eq!(ts.as_u32(), 99);
    }
}
