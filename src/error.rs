//! Error types for the netcode core.
//!
//! Errors are structured data, not strings: every variant stores the numeric
//! context of the failure directly, so construction is allocation-free on
//! hot paths and callers can match on specific cases. Messages are only
//! formatted lazily, in the `Display` impls.
//!
//! Three families of failure are distinguished (and must stay
//! distinguished, because their handling differs):
//!
//! - **Protocol errors** ([`ProtocolErrorKind`]) - malformed wire bytes.
//!   The offending connection is disconnected; no other connection is
//!   affected, and the process never aborts.
//! - **Logic-precondition violations** (`NonSequentialUpdate`,
//!   `FutureUpdate`, trim refusals) - programmer errors surfaced as
//!   structured errors; the telemetry layer additionally aborts in debug
//!   builds.
//! - **Stale-data conditions** (`StaleUpdate`) - recoverable; higher layers
//!   decide whether to ignore or reconnect.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{ConnectionId, UpdateIdx};

/// Why decoding a wire payload failed.
///
/// All variants describe data received from the network, never local state;
/// the remedy is always the same (disconnect the sender with `Unknown`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ProtocolErrorKind {
    /// The payload ended before a fixed-width field could be read.
    TruncatedPayload {
        /// Cursor position at which the read was attempted.
        cursor: usize,
        /// Total payload length.
        payload_len: usize,
    },
    /// A float field carried a NaN or infinite bit pattern.
    NonFiniteFloat {
        /// Cursor position of the offending field.
        cursor: usize,
    },
    /// A value did not fit the narrower wire field it was written to.
    ValueOutOfRange {
        /// Name of the field.
        field: &'static str,
    },
    /// A gameplay command carried an unregistered kind tag.
    UnknownCommandKind {
        /// The tag that was received.
        kind: u16,
    },
    /// The message id did not name any known message.
    UnknownMessageId {
        /// The id that was received.
        id: u32,
    },
    /// A compressed input window's key groups did not tile the window:
    /// an end-frame index went backwards or past the window length.
    InputWindowTiling {
        /// Index of the key whose groups were malformed.
        key_index: usize,
        /// The end-frame index that broke the tiling.
        end_frame: usize,
        /// The window length the groups had to tile exactly.
        window_len: usize,
    },
    /// A key state byte was not one of the four known states.
    UnknownKeyState {
        /// The state code that was received.
        code: u8,
    },
}

impl Display for ProtocolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TruncatedPayload {
                cursor,
                payload_len,
            } => {
                write!(
                    f,
                    "payload truncated: read at cursor {} but payload is {} bytes",
                    cursor, payload_len
                )
            },
            Self::NonFiniteFloat { cursor } => {
                write!(f, "non-finite float at cursor {}", cursor)
            },
            Self::ValueOutOfRange { field } => {
                write!(f, "value of field '{}' does not fit its wire width", field)
            },
            Self::UnknownCommandKind { kind } => {
                write!(f, "unknown gameplay command kind {}", kind)
            },
            Self::UnknownMessageId { id } => {
                write!(f, "unknown message id {}", id)
            },
            Self::InputWindowTiling {
                key_index,
                end_frame,
                window_len,
            } => {
                write!(
                    f,
                    "input window key {} groups do not tile the window: end frame {} for window of {}",
                    key_index, end_frame, window_len
                )
            },
            Self::UnknownKeyState { code } => {
                write!(f, "unknown key state code {}", code)
            },
        }
    }
}

/// All errors the netcode core can return. Most fallible API functions
/// return `Result<_, NetcodeError>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NetcodeError {
    /// The requested update has already been trimmed from the history.
    ///
    /// Recoverable: the caller may ignore the data or reconnect.
    StaleUpdate {
        /// The update that was requested.
        requested: UpdateIdx,
        /// The oldest update still stored.
        first_stored: UpdateIdx,
    },
    /// The requested update has not been simulated yet.
    FutureUpdate {
        /// The update that was requested.
        requested: UpdateIdx,
        /// The current update of the rewinder.
        current: UpdateIdx,
    },
    /// An advance skipped or repeated an update index. The rewinder only
    /// ever moves to `current + 1`.
    NonSequentialUpdate {
        /// The update that was requested.
        requested: UpdateIdx,
        /// The current update of the rewinder.
        current: UpdateIdx,
    },
    /// Trimming would discard updates that are still required for
    /// reconciliation.
    WouldTrimConfirmed {
        /// The first update the caller asked to keep.
        requested_first_kept: UpdateIdx,
        /// The first update the rewinder still needs.
        first_required: UpdateIdx,
    },
    /// Rewinding here would cross an update whose moves were confirmed by
    /// the server; confirmed snapshots are never resimulated.
    WouldRewindConfirmed {
        /// The update the caller asked to rewind to.
        requested: UpdateIdx,
        /// The last server-confirmed update.
        last_confirmed: UpdateIdx,
    },
    /// The referenced connection does not exist (never connected, or
    /// already removed).
    UnknownConnection {
        /// The connection that was referenced.
        connection: ConnectionId,
    },
    /// Malformed data received from the network.
    Protocol {
        /// What exactly was malformed.
        kind: ProtocolErrorKind,
    },
    /// A configuration value violates its constraint.
    InvalidConfig {
        /// Name of the offending field.
        field: &'static str,
        /// The violated constraint.
        reason: &'static str,
    },
}

impl Display for NetcodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StaleUpdate {
                requested,
                first_stored,
            } => {
                write!(
                    f,
                    "update {} is stale: oldest stored update is {}",
                    requested, first_stored
                )
            },
            Self::FutureUpdate { requested, current } => {
                write!(
                    f,
                    "update {} is in the future: current update is {}",
                    requested, current
                )
            },
            Self::NonSequentialUpdate { requested, current } => {
                write!(
                    f,
                    "non-sequential advance to update {}: current update is {}",
                    requested, current
                )
            },
            Self::WouldTrimConfirmed {
                requested_first_kept,
                first_required,
            } => {
                write!(
                    f,
                    "trimming to {} would discard required updates (first required: {})",
                    requested_first_kept, first_required
                )
            },
            Self::WouldRewindConfirmed {
                requested,
                last_confirmed,
            } => {
                write!(
                    f,
                    "rewinding to {} would cross server-confirmed update {}",
                    requested, last_confirmed
                )
            },
            Self::UnknownConnection { connection } => {
                write!(f, "unknown connection {}", connection)
            },
            Self::Protocol { kind } => {
                write!(f, "protocol error: {}", kind)
            },
            Self::InvalidConfig { field, reason } => {
                write!(f, "invalid configuration '{}': {}", field, reason)
            },
        }
    }
}

impl Error for NetcodeError {}

impl From<ProtocolErrorKind> for NetcodeError {
    fn from(kind: ProtocolErrorKind) -> Self {
        Self::Protocol { kind }
    }
}
