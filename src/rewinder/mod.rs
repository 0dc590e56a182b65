//! The state rewinder: single authority for all per-update data.
//!
//! The rewinder owns a bounded ring of world snapshots - one per simulated
//! update - plus update-aligned histories of player inputs, entity moves,
//! and gameplay commands. Everything the simulation consumes for an update
//! and everything it produced during that update flows through here, which
//! is what makes rewinding and resimulating possible at all.
//!
//! # Invariants
//!
//! - The rewinder always owns at least one snapshot; `current` points
//!   inside the ring.
//! - Snapshots are contiguous: one exists for every update in
//!   `[first_stored, current]`.
//! - A snapshot whose moves were confirmed by the server is never
//!   resimulated; rewinding past it is refused.
//! - `last_confirmed_client_update <= current`, and the first desynced
//!   update (when set) is strictly greater than the last confirmed one.
//! - Data for updates before `first_stored` is unrecoverable; addressing
//!   it yields [`NetcodeError::StaleUpdate`].
//!
//! Contract breaches (non-sequential advances, rewinds into the future)
//! return structured errors *and* report a telemetry violation, which
//! aborts in debug builds.
//!
//! # Snapshot strategy
//!
//! Advancing clones the current snapshot and mutates the clone in place.
//! For the target game size (hundreds of entities) a deep clone per update
//! is cheap; a copy-on-write scheme would only pay off for enormous
//! worlds.

pub mod history;

use std::collections::{BTreeMap, VecDeque};

use crate::commands::GameplayCommand;
use crate::report_violation;
use crate::telemetry::{ContractViolation, InvariantChecker, ViolationKind, ViolationSeverity};
use crate::world::EntityMove;
use crate::{ConnectionId, FrameInput, GameWorld, NetcodeError, SessionRole, UpdateIdx};
use history::{CommandHistoryRecord, MovementUpdateData, PlayerInputHistory, UpdateWindow};

/// Whether a ring slot holds live simulation output or is a leftover from
/// before a rewind, waiting to be overwritten.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SlotState {
    /// The slot holds the snapshot produced by simulating its update.
    Simulated,
    /// The slot was invalidated by a rewind and will be overwritten on the
    /// next advance through it.
    Empty,
}

#[derive(Debug, Clone)]
struct WorldFrame<W> {
    world: W,
    slot: SlotState,
}

/// Ring of per-update snapshots plus aligned input, move, and command
/// histories. See the module docs for the invariants.
#[derive(Debug, Clone)]
pub struct StateRewinder<W> {
    role: SessionRole,
    frames: VecDeque<WorldFrame<W>>,
    first_stored: UpdateIdx,
    current: UpdateIdx,

    movement: UpdateWindow<MovementUpdateData>,
    commands: UpdateWindow<CommandHistoryRecord>,

    /// The local player's inputs; used only in the client role.
    client_input: PlayerInputHistory,
    /// Per-connection input histories; used only in the server role.
    server_inputs: BTreeMap<ConnectionId, PlayerInputHistory>,

    first_desynced: UpdateIdx,
    last_confirmed: UpdateIdx,
}

impl<W: GameWorld> StateRewinder<W> {
    /// Creates a rewinder whose single snapshot is `initial_world` at
    /// update zero.
    #[must_use]
    pub fn new(role: SessionRole, initial_world: W) -> Self {
        let start = UpdateIdx::new(0);
        Self {
            role,
            frames: VecDeque::from([WorldFrame {
                world: initial_world,
                slot: SlotState::Simulated,
            }]),
            first_stored: start,
            current: start,
            movement: UpdateWindow::new(start),
            commands: UpdateWindow::new(start),
            client_input: PlayerInputHistory::new(start),
            server_inputs: BTreeMap::new(),
            first_desynced: UpdateIdx::INVALID,
            last_confirmed: UpdateIdx::INVALID,
        }
    }

    /// The role this rewinder runs as.
    #[must_use]
    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// The update the current snapshot belongs to.
    #[must_use]
    pub fn current_update_idx(&self) -> UpdateIdx {
        self.current
    }

    /// The oldest update a snapshot still exists for.
    #[must_use]
    pub fn first_stored_update_idx(&self) -> UpdateIdx {
        self.first_stored
    }

    /// How many simulated snapshots the ring currently holds, counting
    /// from `first_stored` through `current`.
    #[must_use]
    pub fn stored_updates_count(&self) -> u32 {
        self.current.as_u32() - self.first_stored.as_u32() + 1
    }

    fn ring_index(&self, update: UpdateIdx) -> Option<usize> {
        if update < self.first_stored {
            return None;
        }
        let offset = usize::try_from(update.as_u32() - self.first_stored.as_u32()).ok()?;
        (offset < self.frames.len()).then_some(offset)
    }

    /// The current snapshot.
    #[must_use]
    pub fn current_world(&self) -> &W {
        // The ring is never empty and current always points inside it.
        match self.ring_index(self.current).and_then(|idx| self.frames.get(idx)) {
            Some(frame) => &frame.world,
            None => unreachable!("rewinder ring lost its current snapshot"),
        }
    }

    /// Mutable access to the current snapshot. Snapshots of earlier
    /// updates are immutable except through [`unwind_to`].
    ///
    /// [`unwind_to`]: StateRewinder::unwind_to
    pub fn current_world_mut(&mut self) -> &mut W {
        let idx = self.ring_index(self.current);
        match idx.and_then(|idx| self.frames.get_mut(idx)) {
            Some(frame) => &mut frame.world,
            None => unreachable!("rewinder ring lost its current snapshot"),
        }
    }

    /// The snapshot recorded for `update`.
    ///
    /// # Errors
    /// [`NetcodeError::StaleUpdate`] below the ring,
    /// [`NetcodeError::FutureUpdate`] above `current`.
    pub fn world_at(&self, update: UpdateIdx) -> Result<&W, NetcodeError> {
        if update < self.first_stored {
            return Err(NetcodeError::StaleUpdate {
                requested: update,
                first_stored: self.first_stored,
            });
        }
        if update > self.current {
            return Err(NetcodeError::FutureUpdate {
                requested: update,
                current: self.current,
            });
        }
        match self.ring_index(update).and_then(|idx| self.frames.get(idx)) {
            Some(frame) => Ok(&frame.world),
            None => unreachable!("ring not contiguous between first_stored and current"),
        }
    }

    // =========================================================================
    // Advancing, rewinding, trimming
    // =========================================================================

    /// Creates the snapshot slot for `update` by cloning the current
    /// snapshot, and makes it current. A slot left behind by an earlier
    /// rewind is reused in place.
    ///
    /// # Errors
    /// [`NetcodeError::NonSequentialUpdate`] unless
    /// `update == current + 1`; the rewinder is unchanged in that case.
    pub fn advance_to_next_update(&mut self, update: UpdateIdx) -> Result<(), NetcodeError> {
        if update != self.current.next() {
            report_violation!(
                ViolationSeverity::Critical,
                ViolationKind::UpdateSync,
                "advance to update {} is not sequential (current {})",
                update,
                self.current
            );
            return Err(NetcodeError::NonSequentialUpdate {
                requested: update,
                current: self.current,
            });
        }

        let cloned = self.current_world().clone();
        let next_offset = usize::try_from(update.as_u32() - self.first_stored.as_u32())
            .unwrap_or(usize::MAX);
        if let Some(frame) = self.frames.get_mut(next_offset) {
            // Reuse a slot invalidated by a rewind.
            frame.world = cloned;
            frame.slot = SlotState::Simulated;
        } else {
            self.frames.push_back(WorldFrame {
                world: cloned,
                slot: SlotState::Simulated,
            });
        }
        self.current = update;
        Ok(())
    }

    /// Makes the snapshot at `update` the current one again. Later records
    /// remain allocated but are invalidated until overwritten by new
    /// advances.
    ///
    /// # Errors
    /// [`NetcodeError::FutureUpdate`] above `current`,
    /// [`NetcodeError::StaleUpdate`] below the ring, and
    /// [`NetcodeError::WouldRewindConfirmed`] when the target lies before
    /// the last server-confirmed update.
    pub fn unwind_to(&mut self, update: UpdateIdx) -> Result<(), NetcodeError> {
        if update > self.current {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::UpdateSync,
                "unwind to {} is in the future (current {})",
                update,
                self.current
            );
            return Err(NetcodeError::FutureUpdate {
                requested: update,
                current: self.current,
            });
        }
        if update < self.first_stored {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::UpdateSync,
                "unwind to {} is before the oldest stored update {}",
                update,
                self.first_stored
            );
            return Err(NetcodeError::StaleUpdate {
                requested: update,
                first_stored: self.first_stored,
            });
        }
        if self.last_confirmed.is_valid() && update < self.last_confirmed {
            return Err(NetcodeError::WouldRewindConfirmed {
                requested: update,
                last_confirmed: self.last_confirmed,
            });
        }

        let keep = usize::try_from(update.as_u32() - self.first_stored.as_u32())
            .unwrap_or(usize::MAX);
        for frame in self.frames.iter_mut().skip(keep.saturating_add(1)) {
            frame.slot = SlotState::Empty;
        }
        self.current = update;
        Ok(())
    }

    /// The first update the rewinder still needs for a potential rollback:
    /// one before the first desynced update while a desync is pending,
    /// otherwise the current update.
    #[must_use]
    pub fn first_required_update_idx(&self) -> UpdateIdx {
        if self.first_desynced.is_valid() {
            std::cmp::min(self.first_desynced.saturating_sub(1), self.current)
        } else {
            self.current
        }
    }

    /// Drops snapshots and aligned history records for updates before
    /// `first_to_keep`. Idempotent; trimming to or before `first_stored`
    /// is a no-op.
    ///
    /// # Errors
    /// [`NetcodeError::WouldTrimConfirmed`] when the request would discard
    /// updates still needed for reconciliation; nothing is trimmed then.
    pub fn trim_old_updates(&mut self, first_to_keep: UpdateIdx) -> Result<(), NetcodeError> {
        if first_to_keep <= self.first_stored {
            return Ok(());
        }
        let first_required = self.first_required_update_idx();
        if first_to_keep > first_required {
            return Err(NetcodeError::WouldTrimConfirmed {
                requested_first_kept: first_to_keep,
                first_required,
            });
        }

        while self.first_stored < first_to_keep {
            self.frames.pop_front();
            self.first_stored += 1;
        }
        self.movement.trim_front(first_to_keep);
        self.commands.trim_front(first_to_keep);
        self.client_input.trim_front(first_to_keep);
        for input_history in self.server_inputs.values_mut() {
            input_history.trim_front(first_to_keep);
        }
        Ok(())
    }

    /// Rebases the rewinder onto the server timeline. The client calls
    /// this once, from the connection-accepted handler: `current` is the
    /// update the client will simulate next, `history_start` the oldest
    /// update the server may still send authoritative data for (one
    /// before the accept index).
    ///
    /// Every slot in `[history_start, current]` is seeded with a clone of
    /// the pre-connect world, so authoritative commands landing below
    /// `current` have snapshots to roll back onto. That rollback is how a
    /// freshly joined client executes its own spawn command, which the
    /// server schedules at an update the client's lead has already passed.
    pub fn set_initial_client_update_idx(
        &mut self,
        current: UpdateIdx,
        history_start: UpdateIdx,
    ) {
        let history_start = std::cmp::min(history_start, current);
        let world = self.current_world().clone();
        self.frames.clear();
        let mut update = history_start;
        loop {
            self.frames.push_back(WorldFrame {
                world: world.clone(),
                slot: SlotState::Simulated,
            });
            if update == current {
                break;
            }
            update += 1;
        }
        self.first_stored = history_start;
        self.current = current;
        self.movement = UpdateWindow::new(history_start);
        self.commands = UpdateWindow::new(history_start);
        self.client_input = PlayerInputHistory::new(history_start);
        self.first_desynced = UpdateIdx::INVALID;
        self.last_confirmed = UpdateIdx::INVALID;
    }

    /// Applies an authoritative world replacement to every stored
    /// snapshot. Used when a server snapshot message rewrites the world:
    /// the seeded history below `current` must agree with the replacement,
    /// or a later rollback would resimulate from a world the replacement
    /// never touched.
    pub fn overwrite_all_snapshots(&mut self, mut overwrite: impl FnMut(&mut W)) {
        for frame in &mut self.frames {
            overwrite(&mut frame.world);
        }
    }

    // =========================================================================
    // Inputs
    // =========================================================================

    /// Client side: stores the local player's input for `update`.
    pub fn set_input_for(&mut self, update: UpdateIdx, input: FrameInput) {
        self.client_input.set(update, input);
    }

    /// Client side: the local input for `update`, predicting forward by
    /// repeating the last stored input when `update` is past the history.
    #[must_use]
    pub fn get_input_for(&self, update: UpdateIdx) -> FrameInput {
        self.client_input.get_or_predict(update)
    }

    /// Client side: up to `count` inputs ending at `end_update`, oldest
    /// first, for the outbound input message. Missing tail frames are left
    /// zeroed.
    #[must_use]
    pub fn last_inputs(&self, count: usize, end_update: UpdateIdx) -> Vec<FrameInput> {
        self.client_input.last_inputs(count, end_update)
    }

    /// Server side: creates the input history for a new connection,
    /// starting at the next update to simulate.
    pub fn register_connection(&mut self, connection: ConnectionId) {
        self.server_inputs
            .entry(connection)
            .or_insert_with(|| PlayerInputHistory::new(self.current.next()));
    }

    /// Server side: drops a connection's input history.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.server_inputs.remove(&connection);
    }

    /// Server side: stores a connection's input for `update`, overwriting
    /// any previously predicted or received value. Skipped updates between
    /// the connection's last known input and `update` are filled by
    /// repeating the last known input.
    ///
    /// # Errors
    /// [`NetcodeError::UnknownConnection`] for unregistered connections.
    pub fn add_player_input(
        &mut self,
        connection: ConnectionId,
        update: UpdateIdx,
        input: FrameInput,
    ) -> Result<(), NetcodeError> {
        let input_history = self
            .server_inputs
            .get_mut(&connection)
            .ok_or(NetcodeError::UnknownConnection { connection })?;
        input_history.set(update, input);
        Ok(())
    }

    /// Server side: the input to simulate `update` with for `connection`.
    /// Falls back to the connection's most recent known input (or the
    /// zeroed input when none ever arrived); never fails once the
    /// connection exists.
    ///
    /// # Errors
    /// [`NetcodeError::UnknownConnection`] for unregistered connections.
    pub fn get_or_predict_player_input(
        &self,
        connection: ConnectionId,
        update: UpdateIdx,
    ) -> Result<FrameInput, NetcodeError> {
        self.server_inputs
            .get(&connection)
            .map(|input_history| input_history.get_or_predict(update))
            .ok_or(NetcodeError::UnknownConnection { connection })
    }

    /// Server side: the last update a real input arrived for from
    /// `connection`, [`UpdateIdx::INVALID`] when none did.
    #[must_use]
    pub fn last_known_input_update_for(&self, connection: ConnectionId) -> UpdateIdx {
        self.server_inputs
            .get(&connection)
            .map_or(UpdateIdx::INVALID, PlayerInputHistory::last_known_update)
    }

    /// Server side: the registered connections in deterministic order.
    pub fn connections(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.server_inputs.keys().copied()
    }

    // =========================================================================
    // Moves and desync tracking
    // =========================================================================

    /// Whether an authoritative moves message for `update` has been
    /// applied.
    #[must_use]
    pub fn has_confirmed_moves_for(&self, update: UpdateIdx) -> bool {
        self.movement
            .get(update)
            .is_some_and(|record| record.confirmed)
    }

    /// The movement record of `update`, simulated or authoritative.
    #[must_use]
    pub fn moves_for(&self, update: UpdateIdx) -> Option<&MovementUpdateData> {
        self.movement.get(update)
    }

    /// Records what the local simulation moved this update. Called at the
    /// end of every simulated frame; the hashes recorded here are what
    /// authoritative moves are compared against.
    ///
    /// An update that is already confirmed keeps its authoritative record.
    pub fn write_simulated_moves(&mut self, update: UpdateIdx, moves: Vec<EntityMove>) {
        let Some(record) = self.movement.ensure(update) else {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::StateManagement,
                "simulated moves for trimmed update {}",
                update
            );
            return;
        };
        if record.confirmed {
            return;
        }
        *record = MovementUpdateData::from_moves(moves);
    }

    /// Applies an authoritative movement record for `update`.
    ///
    /// When the update was already simulated locally, the sorted hash
    /// vectors are compared: a mismatch arms the desync flag at the
    /// earliest diverged update, a match advances the confirmed watermark.
    /// When the update has not been simulated yet, the record is stored
    /// and the comparison happens as soon as the simulation catches up.
    ///
    /// # Errors
    /// [`NetcodeError::StaleUpdate`] when `update` precedes the stored
    /// history; the caller usually ignores that (the message is simply
    /// late).
    pub fn apply_authoritative_moves(
        &mut self,
        update: UpdateIdx,
        mut authoritative: MovementUpdateData,
    ) -> Result<(), NetcodeError> {
        if update < self.first_stored {
            return Err(NetcodeError::StaleUpdate {
                requested: update,
                first_stored: self.first_stored,
            });
        }
        authoritative.sort_hashes();
        authoritative.confirmed = true;

        let simulated_this_update = update <= self.current;
        let current = self.current;
        let Some(record) = self.movement.ensure(update) else {
            return Ok(());
        };

        if !simulated_this_update || record.moves.is_empty() && record.hashes.is_empty() {
            // Nothing local to compare against yet; the comparison happens
            // in write_simulated_moves when the simulation reaches this
            // update, or the record genuinely has no entities.
            let matches = record.hashes == authoritative.hashes;
            *record = authoritative;
            if simulated_this_update && matches {
                self.confirm_update(update);
            } else if simulated_this_update {
                self.flag_desync(update);
            }
            return Ok(());
        }

        if record.hashes == authoritative.hashes {
            *record = authoritative;
            self.confirm_update(update);
        } else {
            tracing::debug!(
                update = update.as_u32(),
                current = current.as_u32(),
                "authoritative moves disagree with simulation"
            );
            *record = authoritative;
            self.flag_desync(update);
        }
        Ok(())
    }

    fn confirm_update(&mut self, update: UpdateIdx) {
        if !self.last_confirmed.is_valid() || update > self.last_confirmed {
            self.last_confirmed = std::cmp::min(update, self.current);
        }
    }

    fn flag_desync(&mut self, update: UpdateIdx) {
        if self.last_confirmed.is_valid() && update <= self.last_confirmed {
            report_violation!(
                ViolationSeverity::Error,
                ViolationKind::DesyncTracking,
                "desync reported at {} at or before confirmed update {}",
                update,
                self.last_confirmed
            );
            return;
        }
        if !self.first_desynced.is_valid() || update < self.first_desynced {
            self.first_desynced = update;
        }
    }

    /// The earliest update flagged as diverged from the server,
    /// [`UpdateIdx::INVALID`] while everything matches.
    #[must_use]
    pub fn first_desynced_update_idx(&self) -> UpdateIdx {
        self.first_desynced
    }

    /// The greatest update whose moves matched the server's.
    #[must_use]
    pub fn last_confirmed_client_update_idx(&self) -> UpdateIdx {
        self.last_confirmed
    }

    /// Clears the desync flag after a completed reconciliation pass.
    pub fn clear_desync_flag(&mut self) {
        self.first_desynced = UpdateIdx::INVALID;
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Records the commands the local simulation produced during `update`.
    pub fn write_simulated_commands(&mut self, update: UpdateIdx, commands: Vec<GameplayCommand>) {
        if let Some(record) = self.commands.ensure(update) {
            record.gameplay_generated = commands;
        }
    }

    /// Schedules an externally generated command (e.g. a player join) for
    /// `update`.
    pub fn append_external_command(&mut self, update: UpdateIdx, command: GameplayCommand) {
        if let Some(record) = self.commands.ensure(update) {
            record.external.push(command);
        }
    }

    /// Replaces the external command list of `update` with the server's
    /// authoritative one. When the update was already simulated with a
    /// different list, the desync flag is armed so the frame gets
    /// resimulated with the right commands.
    ///
    /// # Errors
    /// [`NetcodeError::StaleUpdate`] when `update` precedes the stored
    /// history.
    pub fn apply_authoritative_commands(
        &mut self,
        update: UpdateIdx,
        commands: Vec<GameplayCommand>,
    ) -> Result<(), NetcodeError> {
        if update < self.first_stored {
            return Err(NetcodeError::StaleUpdate {
                requested: update,
                first_stored: self.first_stored,
            });
        }
        let simulated_this_update = update <= self.current;
        let Some(record) = self.commands.ensure(update) else {
            return Ok(());
        };
        let disagreed = record.external != commands;
        record.external = commands;
        if simulated_this_update && disagreed {
            self.flag_desync(update);
        }
        Ok(())
    }

    /// The command record of `update`, if any commands were stored.
    #[must_use]
    pub fn commands_for(&self, update: UpdateIdx) -> Option<&CommandHistoryRecord> {
        self.commands.get(update)
    }

    /// All commands to execute when simulating `update`, in execution
    /// order (external first, then gameplay-generated from a previous
    /// simulation of this update, which resimulation replaces).
    #[must_use]
    pub fn external_commands_for_step(&self, update: UpdateIdx) -> Vec<GameplayCommand> {
        self.commands
            .get(update)
            .map(|record| record.external.clone())
            .unwrap_or_default()
    }
}

impl<W: GameWorld> InvariantChecker for StateRewinder<W> {
    /// Checks the ring and bookkeeping invariants listed in the module
    /// docs.
    fn check_invariants(&self) -> Result<(), ContractViolation> {
        let violation = |message: &str| {
            ContractViolation::new(
                ViolationSeverity::Critical,
                ViolationKind::StateManagement,
                message.to_owned(),
                concat!(file!(), ":", line!()),
            )
        };

        if self.frames.is_empty() {
            return Err(violation("rewinder owns no snapshots"));
        }
        if self.current < self.first_stored {
            return Err(violation("current update is before first stored update")
                .with_update(self.current));
        }
        let span = self.current.as_u32() - self.first_stored.as_u32() + 1;
        if (self.frames.len() as u32) < span {
            return Err(violation("snapshot ring is not contiguous through current"));
        }
        // Every slot up to and including current must hold simulated data;
        // Empty tombstones may only exist past current (rewind leftovers).
        for (offset, frame) in self.frames.iter().enumerate() {
            if (offset as u32) < span && frame.slot != SlotState::Simulated {
                return Err(violation("invalidated slot inside the live range")
                    .with_update(self.first_stored + offset as u32));
            }
        }
        if self.last_confirmed.is_valid() && self.last_confirmed > self.current {
            return Err(violation("confirmed update is past current").with_update(self.last_confirmed));
        }
        if self.first_desynced.is_valid()
            && self.last_confirmed.is_valid()
            && self.first_desynced <= self.last_confirmed
        {
            return Err(
                violation("first desynced update overlaps confirmed range")
                    .with_update(self.first_desynced),
            );
        }
        Ok(())
    }
}

// #########
// # TESTS #
// #########
