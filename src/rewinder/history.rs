//! Per-update history records kept by the rewinder: movement data with
//! quantised hashes, gameplay-command logs, and per-player input windows.

use std::collections::VecDeque;

use crate::commands::GameplayCommand;
use crate::world::EntityMove;
use crate::{FrameInput, NetworkEntityId, UpdateIdx};

/// Scale applied to direction components in [`EntityMoveHash`].
pub const DIRECTION_HASH_SCALE: f32 = 16384.0;

/// Quantised identity of one entity's move, used for fast equality between
/// a simulated update and the server's authoritative replica.
///
/// Positions are quantised to integer world units and directions to
/// `round(d * 16384)`; the tolerance hides platform-specific float noise
/// while still catching real divergence. Hash vectors are compared as
/// whole, entity-id-sorted vectors.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EntityMoveHash {
    /// The entity the move belongs to.
    pub entity: NetworkEntityId,
    /// Position x, integer world units.
    pub location_x: i32,
    /// Position y, integer world units.
    pub location_y: i32,
    /// Direction x, quantised.
    pub direction_x: i32,
    /// Direction y, quantised.
    pub direction_y: i32,
}

impl EntityMoveHash {
    /// Quantises one move.
    #[must_use]
    pub fn new(entity_move: &EntityMove) -> Self {
        Self {
            entity: entity_move.network_entity_id,
            location_x: entity_move.position.x as i32,
            location_y: entity_move.position.y as i32,
            direction_x: (entity_move.direction.x * DIRECTION_HASH_SCALE).round() as i32,
            direction_y: (entity_move.direction.y * DIRECTION_HASH_SCALE).round() as i32,
        }
    }
}

/// The movement record of one update: full-precision moves plus the sorted
/// hash vector they quantise to.
#[derive(Debug, Clone, Default)]
pub struct MovementUpdateData {
    /// Whether this update's moves were confirmed by (or came from) the
    /// server. Snapshots of confirmed updates are never resimulated.
    pub confirmed: bool,
    /// Full-precision moves, used to overwrite entity transforms.
    pub moves: Vec<EntityMove>,
    /// Quantised hashes, sorted by entity id before comparison.
    pub hashes: Vec<EntityMoveHash>,
}

impl MovementUpdateData {
    /// Records a move together with its hash.
    pub fn add_move(&mut self, entity_move: EntityMove) {
        self.hashes.push(EntityMoveHash::new(&entity_move));
        self.moves.push(entity_move);
    }

    /// Builds a record from a set of moves and sorts the hashes.
    #[must_use]
    pub fn from_moves(moves: Vec<EntityMove>) -> Self {
        let mut data = Self::default();
        for entity_move in moves {
            data.add_move(entity_move);
        }
        data.sort_hashes();
        data
    }

    /// Sorts the hash vector by entity id, the canonical comparison order.
    pub fn sort_hashes(&mut self) {
        self.hashes.sort_unstable_by_key(|hash| hash.entity);
    }
}

/// The command log of one update.
#[derive(Debug, Clone, Default)]
pub struct CommandHistoryRecord {
    /// Commands produced by the simulation itself during this update
    /// (e.g. projectile spawns from a shoot key).
    pub gameplay_generated: Vec<GameplayCommand>,
    /// Commands injected from outside the simulation (e.g. a new player
    /// joining); on clients these are the server-authoritative commands.
    pub external: Vec<GameplayCommand>,
}

impl CommandHistoryRecord {
    /// Whether both lists are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gameplay_generated.is_empty() && self.external.is_empty()
    }

    /// All commands of the update in execution order: external first, then
    /// gameplay-generated.
    #[must_use]
    pub fn all(&self) -> Vec<GameplayCommand> {
        let mut all = Vec::with_capacity(self.external.len() + self.gameplay_generated.len());
        all.extend(self.external.iter().cloned());
        all.extend(self.gameplay_generated.iter().cloned());
        all
    }
}

/// A contiguous window of per-update records starting at a known update
/// index. Growing past the end fills intermediate slots with defaults;
/// trimming drops records from the front.
#[derive(Debug, Clone)]
pub struct UpdateWindow<T> {
    first: UpdateIdx,
    records: VecDeque<T>,
}

impl<T: Default> UpdateWindow<T> {
    /// An empty window that will start at `first`.
    #[must_use]
    pub fn new(first: UpdateIdx) -> Self {
        Self {
            first,
            records: VecDeque::new(),
        }
    }

    /// The first update a record can exist for.
    #[must_use]
    pub fn first_update(&self) -> UpdateIdx {
        self.first
    }

    /// The last update a record exists for, `None` while empty.
    #[must_use]
    pub fn last_update(&self) -> Option<UpdateIdx> {
        let len = u32::try_from(self.records.len()).ok()?;
        len.checked_sub(1).map(|offset| self.first + offset)
    }

    fn offset_of(&self, update: UpdateIdx) -> Option<usize> {
        if update < self.first {
            return None;
        }
        let offset = usize::try_from(update.as_u32() - self.first.as_u32()).ok()?;
        (offset < self.records.len()).then_some(offset)
    }

    /// The record at `update`, if one exists.
    #[must_use]
    pub fn get(&self, update: UpdateIdx) -> Option<&T> {
        self.offset_of(update).and_then(|offset| self.records.get(offset))
    }

    /// Mutable access to the record at `update`, if one exists.
    pub fn get_mut(&mut self, update: UpdateIdx) -> Option<&mut T> {
        let offset = self.offset_of(update)?;
        self.records.get_mut(offset)
    }

    /// The record at `update`, creating it (and every missing record
    /// before it) with defaults. Returns `None` only for updates before
    /// the window start.
    pub fn ensure(&mut self, update: UpdateIdx) -> Option<&mut T> {
        if update < self.first {
            return None;
        }
        let needed = usize::try_from(update.as_u32() - self.first.as_u32()).ok()? + 1;
        while self.records.len() < needed {
            self.records.push_back(T::default());
        }
        self.records.get_mut(needed - 1)
    }

    /// Drops records before `first_to_keep`. Keeps the window start
    /// consistent even when the window is empty.
    pub fn trim_front(&mut self, first_to_keep: UpdateIdx) {
        while self.first < first_to_keep {
            if self.records.pop_front().is_none() {
                self.first = first_to_keep;
                return;
            }
            self.first += 1;
        }
    }

    /// Iterates stored `(update, record)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (UpdateIdx, &T)> {
        self.records
            .iter()
            .enumerate()
            .map(move |(offset, record)| (self.first + offset as u32, record))
    }
}

/// One player's input history: a contiguous window of per-update inputs
/// with gap filling and forward prediction by repetition.
#[derive(Debug, Clone)]
pub struct PlayerInputHistory {
    window: UpdateWindow<FrameInput>,
    last_known: UpdateIdx,
}

impl PlayerInputHistory {
    /// An empty history starting at `first`.
    #[must_use]
    pub fn new(first: UpdateIdx) -> Self {
        Self {
            window: UpdateWindow::new(first),
            last_known: UpdateIdx::INVALID,
        }
    }

    /// The last update a real input was stored for, or
    /// [`UpdateIdx::INVALID`] when none ever arrived.
    #[must_use]
    pub fn last_known_update(&self) -> UpdateIdx {
        self.last_known
    }

    /// The most recent known input, default when none arrived yet.
    #[must_use]
    pub fn last_known_input(&self) -> FrameInput {
        self.last_known
            .to_option()
            .and_then(|update| self.window.get(update))
            .copied()
            .unwrap_or_default()
    }

    /// Stores the input for `update`, overwriting any previously predicted
    /// or received value. Skipped intermediate updates are filled by
    /// repeating the most recent known input.
    pub fn set(&mut self, update: UpdateIdx, input: FrameInput) {
        if self.last_known.is_valid() && update > self.last_known + 1 {
            let filler = self.last_known_input();
            let mut gap = self.last_known + 1;
            while gap < update {
                if let Some(slot) = self.window.ensure(gap) {
                    *slot = filler;
                }
                gap += 1;
            }
        }
        if let Some(slot) = self.window.ensure(update) {
            *slot = input;
            if !self.last_known.is_valid() || update > self.last_known {
                self.last_known = update;
            }
        }
    }

    /// The stored input for `update`, if any real or gap-filled record
    /// exists.
    #[must_use]
    pub fn get(&self, update: UpdateIdx) -> Option<FrameInput> {
        self.window.get(update).copied()
    }

    /// The input for `update`, predicting forward by repeating the most
    /// recent known input when `update` is past the history. Never fails.
    #[must_use]
    pub fn get_or_predict(&self, update: UpdateIdx) -> FrameInput {
        self.get(update).unwrap_or_else(|| self.last_known_input())
    }

    /// Up to `count` inputs ending at `end_update`, oldest first. Updates
    /// before the window start are omitted; updates past the last known
    /// input are left as their default (zeroed) frame.
    #[must_use]
    pub fn last_inputs(&self, count: usize, end_update: UpdateIdx) -> Vec<FrameInput> {
        let Ok(count_u32) = u32::try_from(count) else {
            return Vec::new();
        };
        if count == 0 {
            return Vec::new();
        }
        let first = std::cmp::max(
            self.window.first_update(),
            end_update.saturating_sub(count_u32 - 1),
        );
        let mut inputs = Vec::new();
        let mut update = first;
        while update <= end_update {
            inputs.push(self.get(update).unwrap_or_default());
            update += 1;
        }
        inputs
    }

    /// Drops inputs before `first_to_keep`.
    pub fn trim_front(&mut self, first_to_keep: UpdateIdx) {
        self.window.trim_front(first_to_keep);
    }
}

// #########
// # TESTS #
// #########



#[cfg(test)]
mod input_history_tests {
    use super::*;

    fn input_with(horizontal: f32) -> FrameInput {
        let mut input = FrameInput::default();
        input.set_axis_value(0, horizontal);
        input
    }

    #[test]
    fn set_and_get() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(0));
        history.set(UpdateIdx::new(0), input_with(1.0));
        assert_eq!(history.get(UpdateIdx::new(0)), Some(input_with(1.0)));
        assert_eq!(history.last_known_update(), UpdateIdx::new(0));
    }

    #[test]
    fn gaps_fill_with_last_known_input() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(100));
        history.set(UpdateIdx::new(100), input_with(0.5));
        history.set(UpdateIdx::new(104), input_with(1.0));

        // 101..=103 repeat the input of 100.
        for update in 101..=103 {
            assert_eq!(
                history.get(UpdateIdx::new(update)),
                Some(input_with(0.5)),
                "update {update}"
            );
        }
        assert_eq!(history.get(UpdateIdx::new(104)), Some(input_with(1.0)));
        assert_eq!(history.last_known_update(), UpdateIdx::new(104));
    }

    #[test]
    fn predicts_forward_by_repetition() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(0));
        history.set(UpdateIdx::new(3), input_with(-1.0));
        assert_eq!(history.get_or_predict(UpdateIdx::new(50)), input_with(-1.0));
    }

    #[test]
    fn predicts_default_before_any_input() {
        let history = PlayerInputHistory::new(UpdateIdx::new(0));
        assert_eq!(history.get_or_predict(UpdateIdx::new(5)), FrameInput::default());
        assert_eq!(history.last_known_update(), UpdateIdx::INVALID);
    }

    #[test]
    fn overwrite_replaces_predicted_value() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(0));
        history.set(UpdateIdx::new(0), input_with(0.5));
        history.set(UpdateIdx::new(2), input_with(0.5)); // fills update 1
        history.set(UpdateIdx::new(1), input_with(-1.0)); // real input arrives late
        assert_eq!(history.get(UpdateIdx::new(1)), Some(input_with(-1.0)));
    }

    #[test]
    fn last_inputs_pads_missing_tail_with_default() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(0));
        history.set(UpdateIdx::new(0), input_with(1.0));
        history.set(UpdateIdx::new(1), input_with(0.25));

        let inputs = history.last_inputs(4, UpdateIdx::new(3));
        assert_eq!(inputs.len(), 4);
        assert_eq!(inputs[0], input_with(1.0));
        assert_eq!(inputs[1], input_with(0.25));
        assert_eq!(inputs[2], FrameInput::default());
        assert_eq!(inputs[3], FrameInput::default());
    }

    #[test]
    fn last_inputs_clamps_to_window_start() {
        let mut history = PlayerInputHistory::new(UpdateIdx::new(10));
        history.set(UpdateIdx::new(10), input_with(1.0));
        history.set(UpdateIdx::new(11), input_with(2.0));

        let inputs = history.last_inputs(10, UpdateIdx::new(11));
        assert_eq!(inputs.len(), 2);
    }
}
