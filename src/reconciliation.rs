//! Client-side desync reconciliation: rewind to the first diverged update,
//! overwrite it with authoritative data, and resimulate to the present.
//!
//! Runs once per fixed update on the client, before the live simulation
//! step. The visible cost of a rollback is a position correction; the
//! driver reports, per moved entity, whether the render layer should
//! smooth the correction over a few updates or snap outright (corrections
//! below the no-interpolation distance are too small to read as movement,
//! so easing them would only smear the picture).
//!
//! If the rollback target has already been trimmed the driver clamps to the
//! oldest stored update, accepts one visible teleport, and continues - that
//! beats aborting the session. A non-deterministic simulation (a bug) still
//! terminates the loop; it will simply re-desync on the next authoritative
//! message.

use std::collections::BTreeMap;

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::world::{GameWorld, Simulation, StepContext};
use crate::{
    ConnectionId, NetcodeConfig, NetcodeError, NetworkEntityId, StateRewinder, UpdateIdx, Vec2,
};

/// Tells the render layer to restart position interpolation for one entity
/// from where it was displayed before a rollback moved it.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct InterpolationReset {
    /// The entity whose displayed position should be smoothed.
    pub entity: NetworkEntityId,
    /// Where the entity was displayed before reconciliation.
    pub from_position: Vec2,
    /// Over how many updates to blend toward the corrected position.
    pub updates: u32,
}

/// Simulates one client update through the rewinder: advances the snapshot
/// ring, executes the update's external commands, steps the simulation with
/// the local input, records what it produced, and - for server-confirmed
/// updates - snaps entity transforms to the authoritative moves so the
/// resimulation continues from server truth.
///
/// Used both for live frames and for resimulation after a rollback.
///
/// # Errors
/// Propagates rewinder contract violations ([`NetcodeError::NonSequentialUpdate`]).
pub fn advance_client_update<W: GameWorld, S: Simulation<W>>(
    rewinder: &mut StateRewinder<W>,
    simulation: &mut S,
    update: UpdateIdx,
) -> Result<(), NetcodeError> {
    rewinder.advance_to_next_update(update)?;

    let context = StepContext {
        update,
        inputs: vec![(ConnectionId::INVALID, rewinder.get_input_for(update))],
    };
    let external = rewinder.external_commands_for_step(update);
    let world = rewinder.current_world_mut();
    for command in &external {
        command.execute(world);
    }
    let generated = simulation.fixed_step(world, &context);
    for command in &generated {
        command.execute(world);
    }
    rewinder.write_simulated_commands(update, generated);

    if rewinder.has_confirmed_moves_for(update) {
        let authoritative: Vec<_> = rewinder
            .moves_for(update)
            .map(|record| record.moves.clone())
            .unwrap_or_default();
        let world = rewinder.current_world_mut();
        for entity_move in &authoritative {
            world.apply_move(entity_move);
        }
    } else {
        let moves = rewinder.current_world().entity_moves();
        rewinder.write_simulated_moves(update, moves);
    }
    Ok(())
}

/// Detects a pending desync and, if one exists, rewinds and resimulates to
/// the present. Returns the interpolation resets the render layer should
/// apply; an empty list means nothing diverged (or every correction was
/// small enough to snap).
///
/// # Errors
/// Propagates rewinder errors; by construction of the clamping these only
/// occur if the simulation itself corrupts rewinder state.
pub fn reconcile<W: GameWorld, S: Simulation<W>>(
    rewinder: &mut StateRewinder<W>,
    simulation: &mut S,
    config: &NetcodeConfig,
) -> Result<Vec<InterpolationReset>, NetcodeError> {
    let mut first_desynced = rewinder.first_desynced_update_idx();
    let now = rewinder.current_update_idx();
    if !first_desynced.is_valid() || first_desynced > now {
        trim_settled_history(rewinder, config)?;
        return Ok(Vec::new());
    }

    // Displayed positions before the rollback, for the smoothing decision.
    let old_positions: BTreeMap<NetworkEntityId, Vec2> = rewinder
        .current_world()
        .entity_moves()
        .into_iter()
        .map(|entity_move| (entity_move.network_entity_id, entity_move.position))
        .collect();

    let first_stored = rewinder.first_stored_update_idx();
    if first_desynced <= first_stored {
        // The rollback target is gone; accept one visible teleport.
        report_violation!(
            ViolationSeverity::Error,
            ViolationKind::DesyncTracking,
            "first desynced update {} is at or before the oldest stored update {}; clamping",
            first_desynced,
            first_stored
        );
        first_desynced = first_stored.next();
    }

    tracing::info!(
        first_desynced = first_desynced.as_u32(),
        now = now.as_u32(),
        "reconciling after desync"
    );

    rewinder.unwind_to(first_desynced - 1)?;
    let mut update = first_desynced;
    while update <= now {
        advance_client_update(rewinder, simulation, update)?;
        update += 1;
    }
    rewinder.clear_desync_flag();

    // Corrections farther than the no-interpolation distance are smoothed
    // from the old displayed position; smaller differences snap without
    // smoothing.
    let mut resets = Vec::new();
    for entity_move in rewinder.current_world().entity_moves() {
        let Some(old_position) = old_positions.get(&entity_move.network_entity_id) else {
            continue;
        };
        let displacement = old_position.distance(entity_move.position);
        if displacement > config.no_interpolation_distance {
            resets.push(InterpolationReset {
                entity: entity_move.network_entity_id,
                from_position: *old_position,
                updates: config.interpolation_updates,
            });
        }
    }

    trim_settled_history(rewinder, config)?;

    Ok(resets)
}

/// Drops history that no future rollback can need: everything more than
/// the configured cap behind the last confirmed update, clamped so a
/// pending desync's rollback target always survives.
fn trim_settled_history<W: GameWorld>(
    rewinder: &mut StateRewinder<W>,
    config: &NetcodeConfig,
) -> Result<(), NetcodeError> {
    let last_confirmed = rewinder.last_confirmed_client_update_idx();
    if !last_confirmed.is_valid() {
        return Ok(());
    }
    let keep_from = std::cmp::min(
        last_confirmed.saturating_sub(config.stored_history_max),
        rewinder.first_required_update_idx(),
    );
    rewinder.trim_old_updates(keep_from)
}

// #########
// # TESTS #
// #########
