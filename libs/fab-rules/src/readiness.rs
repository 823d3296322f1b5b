//! Destination readiness / wait resolver
//!
//! A robot holding a wafer may be blocked on its destination. Readiness is
//! checked both when the robot starts waiting and when a station changes to a
//! state that can release waiters, so neither ordering is missed.

use crate::state::RuntimeState;
use crate::types::RuleCatalog;

/// Station states that may release waiting robots
pub const RELEASE_STATES: [&str; 4] = ["empty", "done", "IDLE", "COMPLETE"];

/// Fallback ready states when no wait behavior is configured (case-insensitive)
const DEFAULT_READY_STATES: [&str; 2] = ["empty", "idle"];

pub fn is_release_state(state: &str) -> bool {
    RELEASE_STATES.contains(&state)
}

/// Whether `destination` can accept `robot`'s wafer now
pub fn is_destination_ready(
    catalog: &RuleCatalog,
    state: &RuntimeState,
    robot: &str,
    destination: &str,
) -> bool {
    let current = state.station_state(destination);

    let configured = catalog
        .robot_behaviors
        .get(robot)
        .and_then(|b| b.wait_conditions.get(destination));

    if let Some(cond) = configured {
        if cond.always_ready {
            return true;
        }
        if let Some(ready_states) = &cond.ready_states {
            return current.is_some_and(|s| ready_states.contains(s));
        }
    }

    current.is_some_and(|s| {
        DEFAULT_READY_STATES
            .iter()
            .any(|ready| ready.eq_ignore_ascii_case(s))
    })
}

/// Check a single waiting robot; clears its wait record when ready
pub fn resolve_robot(catalog: &RuleCatalog, state: &mut RuntimeState, robot: &str) -> bool {
    let Some(destination) = state.waiting_for(robot).map(str::to_string) else {
        return false;
    };
    if !is_destination_ready(catalog, state, robot, &destination) {
        tracing::debug!("{} still waiting for {}", robot, destination);
        return false;
    }
    state.clear_waiting(robot);
    true
}

/// Release every robot waiting on `station` that is now ready
pub fn resolve_station(catalog: &RuleCatalog, state: &mut RuntimeState, station: &str) -> Vec<String> {
    state
        .robots_waiting_for(station)
        .into_iter()
        .filter(|robot| resolve_robot(catalog, state, robot))
        .collect()
}
