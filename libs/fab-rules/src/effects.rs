//! Effect executor
//!
//! Applies a rule's queue effects after a successful dispatch and reports the
//! completion notifications they raise. Emission is left to the caller.

use tracing::{debug, warn};

use crate::state::RuntimeState;
use crate::types::{Effect, QueueOp, WaferId, COMPLETED_QUEUE};

/// Notification raised while applying effects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectNotification {
    /// A wafer was appended to the completion queue
    WaferCompleted { wafer_id: WaferId },
    /// The completion queue crossed `total_wafers`
    AllWafersCompleted { total: usize },
}

/// Apply one effect, appending any notifications it raises.
///
/// Returns whether the effect changed a queue.
pub fn apply_effect(
    effect: &Effect,
    state: &mut RuntimeState,
    notifications: &mut Vec<EffectNotification>,
) -> bool {
    match effect {
        Effect::QueueOperation { queue, operation } => match operation {
            QueueOp::Add(value) => {
                let wafer_id = value.resolve_int(state);
                state.queue_mut(queue).push_back(wafer_id);
                debug!("Queue {} += {}", queue, wafer_id);
                if queue == COMPLETED_QUEUE {
                    notifications.push(EffectNotification::WaferCompleted { wafer_id });
                }
                true
            },
            QueueOp::RemoveFirst => {
                let head = if state.queue(queue).is_some() {
                    state.queue_mut(queue).pop_front()
                } else {
                    None
                };
                match head {
                    Some(wafer_id) => {
                        debug!("Queue {} -= head {}", queue, wafer_id);
                        true
                    },
                    None => {
                        warn!("removeFirst on empty queue {}", queue);
                        false
                    },
                }
            },
            QueueOp::Remove(wafer_id) => {
                let Some(position) = state
                    .queue(queue)
                    .and_then(|q| q.iter().position(|w| w == wafer_id))
                else {
                    debug!("Queue {} has no wafer {}", queue, wafer_id);
                    return false;
                };
                state.queue_mut(queue).remove(position);
                true
            },
        },
        Effect::CheckCompletion { queue } => {
            check_completion(queue, state, notifications);
            false
        },
    }
}

/// Edge-triggered: fires once when the count reaches the total, re-arms below it
fn check_completion(
    queue: &str,
    state: &mut RuntimeState,
    notifications: &mut Vec<EffectNotification>,
) {
    let total = state.total_wafers();
    let reached = state.queue_len(queue) >= total;

    if !reached {
        state.set_completion_signalled(false);
        return;
    }
    if state.completion_signalled() {
        debug!("Completion already signalled for {}", queue);
        return;
    }

    state.set_completion_signalled(true);
    notifications.push(EffectNotification::AllWafersCompleted { total });
}
