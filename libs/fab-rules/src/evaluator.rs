//! Condition evaluator
//!
//! Recursive evaluation of a condition tree against the runtime state, the
//! catalog's station state aliases and the reference resolver.

use crate::state::RuntimeState;
use crate::types::{Condition, Operand, Operator, RuleCatalog};

/// Read-only view used to evaluate conditions
pub struct ConditionEvaluator<'a> {
    catalog: &'a RuleCatalog,
    state: &'a RuntimeState,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(catalog: &'a RuleCatalog, state: &'a RuntimeState) -> Self {
        Self { catalog, state }
    }

    pub fn evaluate(&self, condition: &Condition) -> bool {
        match condition {
            // Empty `and` means "no condition": never fires
            Condition::And { children } => {
                !children.is_empty() && children.iter().all(|c| self.evaluate(c))
            },
            Condition::Or { children } => children.iter().any(|c| self.evaluate(c)),
            Condition::Not { children } => match children.as_slice() {
                [only] => !self.evaluate(only),
                _ => false,
            },
            Condition::Comment { .. } => false,
            Condition::StationState {
                station,
                operator,
                value,
            } => self.evaluate_station_state(station, operator, value),
            Condition::RobotState {
                robot,
                operator,
                value,
            } => {
                let expected = value.resolve_text(self.state);
                compare_state(self.state.robot_state(robot), operator, &expected)
            },
            Condition::QueueCount {
                queue,
                operator,
                value,
            } => {
                let count = self.state.queue_len(queue) as i64;
                let target = value.resolve_int(self.state);
                match operator {
                    Operator::GreaterThan => count > target,
                    Operator::LessThan => count < target,
                    Operator::Equals => count == target,
                    _ => false,
                }
            },
            Condition::QueueContains {
                queue,
                operator,
                value,
            } => {
                let Some(items) = self.state.queue(queue) else {
                    return false;
                };
                let needle = value.resolve_int(self.state);
                match operator {
                    Operator::Contains => items.contains(&needle),
                    Operator::NotContains => !items.contains(&needle),
                    _ => false,
                }
            },
        }
    }

    /// Alias sets from the catalog take precedence over direct comparison
    fn evaluate_station_state(&self, station: &str, operator: &Operator, value: &Operand) -> bool {
        let expected = value.resolve_text(self.state);
        let actual = self.state.station_state(station);

        let aliases = self
            .catalog
            .state_mapping
            .get(station)
            .and_then(|m| m.get(&expected));

        match aliases {
            Some(states) => {
                let member = actual.is_some_and(|a| states.contains(a));
                match operator {
                    Operator::Equals => member,
                    Operator::NotEquals => !member,
                    _ => false,
                }
            },
            None => compare_state(actual, operator, &expected),
        }
    }
}

/// A missing state never equals anything
fn compare_state(actual: Option<&str>, operator: &Operator, expected: &str) -> bool {
    match operator {
        Operator::Equals => actual == Some(expected),
        Operator::NotEquals => actual != Some(expected),
        _ => false,
    }
}
