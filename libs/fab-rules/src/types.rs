//! Rule catalog type definitions
//!
//! Core types loaded once per run and read-only afterwards:
//! - RuleCatalog: rules, robot wait behaviors, station state aliases, execution flags
//! - Rule: priority-ordered, condition-gated action plus effects
//! - Condition / Effect / RuleAction: closed variants, unknown kinds are rejected by the parser
//! - Operand / Reference: literal or `@`-reference values, classified at load time

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Wafer identifier. Signed because reference arithmetic may go below zero.
pub type WaferId = i64;

/// Queue seeded with `[1..=total_wafers]` at construction and on reset
pub const PENDING_QUEUE: &str = "LoadPort.Pending";

/// Queue whose additions raise per-wafer completion notifications
pub const COMPLETED_QUEUE: &str = "LoadPort.Completed";

/// Robot command name used when an action does not name one
pub const DEFAULT_COMMAND: &str = "TRANSFER";

// ============================================================================
// Catalog
// ============================================================================

/// Rule catalog - immutable configuration for one engine
#[derive(Debug, Clone, Default, Serialize)]
pub struct RuleCatalog {
    pub id: String,
    pub version: String,
    pub settings: ExecutionSettings,
    pub resources: Resources,

    /// Rules in declaration order (execution order is by priority)
    pub rules: Vec<Rule>,

    /// robotId -> wait behavior
    pub robot_behaviors: HashMap<String, WaitBehavior>,

    /// stationId -> alias -> concrete states
    pub state_mapping: HashMap<String, HashMap<String, HashSet<String>>>,
}

/// `configuration` block of the catalog
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionSettings {
    pub mode: String,
    pub conflict_resolution: String,
    pub enable_parallel_execution: bool,
}

/// Declared resource names, informational and used by validation
#[derive(Debug, Clone, Default, Serialize)]
pub struct Resources {
    pub robots: Vec<String>,
    pub stations: Vec<String>,
    pub queues: Vec<String>,
}

/// Per-robot destination wait behavior
#[derive(Debug, Clone, Default, Serialize)]
pub struct WaitBehavior {
    /// destinationId -> readiness condition
    pub wait_conditions: HashMap<String, WaitCondition>,
}

/// Readiness condition for one robot/destination pair
#[derive(Debug, Clone, Default, Serialize)]
pub struct WaitCondition {
    pub ready_states: Option<HashSet<String>>,
    pub always_ready: bool,
    pub description: Option<String>,
}

// ============================================================================
// Rules
// ============================================================================

/// Rule - a condition-gated transfer with queue effects
#[derive(Debug, Clone, Serialize)]
pub struct Rule {
    /// Unique identifier
    pub id: String,

    /// Lower runs first, ties keep catalog order
    pub priority: i32,

    pub description: Option<String>,

    /// Robot used when the action parameters do not name one
    pub default_robot: Option<String>,

    pub from: String,
    pub to: String,

    /// Root condition, defaults to an empty `and` (never true)
    pub conditions: Condition,

    pub action: RuleAction,

    /// Applied in order after a successful dispatch
    pub effects: Vec<Effect>,

    /// Informational flags, not used by the engine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub behavior: Option<serde_json::Value>,
}

impl Rule {
    /// Automatic rules are driven by the equipment actors themselves
    pub fn is_executable(&self) -> bool {
        self.action.kind != ActionKind::Automatic
    }
}

/// Action kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    Transfer,
    Automatic,
}

/// Rule action - what to dispatch when the conditions hold
#[derive(Debug, Clone, Serialize)]
pub struct RuleAction {
    pub kind: ActionKind,

    /// Robot command name, `TRANSFER` when absent
    pub command: Option<String>,

    /// Parameters, `@`-values resolved at execution time
    pub parameters: BTreeMap<String, Operand>,
}

impl Default for RuleAction {
    fn default() -> Self {
        Self {
            kind: ActionKind::Transfer,
            command: None,
            parameters: BTreeMap::new(),
        }
    }
}

impl RuleAction {
    pub fn command_name(&self) -> &str {
        self.command.as_deref().unwrap_or(DEFAULT_COMMAND)
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// Condition tree node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Condition {
    And { children: Vec<Condition> },
    Or { children: Vec<Condition> },
    Not { children: Vec<Condition> },
    StationState {
        station: String,
        operator: Operator,
        value: Operand,
    },
    RobotState {
        robot: String,
        operator: Operator,
        value: Operand,
    },
    QueueCount {
        queue: String,
        operator: Operator,
        value: Operand,
    },
    QueueContains {
        queue: String,
        operator: Operator,
        value: Operand,
    },
    /// Documentation-only node, never true
    Comment { text: String },
}

impl Default for Condition {
    fn default() -> Self {
        Condition::And {
            children: Vec::new(),
        }
    }
}

impl Condition {
    /// Visit every queue name referenced by this tree
    pub fn queue_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_queue_names(&mut names);
        names
    }

    fn collect_queue_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Condition::And { children } | Condition::Or { children } | Condition::Not { children } => {
                for child in children {
                    child.collect_queue_names(names);
                }
            },
            Condition::QueueCount { queue, value, .. }
            | Condition::QueueContains { queue, value, .. } => {
                names.push(queue);
                if let Operand::Reference(Reference::QueueIndex { queue, .. }) = value {
                    names.push(queue);
                }
            },
            Condition::StationState { .. }
            | Condition::RobotState { .. }
            | Condition::Comment { .. } => {},
        }
    }
}

/// Leaf comparison operator
///
/// Each leaf kind accepts a subset; anything else evaluates to false.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    Contains,
    NotContains,
    Unsupported(String),
}

impl Operator {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "equals" | "eq" | "==" => Operator::Equals,
            "notequals" | "ne" | "!=" => Operator::NotEquals,
            "greaterthan" | "gt" | ">" => Operator::GreaterThan,
            "lessthan" | "lt" | "<" => Operator::LessThan,
            "contains" => Operator::Contains,
            "notcontains" => Operator::NotContains,
            _ => Operator::Unsupported(raw.to_string()),
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Operator::Equals => "=",
            Operator::NotEquals => "!=",
            Operator::GreaterThan => ">",
            Operator::LessThan => "<",
            Operator::Contains => " has ",
            Operator::NotContains => " lacks ",
            Operator::Unsupported(raw) => raw,
        }
    }
}

// ============================================================================
// Values
// ============================================================================

/// Literal or reference value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Operand {
    Int(i64),
    Text(String),
    Reference(Reference),
}

/// Parsed `@`-reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "ref", rename_all = "camelCase")]
pub enum Reference {
    /// `@queue[index]` with optional `+N` / `-N`
    QueueIndex {
        queue: String,
        index: usize,
        offset: i64,
    },
    /// `@station.waferId`
    StationWafer { station: String },
    /// Anything else, resolves to 0
    Unresolvable { raw: String },
}

// ============================================================================
// Effects
// ============================================================================

/// Effect applied after a rule dispatches
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Effect {
    QueueOperation { queue: String, operation: QueueOp },
    /// `<queue>.Count >= TotalWafers`
    CheckCompletion { queue: String },
}

/// Queue mutation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueueOp {
    /// Append the resolved value
    Add(Operand),
    /// Drop the head
    RemoveFirst,
    /// Remove the first occurrence of a literal id
    Remove(WaferId),
}

impl RuleCatalog {
    /// Executable rules in execution order: ascending priority, ties by catalog order
    pub fn execution_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.rules.len())
            .filter(|&i| self.rules[i].is_executable())
            .collect();
        // sort_by_key is stable
        order.sort_by_key(|&i| self.rules[i].priority);
        order
    }

    /// Non-fatal consistency warnings
    ///
    /// Checks against an empty declared resource list are skipped.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        let mut seen = HashSet::new();

        let robots = &self.resources.robots;
        let stations = &self.resources.stations;
        let queues = &self.resources.queues;
        let is_location = |name: &str| {
            stations.iter().any(|s| s == name) || queues.iter().any(|q| q == name)
        };

        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                warnings.push(format!("duplicate rule id '{}'", rule.id));
            }

            if !stations.is_empty() && rule.is_executable() {
                for (field, loc) in [("from", &rule.from), ("to", &rule.to)] {
                    if !loc.is_empty() && !is_location(loc) {
                        warnings.push(format!(
                            "rule '{}': {} '{}' is not a declared station or queue",
                            rule.id, field, loc
                        ));
                    }
                }
            }

            if !robots.is_empty() {
                if let Some(robot) = &rule.default_robot {
                    if !robots.contains(robot) {
                        warnings.push(format!(
                            "rule '{}': default robot '{}' is not declared",
                            rule.id, robot
                        ));
                    }
                }
            }

            if !queues.is_empty() {
                let mut referenced = rule.conditions.queue_names();
                for effect in &rule.effects {
                    match effect {
                        Effect::QueueOperation { queue, .. } | Effect::CheckCompletion { queue } => {
                            referenced.push(queue)
                        },
                    }
                }
                for queue in referenced {
                    if !queues.iter().any(|q| q == queue) {
                        warnings.push(format!(
                            "rule '{}': queue '{}' is not declared",
                            rule.id, queue
                        ));
                    }
                }
            }
        }

        if !robots.is_empty() {
            let mut behavior_robots: Vec<&String> = self.robot_behaviors.keys().collect();
            behavior_robots.sort();
            for robot in behavior_robots {
                if !robots.contains(robot) {
                    warnings.push(format!("wait behavior for undeclared robot '{}'", robot));
                }
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, priority: i32, kind: ActionKind) -> Rule {
        Rule {
            id: id.to_string(),
            priority,
            description: None,
            default_robot: None,
            from: String::new(),
            to: String::new(),
            conditions: Condition::default(),
            action: RuleAction {
                kind,
                ..RuleAction::default()
            },
            effects: Vec::new(),
            behavior: None,
        }
    }

    #[test]
    fn test_execution_order_is_stable_by_priority() {
        let catalog = RuleCatalog {
            rules: vec![
                rule("late", 20, ActionKind::Transfer),
                rule("first_tie", 10, ActionKind::Transfer),
                rule("auto", 0, ActionKind::Automatic),
                rule("second_tie", 10, ActionKind::Transfer),
            ],
            ..RuleCatalog::default()
        };

        let ids: Vec<&str> = catalog
            .execution_order()
            .into_iter()
            .map(|i| catalog.rules[i].id.as_str())
            .collect();
        assert_eq!(ids, vec!["first_tie", "second_tie", "late"]);
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!(Operator::parse("notEquals"), Operator::NotEquals);
        assert_eq!(Operator::parse("GREATERTHAN"), Operator::GreaterThan);
        assert_eq!(
            Operator::parse("between"),
            Operator::Unsupported("between".to_string())
        );
    }

    #[test]
    fn test_validate_reports_undeclared_names() {
        let mut transfer = rule("r1", 1, ActionKind::Transfer);
        transfer.from = "LoadPort.Pending".to_string();
        transfer.to = "etcher".to_string();
        transfer.default_robot = Some("R9".to_string());

        let catalog = RuleCatalog {
            resources: Resources {
                robots: vec!["R1".to_string()],
                stations: vec!["polisher".to_string()],
                queues: vec!["LoadPort.Pending".to_string()],
            },
            rules: vec![transfer.clone(), transfer],
            ..RuleCatalog::default()
        };

        let warnings = catalog.validate();
        assert!(warnings.iter().any(|w| w.contains("duplicate rule id 'r1'")));
        assert!(warnings.iter().any(|w| w.contains("to 'etcher'")));
        assert!(warnings.iter().any(|w| w.contains("default robot 'R9'")));
        assert!(!warnings.iter().any(|w| w.contains("from 'LoadPort.Pending'")));
    }
}
