//! Rule catalog parser
//!
//! Parses the catalog JSON (or YAML) record into the typed `RuleCatalog`.
//! Kind strings are matched case-insensitively; unknown condition, effect,
//! action and queue-operation kinds are rejected here rather than silently
//! evaluating to false at run time.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{Result, RuleError};
use crate::types::{
    ActionKind, Condition, Effect, ExecutionSettings, Operand, Operator, QueueOp, Resources,
    Rule, RuleAction, RuleCatalog, WaitBehavior, WaitCondition,
};

static COMPLETION_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\s*(?P<queue>\S+)\.Count\s*>=\s*TotalWafers\s*$").ok()
});

/// Parse catalog JSON into a RuleCatalog
pub fn parse_catalog(json: &Value) -> Result<RuleCatalog> {
    let root = json
        .as_object()
        .ok_or_else(|| RuleError::InvalidFormat("Catalog must be an object".to_string()))?;

    let id = get_str(root, "id")
        .ok_or_else(|| RuleError::ParseError("Missing 'id' field".to_string()))?
        .to_string();
    let version = get_str(root, "version").unwrap_or("1.0").to_string();

    let settings = root
        .get("configuration")
        .map(parse_settings)
        .unwrap_or_default();
    let resources = root
        .get("resources")
        .map(parse_resources)
        .unwrap_or_default();

    let rules = match root.get("rules") {
        Some(Value::Array(arr)) => arr.iter().map(parse_rule).collect::<Result<Vec<_>>>()?,
        Some(_) => {
            return Err(RuleError::ParseError(
                "'rules' must be an array".to_string(),
            ))
        },
        None => Vec::new(),
    };

    let robot_behaviors = match root.get("robotBehaviors") {
        Some(v) => parse_robot_behaviors(v)?,
        None => HashMap::new(),
    };
    let state_mapping = match root.get("stateMapping") {
        Some(v) => parse_state_mapping(v)?,
        None => HashMap::new(),
    };

    Ok(RuleCatalog {
        id,
        version,
        settings,
        resources,
        rules,
        robot_behaviors,
        state_mapping,
    })
}

/// Parse catalog text; YAML when `yaml` is set, JSON otherwise
pub fn parse_catalog_str(text: &str, yaml: bool) -> Result<RuleCatalog> {
    let value: Value = if yaml {
        serde_yaml::from_str(text)?
    } else {
        serde_json::from_str(text)?
    };
    parse_catalog(&value)
}

/// Load a catalog file, format chosen by extension (`.yaml`/`.yml` or JSON)
pub fn load_catalog(path: &Path) -> Result<RuleCatalog> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| RuleError::IoError(format!("{}: {}", path.display(), e)))?;
    let yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let catalog = parse_catalog_str(&text, yaml)?;

    tracing::info!(
        "Loaded catalog {} v{} ({} rules) from {}",
        catalog.id,
        catalog.version,
        catalog.rules.len(),
        path.display()
    );
    Ok(catalog)
}

fn parse_settings(v: &Value) -> ExecutionSettings {
    ExecutionSettings {
        mode: v
            .get("mode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        conflict_resolution: v
            .get("conflictResolution")
            .and_then(Value::as_str)
            .unwrap_or("priority")
            .to_string(),
        enable_parallel_execution: v
            .get("enableParallelExecution")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn parse_resources(v: &Value) -> Resources {
    Resources {
        robots: string_list(v.get("robots")),
        stations: string_list(v.get("stations")),
        queues: string_list(v.get("queues")),
    }
}

/// Parse a single rule
fn parse_rule(v: &Value) -> Result<Rule> {
    let obj = v
        .as_object()
        .ok_or_else(|| RuleError::ParseError("Rule must be an object".to_string()))?;

    let id = match obj.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(RuleError::ParseError("Rule missing 'id'".to_string())),
    };

    let priority = match obj.get("priority").and_then(Value::as_i64) {
        Some(p) => i32::try_from(p).map_err(|_| {
            RuleError::ParseError(format!("Rule {}: priority {} out of range", id, p))
        })?,
        None => 0,
    };

    let conditions = match obj.get("conditions") {
        Some(Value::Null) | None => Condition::default(),
        Some(c) => parse_condition(c, &id)?,
    };

    let action = match obj.get("action") {
        Some(Value::Null) | None => RuleAction::default(),
        Some(a) => parse_action(a, &id)?,
    };

    let effects = match obj.get("effects") {
        Some(Value::Array(arr)) => arr
            .iter()
            .map(|e| parse_effect(e, &id))
            .collect::<Result<Vec<_>>>()?,
        Some(Value::Null) | None => Vec::new(),
        Some(_) => {
            return Err(RuleError::ParseError(format!(
                "Rule {}: 'effects' must be an array",
                id
            )))
        },
    };

    Ok(Rule {
        priority,
        description: get_str(obj, "description")
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        default_robot: get_str(obj, "defaultRobot").map(str::to_string),
        from: get_str(obj, "from").unwrap_or_default().to_string(),
        to: get_str(obj, "to").unwrap_or_default().to_string(),
        conditions,
        action,
        effects,
        behavior: obj.get("behavior").cloned(),
        id,
    })
}

/// Parse a condition tree
pub fn parse_condition(v: &Value, rule_id: &str) -> Result<Condition> {
    let obj = v.as_object().ok_or_else(|| {
        RuleError::ParseError(format!("Rule {}: condition must be an object", rule_id))
    })?;

    let kind = kind_of(obj).ok_or_else(|| {
        RuleError::ParseError(format!("Rule {}: condition missing 'type'", rule_id))
    })?;

    let condition = match kind.to_ascii_lowercase().as_str() {
        "and" => Condition::And {
            children: parse_children(obj, rule_id)?,
        },
        "or" => Condition::Or {
            children: parse_children(obj, rule_id)?,
        },
        "not" => Condition::Not {
            children: parse_children(obj, rule_id)?,
        },
        "comment" => Condition::Comment {
            text: get_str(obj, "text")
                .or_else(|| get_str(obj, "value"))
                .unwrap_or_default()
                .to_string(),
        },
        "stationstate" => Condition::StationState {
            station: subject(obj, "station", rule_id)?,
            operator: leaf_operator(obj, Operator::Equals),
            value: leaf_value(obj, &["value", "state"]),
        },
        "robotstate" => Condition::RobotState {
            robot: subject(obj, "robot", rule_id)?,
            operator: leaf_operator(obj, Operator::Equals),
            value: leaf_value(obj, &["value", "state"]),
        },
        "queuecount" => Condition::QueueCount {
            queue: subject(obj, "queue", rule_id)?,
            operator: leaf_operator(obj, Operator::Equals),
            value: leaf_value(obj, &["value", "count"]),
        },
        "queuecontains" => Condition::QueueContains {
            queue: subject(obj, "queue", rule_id)?,
            operator: leaf_operator(obj, Operator::Contains),
            value: leaf_value(obj, &["value", "waferId"]),
        },
        _ => {
            return Err(RuleError::UnknownKind {
                category: "condition",
                kind: kind.to_string(),
                rule_id: rule_id.to_string(),
            })
        },
    };

    if let Some(warning) = operator_mismatch(&condition) {
        tracing::warn!("Rule {}: {}", rule_id, warning);
    }

    Ok(condition)
}

fn parse_children(obj: &Map<String, Value>, rule_id: &str) -> Result<Vec<Condition>> {
    let children = obj.get("conditions").or_else(|| obj.get("children"));
    match children {
        Some(Value::Array(arr)) => arr.iter().map(|c| parse_condition(c, rule_id)).collect(),
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(_) => Err(RuleError::ParseError(format!(
            "Rule {}: child conditions must be an array",
            rule_id
        ))),
    }
}

fn subject(obj: &Map<String, Value>, key: &str, rule_id: &str) -> Result<String> {
    get_str(obj, key)
        .or_else(|| get_str(obj, "subject"))
        .map(str::to_string)
        .ok_or_else(|| {
            RuleError::ParseError(format!("Rule {}: condition missing '{}'", rule_id, key))
        })
}

fn leaf_operator(obj: &Map<String, Value>, default: Operator) -> Operator {
    get_str(obj, "operator").map_or(default, Operator::parse)
}

fn leaf_value(obj: &Map<String, Value>, keys: &[&str]) -> Operand {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .map_or(Operand::Text(String::new()), parse_operand)
}

/// Operator not applicable to the leaf kind (evaluates to false)
fn operator_mismatch(condition: &Condition) -> Option<String> {
    use Operator::{Contains, Equals, GreaterThan, LessThan, NotContains, NotEquals};

    let (kind, operator, supported) = match condition {
        Condition::StationState { operator, .. } => (
            "stationState",
            operator,
            matches!(operator, Equals | NotEquals),
        ),
        Condition::RobotState { operator, .. } => (
            "robotState",
            operator,
            matches!(operator, Equals | NotEquals),
        ),
        Condition::QueueCount { operator, .. } => (
            "queueCount",
            operator,
            matches!(operator, GreaterThan | LessThan | Equals),
        ),
        Condition::QueueContains { operator, .. } => (
            "queueContains",
            operator,
            matches!(operator, Contains | NotContains),
        ),
        _ => return None,
    };

    if supported {
        None
    } else {
        Some(format!(
            "operator '{}' is not supported by {}, condition is always false",
            operator.symbol(),
            kind
        ))
    }
}

/// Classify a raw JSON value once
pub fn parse_operand(v: &Value) -> Operand {
    match v {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Operand::Int(i),
            None => Operand::Text(n.to_string()),
        },
        Value::String(s) => Operand::from_text(s),
        Value::Bool(b) => Operand::Text(b.to_string()),
        Value::Null => Operand::Text(String::new()),
        other => Operand::Text(other.to_string()),
    }
}

fn parse_action(v: &Value, rule_id: &str) -> Result<RuleAction> {
    let obj = v.as_object().ok_or_else(|| {
        RuleError::ParseError(format!("Rule {}: action must be an object", rule_id))
    })?;

    let kind = match kind_of(obj).map(str::to_ascii_lowercase).as_deref() {
        None | Some("transfer") => ActionKind::Transfer,
        Some("automatic") => ActionKind::Automatic,
        Some(other) => {
            return Err(RuleError::UnknownKind {
                category: "action",
                kind: other.to_string(),
                rule_id: rule_id.to_string(),
            })
        },
    };

    let parameters: BTreeMap<String, Operand> = obj
        .get("parameters")
        .and_then(Value::as_object)
        .map(|params| {
            params
                .iter()
                .map(|(k, v)| (k.clone(), parse_operand(v)))
                .collect()
        })
        .unwrap_or_default();

    Ok(RuleAction {
        kind,
        command: get_str(obj, "command").map(str::to_string),
        parameters,
    })
}

fn parse_effect(v: &Value, rule_id: &str) -> Result<Effect> {
    let obj = v.as_object().ok_or_else(|| {
        RuleError::ParseError(format!("Rule {}: effect must be an object", rule_id))
    })?;

    let kind = kind_of(obj).ok_or_else(|| {
        RuleError::ParseError(format!("Rule {}: effect missing 'type'", rule_id))
    })?;

    match kind.to_ascii_lowercase().as_str() {
        "queueoperation" => {
            let queue = get_str(obj, "queue")
                .or_else(|| get_str(obj, "queueName"))
                .ok_or_else(|| {
                    RuleError::ParseError(format!("Rule {}: queue effect missing 'queue'", rule_id))
                })?
                .to_string();
            let operation = get_str(obj, "operation").unwrap_or_default();
            let value = obj.get("value").filter(|v| !v.is_null());

            let op = match operation.to_ascii_lowercase().as_str() {
                "add" => QueueOp::Add(value.map(parse_operand).ok_or_else(|| {
                    RuleError::ParseError(format!("Rule {}: 'add' requires a value", rule_id))
                })?),
                "removefirst" => QueueOp::RemoveFirst,
                "remove" => QueueOp::Remove(
                    value
                        .map(parse_operand)
                        .and_then(|o| o.literal_int())
                        .ok_or_else(|| {
                            RuleError::ParseError(format!(
                                "Rule {}: 'remove' requires a literal integer value",
                                rule_id
                            ))
                        })?,
                ),
                _ => {
                    return Err(RuleError::UnknownKind {
                        category: "queue operation",
                        kind: operation.to_string(),
                        rule_id: rule_id.to_string(),
                    })
                },
            };
            Ok(Effect::QueueOperation { queue, operation: op })
        },
        "checkcompletion" => {
            let text = get_str(obj, "condition")
                .or_else(|| get_str(obj, "conditionText"))
                .unwrap_or_default();
            let queue = parse_completion_text(text).ok_or_else(|| {
                RuleError::ParseError(format!(
                    "Rule {}: unsupported completion condition '{}'",
                    rule_id, text
                ))
            })?;
            Ok(Effect::CheckCompletion { queue })
        },
        _ => Err(RuleError::UnknownKind {
            category: "effect",
            kind: kind.to_string(),
            rule_id: rule_id.to_string(),
        }),
    }
}

/// `<queue>.Count >= TotalWafers` -> queue name
pub fn parse_completion_text(text: &str) -> Option<String> {
    COMPLETION_RE
        .as_ref()?
        .captures(text)
        .and_then(|caps| caps.name("queue"))
        .map(|m| m.as_str().to_string())
}

fn parse_robot_behaviors(v: &Value) -> Result<HashMap<String, WaitBehavior>> {
    let obj = v
        .as_object()
        .ok_or_else(|| RuleError::ParseError("'robotBehaviors' must be an object".to_string()))?;

    let mut behaviors = HashMap::new();
    for (robot, behavior) in obj {
        let mut wait_conditions = HashMap::new();
        if let Some(conds) = behavior.get("waitConditions").and_then(Value::as_object) {
            for (destination, cond) in conds {
                let ready_states = cond
                    .get("readyStates")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<HashSet<_>>()
                    });
                wait_conditions.insert(
                    destination.clone(),
                    WaitCondition {
                        ready_states,
                        always_ready: cond
                            .get("alwaysReady")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                        description: cond
                            .get("description")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                );
            }
        }
        behaviors.insert(robot.clone(), WaitBehavior { wait_conditions });
    }
    Ok(behaviors)
}

fn parse_state_mapping(v: &Value) -> Result<HashMap<String, HashMap<String, HashSet<String>>>> {
    let obj = v
        .as_object()
        .ok_or_else(|| RuleError::ParseError("'stateMapping' must be an object".to_string()))?;

    let mut mapping = HashMap::new();
    for (station, aliases) in obj {
        let aliases = aliases.as_object().ok_or_else(|| {
            RuleError::ParseError(format!("stateMapping for '{}' must be an object", station))
        })?;
        let station_aliases = aliases
            .iter()
            .map(|(alias, states)| {
                let states = string_list(Some(states)).into_iter().collect::<HashSet<_>>();
                (alias.clone(), states)
            })
            .collect();
        mapping.insert(station.clone(), station_aliases);
    }
    Ok(mapping)
}

fn kind_of(obj: &Map<String, Value>) -> Option<&str> {
    get_str(obj, "type").or_else(|| get_str(obj, "kind"))
}

fn get_str<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    obj.get(key).and_then(Value::as_str)
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::Reference;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_catalog() {
        let catalog = parse_catalog(&json!({ "id": "cmp", "rules": [] })).unwrap();
        assert_eq!(catalog.id, "cmp");
        assert_eq!(catalog.version, "1.0");
        assert!(!catalog.settings.enable_parallel_execution);
        assert!(catalog.rules.is_empty());
    }

    #[test]
    fn test_missing_id_is_fatal() {
        let err = parse_catalog(&json!({ "rules": [] })).unwrap_err();
        assert!(matches!(err, RuleError::ParseError(_)));
    }

    #[test]
    fn test_parse_rule_with_nested_conditions() {
        let catalog = parse_catalog(&json!({
            "id": "cmp",
            "rules": [{
                "id": "load_polisher",
                "priority": 5,
                "defaultRobot": "R1",
                "from": "LoadPort.Pending",
                "to": "polisher",
                "conditions": {
                    "type": "AND",
                    "conditions": [
                        { "type": "stationState", "station": "polisher", "value": "empty" },
                        { "type": "not", "conditions": [
                            { "type": "robotState", "robot": "R1", "value": "busy" }
                        ]},
                        { "type": "queueContains", "queue": "LoadPort.Completed",
                          "operator": "notContains", "value": "@LoadPort.Pending[0]-3" }
                    ]
                },
                "action": { "type": "transfer", "parameters": { "waferId": "@LoadPort.Pending[0]" } },
                "effects": [
                    { "type": "queueOperation", "queue": "LoadPort.Pending", "operation": "removeFirst" }
                ]
            }]
        }))
        .unwrap();

        let rule = &catalog.rules[0];
        assert_eq!(rule.priority, 5);
        assert_eq!(rule.default_robot.as_deref(), Some("R1"));
        let Condition::And { children } = &rule.conditions else {
            panic!("expected and");
        };
        assert_eq!(children.len(), 3);
        assert_eq!(
            children[2],
            Condition::QueueContains {
                queue: "LoadPort.Completed".to_string(),
                operator: Operator::NotContains,
                value: Operand::Reference(Reference::QueueIndex {
                    queue: "LoadPort.Pending".to_string(),
                    index: 0,
                    offset: -3
                }),
            }
        );
        assert_eq!(
            rule.effects[0],
            Effect::QueueOperation {
                queue: "LoadPort.Pending".to_string(),
                operation: QueueOp::RemoveFirst
            }
        );
    }

    #[test]
    fn test_missing_conditions_default_to_never() {
        let catalog = parse_catalog(&json!({
            "id": "c", "rules": [{ "id": "r" }]
        }))
        .unwrap();
        assert_eq!(catalog.rules[0].conditions, Condition::default());
        assert_eq!(catalog.rules[0].action.kind, ActionKind::Transfer);
    }

    #[test]
    fn test_unknown_kinds_rejected() {
        let err = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "conditions": { "type": "timeElapsed" } }]
        }))
        .unwrap_err();
        assert!(
            matches!(err, RuleError::UnknownKind { category: "condition", ref kind, .. } if kind == "timeElapsed")
        );

        let err = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "effects": [{ "type": "notify" }] }]
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::UnknownKind { category: "effect", .. }));

        let err = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "action": { "type": "teleport" } }]
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::UnknownKind { category: "action", .. }));
    }

    #[test]
    fn test_completion_text() {
        assert_eq!(
            parse_completion_text("LoadPort.Completed.Count >= TotalWafers").as_deref(),
            Some("LoadPort.Completed")
        );
        assert_eq!(parse_completion_text("LoadPort.Completed.Count > 3"), None);
        assert_eq!(
            parse_completion_text("  Out.Count>=TotalWafers ").as_deref(),
            Some("Out")
        );
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let err = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "priority": 4_294_967_297_i64 }]
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::ParseError(_)));

        let catalog = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "priority": -7 }]
        }))
        .unwrap();
        assert_eq!(catalog.rules[0].priority, -7);
    }

    #[test]
    fn test_remove_requires_literal() {
        let err = parse_catalog(&json!({
            "id": "c",
            "rules": [{ "id": "r", "effects": [
                { "type": "queueOperation", "queue": "Q", "operation": "remove", "value": "@Q[0]" }
            ]}]
        }))
        .unwrap_err();
        assert!(matches!(err, RuleError::ParseError(_)));
    }

    #[test]
    fn test_parse_behaviors_and_mapping() {
        let catalog = parse_catalog(&json!({
            "id": "c",
            "robotBehaviors": {
                "R2": { "waitConditions": {
                    "cleaner": { "readyStates": ["empty", "done"], "description": "wait for cleaner" },
                    "buffer": { "alwaysReady": true }
                }}
            },
            "stateMapping": { "cleaner": { "done": ["done", "COMPLETE"] } }
        }))
        .unwrap();

        let r2 = &catalog.robot_behaviors["R2"];
        assert!(r2.wait_conditions["buffer"].always_ready);
        assert!(r2.wait_conditions["cleaner"]
            .ready_states
            .as_ref()
            .unwrap()
            .contains("done"));
        assert!(catalog.state_mapping["cleaner"]["done"].contains("COMPLETE"));
    }

    #[test]
    fn test_parse_yaml_catalog() {
        let yaml = r#"
id: cmp-yaml
configuration:
  enableParallelExecution: true
rules:
  - id: r1
    priority: 1
    conditions:
      type: queueCount
      queue: LoadPort.Pending
      operator: greaterThan
      value: 0
"#;
        let catalog = parse_catalog_str(yaml, true).unwrap();
        assert!(catalog.settings.enable_parallel_execution);
        assert!(matches!(
            catalog.rules[0].conditions,
            Condition::QueueCount { operator: Operator::GreaterThan, value: Operand::Int(0), .. }
        ));
    }
}
