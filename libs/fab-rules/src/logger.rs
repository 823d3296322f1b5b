//! Rule execution logger
//!
//! Execution logging is injected into the engine through `ExecutionLogger`.
//! `TracingExecutionLogger` is the default; `RuleLogger` writes an independent,
//! daily-rotated log file per catalog.

use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{Local, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::executor::{DispatchPath, RuleExecutionResult};
use crate::types::{Condition, Operand, Reference};

/// Receives one record per executed rule
pub trait ExecutionLogger: Send + Sync {
    fn log_execution(&self, result: &RuleExecutionResult);
}

/// Default logger: one `info!` line per executed rule
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingExecutionLogger;

impl ExecutionLogger for TracingExecutionLogger {
    fn log_execution(&self, result: &RuleExecutionResult) {
        info!("[RULE] {} {}", result.rule_id, format_line(result));
    }
}

/// File logger for one catalog
///
/// Files live in `{log_root}/rules/{catalog_id}/` and are named
/// `{YYYYMMDD}_{catalog_id}.log`.
pub struct RuleLogger {
    catalog_id: String,
    log_dir: PathBuf,
    current_date: Mutex<String>,
    current_file: Mutex<Option<File>>,
}

impl RuleLogger {
    pub fn new(log_root: &Path, catalog_id: &str) -> Self {
        let log_dir = log_root.join("rules").join(catalog_id);
        if let Err(e) = fs::create_dir_all(&log_dir) {
            warn!("Log dir err {:?}: {}", log_dir, e);
        }

        Self {
            catalog_id: catalog_id.to_string(),
            log_dir,
            current_date: Mutex::new(String::new()),
            current_file: Mutex::new(None),
        }
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    fn write_line(&self, rule_id: &str, message: &str) {
        let today = Local::now().format("%Y%m%d").to_string();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ");

        let mut current_date = self.current_date.lock();
        let mut file_guard = self.current_file.lock();

        if *current_date != today {
            // New day - open new file
            *current_date = today.clone();
            let file_path = self
                .log_dir
                .join(format!("{}_{}.log", today, self.catalog_id));

            match OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file_path)
            {
                Ok(file) => *file_guard = Some(file),
                Err(e) => {
                    warn!("Log open err {:?}: {}", file_path, e);
                    return;
                },
            }
        }

        if let Some(ref mut file) = *file_guard {
            let line = format!("{} [RULE] {} {}\n", timestamp, rule_id, message);
            if let Err(e) = file.write_all(line.as_bytes()) {
                warn!("Log write err: {}", e);
            }
        }
    }
}

impl ExecutionLogger for RuleLogger {
    fn log_execution(&self, result: &RuleExecutionResult) {
        self.write_line(&result.rule_id, &format_line(result));
    }
}

/// `condition | wafer from->to by robot via path | effects`
fn format_line(result: &RuleExecutionResult) -> String {
    let cond = if result.matched_condition.is_empty() {
        "-"
    } else {
        result.matched_condition.as_str()
    };
    let via = match result.dispatched_via {
        DispatchPath::Scheduler => "scheduler",
        DispatchPath::DirectCommand => "command",
    };
    format!(
        "{} | wafer {} {}->{} by {} via {} | {} effects",
        cond,
        result.wafer_id,
        result.from,
        result.to,
        result.robot.as_deref().unwrap_or("-"),
        via,
        result.effects_applied
    )
}

/// Render a condition tree as a compact expression, e.g. `cleaner=done && !(R1=busy)`
pub fn format_condition(condition: &Condition) -> String {
    match condition {
        Condition::And { children } => join_children(children, " && "),
        Condition::Or { children } => join_children(children, " || "),
        Condition::Not { children } => format!("!({})", join_children(children, ", ")),
        Condition::StationState {
            station: subject,
            operator,
            value,
        }
        | Condition::RobotState {
            robot: subject,
            operator,
            value,
        }
        | Condition::QueueCount {
            queue: subject,
            operator,
            value,
        }
        | Condition::QueueContains {
            queue: subject,
            operator,
            value,
        } => {
            let subject = if matches!(condition, Condition::QueueCount { .. }) {
                format!("{}.Count", subject)
            } else {
                subject.clone()
            };
            format!("{}{}{}", subject, operator.symbol(), format_operand(value))
        },
        Condition::Comment { .. } => "#".to_string(),
    }
}

fn join_children(children: &[Condition], separator: &str) -> String {
    if children.is_empty() {
        return "false".to_string();
    }
    let parts: Vec<String> = children
        .iter()
        .map(|c| match c {
            Condition::And { children } | Condition::Or { children } if children.len() > 1 => {
                format!("({})", format_condition(c))
            },
            _ => format_condition(c),
        })
        .collect();
    parts.join(separator)
}

fn format_operand(value: &Operand) -> String {
    match value {
        Operand::Int(n) => n.to_string(),
        Operand::Text(s) => s.clone(),
        Operand::Reference(Reference::QueueIndex {
            queue,
            index,
            offset,
        }) => match offset {
            0 => format!("@{}[{}]", queue, index),
            n if *n < 0 => format!("@{}[{}]{}", queue, index, n),
            n => format!("@{}[{}]+{}", queue, index, n),
        },
        Operand::Reference(Reference::StationWafer { station }) => format!("@{}.waferId", station),
        Operand::Reference(Reference::Unresolvable { raw }) => format!("@{}", raw),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::types::Operator;

    fn result() -> RuleExecutionResult {
        RuleExecutionResult {
            rule_id: "load_polisher".to_string(),
            priority: 1,
            robot: Some("R1".to_string()),
            wafer_id: 3,
            from: "LoadPort.Pending".to_string(),
            to: "polisher".to_string(),
            dispatched_via: DispatchPath::DirectCommand,
            effects_applied: 1,
            matched_condition: "polisher=empty".to_string(),
        }
    }

    #[test]
    fn test_format_condition_nested() {
        let condition = Condition::And {
            children: vec![
                Condition::StationState {
                    station: "cleaner".to_string(),
                    operator: Operator::Equals,
                    value: Operand::Text("done".to_string()),
                },
                Condition::Not {
                    children: vec![Condition::RobotState {
                        robot: "R1".to_string(),
                        operator: Operator::Equals,
                        value: Operand::Text("busy".to_string()),
                    }],
                },
                Condition::Or {
                    children: vec![
                        Condition::QueueCount {
                            queue: "LoadPort.Pending".to_string(),
                            operator: Operator::GreaterThan,
                            value: Operand::Int(0),
                        },
                        Condition::QueueContains {
                            queue: "LoadPort.Completed".to_string(),
                            operator: Operator::Contains,
                            value: Operand::Reference(Reference::QueueIndex {
                                queue: "LoadPort.Pending".to_string(),
                                index: 0,
                                offset: -3,
                            }),
                        },
                    ],
                },
            ],
        };

        assert_eq!(
            format_condition(&condition),
            "cleaner=done && !(R1=busy) && (LoadPort.Pending.Count>0 || LoadPort.Completed has @LoadPort.Pending[0]-3)"
        );
    }

    #[test]
    fn test_format_condition_empty() {
        assert_eq!(format_condition(&Condition::default()), "false");
    }

    #[test]
    fn test_format_line() {
        assert_eq!(
            format_line(&result()),
            "polisher=empty | wafer 3 LoadPort.Pending->polisher by R1 via command | 1 effects"
        );
    }

    #[test]
    fn test_rule_logger_writes_daily_file() {
        let dir = tempfile::tempdir().unwrap();
        let logger = RuleLogger::new(dir.path(), "cmp-line");
        logger.log_execution(&result());
        logger.log_execution(&result());

        let files: Vec<_> = fs::read_dir(logger.log_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(files.len(), 1);

        let content = fs::read_to_string(&files[0]).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("[RULE] load_polisher polisher=empty"));
    }
}
