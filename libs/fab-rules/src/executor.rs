//! Rule Executor - priority-ordered evaluation loop
//!
//! On every status change:
//! 1. Record the report in the runtime state and release waiting robots
//! 2. Skip the pass when paused or when the state signature is unchanged
//! 3. Evaluate executable rules by ascending priority
//! 4. Dispatch each satisfied rule and apply its effects, stopping after the
//!    first one unless parallel execution is enabled

use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Span};

use crate::dispatch::{EventSink, OutboundEvent, TransferRequest, TransferScheduler};
use crate::effects::{apply_effect, EffectNotification};
use crate::error::{Result, RuleError};
use crate::evaluator::ConditionEvaluator;
use crate::logger::{format_condition, ExecutionLogger, TracingExecutionLogger};
use crate::readiness::{is_release_state, resolve_robot, resolve_station};
use crate::state::{is_waiting_state, RuntimeState};
use crate::types::{Operand, Rule, RuleAction, RuleCatalog, WaferId, COMPLETED_QUEUE, PENDING_QUEUE};

/// Number of executions kept for `recent_executions`
pub const HISTORY_CAPACITY: usize = 64;

/// Robot states that trigger an evaluation pass
const EVALUATING_ROBOT_STATES: [&str; 2] = ["holding", "idle"];

/// How a transfer left the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatchPath {
    Scheduler,
    DirectCommand,
}

/// Record of an executed rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleExecutionResult {
    pub rule_id: String,
    pub priority: i32,
    pub robot: Option<String>,
    pub wafer_id: WaferId,
    pub from: String,
    pub to: String,
    pub dispatched_via: DispatchPath,
    /// Effects that changed a queue
    pub effects_applied: usize,
    /// Rendered condition tree, e.g. `cleaner=done && R2=idle`
    pub matched_condition: String,
}

/// Dry-run result for one rule
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionResult {
    pub rule_id: String,
    pub priority: i32,
    pub expression: String,
    pub result: bool,
}

/// Engine status snapshot
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub catalog_id: String,
    pub paused: bool,
    pub carrier_id: Option<String>,
    pub total_wafers: usize,
    pub pending: usize,
    pub completed: usize,
    pub evaluation_passes: u64,
    pub skipped_passes: u64,
    pub rules_executed: u64,
    /// (robot, destination)
    pub waiting_robots: Vec<(String, String)>,
    pub pending_commands: Vec<String>,
}

/// Action parameter after reference resolution
#[derive(Debug, Clone, PartialEq, Eq)]
enum ParamValue {
    Int(i64),
    Text(String),
}

impl ParamValue {
    fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    fn as_int(&self) -> i64 {
        match self {
            ParamValue::Int(n) => *n,
            ParamValue::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

/// Rule engine - single owner of the runtime state
pub struct RuleEngine {
    catalog: Arc<RuleCatalog>,
    /// Executable rule indices in execution order
    order: Arc<[usize]>,
    state: RuntimeState,
    total_wafers: usize,
    sink: Arc<dyn EventSink>,
    scheduler: Option<Arc<dyn TransferScheduler>>,
    logger: Arc<dyn ExecutionLogger>,
    span: Span,
    carrier_id: Option<String>,
    history: VecDeque<RuleExecutionResult>,
    evaluation_passes: u64,
    skipped_passes: u64,
    rules_executed: u64,
}

impl RuleEngine {
    /// Create an engine using the legacy direct-command path
    pub fn new(catalog: Arc<RuleCatalog>, total_wafers: usize, sink: Arc<dyn EventSink>) -> Self {
        let span = info_span!("fab_engine", catalog = %catalog.id);
        {
            let _enter = span.enter();
            for warning in catalog.validate() {
                warn!("Catalog {}: {}", catalog.id, warning);
            }
            info!(
                "Engine ready: {} rules, {} wafers, parallel={}",
                catalog.rules.len(),
                total_wafers,
                catalog.settings.enable_parallel_execution
            );
        }

        Self {
            order: catalog.execution_order().into(),
            catalog,
            state: RuntimeState::new(total_wafers),
            total_wafers,
            sink,
            scheduler: None,
            logger: Arc::new(TracingExecutionLogger),
            span,
            carrier_id: None,
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
            evaluation_passes: 0,
            skipped_passes: 0,
            rules_executed: 0,
        }
    }

    /// Submit transfers to a robot scheduler instead of commanding robots directly
    pub fn with_scheduler(mut self, scheduler: Arc<dyn TransferScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ExecutionLogger>) -> Self {
        self.logger = logger;
        self
    }

    // ========== Inbound API ==========

    pub fn on_station_status(&mut self, station: &str, state: &str, wafer_id: Option<WaferId>) {
        let span = self.span.clone();
        let _enter = span.enter();

        debug!("Station {} -> {} ({:?})", station, state, wafer_id);
        self.state.set_station_status(station, state, wafer_id);

        if is_release_state(state) {
            for robot in resolve_station(&self.catalog, &mut self.state, station) {
                self.emit_destination_ready(robot);
            }
        }

        self.run_evaluation();
    }

    pub fn on_robot_status(
        &mut self,
        robot: &str,
        state: &str,
        wafer_id: Option<WaferId>,
        waiting_for: Option<&str>,
    ) {
        let span = self.span.clone();
        let _enter = span.enter();

        debug!(
            "Robot {} -> {} ({:?}, waiting for {:?})",
            robot, state, wafer_id, waiting_for
        );
        self.state
            .set_robot_status(robot, state, wafer_id, waiting_for);

        if waiting_for.is_some()
            && is_waiting_state(state)
            && resolve_robot(&self.catalog, &mut self.state, robot)
        {
            self.emit_destination_ready(robot.to_string());
        }

        if EVALUATING_ROBOT_STATES
            .iter()
            .any(|s| s.eq_ignore_ascii_case(state))
        {
            self.run_evaluation();
        }
    }

    /// Suppress rule execution; status updates are still recorded
    pub fn pause(&mut self) {
        let _enter = self.span.enter();
        self.state.set_paused(true);
        info!("Engine paused");
    }

    /// Re-enable rule execution; the next status update runs a full pass
    pub fn resume(&mut self, carrier_id: Option<&str>) {
        let _enter = self.span.enter();
        if let Some(id) = carrier_id {
            self.carrier_id = Some(id.to_string());
        }
        self.state.set_paused(false);
        self.state.set_last_signature(None);
        info!("Engine resumed (carrier {:?})", self.carrier_id);
    }

    /// Start a new batch: queues and tracking are rebuilt, pause flag kept
    pub fn reset(&mut self, carrier_id: Option<&str>) {
        let _enter = self.span.enter();
        if let Some(id) = carrier_id {
            self.carrier_id = Some(id.to_string());
        }
        self.state.reset(self.total_wafers);
        info!(
            "Engine reset: {} wafers pending (carrier {:?})",
            self.total_wafers, self.carrier_id
        );
    }

    // ========== Accessors ==========

    pub fn pending_count(&self) -> usize {
        self.state.queue_len(PENDING_QUEUE)
    }

    pub fn completed_count(&self) -> usize {
        self.state.queue_len(COMPLETED_QUEUE)
    }

    pub fn completed_wafers(&self) -> Vec<WaferId> {
        self.state
            .queue(COMPLETED_QUEUE)
            .map(|q| q.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    pub fn catalog(&self) -> &RuleCatalog {
        &self.catalog
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    pub fn carrier_id(&self) -> Option<&str> {
        self.carrier_id.as_deref()
    }

    /// Most recent executions, oldest first
    pub fn recent_executions(&self) -> Vec<RuleExecutionResult> {
        self.history.iter().cloned().collect()
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            catalog_id: self.catalog.id.clone(),
            paused: self.state.is_paused(),
            carrier_id: self.carrier_id.clone(),
            total_wafers: self.total_wafers,
            pending: self.pending_count(),
            completed: self.completed_count(),
            evaluation_passes: self.evaluation_passes,
            skipped_passes: self.skipped_passes,
            rules_executed: self.rules_executed,
            waiting_robots: self.state.waiting_robots(),
            pending_commands: self.state.pending_command_robots(),
        }
    }

    /// Evaluate every executable rule without executing anything
    pub fn explain(&self) -> Vec<ConditionResult> {
        let evaluator = ConditionEvaluator::new(&self.catalog, &self.state);
        self.order
            .iter()
            .map(|&i| {
                let rule = &self.catalog.rules[i];
                ConditionResult {
                    rule_id: rule.id.clone(),
                    priority: rule.priority,
                    expression: format_condition(&rule.conditions),
                    result: evaluator.evaluate(&rule.conditions),
                }
            })
            .collect()
    }

    // ========== Execution loop ==========

    fn run_evaluation(&mut self) {
        if self.state.is_paused() {
            debug!("Paused, evaluation suppressed");
            return;
        }

        let signature = self.state.signature();
        if self.state.last_signature() == Some(signature.as_str()) {
            self.skipped_passes += 1;
            debug!("Signature unchanged, skipping pass");
            return;
        }
        self.state.set_last_signature(Some(signature));
        self.evaluation_passes += 1;

        let catalog = Arc::clone(&self.catalog);
        let order = Arc::clone(&self.order);
        let parallel = catalog.settings.enable_parallel_execution;

        for &index in order.iter() {
            let rule = &catalog.rules[index];
            let satisfied =
                ConditionEvaluator::new(&catalog, &self.state).evaluate(&rule.conditions);
            if !satisfied {
                continue;
            }

            match self.execute_rule(rule) {
                Ok(result) => {
                    self.record(result);
                    if !parallel {
                        break;
                    }
                },
                Err(e) => {
                    error!("Rule {} not executed: {}", rule.id, e);
                },
            }
        }
    }

    /// Dispatch a satisfied rule and apply its effects
    fn execute_rule(&mut self, rule: &Rule) -> Result<RuleExecutionResult> {
        let params = self.resolve_parameters(&rule.action);
        let robot = params
            .get("robot")
            .and_then(ParamValue::as_text)
            .map(str::to_string)
            .or_else(|| rule.default_robot.clone());
        let wafer_id = params
            .get("waferId")
            .or_else(|| params.get("wafer"))
            .map_or(0, ParamValue::as_int);

        let request = TransferRequest {
            wafer_id,
            from: rule.from.clone(),
            to: rule.to.clone(),
            priority: rule.priority,
            preferred_robot: robot.clone(),
        };
        request.validate()?;

        let dispatched_via = match &self.scheduler {
            Some(scheduler) => {
                scheduler.submit(request)?;
                if let Some(robot) = &robot {
                    self.state.mark_command_dispatched(robot);
                }
                DispatchPath::Scheduler
            },
            None => {
                let robot = robot.as_deref().ok_or_else(|| {
                    RuleError::InvalidTransfer(format!("rule {} names no robot", rule.id))
                })?;
                self.sink.emit(OutboundEvent::RobotCommand {
                    robot: robot.to_string(),
                    command: rule.action.command_name().to_string(),
                    wafer_id,
                    from: rule.from.clone(),
                    to: rule.to.clone(),
                });
                self.state.mark_command_dispatched(robot);
                DispatchPath::DirectCommand
            },
        };

        let mut notifications = Vec::new();
        let mut effects_applied = 0;
        for effect in &rule.effects {
            if apply_effect(effect, &mut self.state, &mut notifications) {
                effects_applied += 1;
            }
        }
        for notification in notifications {
            self.emit_notification(notification);
        }

        debug!(
            "Rule {} fired: wafer {} {} -> {} ({:?})",
            rule.id, wafer_id, rule.from, rule.to, dispatched_via
        );

        Ok(RuleExecutionResult {
            rule_id: rule.id.clone(),
            priority: rule.priority,
            robot,
            wafer_id,
            from: rule.from.clone(),
            to: rule.to.clone(),
            dispatched_via,
            effects_applied,
            matched_condition: format_condition(&rule.conditions),
        })
    }

    fn resolve_parameters(&self, action: &RuleAction) -> BTreeMap<String, ParamValue> {
        action
            .parameters
            .iter()
            .map(|(key, value)| {
                let resolved = match value {
                    Operand::Int(n) => ParamValue::Int(*n),
                    Operand::Text(s) => ParamValue::Text(s.clone()),
                    Operand::Reference(r) => ParamValue::Int(r.resolve(&self.state)),
                };
                (key.clone(), resolved)
            })
            .collect()
    }

    fn record(&mut self, result: RuleExecutionResult) {
        self.logger.log_execution(&result);
        self.rules_executed += 1;
        if self.history.len() == HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(result);
    }

    fn emit_destination_ready(&self, robot: String) {
        debug!("Destination ready for {}", robot);
        self.sink.emit(OutboundEvent::DestinationReady { robot });
    }

    fn emit_notification(&self, notification: EffectNotification) {
        let carrier_id = self.carrier_id.clone();
        let event = match notification {
            EffectNotification::WaferCompleted { wafer_id } => {
                OutboundEvent::CarrierWaferCompleted {
                    carrier_id,
                    wafer_id,
                }
            },
            EffectNotification::AllWafersCompleted { total } => {
                info!("All {} wafers completed", total);
                OutboundEvent::AllWafersCompleted { carrier_id, total }
            },
        };
        self.sink.emit(event);
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::dispatch::RecordingSink;
    use crate::parser::parse_catalog;
    use parking_lot::Mutex;
    use serde_json::json;

    fn catalog(parallel: bool) -> Arc<RuleCatalog> {
        Arc::new(
            parse_catalog(&json!({
                "id": "unit",
                "configuration": { "enableParallelExecution": parallel },
                "rules": [
                    {
                        "id": "unload_cleaner",
                        "priority": 1,
                        "defaultRobot": "R2",
                        "from": "cleaner",
                        "to": "LoadPort.Completed",
                        "conditions": { "type": "and", "conditions": [
                            { "type": "stationState", "station": "cleaner", "value": "done" },
                            { "type": "robotState", "robot": "R2", "value": "idle" }
                        ]},
                        "action": { "type": "transfer", "parameters": { "waferId": "@cleaner.waferId" } },
                        "effects": [
                            { "type": "queueOperation", "queue": "LoadPort.Completed",
                              "operation": "add", "value": "@cleaner.waferId" }
                        ]
                    },
                    {
                        "id": "load_polisher",
                        "priority": 2,
                        "defaultRobot": "R1",
                        "from": "LoadPort.Pending",
                        "to": "polisher",
                        "conditions": { "type": "and", "conditions": [
                            { "type": "stationState", "station": "polisher", "value": "empty" },
                            { "type": "robotState", "robot": "R1", "value": "idle" },
                            { "type": "queueCount", "queue": "LoadPort.Pending",
                              "operator": "greaterThan", "value": 0 }
                        ]},
                        "action": { "type": "transfer", "parameters": { "waferId": "@LoadPort.Pending[0]" } },
                        "effects": [
                            { "type": "queueOperation", "queue": "LoadPort.Pending", "operation": "removeFirst" }
                        ]
                    }
                ]
            }))
            .unwrap(),
        )
    }

    fn prime(engine: &mut RuleEngine) {
        engine.pause();
        engine.on_station_status("polisher", "empty", None);
        engine.on_station_status("cleaner", "done", Some(7));
        engine.on_robot_status("R2", "idle", None, None);
        engine.on_robot_status("R1", "idle", None, None);
        engine.resume(None);
    }

    #[test]
    fn test_priority_wins_without_parallel() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = RuleEngine::new(catalog(false), 3, sink.clone());
        prime(&mut engine);
        engine.on_robot_status("R1", "idle", None, None);

        let commands = sink.robot_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].robot(), Some("R2"));
        assert_eq!(engine.completed_wafers(), vec![7]);
        assert_eq!(engine.pending_count(), 3);
    }

    #[test]
    fn test_parallel_dispatches_both() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = RuleEngine::new(catalog(true), 3, sink.clone());
        prime(&mut engine);
        engine.on_robot_status("R1", "idle", None, None);

        let robots: Vec<_> = sink
            .robot_commands()
            .iter()
            .filter_map(|e| e.robot().map(str::to_string))
            .collect();
        assert_eq!(robots, vec!["R2".to_string(), "R1".to_string()]);
        assert_eq!(engine.pending_count(), 2);
        assert_eq!(
            engine.state().robot_state("R1"),
            Some(crate::state::BUSY_STATE)
        );
    }

    #[test]
    fn test_parameters_resolved_before_effects() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = RuleEngine::new(catalog(true), 3, sink.clone());
        prime(&mut engine);
        engine.on_robot_status("R1", "idle", None, None);

        let load = engine
            .recent_executions()
            .into_iter()
            .find(|r| r.rule_id == "load_polisher")
            .unwrap();
        // Head of Pending at dispatch time, before removeFirst
        assert_eq!(load.wafer_id, 1);
        assert_eq!(load.effects_applied, 1);
        assert_eq!(load.dispatched_via, DispatchPath::DirectCommand);
    }

    struct RejectingScheduler {
        seen: Mutex<Vec<TransferRequest>>,
    }

    impl TransferScheduler for RejectingScheduler {
        fn submit(&self, request: TransferRequest) -> Result<()> {
            self.seen.lock().push(request);
            Err(RuleError::TransferRejected("no robot free".to_string()))
        }
    }

    #[tracing_test::traced_test]
    #[test]
    fn test_scheduler_rejection_is_isolated() {
        let sink = Arc::new(RecordingSink::new());
        let scheduler = Arc::new(RejectingScheduler {
            seen: Mutex::new(Vec::new()),
        });
        let mut engine =
            RuleEngine::new(catalog(false), 3, sink.clone()).with_scheduler(scheduler.clone());
        prime(&mut engine);
        engine.on_robot_status("R1", "idle", None, None);

        // Both rules tried, neither executed, no effects applied
        assert_eq!(scheduler.seen.lock().len(), 2);
        assert!(engine.recent_executions().is_empty());
        assert_eq!(engine.pending_count(), 3);
        assert_eq!(engine.completed_count(), 0);
        assert!(engine.state().robot_state("R2") == Some("idle"));
        assert!(logs_contain("not executed"));
    }

    #[test]
    fn test_history_keeps_most_recent_executions() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = RuleEngine::new(catalog(false), 70, sink.clone());
        engine.on_station_status("polisher", "empty", None);
        engine.on_station_status("cleaner", "processing", Some(99));

        // moving clears the pending flag, idle runs the next pass
        for _ in 0..70 {
            engine.on_robot_status("R1", "moving", None, None);
            engine.on_robot_status("R1", "idle", None, None);
        }

        assert_eq!(sink.robot_commands().len(), 70);
        assert_eq!(engine.status().rules_executed, 70);
        assert_eq!(engine.pending_count(), 0);

        let history = engine.recent_executions();
        assert_eq!(history.len(), HISTORY_CAPACITY);
        assert_eq!(history[0].wafer_id, 7);
        assert_eq!(history[HISTORY_CAPACITY - 1].wafer_id, 70);
    }

    #[test]
    fn test_explain_does_not_execute() {
        let sink = Arc::new(RecordingSink::new());
        let mut engine = RuleEngine::new(catalog(false), 3, sink.clone());
        prime(&mut engine);
        engine.pause();

        let explained = engine.explain();
        assert_eq!(explained.len(), 2);
        assert!(explained.iter().all(|c| c.result));
        assert_eq!(explained[0].rule_id, "unload_cleaner");
        assert!(sink.events().is_empty());
    }
}
