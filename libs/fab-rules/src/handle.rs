//! Engine task - serializes concurrent status reports onto one owner
//!
//! Station and robot actors report from many tasks; `EngineHandle` turns each
//! report into a command for the single task that owns the `RuleEngine`, so
//! evaluation passes never interleave.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Result, RuleError};
use crate::executor::{ConditionResult, EngineStatus, RuleEngine, RuleExecutionResult};
use crate::types::WaferId;

/// Command processed by the engine task
#[derive(Debug)]
pub enum EngineCommand {
    StationStatus {
        station: String,
        state: String,
        wafer_id: Option<WaferId>,
    },
    RobotStatus {
        robot: String,
        state: String,
        wafer_id: Option<WaferId>,
        waiting_for: Option<String>,
    },
    Pause,
    Resume {
        carrier_id: Option<String>,
    },
    Reset {
        carrier_id: Option<String>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
    CompletedWafers {
        reply: oneshot::Sender<Vec<WaferId>>,
    },
    Explain {
        reply: oneshot::Sender<Vec<ConditionResult>>,
    },
    RecentExecutions {
        reply: oneshot::Sender<Vec<RuleExecutionResult>>,
    },
    Shutdown {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Cloneable sender side of the engine task
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    fn send(&self, command: EngineCommand) -> Result<()> {
        self.tx.send(command).map_err(|_| RuleError::EngineStopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| RuleError::EngineStopped)
    }

    pub fn station_status(
        &self,
        station: &str,
        state: &str,
        wafer_id: Option<WaferId>,
    ) -> Result<()> {
        self.send(EngineCommand::StationStatus {
            station: station.to_string(),
            state: state.to_string(),
            wafer_id,
        })
    }

    pub fn robot_status(
        &self,
        robot: &str,
        state: &str,
        wafer_id: Option<WaferId>,
        waiting_for: Option<&str>,
    ) -> Result<()> {
        self.send(EngineCommand::RobotStatus {
            robot: robot.to_string(),
            state: state.to_string(),
            wafer_id,
            waiting_for: waiting_for.map(str::to_string),
        })
    }

    pub fn pause(&self) -> Result<()> {
        self.send(EngineCommand::Pause)
    }

    pub fn resume(&self, carrier_id: Option<&str>) -> Result<()> {
        self.send(EngineCommand::Resume {
            carrier_id: carrier_id.map(str::to_string),
        })
    }

    pub fn reset(&self, carrier_id: Option<&str>) -> Result<()> {
        self.send(EngineCommand::Reset {
            carrier_id: carrier_id.map(str::to_string),
        })
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        self.request(|reply| EngineCommand::Status { reply }).await
    }

    pub async fn completed_wafers(&self) -> Result<Vec<WaferId>> {
        self.request(|reply| EngineCommand::CompletedWafers { reply })
            .await
    }

    pub async fn explain(&self) -> Result<Vec<ConditionResult>> {
        self.request(|reply| EngineCommand::Explain { reply }).await
    }

    pub async fn recent_executions(&self) -> Result<Vec<RuleExecutionResult>> {
        self.request(|reply| EngineCommand::RecentExecutions { reply })
            .await
    }

    /// Stop the engine task after draining earlier commands
    pub async fn shutdown(&self) -> Result<EngineStatus> {
        self.request(|reply| EngineCommand::Shutdown { reply })
            .await
    }
}

/// Move the engine onto its own task
///
/// The task ends on `shutdown` or once every handle is dropped.
pub fn spawn_engine(engine: RuleEngine) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(engine, rx));
    (EngineHandle { tx }, task)
}

async fn run(mut engine: RuleEngine, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
    info!("Engine task started for catalog {}", engine.catalog().id);

    while let Some(command) = rx.recv().await {
        match command {
            EngineCommand::StationStatus {
                station,
                state,
                wafer_id,
            } => engine.on_station_status(&station, &state, wafer_id),
            EngineCommand::RobotStatus {
                robot,
                state,
                wafer_id,
                waiting_for,
            } => engine.on_robot_status(&robot, &state, wafer_id, waiting_for.as_deref()),
            EngineCommand::Pause => engine.pause(),
            EngineCommand::Resume { carrier_id } => engine.resume(carrier_id.as_deref()),
            EngineCommand::Reset { carrier_id } => engine.reset(carrier_id.as_deref()),
            EngineCommand::Status { reply } => {
                let _ = reply.send(engine.status());
            },
            EngineCommand::CompletedWafers { reply } => {
                let _ = reply.send(engine.completed_wafers());
            },
            EngineCommand::Explain { reply } => {
                let _ = reply.send(engine.explain());
            },
            EngineCommand::RecentExecutions { reply } => {
                let _ = reply.send(engine.recent_executions());
            },
            EngineCommand::Shutdown { reply } => {
                debug!("Shutdown requested");
                let _ = reply.send(engine.status());
                break;
            },
        }
    }

    info!("Engine task stopped");
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::dispatch::{ChannelSink, OutboundEvent};
    use crate::parser::parse_catalog;
    use serde_json::json;
    use std::sync::Arc;

    fn engine(sink: ChannelSink) -> RuleEngine {
        let catalog = parse_catalog(&json!({
            "id": "handle",
            "rules": [{
                "id": "load_polisher",
                "priority": 1,
                "defaultRobot": "R1",
                "from": "LoadPort.Pending",
                "to": "polisher",
                "conditions": { "type": "and", "conditions": [
                    { "type": "stationState", "station": "polisher", "value": "empty" },
                    { "type": "robotState", "robot": "R1", "value": "idle" },
                    { "type": "queueCount", "queue": "LoadPort.Pending", "operator": "greaterThan", "value": 0 }
                ]},
                "action": { "type": "transfer", "parameters": { "waferId": "@LoadPort.Pending[0]" } },
                "effects": [
                    { "type": "queueOperation", "queue": "LoadPort.Pending", "operation": "removeFirst" }
                ]
            }]
        }))
        .unwrap();
        RuleEngine::new(Arc::new(catalog), 2, Arc::new(sink))
    }

    #[tokio::test]
    async fn test_concurrent_reports_are_serialized() {
        let (sink, mut events) = ChannelSink::new();
        let (handle, task) = spawn_engine(engine(sink));

        handle.station_status("polisher", "empty", None).unwrap();
        let reporters: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.robot_status("R1", "idle", None, None) })
            })
            .collect();
        for reporter in reporters {
            reporter.await.unwrap().unwrap();
        }

        let status = handle.shutdown().await.unwrap();
        task.await.unwrap();

        // R1 stays busy until it reports a non-idle state, so one dispatch only
        assert_eq!(status.pending, 1);
        assert_eq!(status.rules_executed, 1);
        assert_eq!(status.pending_commands, vec!["R1".to_string()]);

        let first = events.recv().await.unwrap();
        assert!(matches!(
            first,
            OutboundEvent::RobotCommand { wafer_id: 1, .. }
        ));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_handle_after_shutdown() {
        let (sink, _events) = ChannelSink::new();
        let (handle, task) = spawn_engine(engine(sink));

        handle.pause().unwrap();
        assert!(handle.status().await.unwrap().paused);
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        assert!(matches!(
            handle.pause(),
            Err(RuleError::EngineStopped)
        ));
        assert!(matches!(
            handle.completed_wafers().await,
            Err(RuleError::EngineStopped)
        ));
    }
}
