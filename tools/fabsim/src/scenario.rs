//! Scripted equipment events and the simulated transfer scheduler

use anyhow::{Context, Result};
use fab_rules::{EngineHandle, TransferRequest, TransferScheduler, WaferId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use tokio::sync::mpsc;

/// A replayable event script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub description: Option<String>,

    /// Overrides the configured wafer total
    #[serde(default)]
    pub total_wafers: Option<usize>,

    #[serde(default)]
    pub steps: Vec<ScenarioStep>,
}

/// One inbound event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ScenarioStep {
    Station {
        station: String,
        state: String,
        #[serde(default, rename = "waferId")]
        wafer_id: Option<WaferId>,
    },
    Robot {
        robot: String,
        state: String,
        #[serde(default, rename = "waferId")]
        wafer_id: Option<WaferId>,
        #[serde(default, rename = "waitingFor")]
        waiting_for: Option<String>,
    },
    Pause,
    Resume {
        #[serde(default, rename = "carrierId")]
        carrier_id: Option<String>,
    },
    Reset {
        #[serde(default, rename = "carrierId")]
        carrier_id: Option<String>,
    },
}

impl fmt::Display for ScenarioStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScenarioStep::Station {
                station,
                state,
                wafer_id,
            } => {
                write!(f, "station {} -> {}", station, state)?;
                if let Some(id) = wafer_id {
                    write!(f, " (wafer {})", id)?;
                }
                Ok(())
            },
            ScenarioStep::Robot {
                robot,
                state,
                wafer_id,
                waiting_for,
            } => {
                write!(f, "robot {} -> {}", robot, state)?;
                if let Some(id) = wafer_id {
                    write!(f, " (wafer {})", id)?;
                }
                if let Some(dest) = waiting_for {
                    write!(f, " waiting for {}", dest)?;
                }
                Ok(())
            },
            ScenarioStep::Pause => write!(f, "pause"),
            ScenarioStep::Resume { carrier_id } => {
                write!(f, "resume {}", carrier_id.as_deref().unwrap_or("-"))
            },
            ScenarioStep::Reset { carrier_id } => {
                write!(f, "reset {}", carrier_id.as_deref().unwrap_or("-"))
            },
        }
    }
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?;
        let scenario = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)?,
            _ => serde_yaml::from_str(&text)?,
        };
        Ok(scenario)
    }
}

/// Forward one step to the engine task
pub fn apply_step(handle: &EngineHandle, step: &ScenarioStep) -> fab_rules::Result<()> {
    match step {
        ScenarioStep::Station {
            station,
            state,
            wafer_id,
        } => handle.station_status(station, state, *wafer_id),
        ScenarioStep::Robot {
            robot,
            state,
            wafer_id,
            waiting_for,
        } => handle.robot_status(robot, state, *wafer_id, waiting_for.as_deref()),
        ScenarioStep::Pause => handle.pause(),
        ScenarioStep::Resume { carrier_id } => handle.resume(carrier_id.as_deref()),
        ScenarioStep::Reset { carrier_id } => handle.reset(carrier_id.as_deref()),
    }
}

/// Scheduler stand-in: validates, rejects transfers for offline robots,
/// forwards accepted requests for display
pub struct SimScheduler {
    offline_robots: HashSet<String>,
    tx: mpsc::UnboundedSender<TransferRequest>,
}

impl SimScheduler {
    pub fn new(
        offline_robots: impl IntoIterator<Item = String>,
    ) -> (Self, mpsc::UnboundedReceiver<TransferRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            offline_robots: offline_robots.into_iter().collect(),
            tx,
        };
        (scheduler, rx)
    }
}

impl TransferScheduler for SimScheduler {
    fn submit(&self, request: TransferRequest) -> fab_rules::Result<()> {
        request.validate()?;
        if let Some(robot) = &request.preferred_robot {
            if self.offline_robots.contains(robot) {
                return Err(fab_rules::RuleError::TransferRejected(format!(
                    "robot {} is offline",
                    robot
                )));
            }
        }
        if self.tx.send(request).is_err() {
            tracing::warn!("Transfer receiver dropped");
        }
        Ok(())
    }
}
