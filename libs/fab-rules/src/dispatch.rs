//! Outbound collaborator interfaces
//!
//! The engine never talks to robots or stations directly; everything it emits
//! goes through an `EventSink`, and transfers may instead be submitted to a
//! `TransferScheduler` that owns robot assignment.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::{Result, RuleError};
use crate::types::WaferId;

/// Event emitted by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundEvent {
    /// Direct command to a robot actor
    RobotCommand {
        robot: String,
        command: String,
        wafer_id: WaferId,
        from: String,
        to: String,
    },
    /// The robot's wait target can accept its wafer
    DestinationReady { robot: String },
    /// A wafer reached the completion queue
    CarrierWaferCompleted {
        carrier_id: Option<String>,
        wafer_id: WaferId,
    },
    /// The completion queue reached the wafer total
    AllWafersCompleted {
        carrier_id: Option<String>,
        total: usize,
    },
}

impl OutboundEvent {
    /// Robot the event is addressed to, if any
    pub fn robot(&self) -> Option<&str> {
        match self {
            OutboundEvent::RobotCommand { robot, .. } | OutboundEvent::DestinationReady { robot } => {
                Some(robot)
            },
            _ => None,
        }
    }
}

/// Receiver of engine events. Must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OutboundEvent);
}

/// Transfer request submitted to a robot scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub wafer_id: WaferId,
    pub from: String,
    pub to: String,
    pub priority: i32,
    pub preferred_robot: Option<String>,
}

impl TransferRequest {
    pub fn validate(&self) -> Result<()> {
        if self.from.trim().is_empty() {
            return Err(RuleError::InvalidTransfer(format!(
                "wafer {}: missing 'from'",
                self.wafer_id
            )));
        }
        if self.to.trim().is_empty() {
            return Err(RuleError::InvalidTransfer(format!(
                "wafer {}: missing 'to'",
                self.wafer_id
            )));
        }
        Ok(())
    }
}

/// Robot-scheduling collaborator
pub trait TransferScheduler: Send + Sync {
    /// Accept or reject a transfer; rejection is not fatal to the engine
    fn submit(&self, request: TransferRequest) -> Result<()>;
}

// ============================================================================
// Sinks
// ============================================================================

/// Forwards events to a tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: OutboundEvent) {
        if self.tx.send(event).is_err() {
            tracing::warn!("Event receiver dropped");
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<OutboundEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OutboundEvent> {
        self.events.lock().clone()
    }

    /// Drain recorded events
    pub fn take(&self) -> Vec<OutboundEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn robot_commands(&self) -> Vec<OutboundEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, OutboundEvent::RobotCommand { .. }))
            .cloned()
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: OutboundEvent) {
        self.events.lock().push(event);
    }
}

/// Discards events
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: OutboundEvent) {}
}
