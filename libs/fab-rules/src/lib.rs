//! Fab Rules - Wafer Transfer Rule Engine
//!
//! Event-driven rule engine for a wafer-processing tool simulator:
//! - Rule catalogs loaded from JSON or YAML
//! - Condition trees over live station, robot and queue state
//! - Priority-ordered dispatch to robots or a transfer scheduler
//! - Queue effects with batch-completion detection
//! - Destination-readiness resolution for waiting robots
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │   Actors    │────▶│ EngineHandle │────▶│  RuleEngine  │
//! │(status evts)│     │   (mpsc)     │     │ (single task)│
//! └─────────────┘     └──────────────┘     └──────────────┘
//!                                                 │
//!                         ┌───────────────────────┼──────────────┐
//!                         ▼                       ▼              ▼
//!                  ┌─────────────┐        ┌─────────────┐  ┌───────────┐
//!                  │  EventSink  │        │  Transfer   │  │ Execution │
//!                  │ (commands)  │        │  Scheduler  │  │  Logger   │
//!                  └─────────────┘        └─────────────┘  └───────────┘
//! ```

mod dispatch;
mod effects;
mod error;
mod evaluator;
mod executor;
mod handle;
pub mod logger;
mod parser;
pub mod readiness;
mod reference;
mod state;
pub mod types;

// Re-export public API
pub use dispatch::{
    ChannelSink, EventSink, NullSink, OutboundEvent, RecordingSink, TransferRequest,
    TransferScheduler,
};
pub use effects::{apply_effect, EffectNotification};
pub use error::{Result, RuleError};
pub use evaluator::ConditionEvaluator;
pub use executor::{
    ConditionResult, DispatchPath, EngineStatus, RuleEngine, RuleExecutionResult,
    HISTORY_CAPACITY,
};
pub use handle::{spawn_engine, EngineCommand, EngineHandle};
pub use logger::{format_condition, ExecutionLogger, RuleLogger, TracingExecutionLogger};
pub use parser::{
    load_catalog, parse_catalog, parse_catalog_str, parse_completion_text, parse_condition,
    parse_operand,
};
pub use reference::resolve_str;
pub use state::{RuntimeState, BUSY_STATE};

// Re-export catalog types for convenience
pub use types::{
    Condition, Effect, Operand, Operator, QueueOp, Reference, Rule, RuleAction, RuleCatalog,
    WaferId, COMPLETED_QUEUE, PENDING_QUEUE,
};
