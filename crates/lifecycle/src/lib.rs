//! # Experiment Lifecycle Engine
//!
//! Drives chaos-engineering experiments through an auditable lifecycle and
//! sequences them as workflows.
//!
//! ## Features
//!
//! - **Guarded state machine**: a fixed table of 13 transitions over 9 states, each rule carrying an optional guard and action
//! - **Event sourcing**: every committed transition is an append-only event; state is rebuilt by replay after a crash
//! - **Durable event bus**: ordered, at-least-once delivery with durable cursors, redelivery and dead letters
//! - **Workflow DAG executor**: dependency ordering, conditional gates and bounded concurrency
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowExecutor                         │
//! │  (validates the DAG, schedules steps, waits on bus events)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ transition
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Engine                               │
//! │  (guards, actions via FaultInjector, per-experiment lock)   │
//! └─────────────────────────────────────────────────────────────┘
//!                 │ append                    │ publish
//!                 ▼                           ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │   ExperimentEventStore    │   │          EventBus            │
//! │ (experiments, events)     │   │ (experiments.<id> topics)    │
//! └──────────────────────────┘   └──────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use faultline_lifecycle::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), EngineError> {
//! let injectors = InjectorRegistry::new().with(Arc::new(SimulatedInjector::new("latency")));
//! let engine = Engine::new(
//!     Arc::new(InMemoryExperimentStore::new()),
//!     Arc::new(InMemoryEventBus::new()),
//!     injectors,
//! );
//!
//! let spec = ExperimentSpec::new(
//!     "checkout-latency",
//!     Target::new("prod", "pod").with_label("app", "checkout"),
//!     FaultSpec::new("latency"),
//! );
//! let experiment = engine.create_experiment(spec).await?;
//!
//! engine.transition(&experiment.id, Trigger::Prepare, Payload::new()).await?;
//! engine.transition(&experiment.id, Trigger::Inject, Payload::new()).await?;
//! let state = engine.transition(&experiment.id, Trigger::Revert, Payload::new()).await?;
//! assert_eq!(state, ExperimentState::Completed);
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod capability;
pub mod config;
pub mod event;
pub mod experiment;
pub mod machine;
pub mod persistence;
pub mod reliability;
mod serde_duration;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bus::{
        handler_fn, BusError, BusPurge, DeadLetter, Delivery, EventBus, EventHandler, HandlerError,
        InMemoryEventBus, PostgresEventBus, Subscription, ALL_EXPERIMENTS,
    };
    pub use crate::capability::{
        FaultInjector, FaultPhase, FaultRequest, FaultStatus, InjectorError, InjectorRegistry,
        MetricSource, Probe, ProbeRegistry, ProbeResult, SimulatedInjector, StaticMetrics,
        StaticProbe,
    };
    pub use crate::config::{BusConfig, EngineConfig, RetentionPolicy, WorkflowConfig};
    pub use crate::event::{EventType, ExperimentEvent, Payload};
    pub use crate::experiment::{
        Experiment, ExperimentId, ExperimentSpec, FaultSpec, ProbePhase, Target,
    };
    pub use crate::machine::{
        Engine, EngineError, ExperimentState, RecoveryReport, TransitionTable, Trigger,
    };
    pub use crate::persistence::{
        ExperimentEventStore, InMemoryExperimentStore, PostgresExperimentStore, StoreError,
    };
    pub use crate::reliability::RetryPolicy;
    pub use crate::workflow::{
        Comparator, Condition, ExperimentCatalog, StepSpec, StepStatus, WorkflowError,
        WorkflowExecutor, WorkflowReport, WorkflowSpec,
    };
}

// Re-export key types at crate root
pub use bus::{
    handler_fn, BusError, BusPurge, DeadLetter, Delivery, EventBus, EventHandler, HandlerError,
    InMemoryEventBus, PostgresEventBus, Subscription,
};
pub use capability::{
    FaultInjector, InjectorError, InjectorRegistry, MetricSource, Probe, ProbeRegistry,
    SimulatedInjector,
};
pub use config::{BusConfig, EngineConfig, RetentionPolicy, SkippedDependencyPolicy, WorkflowConfig};
pub use event::{EventType, ExperimentEvent, NewEvent, Payload};
pub use experiment::{
    Experiment, ExperimentId, ExperimentRecord, ExperimentSpec, FaultSpec, ProbePhase, ProbeRef,
    Target,
};
pub use machine::{Engine, EngineError, ExperimentState, RecoveryReport, TransitionTable, Trigger};
pub use persistence::{
    ExperimentEventStore, InMemoryExperimentStore, PostgresExperimentStore, ReplayError,
    StoreError, MIGRATOR,
};
pub use reliability::RetryPolicy;
pub use workflow::{
    Condition, ExperimentCatalog, StepSpec, StepStatus, ValidationError, WorkflowError,
    WorkflowExecutor, WorkflowReport, WorkflowSpec,
};
