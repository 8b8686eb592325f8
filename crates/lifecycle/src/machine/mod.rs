//! Experiment state machine
//!
//! States, triggers and the guarded transition table, plus the engine that
//! applies transitions through the event store and publishes them.

mod builtin;
mod engine;
mod lease;
mod recovery;
mod rule;
mod state;
mod table;

pub use builtin::{
    BeforeProbesPass, CleanupPartialFault, FaultSpecValid, FlagManualRemediation, InjectFault,
    InjectorConfirmsRecovery, NoOverlappingTarget, PrepareFault, RecoverFault,
};
pub use engine::{Engine, EngineError};
pub use lease::TargetLeases;
pub use recovery::RecoveryReport;
pub use rule::{
    Action, ActionError, ActionOutcome, Guard, GuardVerdict, TransitionContext, TransitionRule,
};
pub use state::{ExperimentState, Trigger};
pub use table::TransitionTable;
