//! External capabilities the engine calls into
//!
//! - [`FaultInjector`] + [`InjectorRegistry`] - one injector per fault kind
//! - [`Probe`] + [`ProbeRegistry`] - named steady-state checks
//! - [`MetricSource`] - metric values for workflow conditions

mod injector;
mod metrics;
mod probe;
mod simulated;

pub(crate) use injector::with_deadline;
pub use injector::{
    FaultInjector, FaultPhase, FaultRequest, FaultStatus, InjectorError, InjectorRegistry,
};
pub use metrics::{MetricError, MetricSource, StaticMetrics};
pub use probe::{Probe, ProbeRegistry, ProbeResult, StaticProbe};
pub use simulated::SimulatedInjector;
