//! Workflow DAG executor
//!
//! Sequences several experiment lifecycles under dependency and conditional
//! constraints. Workflows are validated before any step runs.

mod condition;
mod dag;
mod executor;
mod spec;

pub use condition::{Comparator, Condition};
pub use dag::{Dag, ValidationError};
pub use executor::{StepStatus, WorkflowError, WorkflowExecutor, WorkflowReport};
pub use spec::{ExperimentCatalog, StepSpec, WorkflowSpec};
