//! Workflow DAG executor
//!
//! Steps run as independent tasks, bounded by `WorkflowConfig::concurrency`.
//! A step becomes eligible once every dependency is terminal; its condition
//! is then evaluated and, if true, its experiment is driven through
//! `Prepare`, `Inject` and `Revert`. The step's outcome is taken from the
//! terminal event observed on the experiment's bus topic.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::condition::ConditionInputs;
use super::dag::{Dag, ValidationError};
use super::spec::{ExperimentCatalog, StepSpec, WorkflowSpec};
use crate::bus::{experiment_topic, handler_fn, Delivery, Subscription};
use crate::capability::MetricSource;
use crate::config::{SkippedDependencyPolicy, WorkflowConfig};
use crate::event::{ExperimentEvent, Payload};
use crate::experiment::{ExperimentId, ExperimentSpec};
use crate::machine::{Engine, ExperimentState, Trigger};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("invalid workflow: {0}")]
    Validation(#[from] ValidationError),

    #[error("workflow stalled with unfinished steps: {}", .0.join(", "))]
    Stalled(Vec<String>),
}

/// Terminal per-step outcome of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowReport {
    pub run_id: String,
    pub workflow: String,
    pub statuses: BTreeMap<String, StepStatus>,
    /// Experiment launched by each step that got past its condition
    pub experiments: BTreeMap<String, ExperimentId>,
    pub skip_reasons: BTreeMap<String, String>,
    pub failure_reasons: BTreeMap<String, String>,
}

impl WorkflowReport {
    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.statuses.get(step).copied()
    }

    pub fn failed_steps(&self) -> Vec<&str> {
        self.statuses
            .iter()
            .filter(|(_, status)| **status == StepStatus::Failed)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed_steps().is_empty()
    }
}

pub struct WorkflowExecutor {
    engine: Arc<Engine>,
    catalog: ExperimentCatalog,
    metrics: Option<Arc<dyn MetricSource>>,
    config: WorkflowConfig,
}

impl WorkflowExecutor {
    pub fn new(engine: Arc<Engine>, catalog: ExperimentCatalog) -> Self {
        Self {
            engine,
            catalog,
            metrics: None,
            config: WorkflowConfig::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSource>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn catalog(&self) -> &ExperimentCatalog {
        &self.catalog
    }

    /// Reject cycles, dangling references and unknown experiments
    pub fn validate(&self, spec: &WorkflowSpec) -> Result<Dag, ValidationError> {
        let dag = Dag::build(spec)?;
        for step in &spec.steps {
            if !self.catalog.contains(&step.experiment_ref) {
                return Err(ValidationError::UnknownExperiment {
                    step: step.name.clone(),
                    experiment_ref: step.experiment_ref.clone(),
                });
            }
        }
        Ok(dag)
    }

    /// Validate and run a workflow until every step is terminal
    #[instrument(skip(self, spec), fields(workflow = %spec.name))]
    pub async fn run(&self, spec: &WorkflowSpec) -> Result<WorkflowReport, WorkflowError> {
        let dag = self.validate(spec)?;
        let run_id = Uuid::now_v7().to_string();
        info!(%run_id, steps = dag.len(), "workflow started");

        let shared = Arc::new(RunShared {
            engine: self.engine.clone(),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            permits: Semaphore::new(self.config.concurrency.max(1)),
            run_id: run_id.clone(),
            workflow: spec.name.clone(),
        });

        let mut run = RunState::new(spec);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel::<usize>();
        let mut tasks: JoinSet<(usize, StepOutcome)> = JoinSet::new();

        loop {
            for i in run.schedule(&dag, self.config.skipped_dependency) {
                let step = spec.steps[i].clone();
                let Some(experiment) = self.catalog.get(&step.experiment_ref).cloned() else {
                    run.finish(i, StepOutcome::failed(None, None, "experiment not in catalog"));
                    continue;
                };
                let upstream = run.upstream(&dag, i);
                let shared = shared.clone();
                let started = started_tx.clone();

                tasks.spawn(async move {
                    let step_run = shared.run_step(i, &step, experiment, upstream, started);
                    let outcome = AssertUnwindSafe(step_run)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| StepOutcome::failed(None, None, "step task panicked"));
                    (i, outcome)
                });
            }

            if run.is_done() {
                break;
            }
            if tasks.is_empty() {
                return Err(WorkflowError::Stalled(run.unfinished(&dag)));
            }

            tokio::select! {
                biased;

                Some(i) = started_rx.recv() => run.start(&dag, i),
                joined = tasks.join_next() => match joined {
                    Some(Ok((i, outcome))) => {
                        info!(
                            step = dag.name(i),
                            status = %outcome.status,
                            experiment_id = ?outcome.experiment_id,
                            "step finished"
                        );
                        run.finish(i, outcome);
                    }
                    Some(Err(e)) => error!(error = %e, "step task aborted"),
                    None => {}
                },
            }
        }

        let report = run.into_report(&dag, run_id, spec.name.clone());
        info!(
            run_id = %report.run_id,
            failed = report.failed_steps().len(),
            skipped = report.skip_reasons.len(),
            "workflow finished"
        );
        Ok(report)
    }
}

/// Scheduler bookkeeping for one run, indexed like the [`Dag`]
struct RunState {
    statuses: Vec<StepStatus>,
    spawned: Vec<bool>,
    optional: Vec<bool>,
    condition_skipped: Vec<bool>,
    final_states: Vec<Option<ExperimentState>>,
    experiments: Vec<Option<ExperimentId>>,
    reasons: Vec<Option<String>>,
}

impl RunState {
    fn new(spec: &WorkflowSpec) -> Self {
        let n = spec.steps.len();
        Self {
            statuses: vec![StepStatus::Pending; n],
            spawned: vec![false; n],
            optional: spec.steps.iter().map(|step| step.optional).collect(),
            condition_skipped: vec![false; n],
            final_states: vec![None; n],
            experiments: vec![None; n],
            reasons: vec![None; n],
        }
    }

    /// Skip blocked steps and return the ones to spawn. Walking in
    /// topological order lets a skip cascade in a single pass.
    fn schedule(&mut self, dag: &Dag, policy: SkippedDependencyPolicy) -> Vec<usize> {
        let mut ready = vec![];
        for &i in dag.order() {
            if self.spawned[i] || self.statuses[i] != StepStatus::Pending {
                continue;
            }
            if !dag
                .dependencies(i)
                .iter()
                .all(|&d| self.statuses[d].is_terminal())
            {
                continue;
            }

            match self.blocked_by(dag, i, policy) {
                Some(reason) => {
                    debug!(step = dag.name(i), %reason, "step skipped");
                    self.statuses[i] = StepStatus::Skipped;
                    self.reasons[i] = Some(reason);
                }
                None => {
                    self.spawned[i] = true;
                    ready.push(i);
                }
            }
        }
        ready
    }

    fn blocked_by(&self, dag: &Dag, i: usize, policy: SkippedDependencyPolicy) -> Option<String> {
        for &d in dag.dependencies(i) {
            match self.statuses[d] {
                StepStatus::Failed if !self.optional[d] => {
                    return Some(format!("dependency '{}' failed", dag.name(d)));
                }
                StepStatus::Skipped
                    if !(self.condition_skipped[d] && policy == SkippedDependencyPolicy::Proceed) =>
                {
                    return Some(format!("dependency '{}' was skipped", dag.name(d)));
                }
                _ => {}
            }
        }
        None
    }

    fn upstream(&self, dag: &Dag, i: usize) -> HashMap<String, ExperimentState> {
        dag.dependencies(i)
            .iter()
            .filter_map(|&d| self.final_states[d].map(|s| (dag.name(d).to_string(), s)))
            .collect()
    }

    fn start(&mut self, dag: &Dag, i: usize) {
        if self.statuses[i] == StepStatus::Pending {
            info!(step = dag.name(i), "step running");
            self.statuses[i] = StepStatus::Running;
        }
    }

    fn finish(&mut self, i: usize, outcome: StepOutcome) {
        self.statuses[i] = outcome.status;
        self.condition_skipped[i] = outcome.condition_skipped;
        self.final_states[i] = outcome.final_state;
        self.experiments[i] = outcome.experiment_id;
        self.reasons[i] = outcome.reason;
    }

    fn is_done(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }

    fn unfinished(&self, dag: &Dag) -> Vec<String> {
        (0..dag.len())
            .filter(|&i| !self.statuses[i].is_terminal())
            .map(|i| dag.name(i).to_string())
            .collect()
    }

    fn into_report(self, dag: &Dag, run_id: String, workflow: String) -> WorkflowReport {
        let mut report = WorkflowReport {
            run_id,
            workflow,
            statuses: BTreeMap::new(),
            experiments: BTreeMap::new(),
            skip_reasons: BTreeMap::new(),
            failure_reasons: BTreeMap::new(),
        };

        for (i, status) in self.statuses.into_iter().enumerate() {
            let name = dag.name(i).to_string();
            if let Some(id) = self.experiments[i].clone() {
                report.experiments.insert(name.clone(), id);
            }
            if let Some(reason) = self.reasons[i].clone() {
                match status {
                    StepStatus::Skipped => {
                        report.skip_reasons.insert(name.clone(), reason);
                    }
                    StepStatus::Failed => {
                        report.failure_reasons.insert(name.clone(), reason);
                    }
                    _ => {}
                }
            }
            report.statuses.insert(name, status);
        }
        report
    }
}

struct StepOutcome {
    status: StepStatus,
    experiment_id: Option<ExperimentId>,
    final_state: Option<ExperimentState>,
    reason: Option<String>,
    condition_skipped: bool,
}

impl StepOutcome {
    fn failed(
        experiment_id: Option<ExperimentId>,
        final_state: Option<ExperimentState>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            status: StepStatus::Failed,
            experiment_id,
            final_state,
            reason: Some(reason.into()),
            condition_skipped: false,
        }
    }

    fn condition_not_met(detail: String) -> Self {
        Self {
            status: StepStatus::Skipped,
            experiment_id: None,
            final_state: None,
            reason: Some(format!("condition not met: {detail}")),
            condition_skipped: true,
        }
    }
}

/// State shared by the step tasks of one run
struct RunShared {
    engine: Arc<Engine>,
    metrics: Option<Arc<dyn MetricSource>>,
    config: WorkflowConfig,
    permits: Semaphore,
    run_id: String,
    workflow: String,
}

impl RunShared {
    async fn run_step(
        &self,
        i: usize,
        step: &StepSpec,
        experiment: ExperimentSpec,
        upstream: HashMap<String, ExperimentState>,
        started: mpsc::UnboundedSender<usize>,
    ) -> StepOutcome {
        let Ok(_permit) = self.permits.acquire().await else {
            return StepOutcome::failed(None, None, "workflow run closed");
        };

        if let Some(condition) = &step.condition {
            let inputs = ConditionInputs {
                probes: self.engine.probes(),
                metrics: self.metrics.as_deref(),
                upstream: &upstream,
            };
            match condition.evaluate(&inputs).await {
                Ok(evaluation) if evaluation.satisfied => {
                    debug!(step = %step.name, detail = %evaluation.detail, "condition met");
                }
                Ok(evaluation) => return StepOutcome::condition_not_met(evaluation.detail),
                Err(e) => {
                    return StepOutcome::failed(None, None, format!("condition evaluation failed: {e}"));
                }
            }
        }

        let _ = started.send(i);
        self.drive(step, experiment).await
    }

    fn payload(&self, step: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("workflow".into(), self.workflow.clone().into());
        payload.insert("run_id".into(), self.run_id.clone().into());
        payload.insert("step".into(), step.into());
        payload
    }

    /// Launch the step's experiment and drive it to a terminal state
    async fn drive(&self, step: &StepSpec, spec: ExperimentSpec) -> StepOutcome {
        let id = ExperimentId::generate();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ExperimentEvent>();
        let handler = handler_fn(move |delivery: Delivery| {
            let events_tx = events_tx.clone();
            async move {
                let _ = events_tx.send(delivery.event);
                Ok(())
            }
        });

        let durable_name = format!("workflow-{}-{}", self.run_id, step.name);
        let subscription = match self
            .engine
            .bus()
            .subscribe_from_tail(&experiment_topic(&id), &durable_name, handler)
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => return StepOutcome::failed(None, None, format!("subscribe failed: {e}")),
        };

        if let Err(e) = self.engine.create_experiment_with_id(id.clone(), spec.clone()).await {
            self.release(subscription).await;
            return StepOutcome::failed(None, None, format!("create experiment failed: {e}"));
        }
        info!(step = %step.name, experiment_id = %id, "experiment launched");

        let advanced = self.advance(&id, step, &spec).await;
        let final_state = self.await_terminal(&id, events_rx).await;
        self.release(subscription).await;

        match (advanced, final_state) {
            (Err(reason), state) => StepOutcome::failed(Some(id), state, reason),
            (Ok(()), Some(ExperimentState::Completed)) => StepOutcome {
                status: StepStatus::Succeeded,
                experiment_id: Some(id),
                final_state: Some(ExperimentState::Completed),
                reason: None,
                condition_skipped: false,
            },
            (Ok(()), Some(state)) => {
                StepOutcome::failed(Some(id), Some(state), format!("experiment ended in {state}"))
            }
            (Ok(()), None) => {
                StepOutcome::failed(Some(id), None, "experiment did not reach a terminal state")
            }
        }
    }

    /// Stop a step subscription and drop its cursor, which no later run reuses
    async fn release(&self, subscription: Subscription) {
        let durable_name = subscription.durable_name().to_string();
        subscription.unsubscribe().await;
        if let Err(e) = self.engine.bus().forget(&durable_name).await {
            warn!(%durable_name, error = %e, "failed to drop step cursor");
        }
    }

    async fn advance(
        &self,
        id: &ExperimentId,
        step: &StepSpec,
        spec: &ExperimentSpec,
    ) -> Result<(), String> {
        let payload = self.payload(&step.name);
        let deadline = step.timeout.map(|timeout| Instant::now() + timeout);

        for trigger in [Trigger::Prepare, Trigger::Inject] {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.time_out(id, step, &payload).await);
            }
            match self.engine.transition(id, trigger, payload.clone()).await {
                Ok(state) if state.is_terminal() => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    self.abandon(id, &payload).await;
                    return Err(format!("{trigger} failed: {e}"));
                }
            }
        }

        let hold_until = Instant::now() + spec.fault.duration.unwrap_or_default();
        match deadline {
            Some(deadline) if deadline <= hold_until => {
                tokio::time::sleep_until(deadline).await;
                return Err(self.time_out(id, step, &payload).await);
            }
            _ => tokio::time::sleep_until(hold_until).await,
        }

        match self.engine.transition(id, Trigger::Revert, payload.clone()).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.abandon(id, &payload).await;
                Err(format!("{} failed: {e}", Trigger::Revert))
            }
        }
    }

    /// Deadline passed: cancel through the table, from `Injected` this reverts
    async fn time_out(&self, id: &ExperimentId, step: &StepSpec, payload: &Payload) -> String {
        let mut payload = payload.clone();
        payload.insert("reason".into(), "timeout".into());
        warn!(step = %step.name, experiment_id = %id, "step timed out, cancelling");
        if let Err(e) = self.engine.transition(id, Trigger::Cancel, payload).await {
            error!(step = %step.name, experiment_id = %id, error = %e, "cancel after timeout failed");
        }
        format!("timed out after {:?}", step.timeout.unwrap_or_default())
    }

    /// Move an experiment whose transition was rejected out of the way
    async fn abandon(&self, id: &ExperimentId, payload: &Payload) {
        let Ok(state) = self.engine.state(id) else {
            return;
        };
        if state.is_terminal() || !self.engine.can_transition(state, Trigger::Cancel) {
            return;
        }
        if let Err(e) = self.engine.transition(id, Trigger::Cancel, payload.clone()).await {
            error!(experiment_id = %id, %state, error = %e, "failed to cancel abandoned experiment");
        }
    }

    /// Wait for the terminal event on the experiment's topic
    async fn await_terminal(
        &self,
        id: &ExperimentId,
        mut events: mpsc::UnboundedReceiver<ExperimentEvent>,
    ) -> Option<ExperimentState> {
        let committed = self.engine.state(id).ok().filter(|s| s.is_terminal())?;

        let observed = tokio::time::timeout(self.config.terminal_wait, async {
            while let Some(event) = events.recv().await {
                if event.is_terminal() {
                    return Some(event.to_state);
                }
            }
            None
        })
        .await;

        match observed {
            Ok(Some(state)) => Some(state),
            _ => {
                warn!(experiment_id = %id, state = %committed, "terminal event not observed, using committed state");
                Some(committed)
            }
        }
    }
}
