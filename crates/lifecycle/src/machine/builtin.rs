//! Built-in guards and actions of the standard transition table
//!
//! Actions translate the injector outcome into the follow-up trigger:
//! success yields the matching `*Done` trigger, an [`InjectorError`] yields
//! `Fail` with the cause in the payload. An action only returns
//! [`ActionError`] when nothing was attempted on the target.
//!
//! [`InjectorError`]: crate::capability::InjectorError

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::rule::{Action, ActionError, ActionOutcome, Guard, GuardVerdict, TransitionContext};
use super::state::Trigger;
use crate::capability::FaultPhase;
use crate::event::Payload;
use crate::experiment::ProbePhase;

/// Leases the target; denied when another live experiment overlaps it
pub struct NoOverlappingTarget;

#[async_trait]
impl Guard for NoOverlappingTarget {
    fn name(&self) -> &'static str {
        "no_overlapping_target"
    }

    async fn check(&self, ctx: &TransitionContext<'_>) -> GuardVerdict {
        match ctx.leases.try_acquire(ctx.experiment_id, &ctx.spec.target) {
            Ok(()) => GuardVerdict::Allow,
            Err(holder) => GuardVerdict::Deny(format!(
                "target {} overlaps active experiment {holder}",
                ctx.spec.target
            )),
        }
    }
}

/// Every `before` probe passes
pub struct BeforeProbesPass;

#[async_trait]
impl Guard for BeforeProbesPass {
    fn name(&self) -> &'static str {
        "before_probes_pass"
    }

    async fn check(&self, ctx: &TransitionContext<'_>) -> GuardVerdict {
        for probe in ctx.spec.probes_for(ProbePhase::Before) {
            let result = ctx.probes.run(&probe.name).await;
            if !result.passed {
                let detail = result.detail.unwrap_or_else(|| "failed".to_string());
                return GuardVerdict::Deny(format!("probe '{}': {detail}", probe.name));
            }
        }
        GuardVerdict::Allow
    }
}

/// An injector is registered for the fault kind and accepts the spec
pub struct FaultSpecValid;

#[async_trait]
impl Guard for FaultSpecValid {
    fn name(&self) -> &'static str {
        "fault_spec_valid"
    }

    async fn check(&self, ctx: &TransitionContext<'_>) -> GuardVerdict {
        let injector = match ctx.injector() {
            Ok(injector) => injector,
            Err(e) => return GuardVerdict::Deny(e.to_string()),
        };
        match injector.validate(&ctx.fault_request()).await {
            Ok(()) => GuardVerdict::Allow,
            Err(e) => GuardVerdict::Deny(e.to_string()),
        }
    }
}

/// The injector reports no fault left on the target
pub struct InjectorConfirmsRecovery;

#[async_trait]
impl Guard for InjectorConfirmsRecovery {
    fn name(&self) -> &'static str {
        "injector_confirms_recovery"
    }

    async fn check(&self, ctx: &TransitionContext<'_>) -> GuardVerdict {
        let injector = match ctx.injector() {
            Ok(injector) => injector,
            Err(e) => return GuardVerdict::Deny(e.to_string()),
        };
        match injector.status(ctx.experiment_id).await {
            Ok(status) if status.is_clear() => GuardVerdict::Allow,
            Ok(status) => GuardVerdict::Deny(format!("injector reports fault status {status:?}")),
            Err(e) => GuardVerdict::Deny(format!("status check failed: {e}")),
        }
    }
}

fn failure(phase: FaultPhase, err: impl std::fmt::Display) -> ActionOutcome {
    ActionOutcome::then(Trigger::Fail)
        .with("error", err.to_string())
        .with("failed_phase", phase.to_string())
}

pub struct PrepareFault;

#[async_trait]
impl Action for PrepareFault {
    fn name(&self) -> &'static str {
        "prepare_fault"
    }

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.injector()?;
        match ctx.call_injector(FaultPhase::Prepare).await {
            Ok(()) => Ok(ActionOutcome::then(Trigger::PrepareDone)),
            Err(e) => Ok(failure(FaultPhase::Prepare, e)),
        }
    }
}

pub struct InjectFault;

#[async_trait]
impl Action for InjectFault {
    fn name(&self) -> &'static str {
        "inject_fault"
    }

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.injector()?;
        match ctx.call_injector(FaultPhase::Inject).await {
            Ok(()) => Ok(ActionOutcome::then(Trigger::InjectDone)),
            Err(e) => Ok(failure(FaultPhase::Inject, e)),
        }
    }
}

/// Removes the fault (on `Revert` and on `Cancel` from `Injected`), then
/// records the `after` probes
pub struct RecoverFault;

#[async_trait]
impl Action for RecoverFault {
    fn name(&self) -> &'static str {
        "recover_fault"
    }

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError> {
        ctx.injector()?;
        if let Err(e) = ctx.call_injector(FaultPhase::Recover).await {
            return Ok(failure(FaultPhase::Recover, e));
        }

        let mut probes = Payload::new();
        for probe in ctx.spec.probes_for(ProbePhase::After) {
            let result = ctx.probes.run(&probe.name).await;
            probes.insert(
                probe.name.clone(),
                serde_json::to_value(&result).unwrap_or(Value::Null),
            );
        }

        let outcome = ActionOutcome::then(Trigger::RevertDone);
        if probes.is_empty() {
            Ok(outcome)
        } else {
            Ok(outcome.with("after_probes", Value::Object(probes)))
        }
    }
}

/// Best-effort removal of a partially prepared or applied fault
pub struct CleanupPartialFault;

#[async_trait]
impl Action for CleanupPartialFault {
    fn name(&self) -> &'static str {
        "cleanup_partial_fault"
    }

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError> {
        match ctx.call_injector(FaultPhase::Recover).await {
            Ok(()) => Ok(ActionOutcome::done().with("cleanup", "recovered")),
            Err(e) => {
                warn!(
                    experiment_id = %ctx.experiment_id,
                    from = %ctx.from,
                    error = %e,
                    "cleanup of partial fault failed"
                );
                Ok(ActionOutcome::done()
                    .with("cleanup", "failed")
                    .with("cleanup_error", e.to_string())
                    .with("manual_remediation", true))
            }
        }
    }
}

/// Recovery could not be confirmed; a human has to look at the target
pub struct FlagManualRemediation;

#[async_trait]
impl Action for FlagManualRemediation {
    fn name(&self) -> &'static str {
        "flag_manual_remediation"
    }

    async fn run(&self, ctx: &TransitionContext<'_>) -> Result<ActionOutcome, ActionError> {
        error!(
            experiment_id = %ctx.experiment_id,
            target = %ctx.spec.target,
            fault = %ctx.spec.fault.kind,
            "recovery failed, experiment flagged for manual remediation"
        );
        Ok(ActionOutcome::done().with("manual_remediation", json!(true)))
    }
}
