//! Transition table
//!
//! Fixed set of `(from, trigger) -> to` rules resolved at engine construction.
//! The table is read-only afterwards and shared by every experiment.

use std::collections::HashMap;
use std::sync::Arc;

use super::builtin::{
    BeforeProbesPass, CleanupPartialFault, FaultSpecValid, FlagManualRemediation, InjectFault,
    InjectorConfirmsRecovery, NoOverlappingTarget, PrepareFault, RecoverFault,
};
use super::rule::{Action, Guard, TransitionRule};
use super::state::{ExperimentState, Trigger};

#[derive(Debug, Clone)]
pub struct TransitionTable {
    rules: HashMap<(ExperimentState, Trigger), TransitionRule>,
}

impl TransitionTable {
    /// The 13 lifecycle rules without guards or actions
    pub fn bare() -> Self {
        use ExperimentState::*;
        use Trigger::*;

        let rules = [
            (Idle, Prepare, Preparing),
            (Preparing, PrepareDone, Ready),
            (Preparing, Fail, Failed),
            (Preparing, Cancel, Cancelled),
            (Idle, Cancel, Cancelled),
            (Ready, Inject, Injecting),
            (Ready, Cancel, Cancelled),
            (Injecting, InjectDone, Injected),
            (Injecting, Fail, Failed),
            (Injected, Revert, Reverting),
            (Injected, Cancel, Reverting),
            (Reverting, RevertDone, Completed),
            (Reverting, Fail, Failed),
        ];

        Self {
            rules: rules
                .into_iter()
                .map(|(from, trigger, to)| ((from, trigger), TransitionRule::new(from, trigger, to)))
                .collect(),
        }
    }

    /// Lifecycle rules with the built-in guards and fault injector actions
    pub fn standard() -> Self {
        use ExperimentState::*;
        use Trigger::*;

        let recover = Arc::new(RecoverFault);
        let cleanup = Arc::new(CleanupPartialFault);

        Self::bare()
            .with_guard(Idle, Prepare, Arc::new(NoOverlappingTarget))
            .with_action(Idle, Prepare, Arc::new(PrepareFault))
            .with_guard(Preparing, PrepareDone, Arc::new(BeforeProbesPass))
            .with_action(Preparing, Fail, cleanup.clone())
            .with_guard(Ready, Inject, Arc::new(FaultSpecValid))
            .with_action(Ready, Inject, Arc::new(InjectFault))
            .with_action(Injecting, Fail, cleanup)
            .with_action(Injected, Revert, recover.clone())
            .with_action(Injected, Cancel, recover)
            .with_guard(Reverting, RevertDone, Arc::new(InjectorConfirmsRecovery))
            .with_action(Reverting, Fail, Arc::new(FlagManualRemediation))
    }

    /// Attach a guard to an existing rule; unknown pairs are ignored
    pub fn with_guard(mut self, from: ExperimentState, trigger: Trigger, guard: Arc<dyn Guard>) -> Self {
        if let Some(rule) = self.rules.get_mut(&(from, trigger)) {
            rule.guard = Some(guard);
        }
        self
    }

    /// Attach an action to an existing rule; unknown pairs are ignored
    pub fn with_action(
        mut self,
        from: ExperimentState,
        trigger: Trigger,
        action: Arc<dyn Action>,
    ) -> Self {
        if let Some(rule) = self.rules.get_mut(&(from, trigger)) {
            rule.action = Some(action);
        }
        self
    }

    pub fn rule(&self, from: ExperimentState, trigger: Trigger) -> Option<&TransitionRule> {
        self.rules.get(&(from, trigger))
    }

    /// Whether `(state, trigger)` is in the table (guards not evaluated)
    pub fn can_transition(&self, state: ExperimentState, trigger: Trigger) -> bool {
        self.rules.contains_key(&(state, trigger))
    }

    /// Fold a trigger chain through the table, `None` if any step is invalid
    pub fn fold(&self, from: ExperimentState, triggers: &[Trigger]) -> Option<ExperimentState> {
        triggers
            .iter()
            .try_fold(from, |state, trigger| self.rule(state, *trigger).map(|r| r.to))
    }

    /// Every state visited by a trigger chain, starting state excluded
    pub fn path(&self, from: ExperimentState, triggers: &[Trigger]) -> Option<Vec<ExperimentState>> {
        let mut state = from;
        let mut visited = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            state = self.rule(state, *trigger)?.to;
            visited.push(state);
        }
        Some(visited)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ExperimentState::*;
    use Trigger::*;

    #[test]
    fn test_table_has_thirteen_rules() {
        let table = TransitionTable::standard();
        assert_eq!(table.len(), 13);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let table = TransitionTable::bare();
        for state in ExperimentState::ALL.into_iter().filter(|s| s.is_terminal()) {
            for trigger in Trigger::ALL {
                assert!(!table.can_transition(state, trigger), "{state} --{trigger}");
            }
        }
    }

    #[test]
    fn test_cancel_from_injected_reverts() {
        let table = TransitionTable::bare();
        assert_eq!(table.rule(Injected, Cancel).map(|r| r.to), Some(Reverting));
        assert_eq!(
            table.path(Injected, &[Cancel, RevertDone]),
            Some(vec![Reverting, Completed])
        );
    }

    #[test]
    fn test_fold() {
        let table = TransitionTable::bare();
        assert_eq!(table.fold(Idle, &[Prepare, PrepareDone]), Some(Ready));
        assert_eq!(table.fold(Idle, &[]), Some(Idle));
        assert_eq!(table.fold(Idle, &[Inject]), None);
        assert_eq!(table.fold(Ready, &[Inject, Fail]), Some(Failed));
    }

    #[test]
    fn test_standard_attaches_guards_and_actions() {
        let table = TransitionTable::standard();
        let prepare = table.rule(Idle, Prepare).unwrap();
        assert_eq!(prepare.guard.as_ref().map(|g| g.name()), Some("no_overlapping_target"));
        assert_eq!(prepare.action.as_ref().map(|a| a.name()), Some("prepare_fault"));

        let cancel = table.rule(Ready, Cancel).unwrap();
        assert!(cancel.guard.is_none() && cancel.action.is_none());
    }
}
