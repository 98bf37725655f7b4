//! Two-phase rule/sync status protocol
//!
//! Forwarder and Gateway objects carry the 4-tuple `(ruleGeneration,
//! syncGeneration, RuleUpdating, RuleSyncing)`. The compiler brackets every
//! spec mutation with [`begin_update`]/[`finish_update`]; reconcilers gate on
//! [`needs_sync`]/[`needs_check_sync`] and report with [`set_syncing`]/
//! [`set_synced`]. A reconciler therefore never reads a half-written spec and
//! never marks itself synced at a stale generation.
//!
//! All transition helpers return whether they changed anything, so callers
//! can skip the status write entirely when the transition is a no-op.

use crate::crd::{
    Condition, ConditionStatus, ForwarderStatus, GatewayStatus, CONDITION_RULE_SYNCING,
    CONDITION_RULE_UPDATING,
};

/// Common surface of Forwarder and Gateway statuses.
pub trait RuleStatus {
    /// Generation of the rules last written by the compiler
    fn rule_generation(&self) -> i64;
    /// Generation the reconciler last applied
    fn sync_generation(&self) -> i64;
    /// Bump the rule generation
    fn set_rule_generation(&mut self, generation: i64);
    /// Record the applied generation
    fn set_sync_generation(&mut self, generation: i64);
    /// Current conditions
    fn conditions(&self) -> &[Condition];
    /// Mutable conditions
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;
}

macro_rules! impl_rule_status {
    ($ty:ty) => {
        impl RuleStatus for $ty {
            fn rule_generation(&self) -> i64 {
                self.rule_generation
            }
            fn sync_generation(&self) -> i64 {
                self.sync_generation
            }
            fn set_rule_generation(&mut self, generation: i64) {
                self.rule_generation = generation;
            }
            fn set_sync_generation(&mut self, generation: i64) {
                self.sync_generation = generation;
            }
            fn conditions(&self) -> &[Condition] {
                &self.conditions
            }
            fn conditions_mut(&mut self) -> &mut Vec<Condition> {
                &mut self.conditions
            }
        }
    };
}

impl_rule_status!(ForwarderStatus);
impl_rule_status!(GatewayStatus);

/// Status of a condition type; Unknown when the condition is absent.
pub fn condition(status: &impl RuleStatus, type_: &str) -> ConditionStatus {
    status
        .conditions()
        .iter()
        .find(|c| c.type_ == type_)
        .map(|c| c.status)
        .unwrap_or(ConditionStatus::Unknown)
}

/// Set a condition, returning true if the stored status actually changed.
///
/// The transition timestamp only moves on a real transition, so repeated
/// writes of the same value are observable no-ops.
pub fn set_condition(status: &mut impl RuleStatus, type_: &str, value: ConditionStatus) -> bool {
    if let Some(existing) = status
        .conditions_mut()
        .iter_mut()
        .find(|c| c.type_ == type_)
    {
        if existing.status == value {
            return false;
        }
        *existing = Condition::new(type_, value);
        return true;
    }
    status.conditions_mut().push(Condition::new(type_, value));
    true
}

/// True when the reconciler should apply the spec.
///
/// Sync is needed if the rules are not mid-update, and either the
/// generations diverge or a previous sync was interrupted.
pub fn needs_sync(status: &impl RuleStatus) -> bool {
    condition(status, CONDITION_RULE_UPDATING) == ConditionStatus::False
        && (status.rule_generation() != status.sync_generation()
            || condition(status, CONDITION_RULE_SYNCING) == ConditionStatus::True)
}

/// True when the reconciler should probe for drift instead of syncing.
pub fn needs_check_sync(status: &impl RuleStatus) -> bool {
    condition(status, CONDITION_RULE_UPDATING) == ConditionStatus::False
        && status.rule_generation() == status.sync_generation()
        && condition(status, CONDITION_RULE_SYNCING) == ConditionStatus::False
}

/// Mark a sync as started. Returns false when already syncing.
pub fn set_syncing(status: &mut impl RuleStatus) -> bool {
    set_condition(status, CONDITION_RULE_SYNCING, ConditionStatus::True)
}

/// Mark a sync as finished at the current rule generation.
///
/// Returns false when already synced, in which case nothing moved.
pub fn set_synced(status: &mut impl RuleStatus) -> bool {
    if !set_condition(status, CONDITION_RULE_SYNCING, ConditionStatus::False) {
        return false;
    }
    status.set_sync_generation(status.rule_generation());
    true
}

/// Compiler-side: mark the spec as mid-update before mutating it.
pub fn begin_update(status: &mut impl RuleStatus) -> bool {
    set_condition(status, CONDITION_RULE_UPDATING, ConditionStatus::True)
}

/// Compiler-side: publish a finished spec write.
///
/// Bumps the rule generation, clears RuleUpdating, and resets RuleSyncing to
/// Unknown so the downstream reconciler picks the new generation up.
pub fn finish_update(status: &mut impl RuleStatus) {
    status.set_rule_generation(status.rule_generation() + 1);
    set_condition(status, CONDITION_RULE_UPDATING, ConditionStatus::False);
    set_condition(status, CONDITION_RULE_SYNCING, ConditionStatus::Unknown);
}
