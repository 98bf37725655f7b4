//! Custom Resource Definitions for relaygate
//!
//! Three object kinds in the `relaygate.dev/v1alpha1` group form the
//! pipeline: a user-declared [`ExternalService`] is compiled into one
//! [`Forwarder`] (consumed by the forwarder pod) and one [`Gateway`] per
//! distinct source IP (consumed by the gateway host).

mod external_service;
mod forwarder;
mod gateway;
mod types;

pub use external_service::{ExternalService, ExternalServiceSpec, ServicePortSpec, Source};
pub use forwarder::{Forwarder, ForwarderRule, ForwarderSpec, ForwarderStatus};
pub use gateway::{Gateway, GatewayRule, GatewaySpec, GatewayStatus};
pub use types::{Condition, ConditionStatus, NamespacedRef, Protocol};

/// Condition type set while the compiler is mutating a spec.
pub const CONDITION_RULE_UPDATING: &str = "RuleUpdating";

/// Condition type set while a reconciler is applying a spec.
pub const CONDITION_RULE_SYNCING: &str = "RuleSyncing";
