//! Supporting types shared across relaygate CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Transport protocol of a relayed port
///
/// Only TCP is relayed today; UDP is declared so specs carrying it
/// round-trip, but the data plane rejects it.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Transmission Control Protocol
    #[default]
    Tcp,
    /// User Datagram Protocol (declared, not yet relayed)
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
        }
    }
}

/// Reference to a namespaced object
///
/// Used for source service references and for the cross-links between
/// Forwarder and Gateway rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct NamespacedRef {
    /// Namespace of the referenced object
    #[serde(default)]
    pub namespace: String,

    /// Name of the referenced object
    #[serde(default)]
    pub name: String,
}

impl NamespacedRef {
    /// Create a reference from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for NamespacedRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (RuleUpdating, RuleSyncing)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(type_: impl Into<String>, status: ConditionStatus) -> Self {
        Self {
            type_: type_.into(),
            status,
            last_transition_time: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Protocol::Tcp).unwrap(), "\"TCP\"");
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"UDP\"");
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }

    #[test]
    fn test_protocol_default_is_tcp() {
        assert_eq!(Protocol::default(), Protocol::Tcp);
    }

    #[test]
    fn test_namespaced_ref_display() {
        let r = NamespacedRef::new("external-services", "gwrulec0a87ac8");
        assert_eq!(r.to_string(), "external-services/gwrulec0a87ac8");
    }

    #[test]
    fn test_condition_status_serde() {
        for status in [
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: ConditionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(status, parsed);
        }
    }

    #[test]
    fn test_default_condition_status_is_unknown() {
        // When nothing has been observed yet, Unknown is the safe default.
        assert_eq!(ConditionStatus::default(), ConditionStatus::Unknown);
    }

    #[test]
    fn test_condition_new_sets_timestamp() {
        let before = Utc::now();
        let condition = Condition::new("RuleSyncing", ConditionStatus::True);
        let after = Utc::now();

        assert_eq!(condition.type_, "RuleSyncing");
        assert_eq!(condition.status, ConditionStatus::True);
        assert!(condition.last_transition_time >= before);
        assert!(condition.last_transition_time <= after);
    }

    #[test]
    fn test_condition_serde_roundtrip() {
        let condition = Condition::new("RuleUpdating", ConditionStatus::False);
        let json = serde_json::to_string(&condition).unwrap();
        assert!(json.contains("\"type\":\"RuleUpdating\""));
        assert!(json.contains("lastTransitionTime"));
        let parsed: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(condition, parsed);
    }
}
