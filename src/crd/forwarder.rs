//! Forwarder Custom Resource Definition
//!
//! A Forwarder describes everything one forwarder pod must do: egress rules
//! (pod traffic relayed out through gateways) and ingress rules (external
//! traffic relayed back to in-cluster services). It is written exclusively
//! by the compiler and consumed by the forwarder reconciler running inside
//! the pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespacedRef, Protocol};

/// One relay rule of a Forwarder, used for both directions
///
/// For egress rules `sourceIP` is a source-service endpoint address and
/// `destinationIP` the external target; for ingress rules `sourceIP` is the
/// external target and `destinationIP` the source service's cluster IP.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderRule {
    /// Transport protocol
    #[serde(default)]
    pub protocol: Protocol,

    /// Address the relayed connection originates from
    #[serde(rename = "sourceIP", default)]
    pub source_ip: String,

    /// Port matched on the incoming leg
    #[serde(default)]
    pub target_port: u16,

    /// Address the relayed connection is delivered to
    #[serde(rename = "destinationIP", default)]
    pub destination_ip: String,

    /// Port the relayed connection is delivered to
    #[serde(default)]
    pub destination_port: u16,

    /// Gateway object carrying the mirrored rule
    pub gateway: NamespacedRef,

    /// Source address owned by that gateway
    #[serde(rename = "gatewayIP", default)]
    pub gateway_ip: String,

    /// Relay port uniquely identifying this rule's tunnel
    #[serde(default)]
    pub relay_port: u16,
}

/// Specification of a Forwarder
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "relaygate.dev",
    version = "v1alpha1",
    kind = "Forwarder",
    plural = "forwarders",
    namespaced,
    status = "ForwarderStatus",
    printcolumn = r#"{"name":"ForwarderIP","type":"string","jsonPath":".spec.forwarderIP"}"#,
    printcolumn = r#"{"name":"Synced","type":"integer","jsonPath":".status.syncGeneration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderSpec {
    /// IP of the forwarder pod this spec is addressed to
    #[serde(rename = "forwarderIP", default)]
    pub forwarder_ip: String,

    /// Rules relaying pod traffic out through gateways
    #[serde(default)]
    pub egress_rules: Vec<ForwarderRule>,

    /// Rules relaying external traffic back into the cluster
    #[serde(default)]
    pub ingress_rules: Vec<ForwarderRule>,
}

impl ForwarderSpec {
    /// Unique `(gatewayIP, gateway ref)` pairs referenced by ingress rules.
    ///
    /// The compiler derives the set of Gateway objects to rewrite from this.
    pub fn gateway_refs(&self) -> Vec<(String, NamespacedRef)> {
        let mut refs: Vec<(String, NamespacedRef)> = Vec::new();
        for rule in &self.ingress_rules {
            if !refs.iter().any(|(ip, _)| ip == &rule.gateway_ip) {
                refs.push((rule.gateway_ip.clone(), rule.gateway.clone()));
            }
        }
        refs
    }
}

/// Observed state of a Forwarder
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ForwarderStatus {
    /// Generation of the rules last written by the compiler
    #[serde(default)]
    pub rule_generation: i64,

    /// Generation the reconciler last made reality match
    #[serde(default)]
    pub sync_generation: i64,

    /// RuleUpdating / RuleSyncing conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(gateway_ip: &str) -> ForwarderRule {
        ForwarderRule {
            protocol: Protocol::Tcp,
            source_ip: "10.0.0.4".to_string(),
            target_port: 8080,
            destination_ip: "192.168.122.139".to_string(),
            destination_port: 80,
            gateway: NamespacedRef::new("external-services", "gwrulec0a87ac8"),
            gateway_ip: gateway_ip.to_string(),
            relay_port: 2049,
        }
    }

    #[test]
    fn test_rule_serializes_camel_case_with_ip_suffixes() {
        let json = serde_json::to_string(&rule("192.168.122.200")).unwrap();
        assert!(json.contains("\"sourceIP\""));
        assert!(json.contains("\"destinationIP\""));
        assert!(json.contains("\"gatewayIP\""));
        assert!(json.contains("\"targetPort\""));
        assert!(json.contains("\"relayPort\""));
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = ForwarderSpec {
            forwarder_ip: "10.0.0.3".to_string(),
            egress_rules: vec![rule("192.168.122.200")],
            ingress_rules: vec![],
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"forwarderIP\":\"10.0.0.3\""));
        let parsed: ForwarderSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }

    #[test]
    fn test_gateway_refs_deduplicates_by_ip() {
        let spec = ForwarderSpec {
            forwarder_ip: "10.0.0.3".to_string(),
            egress_rules: vec![],
            ingress_rules: vec![
                rule("192.168.122.200"),
                rule("192.168.122.200"),
                rule("192.168.122.201"),
            ],
        };
        let refs = spec.gateway_refs();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "192.168.122.200");
        assert_eq!(refs[1].0, "192.168.122.201");
    }

    #[test]
    fn test_empty_status_defaults() {
        let status: ForwarderStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.rule_generation, 0);
        assert_eq!(status.sync_generation, 0);
        assert!(status.conditions.is_empty());
    }
}
