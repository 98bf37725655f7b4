//! Gateway Custom Resource Definition
//!
//! A Gateway describes everything one gateway host must do for a single
//! external source IP: which SSH server to run and which NAT rules to hold.
//! Its name is a pure function of the source IP (`gwrule` + hex), so every
//! ExternalService sharing that IP converges on the same object. Rules carry
//! the owning Forwarder's reference and pod IP because the gateway rewrites
//! packets toward that pod.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NamespacedRef, Protocol};

/// One relay rule of a Gateway, mirrored from a Forwarder rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRule {
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

    /// Forwarder object this rule was projected from
    pub forwarder: NamespacedRef,

    /// IP of that forwarder's pod
    #[serde(rename = "forwarderIP", default)]
    pub forwarder_ip: String,

    /// Relay port uniquely identifying this rule's tunnel
    #[serde(default)]
    pub relay_port: u16,
}

/// Specification of a Gateway
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "relaygate.dev",
    version = "v1alpha1",
    kind = "Gateway",
    plural = "gateways",
    namespaced,
    status = "GatewayStatus",
    printcolumn = r#"{"name":"GatewayIP","type":"string","jsonPath":".spec.gatewayIP"}"#,
    printcolumn = r#"{"name":"Synced","type":"integer","jsonPath":".status.syncGeneration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// Source address this gateway serves
    #[serde(rename = "gatewayIP", default)]
    pub gateway_ip: String,

    /// Mirrored egress rules (forwarder pod → target)
    #[serde(default)]
    pub egress_rules: Vec<GatewayRule>,

    /// Mirrored ingress rules (target → cluster service)
    #[serde(default)]
    pub ingress_rules: Vec<GatewayRule>,
}

/// Observed state of a Gateway
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayStatus {
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

    #[test]
    fn test_spec_roundtrip() {
        let spec = GatewaySpec {
            gateway_ip: "192.168.122.200".to_string(),
            egress_rules: vec![GatewayRule {
                protocol: Protocol::Tcp,
                source_ip: "10.0.0.4".to_string(),
                target_port: 8080,
                destination_ip: "192.168.122.139".to_string(),
                destination_port: 80,
                forwarder: NamespacedRef::new("external-services", "es1"),
                forwarder_ip: "10.0.0.3".to_string(),
                relay_port: 2049,
            }],
            ingress_rules: vec![],
        };
        let json = serde_json::to_string(&spec).unwrap();
        assert!(json.contains("\"gatewayIP\":\"192.168.122.200\""));
        assert!(json.contains("\"forwarderIP\":\"10.0.0.3\""));
        let parsed: GatewaySpec = serde_json::from_str(&json).unwrap();
        assert_eq!(spec, parsed);
    }

    #[test]
    fn test_empty_status_defaults() {
        let status: GatewayStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(status.rule_generation, 0);
        assert_eq!(status.sync_generation, 0);
        assert!(status.conditions.is_empty());
    }
}
