//! ExternalService Custom Resource Definition
//!
//! The ExternalService CRD is the user-facing declaration of a virtual
//! endpoint inside the cluster bound to an external target IP with a chosen
//! set of source identities. The compiler decomposes it into Forwarder and
//! Gateway objects.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{NamespacedRef, Protocol};

/// Binding of an in-cluster service to an external source address
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Source {
    /// In-cluster service whose endpoints originate the relayed traffic
    pub service: NamespacedRef,

    /// External address to impersonate on the gateway's segment
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
}

/// One relayed port of the virtual endpoint
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServicePortSpec {
    /// Transport protocol (TCP only today)
    #[serde(default)]
    pub protocol: Protocol,

    /// Port exposed via the virtual endpoint
    pub port: u16,

    /// Port reached on the external target
    pub target_port: u16,
}

/// Specification for an ExternalService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "relaygate.dev",
    version = "v1alpha1",
    kind = "ExternalService",
    plural = "externalservices",
    shortname = "extsvc",
    namespaced,
    printcolumn = r#"{"name":"TargetIP","type":"string","jsonPath":".spec.targetIP"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ExternalServiceSpec {
    /// The external destination host
    #[serde(rename = "targetIP")]
    pub target_ip: String,

    /// Source identities that may reach the target
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,

    /// Ports exposed by the virtual endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortSpec>,
}

impl ExternalServiceSpec {
    /// Distinct source IPs referenced by this external service
    pub fn source_ips(&self) -> Vec<&str> {
        let mut ips: Vec<&str> = Vec::new();
        for source in &self.sources {
            if !ips.contains(&source.source_ip.as_str()) {
                ips.push(&source.source_ip);
            }
        }
        ips
    }

    /// Validate the external service specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.target_ip.parse::<std::net::Ipv4Addr>().is_err() {
            return Err(crate::Error::validation(format!(
                "targetIP {:?} is not a valid IPv4 address",
                self.target_ip
            )));
        }
        for source in &self.sources {
            if source.source_ip.parse::<std::net::Ipv4Addr>().is_err() {
                return Err(crate::Error::validation(format!(
                    "sourceIP {:?} is not a valid IPv4 address",
                    source.source_ip
                )));
            }
            if source.service.name.is_empty() || source.service.namespace.is_empty() {
                return Err(crate::Error::validation(
                    "source service reference must carry namespace and name",
                ));
            }
        }
        for port in &self.ports {
            if port.port == 0 || port.target_port == 0 {
                return Err(crate::Error::validation("port 0 is not relayable"));
            }
            if port.protocol == Protocol::Udp {
                return Err(crate::Error::validation(
                    "UDP relaying is not supported yet",
                ));
            }
        }
        Ok(())
    }
}
