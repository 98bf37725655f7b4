//! Forwarder pod and service provisioning.
//!
//! One forwarder pod (and a matching service) exists per ExternalService,
//! in the connector namespace, labeled with the owning ExternalService's
//! namespace and name. Cross-namespace owner references are not allowed, so
//! the labels are what map pod/service events back to reconcile requests.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EnvVar, Pod, PodSpec, SecretVolumeSource, SecurityContext, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::Resource;

use crate::crd::ExternalService;
use crate::CONNECTOR_NAMESPACE;

/// Label carrying the owning ExternalService's namespace.
pub const EXTERNAL_SERVICE_NAMESPACE_LABEL: &str = "externalservice.relaygate.dev/namespace";
/// Label carrying the owning ExternalService's name.
pub const EXTERNAL_SERVICE_NAME_LABEL: &str = "externalservice.relaygate.dev/name";

/// Container image running the forwarder reconciler.
const FORWARDER_IMAGE: &str = "relaygate-forwarder:0.1";
/// Secret holding the SSH credentials mounted into forwarder pods.
const SSH_SECRET_NAME: &str = "relaygate-ssh";

/// Labels identifying resources owned by an ExternalService.
pub fn owner_labels(es: &ExternalService) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            EXTERNAL_SERVICE_NAMESPACE_LABEL.to_string(),
            es.meta().namespace.clone().unwrap_or_default(),
        ),
        (
            EXTERNAL_SERVICE_NAME_LABEL.to_string(),
            es.meta().name.clone().unwrap_or_default(),
        ),
    ])
}

/// Pod spec for the forwarder pod of an ExternalService.
///
/// The pod runs privileged: it rewrites its own network namespace's NAT
/// table. The SSH credential secret is mounted read-only.
pub fn forwarder_pod(es: &ExternalService) -> Pod {
    let name = es.meta().name.clone().unwrap_or_default();
    let labels = owner_labels(es);

    Pod {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(CONNECTOR_NAMESPACE.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "forwarder".to_string(),
                image: Some(FORWARDER_IMAGE.to_string()),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                env: Some(vec![
                    EnvVar {
                        name: "FORWARDER_NAMESPACE".to_string(),
                        value: Some(CONNECTOR_NAMESPACE.to_string()),
                        ..Default::default()
                    },
                    EnvVar {
                        name: "FORWARDER_NAME".to_string(),
                        value: Some(name),
                        ..Default::default()
                    },
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: "ssh-credentials".to_string(),
                    mount_path: "/etc/relaygate/ssh".to_string(),
                    read_only: Some(true),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "ssh-credentials".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(SSH_SECRET_NAME.to_string()),
                    default_mode: Some(0o400),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Service spec exposing the virtual endpoint ports on the forwarder pod.
pub fn forwarder_service(es: &ExternalService) -> Service {
    let name = es.meta().name.clone().unwrap_or_default();
    let labels = owner_labels(es);

    let ports = es
        .spec
        .ports
        .iter()
        .map(|port| ServicePort {
            protocol: Some(port.protocol.to_string()),
            port: i32::from(port.port),
            target_port: Some(IntOrString::Int(i32::from(port.target_port))),
            ..Default::default()
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(CONNECTOR_NAMESPACE.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            ports: Some(ports),
            selector: Some(labels),
            ..Default::default()
        }),
        ..Default::default()
    }
}
