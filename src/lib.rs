//! Relaygate - virtual in-cluster endpoints relayed through external gateways
//!
//! Relaygate lets pods in an overlay network talk to an external system that
//! only accepts connections from a specific, routable IP on an external
//! network. A declared [`crd::ExternalService`] is compiled into rules for a
//! forwarder pod and one or more gateway hosts; SSH tunnels and NAT rules
//! carry the traffic so that packets leaving a gateway carry the configured
//! source address.
//!
//! # Architecture
//!
//! Three controllers form a pipeline connected only through declarative
//! objects (ExternalService → Forwarder → Gateway):
//!
//! - The **compiler** (operator binary) watches ExternalService objects,
//!   allocates relay ports, and writes Forwarder/Gateway specs under a
//!   two-phase status handoff.
//! - The **forwarder reconciler** runs inside the forwarder pod and drives
//!   SSH tunnels plus the pod-local NAT table toward its Forwarder spec.
//! - The **gateway reconciler** runs on the gateway host and drives embedded
//!   SSH servers plus per-gateway NAT chains toward its Gateway spec.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (ExternalService, Forwarder, Gateway)
//! - [`compiler`] - ExternalService reconciliation and rule compilation
//! - [`forwarder`] - Forwarder reconciler (tunnels + NAT)
//! - [`gateway`] - Gateway reconciler (SSH servers + NAT chains)
//! - [`tunnel`] - Source-IP-preserving SSH tunnels
//! - [`ssh`] - Embedded SSH forwarding server and client configuration
//! - [`nat`] - Idempotent NAT chain management
//! - [`status`] - Two-phase rule/sync status protocol
//! - [`retry`] - Exponential backoff supervision
//! - [`net`] - IP hashing and endpoint helpers
//! - [`error`] - Error types

pub mod compiler;
pub mod crd;
pub mod error;
pub mod forwarder;
pub mod gateway;
pub mod nat;
pub mod net;
pub mod retry;
pub mod ssh;
pub mod status;
pub mod tunnel;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace that holds forwarder pods, Forwarder and Gateway objects.
pub const CONNECTOR_NAMESPACE: &str = "external-services";

/// TCP port the embedded SSH forwarding server listens on, per gateway IP.
pub const SSH_PORT: u16 = 2022;

/// Smallest relay port a forwarder or gateway may allocate.
pub const MIN_PORT: u16 = 2049;

/// Upper bound (exclusive) of the relay port range.
pub const MAX_PORT: u32 = 65536;
