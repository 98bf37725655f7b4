//! Forwarder reconciler
//!
//! Runs inside the forwarder pod and drives actual state (SSH tunnels plus
//! the pod-local NAT table) toward the Forwarder spec written by the
//! compiler. The pod is the sole writer of its own PREROUTING/POSTROUTING
//! chains, so they are replaced wholesale on every sync.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tracing::{error, info, warn};

use crate::crd::{Forwarder, ForwarderSpec, ForwarderStatus};
use crate::error::Error;
use crate::nat::{
    self, ChainRules, NatBackend, CHAIN_POSTROUTING, CHAIN_PREROUTING, TABLE_NAT,
};
use crate::ssh::SshClientConfig;
use crate::status::{needs_check_sync, needs_sync, set_synced, set_syncing};
use crate::tunnel::Tunnel;
use crate::{Result, SSH_PORT};

/// Field manager used for forwarder status writes.
const FIELD_MANAGER: &str = "relaygate-forwarder";

/// Interval between drift probes in the steady state.
const CHECK_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Shared context of the forwarder reconciler.
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Namespace of the Forwarder object this pod serves
    pub namespace: String,
    /// Name of the Forwarder object this pod serves
    pub name: String,
    /// Client configuration for tunnel SSH sessions
    pub ssh_config: SshClientConfig,
    /// NAT backend for the pod-local nat table
    pub nat: Arc<dyn NatBackend>,
    /// Live forward tunnels by canonical key
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
    /// Live remote-forward tunnels by canonical key
    remote_tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
}

impl Context {
    /// Create a reconciler context for one Forwarder object.
    pub fn new(
        client: Client,
        namespace: String,
        name: String,
        ssh_config: SshClientConfig,
        nat: Arc<dyn NatBackend>,
    ) -> Self {
        Self {
            client,
            namespace,
            name,
            ssh_config,
            nat,
            tunnels: Mutex::new(HashMap::new()),
            remote_tunnels: Mutex::new(HashMap::new()),
        }
    }

    /// Keys of currently live forward tunnels.
    pub fn tunnel_keys(&self) -> BTreeSet<String> {
        self.tunnels.lock().unwrap().keys().cloned().collect()
    }

    /// Keys of currently live remote-forward tunnels.
    pub fn remote_tunnel_keys(&self) -> BTreeSet<String> {
        self.remote_tunnels.lock().unwrap().keys().cloned().collect()
    }
}

/// Tunnel keys expected for the spec's egress rules.
///
/// Format: `{forwarderIP}:{relayPort}:{gatewayIP}:{sshPort}:{destIP}:{destPort}`
/// ex) `"10.0.0.2:2049:192.168.122.200:2022:192.168.122.139:8001"`
pub fn expected_tunnel_keys(spec: &ForwarderSpec) -> BTreeSet<String> {
    spec.egress_rules
        .iter()
        .map(|rule| {
            format!(
                "{}:{}:{}:{}:{}:{}",
                spec.forwarder_ip,
                rule.relay_port,
                rule.gateway_ip,
                SSH_PORT,
                rule.destination_ip,
                rule.destination_port
            )
        })
        .collect()
}

/// Tunnel keys expected for the spec's ingress rules.
///
/// Format: `{destIP}:{destPort}:{gatewayIP}:{sshPort}:{gatewayIP}:{relayPort}`
/// ex) `"10.104.205.241:80:192.168.122.200:2022:192.168.122.200:2050"`
pub fn expected_remote_tunnel_keys(spec: &ForwarderSpec) -> BTreeSet<String> {
    spec.ingress_rules
        .iter()
        .map(|rule| {
            format!(
                "{}:{}:{}:{}:{}:{}",
                rule.destination_ip,
                rule.destination_port,
                rule.gateway_ip,
                SSH_PORT,
                rule.gateway_ip,
                rule.relay_port
            )
        })
        .collect()
}

/// NAT rules expected on the forwarder pod for the spec's egress rules.
///
/// Inbound pod traffic is DNATed onto the relay port of its tunnel;
/// outbound relayed traffic is SNATed back to the pod address. Both chains
/// are always present so a sync with no rules flushes stale state.
pub fn expected_nat_rules(spec: &ForwarderSpec) -> ChainRules {
    let mut rules = ChainRules::new();
    rules.insert(CHAIN_PREROUTING.to_string(), Vec::new());
    rules.insert(CHAIN_POSTROUTING.to_string(), Vec::new());

    for rule in &spec.egress_rules {
        rules.get_mut(CHAIN_PREROUTING).unwrap().push(nat::dnat_rule(
            &spec.forwarder_ip,
            &rule.source_ip,
            rule.target_port,
            &spec.forwarder_ip,
            rule.relay_port,
        ));
        rules.get_mut(CHAIN_POSTROUTING).unwrap().push(nat::snat_rule(
            &rule.destination_ip,
            rule.relay_port,
            &spec.forwarder_ip,
        ));
    }

    rules
}

/// Reconcile one Forwarder object.
pub async fn reconcile(fwd: Arc<Forwarder>, ctx: Arc<Context>) -> Result<Action> {
    let name = fwd.name_any();
    let namespace = fwd.namespace().unwrap_or_default();

    // This pod only serves one Forwarder; everything else is not ours.
    if namespace != ctx.namespace || name != ctx.name {
        return Ok(Action::await_change());
    }

    let api: Api<Forwarder> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = fwd.status.clone().unwrap_or_default();

    if needs_sync(&status) {
        if set_syncing(&mut status) {
            patch_status(&api, &name, &status).await?;
        }

        sync_rule(&ctx, &fwd.spec).await?;

        if set_synced(&mut status) {
            patch_status(&api, &name, &status).await?;
        }
        info!(forwarder = %name, generation = status.sync_generation, "rules synced");
        return Ok(Action::requeue(CHECK_SYNC_INTERVAL));
    }

    if needs_check_sync(&status) {
        if !rule_synced(&ctx, &fwd.spec).await {
            warn!(forwarder = %name, "rules are not synced any more");
            // Re-enter syncing; the requeue picks the sync up.
            if set_syncing(&mut status) {
                patch_status(&api, &name, &status).await?;
            }
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        return Ok(Action::requeue(CHECK_SYNC_INTERVAL));
    }

    Ok(Action::await_change())
}

/// Error policy for forwarder reconciliation.
pub fn error_policy(fwd: Arc<Forwarder>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        forwarder = %fwd.name_any(),
        error = %error,
        "forwarder reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn patch_status(api: &Api<Forwarder>, name: &str, status: &ForwarderStatus) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Drive tunnels and NAT to match the spec.
///
/// Stale tunnels are cancelled before new ones start, so a stale tunnel
/// never shadows a new one for the same key. Individual tunnel workers
/// recover on their own (backoff supervision); only NAT application errors
/// fail the sync.
async fn sync_rule(ctx: &Context, spec: &ForwarderSpec) -> Result<()> {
    let expected = expected_tunnel_keys(spec);
    let expected_remote = expected_remote_tunnel_keys(spec);

    {
        let mut tunnels = ctx.tunnels.lock().unwrap();
        tunnels.retain(|key, tunnel| {
            if expected.contains(key) {
                return true;
            }
            info!(key = %key, "deleting ssh tunnel");
            tunnel.cancel();
            false
        });
        for key in &expected {
            if tunnels.contains_key(key) {
                continue;
            }
            info!(key = %key, "creating ssh tunnel");
            let tunnel = Arc::new(Tunnel::from_key(key, ctx.ssh_config.clone())?);
            tunnel.clone().forward_nb();
            tunnels.insert(key.clone(), tunnel);
        }
    }

    {
        let mut remote_tunnels = ctx.remote_tunnels.lock().unwrap();
        remote_tunnels.retain(|key, tunnel| {
            if expected_remote.contains(key) {
                return true;
            }
            info!(key = %key, "deleting remote ssh tunnel");
            tunnel.cancel();
            false
        });
        for key in &expected_remote {
            if remote_tunnels.contains_key(key) {
                continue;
            }
            info!(key = %key, "creating remote ssh tunnel");
            let tunnel = Arc::new(Tunnel::from_key(key, ctx.ssh_config.clone())?);
            tunnel.clone().remote_forward_nb();
            remote_tunnels.insert(key.clone(), tunnel);
        }
    }

    nat::replace_chains(ctx.nat.as_ref(), TABLE_NAT, &expected_nat_rules(spec)).await
}

/// True when every expected tunnel is live and every expected NAT rule
/// exists in the kernel. Powers drift recovery.
async fn rule_synced(ctx: &Context, spec: &ForwarderSpec) -> bool {
    if !expected_tunnel_keys(spec).is_subset(&ctx.tunnel_keys()) {
        return false;
    }
    if !expected_remote_tunnel_keys(spec).is_subset(&ctx.remote_tunnel_keys()) {
        return false;
    }
    nat::check_chains_exist(ctx.nat.as_ref(), TABLE_NAT, &expected_nat_rules(spec)).await
}

/// Run the forwarder controller until shutdown.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let api: Api<Forwarder> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    info!(
        namespace = %ctx.namespace,
        name = %ctx.name,
        "starting forwarder controller"
    );

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "forwarder reconciliation error"),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ForwarderRule, NamespacedRef, Protocol};

    fn egress_spec() -> ForwarderSpec {
        ForwarderSpec {
            forwarder_ip: "10.0.0.2".to_string(),
            egress_rules: vec![ForwarderRule {
                protocol: Protocol::Tcp,
                source_ip: "10.244.0.12".to_string(),
                target_port: 8000,
                destination_ip: "192.168.122.139".to_string(),
                destination_port: 8001,
                gateway: NamespacedRef::new("ns1", "gw1"),
                gateway_ip: "192.168.122.200".to_string(),
                relay_port: 2049,
            }],
            ingress_rules: vec![],
        }
    }

    #[test]
    fn test_expected_tunnel_keys() {
        let keys = expected_tunnel_keys(&egress_spec());
        assert_eq!(
            keys,
            BTreeSet::from(["10.0.0.2:2049:192.168.122.200:2022:192.168.122.139:8001".to_string()])
        );
    }

    #[test]
    fn test_expected_remote_tunnel_keys() {
        let spec = ForwarderSpec {
            forwarder_ip: "10.0.0.2".to_string(),
            egress_rules: vec![],
            ingress_rules: vec![ForwarderRule {
                protocol: Protocol::Tcp,
                source_ip: "192.168.122.139".to_string(),
                target_port: 80,
                destination_ip: "10.104.205.241".to_string(),
                destination_port: 80,
                gateway: NamespacedRef::new("ns1", "gw1"),
                gateway_ip: "192.168.122.200".to_string(),
                relay_port: 2050,
            }],
        };
        let keys = expected_remote_tunnel_keys(&spec);
        assert_eq!(
            keys,
            BTreeSet::from([
                "10.104.205.241:80:192.168.122.200:2022:192.168.122.200:2050".to_string()
            ])
        );
    }

    #[test]
    fn test_expected_nat_rules() {
        let rules = expected_nat_rules(&egress_spec());
        assert_eq!(
            rules[CHAIN_PREROUTING],
            vec![vec![
                "-m", "tcp", "-p", "tcp", "--dst", "10.0.0.2", "--src", "10.244.0.12",
                "--dport", "8000", "-j", "DNAT", "--to-destination", "10.0.0.2:2049",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()]
        );
        assert_eq!(
            rules[CHAIN_POSTROUTING],
            vec![vec![
                "-m", "tcp", "-p", "tcp", "--dst", "192.168.122.139", "--dport", "2049",
                "-j", "SNAT", "--to-source", "10.0.0.2",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()]
        );
    }

    #[test]
    fn test_expected_nat_rules_empty_spec_still_owns_chains() {
        let rules = expected_nat_rules(&ForwarderSpec::default());
        // Both chains are listed (and therefore flushed) even with no rules.
        assert!(rules[CHAIN_PREROUTING].is_empty());
        assert!(rules[CHAIN_POSTROUTING].is_empty());
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn test_keys_distinct_per_rule() {
        let mut spec = egress_spec();
        let mut second = spec.egress_rules[0].clone();
        second.relay_port = 2050;
        second.destination_port = 8002;
        spec.egress_rules.push(second);

        assert_eq!(expected_tunnel_keys(&spec).len(), 2);
    }
}
