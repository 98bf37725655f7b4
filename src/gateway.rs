//! Gateway reconciler
//!
//! Runs on the gateway host and drives actual state (embedded SSH servers
//! plus NAT chains) toward every Gateway spec in its watched namespace. A
//! host may serve several gateway IPs at once; each one gets its own SSH
//! server and its own pair of named NAT chains, so rule replacement for one
//! gateway never disturbs another. Only the jump rules into the base chains
//! are shared, and those are append-only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::crd::{Gateway, GatewaySpec, GatewayStatus};
use crate::error::Error;
use crate::nat::{
    self, ChainRules, NatBackend, CHAIN_POSTROUTING, CHAIN_PREROUTING, TABLE_NAT,
};
use crate::net::{hex_ip, is_port_open};
use crate::retry::{supervise, RetryConfig};
use crate::ssh::{SshCredentials, SshServer};
use crate::status::{needs_check_sync, needs_sync, set_synced, set_syncing};
use crate::{Result, SSH_PORT};

/// Field manager used for gateway status writes.
const FIELD_MANAGER: &str = "relaygate-gateway";

/// Interval between drift probes in the steady state.
const CHECK_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Dial timeout of the SSH-port drift probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Prefix of the per-gateway PREROUTING-side chain.
const PRECHAIN_PREFIX: &str = "pre";
/// Prefix of the per-gateway POSTROUTING-side chain.
const POSTCHAIN_PREFIX: &str = "pst";

/// Shared context of the gateway reconciler.
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Namespace whose Gateways this host serves
    pub namespace: String,
    /// Credentials the embedded SSH servers accept
    pub credentials: SshCredentials,
    /// NAT backend for the host nat table
    pub nat: Arc<dyn NatBackend>,
    /// Cancellation handles of running SSH servers, by gateway IP
    ssh_servers: Mutex<HashMap<String, CancellationToken>>,
}

impl Context {
    /// Create a reconciler context for one watched namespace.
    pub fn new(
        client: Client,
        namespace: String,
        credentials: SshCredentials,
        nat: Arc<dyn NatBackend>,
    ) -> Self {
        Self {
            client,
            namespace,
            credentials,
            nat,
            ssh_servers: Mutex::new(HashMap::new()),
        }
    }

    /// Gateway IPs with a running SSH server.
    pub fn server_ips(&self) -> Vec<String> {
        self.ssh_servers.lock().unwrap().keys().cloned().collect()
    }
}

/// Expected NAT state for a Gateway: `(jump rules, per-gateway chains)`.
///
/// The per-gateway chains are named `pre`/`pst` + hex(gatewayIP) and hold
/// the DNAT/SNAT pairs; the jump rules hook them into PREROUTING and
/// POSTROUTING.
pub fn expected_nat_rules(spec: &GatewaySpec) -> Result<(ChainRules, ChainRules)> {
    let hex = hex_ip(&spec.gateway_ip)?;
    let pre_chain = format!("{PRECHAIN_PREFIX}{hex}");
    let post_chain = format!("{POSTCHAIN_PREFIX}{hex}");

    let mut jump_chains = ChainRules::new();
    jump_chains.insert(
        CHAIN_PREROUTING.to_string(),
        vec![vec!["-j".to_string(), pre_chain.clone()]],
    );
    jump_chains.insert(
        CHAIN_POSTROUTING.to_string(),
        vec![vec!["-j".to_string(), post_chain.clone()]],
    );

    let mut chains = ChainRules::new();
    chains.insert(pre_chain.clone(), Vec::new());
    chains.insert(post_chain.clone(), Vec::new());

    for rule in &spec.ingress_rules {
        chains.get_mut(&pre_chain).unwrap().push(nat::dnat_rule(
            &spec.gateway_ip,
            &rule.source_ip,
            rule.target_port,
            &spec.gateway_ip,
            rule.relay_port,
        ));
        chains.get_mut(&post_chain).unwrap().push(nat::snat_rule(
            &rule.destination_ip,
            rule.relay_port,
            &spec.gateway_ip,
        ));
    }

    Ok((jump_chains, chains))
}

/// Reconcile one Gateway object.
pub async fn reconcile(gw: Arc<Gateway>, ctx: Arc<Context>) -> Result<Action> {
    let name = gw.name_any();
    let namespace = gw.namespace().unwrap_or_default();

    // A host reconciles every Gateway in its watched namespace, nothing else.
    if namespace != ctx.namespace {
        return Ok(Action::await_change());
    }

    let api: Api<Gateway> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = gw.status.clone().unwrap_or_default();

    if needs_sync(&status) {
        if set_syncing(&mut status) {
            patch_status(&api, &name, &status).await?;
        }

        sync_rule(&ctx, &gw.spec).await?;

        if set_synced(&mut status) {
            patch_status(&api, &name, &status).await?;
        }
        info!(gateway = %name, generation = status.sync_generation, "rules synced");
        return Ok(Action::requeue(CHECK_SYNC_INTERVAL));
    }

    if needs_check_sync(&status) {
        if !rule_synced(&ctx, &gw.spec).await {
            warn!(gateway = %name, "rules are not synced any more");
            if set_syncing(&mut status) {
                patch_status(&api, &name, &status).await?;
            }
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        return Ok(Action::requeue(CHECK_SYNC_INTERVAL));
    }

    Ok(Action::await_change())
}

/// Error policy for gateway reconciliation.
pub fn error_policy(gw: Arc<Gateway>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        gateway = %gw.name_any(),
        error = %error,
        "gateway reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

async fn patch_status(api: &Api<Gateway>, name: &str, status: &GatewayStatus) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Drive the SSH server and NAT chains to match the spec.
async fn sync_rule(ctx: &Context, spec: &GatewaySpec) -> Result<()> {
    ensure_ssh_server(ctx, &spec.gateway_ip);

    let (jump_chains, chains) = expected_nat_rules(spec)?;
    nat::replace_chains(ctx.nat.as_ref(), TABLE_NAT, &chains).await?;
    nat::add_chains(ctx.nat.as_ref(), TABLE_NAT, &jump_chains).await?;

    Ok(())
}

/// Start a supervised SSH server for `ip` unless one is already running.
fn ensure_ssh_server(ctx: &Context, ip: &str) {
    let mut servers = ctx.ssh_servers.lock().unwrap();
    if servers.contains_key(ip) {
        return;
    }

    info!(gateway_ip = %ip, "starting embedded ssh server");
    let cancel = CancellationToken::new();
    let server = Arc::new(SshServer::new(
        ip,
        SSH_PORT,
        ctx.credentials.clone(),
        cancel.clone(),
    ));
    let retry = RetryConfig::default();
    let supervisor_cancel = cancel.clone();
    let ip_owned = ip.to_string();
    tokio::spawn(async move {
        supervise(&retry, &format!("sshd {ip_owned}"), &supervisor_cancel, || {
            let server = server.clone();
            async move { server.run().await }
        })
        .await;
    });

    servers.insert(ip.to_string(), cancel);
}

/// True when the SSH port answers and all expected NAT rules exist.
async fn rule_synced(ctx: &Context, spec: &GatewaySpec) -> bool {
    if !is_port_open(&spec.gateway_ip, SSH_PORT, PROBE_TIMEOUT).await {
        return false;
    }
    let Ok((jump_chains, chains)) = expected_nat_rules(spec) else {
        return false;
    };
    nat::check_chains_exist(ctx.nat.as_ref(), TABLE_NAT, &chains).await
        && nat::check_chains_exist(ctx.nat.as_ref(), TABLE_NAT, &jump_chains).await
}

/// Run the gateway controller until shutdown.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let api: Api<Gateway> = Api::namespaced(ctx.client.clone(), &ctx.namespace);

    info!(namespace = %ctx.namespace, "starting gateway controller");

    Controller::new(api, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "gateway reconciliation error"),
            }
        })
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GatewayRule, NamespacedRef, Protocol};

    fn spec() -> GatewaySpec {
        GatewaySpec {
            gateway_ip: "192.168.122.201".to_string(),
            egress_rules: vec![],
            ingress_rules: vec![
                GatewayRule {
                    protocol: Protocol::Tcp,
                    source_ip: "192.168.122.139".to_string(),
                    target_port: 80,
                    destination_ip: "10.104.205.241".to_string(),
                    destination_port: 80,
                    forwarder: NamespacedRef::new("external-services", "es1"),
                    forwarder_ip: "10.0.0.2".to_string(),
                    relay_port: 2049,
                },
                GatewayRule {
                    protocol: Protocol::Tcp,
                    source_ip: "192.168.122.139".to_string(),
                    target_port: 8080,
                    destination_ip: "10.104.205.241".to_string(),
                    destination_port: 8080,
                    forwarder: NamespacedRef::new("external-services", "es1"),
                    forwarder_ip: "10.0.0.2".to_string(),
                    relay_port: 2050,
                },
            ],
        }
    }

    #[test]
    fn test_expected_nat_rules_chain_names() {
        let (jump_chains, chains) = expected_nat_rules(&spec()).unwrap();
        assert!(chains.contains_key("prec0a87ac9"));
        assert!(chains.contains_key("pstc0a87ac9"));
        assert_eq!(
            jump_chains[CHAIN_PREROUTING],
            vec![vec!["-j".to_string(), "prec0a87ac9".to_string()]]
        );
        assert_eq!(
            jump_chains[CHAIN_POSTROUTING],
            vec![vec!["-j".to_string(), "pstc0a87ac9".to_string()]]
        );
    }

    #[test]
    fn test_expected_nat_rules_contents() {
        let (_, chains) = expected_nat_rules(&spec()).unwrap();
        assert_eq!(
            chains["prec0a87ac9"][0],
            vec![
                "-m", "tcp", "-p", "tcp", "--dst", "192.168.122.201", "--src",
                "192.168.122.139", "--dport", "80", "-j", "DNAT", "--to-destination",
                "192.168.122.201:2049",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
        assert_eq!(
            chains["pstc0a87ac9"][0],
            vec![
                "-m", "tcp", "-p", "tcp", "--dst", "10.104.205.241", "--dport", "2049",
                "-j", "SNAT", "--to-source", "192.168.122.201",
            ]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
        );
        assert_eq!(chains["prec0a87ac9"].len(), 2);
        assert_eq!(chains["pstc0a87ac9"].len(), 2);
    }

    #[test]
    fn test_expected_nat_rules_empty_spec_still_owns_chains() {
        let empty = GatewaySpec {
            gateway_ip: "192.168.122.201".to_string(),
            egress_rules: vec![],
            ingress_rules: vec![],
        };
        let (_, chains) = expected_nat_rules(&empty).unwrap();
        // Chains are listed even when empty, so replacement flushes stale
        // rules of a gateway whose last ExternalService went away.
        assert!(chains["prec0a87ac9"].is_empty());
        assert!(chains["pstc0a87ac9"].is_empty());
    }

    #[test]
    fn test_expected_nat_rules_rejects_bad_ip() {
        let mut bad = spec();
        bad.gateway_ip = "not-an-ip".to_string();
        assert!(expected_nat_rules(&bad).is_err());
    }

    #[tokio::test]
    async fn test_sync_rule_applies_chains_and_jumps() {
        let backend = Arc::new(crate::nat::mock::MockBackend::default());
        let config = kube::Config::new("http://127.0.0.1:8080".parse().unwrap());
        let client = Client::try_from(config).unwrap();
        let ctx = Context::new(
            client,
            "external-services".to_string(),
            SshCredentials::default(),
            backend.clone(),
        );

        sync_rule(&ctx, &spec()).await.unwrap();

        // SSH server recorded for the gateway IP.
        assert_eq!(ctx.server_ips(), vec!["192.168.122.201".to_string()]);

        // Named chains replaced, jump rules appended without flushing.
        let calls = backend.calls();
        use crate::nat::mock::Call;
        assert!(calls
            .iter()
            .any(|c| *c == Call::Clear(TABLE_NAT.into(), "prec0a87ac9".into())));
        assert!(calls
            .iter()
            .any(|c| *c == Call::Clear(TABLE_NAT.into(), "pstc0a87ac9".into())));
        assert!(!calls
            .iter()
            .any(|c| *c == Call::Clear(TABLE_NAT.into(), CHAIN_PREROUTING.into())));
        assert!(calls.iter().any(|c| matches!(
            c,
            Call::Append(_, chain, rule) if chain == CHAIN_PREROUTING && rule == &vec!["-j".to_string(), "prec0a87ac9".to_string()]
        )));
    }
}
