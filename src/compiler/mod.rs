//! ExternalService compiler / orchestrator
//!
//! Watches ExternalService objects and decomposes each into a Forwarder and
//! the Gateways its source IPs map to, allocating relay ports along the way.
//! All spec writes happen under the two-phase status protocol so downstream
//! reconcilers never observe a half-written spec.
//!
//! Pod and Service events in the connector namespace map back to the owning
//! ExternalService through labels; Endpoints events map through an index of
//! source-service references maintained during reconciliation.

pub mod resource;
pub mod rules;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Client, Resource, ResourceExt};
use tracing::{error, info, warn};

use crate::crd::{
    ExternalService, Forwarder, ForwarderSpec, ForwarderStatus, Gateway, GatewaySpec,
    GatewayStatus, NamespacedRef,
};
use crate::error::Error;
use crate::net::gateway_name;
use crate::status::{begin_update, finish_update};
use crate::{Result, CONNECTOR_NAMESPACE};

use resource::{EXTERNAL_SERVICE_NAMESPACE_LABEL, EXTERNAL_SERVICE_NAME_LABEL};
use rules::{
    compile_egress_rules, compile_ingress_rules, derive_gateway_spec, seed_egress_pool,
    seed_ingress_pool, ResolvedSource,
};

/// Finalizer guarding teardown of compiled resources.
pub const EXTERNAL_SERVICE_FINALIZER: &str = "externalservice.relaygate.dev/finalizer";

/// Field manager used for compiler writes.
const FIELD_MANAGER: &str = "relaygate-operator";

/// Shared context of the compiler.
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// source service "ns/name" -> ExternalServices referencing it
    source_index: Mutex<HashMap<String, BTreeSet<(String, String)>>>,
}

impl Context {
    /// Create a compiler context.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            source_index: Mutex::new(HashMap::new()),
        }
    }

    /// Record which source services an ExternalService references.
    fn index_sources(&self, es: &ExternalService) {
        let es_key = (
            es.namespace().unwrap_or_default(),
            es.name_any(),
        );
        let mut index = self.source_index.lock().unwrap();
        for set in index.values_mut() {
            set.remove(&es_key);
        }
        for source in &es.spec.sources {
            index
                .entry(format!(
                    "{}/{}",
                    source.service.namespace, source.service.name
                ))
                .or_default()
                .insert(es_key.clone());
        }
    }

    /// Drop an ExternalService from the source index.
    fn unindex(&self, namespace: &str, name: &str) {
        let es_key = (namespace.to_string(), name.to_string());
        let mut index = self.source_index.lock().unwrap();
        for set in index.values_mut() {
            set.remove(&es_key);
        }
    }

    /// ExternalServices referencing a source service.
    fn external_services_for(&self, service_key: &str) -> Vec<(String, String)> {
        self.source_index
            .lock()
            .unwrap()
            .get(service_key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Map a labeled pod/service in the connector namespace back to its
/// ExternalService.
pub(crate) fn map_owner_labels(meta: &ObjectMeta) -> Option<ObjectRef<ExternalService>> {
    if meta.namespace.as_deref() != Some(CONNECTOR_NAMESPACE) {
        return None;
    }
    let labels = meta.labels.as_ref()?;
    let namespace = labels.get(EXTERNAL_SERVICE_NAMESPACE_LABEL)?;
    let name = labels.get(EXTERNAL_SERVICE_NAME_LABEL)?;
    Some(ObjectRef::new(name).within(namespace))
}

/// Reconcile one ExternalService.
pub async fn reconcile(es: Arc<ExternalService>, ctx: Arc<Context>) -> Result<Action> {
    let name = es.name_any();
    let namespace = es
        .namespace()
        .ok_or_else(|| Error::validation("external service has no namespace"))?;

    info!(namespace = %namespace, name = %name, "reconciling external service");

    if es.meta().deletion_timestamp.is_some() {
        teardown(&ctx, &es).await?;
        clear_finalizer(&ctx, &es).await?;
        ctx.unindex(&namespace, &name);
        return Ok(Action::await_change());
    }

    ensure_finalizer(&ctx, &es).await?;
    es.spec.validate()?;
    ctx.index_sources(&es);

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    let pod = match pods.get_opt(&name).await? {
        Some(pod) => pod,
        None => {
            info!(pod = %name, "creating forwarder pod");
            pods.create(&PostParams::default(), &resource::forwarder_pod(&es))
                .await?
        }
    };

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    if services.get_opt(&name).await?.is_none() {
        info!(service = %name, "creating forwarder service");
        services
            .create(&PostParams::default(), &resource::forwarder_service(&es))
            .await?;
    }

    // The rules embed the pod address; without it nothing can be compiled
    // and the generation must not advance.
    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.clone())
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| Error::precondition("forwarder pod has no IP address assigned"))?;

    let sources = resolve_sources(&ctx, &es).await?;

    let forwarders: Api<Forwarder> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    let gateways: Api<Gateway> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    let current = forwarders.get_opt(&name).await?;

    let forwarder_ref = NamespacedRef::new(CONNECTOR_NAMESPACE, &name);
    let current_spec = current.as_ref().map(|f| f.spec.clone()).unwrap_or_default();

    // Relay port pools: egress is scoped to this forwarder, ingress to each
    // gateway. Both are seeded from what is already allocated so recompiling
    // is stable and ports never collide across ExternalServices.
    let mut egress_pool = seed_egress_pool(&current_spec.egress_rules);
    let mut ingress_pools = HashMap::new();
    for source_ip in es.spec.source_ips() {
        let gw_name = gateway_name(source_ip)?;
        let gateway_ref = NamespacedRef::new(CONNECTOR_NAMESPACE, &gw_name);
        let gateway_rules = gateways
            .get_opt(&gw_name)
            .await?
            .map(|gw| gw.spec.ingress_rules)
            .unwrap_or_default();
        ingress_pools.insert(
            gw_name,
            seed_ingress_pool(
                &gateway_ref,
                &current_spec.ingress_rules,
                &gateway_rules,
                &forwarder_ref,
            ),
        );
    }

    let new_spec = ForwarderSpec {
        forwarder_ip: pod_ip,
        egress_rules: compile_egress_rules(&es.spec, &sources, &mut egress_pool)?,
        ingress_rules: compile_ingress_rules(&es.spec, &sources, &mut ingress_pools)?,
    };
    write_forwarder(&forwarders, &name, current, new_spec).await?;

    // Every gateway referenced by a source IP is re-derived from the full
    // set of forwarders, so rules contributed by other ExternalServices
    // sharing the gateway survive.
    let all_forwarders = forwarders.list(&ListParams::default()).await?.items;
    for source_ip in es.spec.source_ips() {
        let gw_name = gateway_name(source_ip)?;
        let gateway_ref = NamespacedRef::new(CONNECTOR_NAMESPACE, &gw_name);
        let spec = derive_gateway_spec(source_ip, &gateway_ref, &all_forwarders);
        let existing = gateways.get_opt(&gw_name).await?;
        write_gateway(&gateways, &gw_name, existing, spec).await?;
    }

    Ok(Action::await_change())
}

/// Error policy for ExternalService reconciliation.
pub fn error_policy(es: Arc<ExternalService>, err: &Error, _ctx: Arc<Context>) -> Action {
    match err {
        Error::RelayPortExhausted { .. } => {
            // Not retried blindly; nothing changes until rules go away.
            error!(
                external_service = %es.name_any(),
                error = %err,
                "relay port exhaustion, manual intervention required"
            );
            Action::requeue(Duration::from_secs(300))
        }
        _ => {
            warn!(
                external_service = %es.name_any(),
                error = %err,
                "external service reconciliation failed"
            );
            Action::requeue(Duration::from_secs(5))
        }
    }
}

/// Resolve the cluster state behind each declared source.
///
/// Absent services or endpoints resolve to empty state rather than errors;
/// the corresponding rules are simply not emitted, and the service and
/// endpoints watches retrigger compilation once the objects appear.
async fn resolve_sources(ctx: &Context, es: &ExternalService) -> Result<Vec<ResolvedSource>> {
    let mut resolved = Vec::new();

    for source in &es.spec.sources {
        let services: Api<Service> =
            Api::namespaced(ctx.client.clone(), &source.service.namespace);
        let endpoints: Api<Endpoints> =
            Api::namespaced(ctx.client.clone(), &source.service.namespace);

        let service = services.get_opt(&source.service.name).await?;
        let (cluster_ip, service_ports) = match &service {
            Some(service) => {
                let spec = service.spec.clone().unwrap_or_default();
                let cluster_ip = spec
                    .cluster_ip
                    .filter(|ip| !ip.is_empty() && ip != "None");
                let ports = spec
                    .ports
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|p| u16::try_from(p.port).ok())
                    .collect();
                (cluster_ip, ports)
            }
            None => (None, Vec::new()),
        };

        let endpoint_ips = endpoints
            .get_opt(&source.service.name)
            .await?
            .and_then(|ep| ep.subsets)
            .unwrap_or_default()
            .into_iter()
            .flat_map(|subset| subset.addresses.unwrap_or_default())
            .map(|address| address.ip)
            .collect();

        resolved.push(ResolvedSource {
            source: source.clone(),
            endpoint_ips,
            cluster_ip,
            service_ports,
        });
    }

    Ok(resolved)
}

/// Write a Forwarder spec under the two-phase protocol.
///
/// No-op when the spec is unchanged, so reconciles triggered by our own
/// writes settle instead of bumping generations forever.
async fn write_forwarder(
    api: &Api<Forwarder>,
    name: &str,
    current: Option<Forwarder>,
    spec: ForwarderSpec,
) -> Result<()> {
    match current {
        Some(existing) if existing.spec == spec => Ok(()),
        Some(existing) => {
            let mut status = existing.status.clone().unwrap_or_default();
            if begin_update(&mut status) {
                patch_forwarder_status(api, name, &status).await?;
            }
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "spec": spec })),
            )
            .await?;
            finish_update(&mut status);
            patch_forwarder_status(api, name, &status).await?;
            info!(forwarder = %name, generation = status.rule_generation, "forwarder rules written");
            Ok(())
        }
        None => {
            let forwarder = Forwarder::new(name, spec);
            api.create(&PostParams::default(), &forwarder).await?;
            let mut status = ForwarderStatus::default();
            begin_update(&mut status);
            finish_update(&mut status);
            patch_forwarder_status(api, name, &status).await?;
            info!(forwarder = %name, "forwarder created");
            Ok(())
        }
    }
}

async fn patch_forwarder_status(
    api: &Api<Forwarder>,
    name: &str,
    status: &ForwarderStatus,
) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Write a Gateway spec under the two-phase protocol.
async fn write_gateway(
    api: &Api<Gateway>,
    name: &str,
    current: Option<Gateway>,
    spec: GatewaySpec,
) -> Result<()> {
    match current {
        Some(existing) if existing.spec == spec => Ok(()),
        Some(existing) => {
            let mut status = existing.status.clone().unwrap_or_default();
            if begin_update(&mut status) {
                patch_gateway_status(api, name, &status).await?;
            }
            api.patch(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&serde_json::json!({ "spec": spec })),
            )
            .await?;
            finish_update(&mut status);
            patch_gateway_status(api, name, &status).await?;
            info!(gateway = %name, generation = status.rule_generation, "gateway rules written");
            Ok(())
        }
        None => {
            let gateway = Gateway::new(name, spec);
            api.create(&PostParams::default(), &gateway).await?;
            let mut status = GatewayStatus::default();
            begin_update(&mut status);
            finish_update(&mut status);
            patch_gateway_status(api, name, &status).await?;
            info!(gateway = %name, "gateway created");
            Ok(())
        }
    }
}

async fn patch_gateway_status(
    api: &Api<Gateway>,
    name: &str,
    status: &GatewayStatus,
) -> Result<()> {
    api.patch_status(
        name,
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Tear down everything compiled for a deleted ExternalService.
///
/// Pod, service, and Forwarder go first; gateways are only rewritten after
/// the Forwarder is verifiably gone, otherwise its rules would be derived
/// right back in. The stale-cache error requeues the work item.
async fn teardown(ctx: &Context, es: &ExternalService) -> Result<()> {
    let name = es.name_any();

    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    if pods.get_opt(&name).await?.is_some() {
        info!(pod = %name, "deleting forwarder pod");
        let _ = pods.delete(&name, &DeleteParams::default()).await;
    }

    let services: Api<Service> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    if services.get_opt(&name).await?.is_some() {
        info!(service = %name, "deleting forwarder service");
        let _ = services.delete(&name, &DeleteParams::default()).await;
    }

    let forwarders: Api<Forwarder> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    if forwarders.get_opt(&name).await?.is_some() {
        info!(forwarder = %name, "deleting forwarder");
        let _ = forwarders.delete(&name, &DeleteParams::default()).await;
    }
    if forwarders.get_opt(&name).await?.is_some() {
        return Err(Error::precondition(format!(
            "deleted forwarder {name} still exists in cache"
        )));
    }

    let remaining = forwarders.list(&ListParams::default()).await?.items;
    let gateways: Api<Gateway> = Api::namespaced(ctx.client.clone(), CONNECTOR_NAMESPACE);
    for gateway in gateways.list(&ListParams::default()).await?.items {
        let gw_name = gateway.name_any();
        let gateway_ref = NamespacedRef::new(CONNECTOR_NAMESPACE, &gw_name);
        let spec = derive_gateway_spec(&gateway.spec.gateway_ip, &gateway_ref, &remaining);
        write_gateway(&gateways, &gw_name, Some(gateway), spec).await?;
    }

    Ok(())
}

async fn ensure_finalizer(ctx: &Context, es: &ExternalService) -> Result<()> {
    if es
        .finalizers()
        .iter()
        .any(|f| f == EXTERNAL_SERVICE_FINALIZER)
    {
        return Ok(());
    }

    info!(external_service = %es.name_any(), "adding finalizer");
    let mut finalizers = es.finalizers().to_vec();
    finalizers.push(EXTERNAL_SERVICE_FINALIZER.to_string());

    let api: Api<ExternalService> =
        Api::namespaced(ctx.client.clone(), &es.namespace().unwrap_or_default());
    api.patch(
        &es.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

async fn clear_finalizer(ctx: &Context, es: &ExternalService) -> Result<()> {
    let finalizers: Vec<String> = es
        .finalizers()
        .iter()
        .filter(|f| *f != EXTERNAL_SERVICE_FINALIZER)
        .cloned()
        .collect();

    let api: Api<ExternalService> =
        Api::namespaced(ctx.client.clone(), &es.namespace().unwrap_or_default());
    api.patch(
        &es.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&serde_json::json!({ "metadata": { "finalizers": finalizers } })),
    )
    .await?;
    Ok(())
}

/// Run the compiler controller until shutdown.
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let client = ctx.client.clone();
    let external_services: Api<ExternalService> = Api::all(client.clone());
    let pods: Api<Pod> = Api::namespaced(client.clone(), CONNECTOR_NAMESPACE);
    let services: Api<Service> = Api::namespaced(client.clone(), CONNECTOR_NAMESPACE);
    let endpoints: Api<Endpoints> = Api::all(client);

    info!("starting external service compiler");

    let endpoints_ctx = ctx.clone();
    Controller::new(external_services, WatcherConfig::default())
        .watches(pods, WatcherConfig::default(), |pod: Pod| {
            map_owner_labels(&pod.metadata)
        })
        .watches(services, WatcherConfig::default(), |service: Service| {
            map_owner_labels(&service.metadata)
        })
        .watches(
            endpoints,
            WatcherConfig::default(),
            move |ep: Endpoints| {
                let key = format!(
                    "{}/{}",
                    ep.metadata.namespace.as_deref().unwrap_or_default(),
                    ep.metadata.name.as_deref().unwrap_or_default()
                );
                endpoints_ctx
                    .external_services_for(&key)
                    .into_iter()
                    .map(|(namespace, name)| ObjectRef::new(&name).within(&namespace))
            },
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(_) => {}
                Err(e) => warn!(error = %e, "compiler reconciliation error"),
            }
        })
        .await;

    Ok(())
}
