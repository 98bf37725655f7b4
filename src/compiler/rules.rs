//! Rule compilation: ExternalService → Forwarder / Gateway rule vectors.
//!
//! Pure functions over already-fetched cluster state, so the allocation and
//! projection logic is testable without an API server. The reconciler in
//! [`super`] gathers inputs and writes results back.

use std::collections::{BTreeSet, HashMap};

use crate::crd::{
    ExternalServiceSpec, Forwarder, ForwarderRule, GatewayRule, GatewaySpec, NamespacedRef,
    Source,
};
use crate::error::Error;
use crate::net::gateway_name;
use crate::{Result, CONNECTOR_NAMESPACE, MAX_PORT, MIN_PORT};

/// Allocator of relay ports within `[MIN_PORT, MAX_PORT)`.
///
/// Ports already recorded for a key are reused, so recompiling an unchanged
/// spec reassigns the same relay ports and the data plane stays untouched.
/// New keys get the lowest unused port. Exhaustion is surfaced as the
/// distinguished [`Error::RelayPortExhausted`] and no rule is emitted for
/// that key.
#[derive(Debug, Default)]
pub struct RelayPortPool {
    by_key: HashMap<String, u16>,
    used: BTreeSet<u16>,
}

impl RelayPortPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an existing `key -> port` assignment for reuse.
    pub fn record(&mut self, key: &str, port: u16) {
        self.by_key.insert(key.to_string(), port);
        self.used.insert(port);
    }

    /// Mark a port as taken without binding it to a key.
    pub fn mark_used(&mut self, port: u16) {
        self.used.insert(port);
    }

    /// Return the port recorded for `key`, or the lowest unused port.
    pub fn alloc(&mut self, key: &str) -> Result<u16> {
        if let Some(&port) = self.by_key.get(key) {
            return Ok(port);
        }
        for candidate in u32::from(MIN_PORT)..MAX_PORT {
            let port = candidate as u16;
            if !self.used.contains(&port) {
                self.record(key, port);
                return Ok(port);
            }
        }
        Err(Error::RelayPortExhausted {
            key: key.to_string(),
        })
    }
}

/// Pool key of an egress rule: source endpoint address and target port.
pub fn egress_key(source_ip: &str, target_port: u16) -> String {
    format!("{source_ip}:{target_port}")
}

/// Pool key of an ingress rule: target IP and service port.
pub fn ingress_key(target_ip: &str, service_port: u16) -> String {
    format!("{target_ip}:{service_port}")
}

/// Seed an egress pool from the rules currently in a Forwarder spec.
pub fn seed_egress_pool(rules: &[ForwarderRule]) -> RelayPortPool {
    let mut pool = RelayPortPool::new();
    for rule in rules {
        pool.record(&egress_key(&rule.source_ip, rule.target_port), rule.relay_port);
    }
    pool
}

/// Seed a per-gateway ingress pool from current Forwarder rules and the
/// existing Gateway object.
///
/// The forwarder's own assignments are recorded for reuse; other
/// forwarders' rules on the gateway only mark their ports as taken, so
/// ExternalServices sharing a SourceIP never collide.
pub fn seed_ingress_pool(
    gateway: &NamespacedRef,
    own_rules: &[ForwarderRule],
    gateway_rules: &[GatewayRule],
    own_forwarder: &NamespacedRef,
) -> RelayPortPool {
    let mut pool = RelayPortPool::new();
    for rule in gateway_rules {
        if rule.forwarder == *own_forwarder {
            pool.record(&ingress_key(&rule.source_ip, rule.target_port), rule.relay_port);
        } else {
            pool.mark_used(rule.relay_port);
        }
    }
    for rule in own_rules {
        if rule.gateway == *gateway {
            pool.record(&ingress_key(&rule.source_ip, rule.target_port), rule.relay_port);
        }
    }
    pool
}

/// Resolved cluster state of one ExternalService source.
#[derive(Clone, Debug)]
pub struct ResolvedSource {
    /// The declared source
    pub source: Source,
    /// Endpoint addresses of the source service; empty while unresolved
    pub endpoint_ips: Vec<String>,
    /// Cluster IP of the source service; None while the service is absent
    pub cluster_ip: Option<String>,
    /// Ports of the source service
    pub service_ports: Vec<u16>,
}

/// Build the egress rules of a Forwarder.
///
/// One rule per source endpoint address per declared port. Rules whose
/// inputs are not resolvable yet are skipped; the watches retrigger
/// compilation once they are.
pub fn compile_egress_rules(
    spec: &ExternalServiceSpec,
    sources: &[ResolvedSource],
    pool: &mut RelayPortPool,
) -> Result<Vec<ForwarderRule>> {
    let mut rules = Vec::new();

    for resolved in sources {
        let gateway = NamespacedRef::new(
            CONNECTOR_NAMESPACE,
            gateway_name(&resolved.source.source_ip)?,
        );
        for endpoint_ip in &resolved.endpoint_ips {
            for port in &spec.ports {
                let relay_port = pool.alloc(&egress_key(endpoint_ip, port.target_port))?;
                rules.push(ForwarderRule {
                    protocol: port.protocol,
                    source_ip: endpoint_ip.clone(),
                    target_port: port.target_port,
                    destination_ip: spec.target_ip.clone(),
                    destination_port: port.port,
                    gateway: gateway.clone(),
                    gateway_ip: resolved.source.source_ip.clone(),
                    relay_port,
                });
            }
        }
    }

    Ok(rules)
}

/// Build the ingress rules of a Forwarder.
///
/// One rule per source per port of the source service, relaying the target
/// back to the service's cluster IP. Relay ports come from the per-gateway
/// pool supplied by `pools`.
pub fn compile_ingress_rules(
    spec: &ExternalServiceSpec,
    sources: &[ResolvedSource],
    pools: &mut HashMap<String, RelayPortPool>,
) -> Result<Vec<ForwarderRule>> {
    let mut rules = Vec::new();

    for resolved in sources {
        let Some(cluster_ip) = resolved.cluster_ip.clone() else {
            continue;
        };
        let name = gateway_name(&resolved.source.source_ip)?;
        let gateway = NamespacedRef::new(CONNECTOR_NAMESPACE, name.clone());
        let pool = pools.entry(name).or_default();

        for &service_port in &resolved.service_ports {
            let relay_port = pool.alloc(&ingress_key(&spec.target_ip, service_port))?;
            rules.push(ForwarderRule {
                protocol: Default::default(),
                source_ip: spec.target_ip.clone(),
                target_port: service_port,
                destination_ip: cluster_ip.clone(),
                destination_port: service_port,
                gateway: gateway.clone(),
                gateway_ip: resolved.source.source_ip.clone(),
                relay_port,
            });
        }
    }

    Ok(rules)
}

/// Project every Forwarder rule referencing `gateway` into a Gateway spec.
///
/// The gateway needs the owning Forwarder's reference and pod IP to rewrite
/// packets, so both are carried onto each projected rule. Gateway rule
/// derivation reads Forwarders cluster-wide; the Forwarder side references
/// gateways purely by computed name, which is what keeps the two object
/// families acyclic.
pub fn derive_gateway_spec(
    gateway_ip: &str,
    gateway: &NamespacedRef,
    forwarders: &[Forwarder],
) -> GatewaySpec {
    let mut spec = GatewaySpec {
        gateway_ip: gateway_ip.to_string(),
        egress_rules: Vec::new(),
        ingress_rules: Vec::new(),
    };

    for forwarder in forwarders {
        let forwarder_ref = NamespacedRef::new(
            forwarder
                .metadata
                .namespace
                .as_deref()
                .unwrap_or(CONNECTOR_NAMESPACE),
            forwarder.metadata.name.as_deref().unwrap_or_default(),
        );
        let project = |rule: &ForwarderRule| GatewayRule {
            protocol: rule.protocol,
            source_ip: rule.source_ip.clone(),
            target_port: rule.target_port,
            destination_ip: rule.destination_ip.clone(),
            destination_port: rule.destination_port,
            forwarder: forwarder_ref.clone(),
            forwarder_ip: forwarder.spec.forwarder_ip.clone(),
            relay_port: rule.relay_port,
        };

        for rule in &forwarder.spec.egress_rules {
            if rule.gateway == *gateway {
                spec.egress_rules.push(project(rule));
            }
        }
        for rule in &forwarder.spec.ingress_rules {
            if rule.gateway == *gateway {
                spec.ingress_rules.push(project(rule));
            }
        }
    }

    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Protocol, ServicePortSpec};

    fn es_spec() -> ExternalServiceSpec {
        ExternalServiceSpec {
            target_ip: "192.168.122.139".to_string(),
            sources: vec![Source {
                service: NamespacedRef::new("ns1", "svc1"),
                source_ip: "192.168.122.200".to_string(),
            }],
            ports: vec![ServicePortSpec {
                protocol: Protocol::Tcp,
                port: 80,
                target_port: 8080,
            }],
        }
    }

    fn resolved() -> Vec<ResolvedSource> {
        vec![ResolvedSource {
            source: es_spec().sources[0].clone(),
            endpoint_ips: vec!["10.0.0.4".to_string()],
            cluster_ip: Some("10.20.0.8".to_string()),
            service_ports: vec![8443],
        }]
    }

    #[test]
    fn test_pool_allocates_lowest_unused() {
        let mut pool = RelayPortPool::new();
        assert_eq!(pool.alloc("a").unwrap(), 2049);
        assert_eq!(pool.alloc("b").unwrap(), 2050);
        // Same key reuses its port.
        assert_eq!(pool.alloc("a").unwrap(), 2049);
    }

    #[test]
    fn test_pool_skips_marked_ports() {
        let mut pool = RelayPortPool::new();
        pool.mark_used(2049);
        pool.mark_used(2050);
        assert_eq!(pool.alloc("a").unwrap(), 2051);
    }

    #[test]
    fn test_pool_reuses_recorded_assignment() {
        let mut pool = RelayPortPool::new();
        pool.record("10.0.0.4:8080", 2060);
        assert_eq!(pool.alloc("10.0.0.4:8080").unwrap(), 2060);
        // A fresh key still gets the lowest unused port.
        assert_eq!(pool.alloc("10.0.0.5:8080").unwrap(), 2049);
    }

    #[test]
    fn test_pool_exhaustion_is_surfaced() {
        let mut pool = RelayPortPool::new();
        for port in crate::MIN_PORT..=u16::MAX {
            pool.mark_used(port);
        }
        let err = pool.alloc("10.0.0.4:8080").unwrap_err();
        assert!(matches!(err, Error::RelayPortExhausted { ref key } if key == "10.0.0.4:8080"));
    }

    #[test]
    fn test_compile_egress_rules_full() {
        let mut pool = RelayPortPool::new();
        let rules = compile_egress_rules(&es_spec(), &resolved(), &mut pool).unwrap();

        assert_eq!(
            rules,
            vec![ForwarderRule {
                protocol: Protocol::Tcp,
                source_ip: "10.0.0.4".to_string(),
                target_port: 8080,
                destination_ip: "192.168.122.139".to_string(),
                destination_port: 80,
                gateway: NamespacedRef::new("external-services", "gwrulec0a87ac8"),
                gateway_ip: "192.168.122.200".to_string(),
                relay_port: 2049,
            }]
        );
    }

    #[test]
    fn test_compile_ingress_rules_full() {
        let mut pools = HashMap::new();
        let rules = compile_ingress_rules(&es_spec(), &resolved(), &mut pools).unwrap();

        assert_eq!(
            rules,
            vec![ForwarderRule {
                protocol: Protocol::Tcp,
                source_ip: "192.168.122.139".to_string(),
                target_port: 8443,
                destination_ip: "10.20.0.8".to_string(),
                destination_port: 8443,
                gateway: NamespacedRef::new("external-services", "gwrulec0a87ac8"),
                gateway_ip: "192.168.122.200".to_string(),
                relay_port: 2049,
            }]
        );
    }

    #[test]
    fn test_compile_egress_rules_n_by_m_distinct_ports() {
        let mut spec = es_spec();
        spec.ports.push(ServicePortSpec {
            protocol: Protocol::Tcp,
            port: 443,
            target_port: 8443,
        });
        let mut sources = resolved();
        sources[0].endpoint_ips = vec![
            "10.0.0.4".to_string(),
            "10.0.0.5".to_string(),
            "10.0.0.6".to_string(),
        ];

        let mut pool = RelayPortPool::new();
        let rules = compile_egress_rules(&spec, &sources, &mut pool).unwrap();

        // N endpoints x M ports rules, all relay ports distinct and in range.
        assert_eq!(rules.len(), 6);
        let ports: BTreeSet<u16> = rules.iter().map(|r| r.relay_port).collect();
        assert_eq!(ports.len(), 6);
        assert!(ports.iter().all(|&p| p >= crate::MIN_PORT));
    }

    #[test]
    fn test_compile_egress_rules_skips_unresolved_endpoints() {
        let mut sources = resolved();
        sources[0].endpoint_ips.clear();
        let mut pool = RelayPortPool::new();
        let rules = compile_egress_rules(&es_spec(), &sources, &mut pool).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_compile_ingress_rules_skips_absent_service() {
        let mut sources = resolved();
        sources[0].cluster_ip = None;
        let mut pools = HashMap::new();
        let rules = compile_ingress_rules(&es_spec(), &sources, &mut pools).unwrap();
        assert!(rules.is_empty());
    }

    #[test]
    fn test_compile_egress_reuses_seeded_ports() {
        let mut pool = RelayPortPool::new();
        let first = compile_egress_rules(&es_spec(), &resolved(), &mut pool).unwrap();

        // Recompiling with a pool seeded from the previous spec keeps the
        // same relay port assignments.
        let mut seeded = seed_egress_pool(&first);
        let second = compile_egress_rules(&es_spec(), &resolved(), &mut seeded).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_seed_ingress_pool_respects_other_forwarders() {
        let gateway = NamespacedRef::new("external-services", "gwrulec0a87ac8");
        let own = NamespacedRef::new("external-services", "es1");
        let other_rule = GatewayRule {
            source_ip: "192.168.122.150".to_string(),
            target_port: 80,
            relay_port: 2049,
            forwarder: NamespacedRef::new("external-services", "es2"),
            ..Default::default()
        };

        let mut pool = seed_ingress_pool(&gateway, &[], &[other_rule], &own);
        // 2049 belongs to es2's rule on this gateway; the next allocation
        // must skip it.
        assert_eq!(pool.alloc("192.168.122.139:80").unwrap(), 2050);
    }

    fn forwarder(name: &str, forwarder_ip: &str, spec: &ExternalServiceSpec) -> Forwarder {
        let mut pool = RelayPortPool::new();
        let egress = compile_egress_rules(spec, &resolved(), &mut pool).unwrap();
        let mut pools = HashMap::new();
        let ingress = compile_ingress_rules(spec, &resolved(), &mut pools).unwrap();

        let mut fwd = Forwarder::new(
            name,
            crate::crd::ForwarderSpec {
                forwarder_ip: forwarder_ip.to_string(),
                egress_rules: egress,
                ingress_rules: ingress,
            },
        );
        fwd.metadata.namespace = Some(CONNECTOR_NAMESPACE.to_string());
        fwd
    }

    #[test]
    fn test_derive_gateway_spec() {
        let gateway = NamespacedRef::new("external-services", "gwrulec0a87ac8");
        let fwd = forwarder("es1", "10.0.0.3", &es_spec());

        let spec = derive_gateway_spec("192.168.122.200", &gateway, &[fwd]);

        assert_eq!(spec.gateway_ip, "192.168.122.200");
        assert_eq!(spec.egress_rules.len(), 1);
        assert_eq!(spec.ingress_rules.len(), 1);

        let egress = &spec.egress_rules[0];
        assert_eq!(egress.source_ip, "10.0.0.4");
        assert_eq!(egress.target_port, 8080);
        assert_eq!(egress.destination_ip, "192.168.122.139");
        assert_eq!(egress.destination_port, 80);
        assert_eq!(egress.forwarder, NamespacedRef::new("external-services", "es1"));
        assert_eq!(egress.forwarder_ip, "10.0.0.3");
        assert_eq!(egress.relay_port, 2049);

        let ingress = &spec.ingress_rules[0];
        assert_eq!(ingress.source_ip, "192.168.122.139");
        assert_eq!(ingress.destination_ip, "10.20.0.8");
        assert_eq!(ingress.forwarder_ip, "10.0.0.3");
    }

    #[test]
    fn test_derive_gateway_spec_merges_forwarders_and_filters() {
        let gateway = NamespacedRef::new("external-services", "gwrulec0a87ac8");
        let other_gateway = NamespacedRef::new("external-services", "gwrulec0a87ac9");

        let fwd1 = forwarder("es1", "10.0.0.3", &es_spec());
        let mut fwd2 = forwarder("es2", "10.0.0.9", &es_spec());
        // Point es2's rules at a different gateway; they must be filtered out.
        for rule in fwd2
            .spec
            .egress_rules
            .iter_mut()
            .chain(fwd2.spec.ingress_rules.iter_mut())
        {
            rule.gateway = other_gateway.clone();
        }

        let spec = derive_gateway_spec("192.168.122.200", &gateway, &[fwd1, fwd2]);
        assert_eq!(spec.egress_rules.len(), 1);
        assert_eq!(spec.ingress_rules.len(), 1);
        assert!(spec
            .egress_rules
            .iter()
            .all(|r| r.forwarder.name == "es1"));
    }

    #[test]
    fn test_derive_gateway_spec_excluding_deleted_forwarder() {
        let gateway = NamespacedRef::new("external-services", "gwrulec0a87ac8");
        let fwd1 = forwarder("es1", "10.0.0.3", &es_spec());
        let fwd2 = forwarder("es2", "10.0.0.9", &es_spec());

        let both = derive_gateway_spec("192.168.122.200", &gateway, &[fwd1.clone(), fwd2]);
        assert_eq!(both.egress_rules.len(), 2);

        // Rerunning the derivation without the departed forwarder purges its
        // contributions while the gateway itself survives.
        let remaining = derive_gateway_spec("192.168.122.200", &gateway, &[fwd1]);
        assert_eq!(remaining.egress_rules.len(), 1);
        assert!(remaining
            .egress_rules
            .iter()
            .all(|r| r.forwarder.name == "es1"));
    }
}
