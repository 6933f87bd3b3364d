//! Assembles the endpoint set of a (service, port) authority from the cache,
//! and keeps a per-subscription snapshot channel fresh as the underlying
//! resources change.
//!
//! Snapshots are rebuilt from the cache on every relevant event and published
//! only when they differ from the last published state, so downstream
//! translators see a coalesced, always-consistent view. Within one applied
//! event batch a removal therefore always wins over an addition of the same
//! address: only the final state is published.

use crate::cache::{Filter, ObjectKey};
use crate::destination::target::Target;
use crate::destination::DiscoveryCaches;
use crate::k8s::{self, EndpointSlice, Pod, Service, SERVICE_NAME_LABEL};
use crate::{annotation, ClusterInfo, DEFAULT_ENDPOINT_WEIGHT};
use k8s_openapi::api::discovery::v1::Endpoint;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info_span, Instrument};

/// The state of one authority's endpoint set at some cache revision.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    /// The service does not exist.
    NotFound,

    /// The service exists; the set may be empty.
    Endpoints(BTreeMap<SocketAddr, EndpointMeta>),
}

/// Metadata attached to one endpoint address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointMeta {
    /// Routing weight out of the authority's total of
    /// [`DEFAULT_ENDPOINT_WEIGHT`].
    pub weight: u32,

    /// The mesh identity of the backing workload, when it is meshed and has
    /// not opted out of identity.
    pub identity: Option<String>,

    /// Whether the backing pod carries an injected proxy.
    pub meshed: bool,

    pub zone: Option<String>,
    pub pod: Option<String>,

    /// When set, the endpoint's port is pinned opaque by a `Server` resource
    /// and the proxy should tunnel through this inbound port.
    pub opaque_inbound_port: Option<u16>,
}

/// How a literal IP target resolves against the cache.
pub enum IpResolution {
    /// The IP belongs to a pod; a single static endpoint answers the stream.
    Pod(SocketAddr, EndpointMeta),

    /// The IP is a service's ClusterIP; resolution continues as a service
    /// subscription.
    Service(ObjectKey),

    Unknown,
}

/// Spawns a task that keeps a snapshot channel for `<name>.<namespace>:<port>`
/// fresh. The task exits when the last receiver is dropped.
pub fn watch_endpoints(
    caches: DiscoveryCaches,
    cluster: ClusterInfo,
    namespace: String,
    name: String,
    port: u16,
) -> watch::Receiver<Snapshot> {
    let initial = build_snapshot(&caches, &cluster, &namespace, &name, port);
    let (tx, rx) = watch::channel(initial.clone());

    let span = info_span!("endpoints", ns = %namespace, svc = %name, port);
    tokio::spawn(
        async move {
            let mut services = caches.services.subscribe(Filter::namespace(&namespace));
            let mut slices = caches.endpoint_slices.subscribe(Filter::namespace(&namespace));
            let mut pods = caches.pods.subscribe(Filter::namespace(&namespace));
            let mut splits = caches.traffic_splits.subscribe(Filter::namespace(&namespace));
            let mut servers = caches.servers.subscribe(Filter::namespace(&namespace));
            let mut profiles = caches.profiles.subscribe(Filter::namespace(&namespace));

            let mut last = initial;
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    e = services.recv() => if e.is_none() { return },
                    e = slices.recv() => if e.is_none() { return },
                    e = pods.recv() => if e.is_none() { return },
                    e = splits.recv() => if e.is_none() { return },
                    e = servers.recv() => if e.is_none() { return },
                    e = profiles.recv() => if e.is_none() { return },
                }

                let snapshot = build_snapshot(&caches, &cluster, &namespace, &name, port);
                if snapshot != last {
                    debug!("endpoint set changed");
                    if tx.send(snapshot.clone()).is_err() {
                        return;
                    }
                    last = snapshot;
                }
            }
        }
        .instrument(span),
    );

    rx
}

/// Resolves a literal IP against the pod and ClusterIP indexes.
pub fn resolve_ip(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    ip: IpAddr,
    port: u16,
) -> IpResolution {
    let ip_str = ip.to_string();
    for pod in caches.pods.list(&Filter::all()) {
        if k8s::pod_ip(&pod) == Some(ip) {
            let ns = pod.metadata.namespace.clone().unwrap_or_default();
            let meta = pod_meta(cluster, &ns, &pod, DEFAULT_ENDPOINT_WEIGHT, None, &[]);
            return IpResolution::Pod(SocketAddr::new(ip, port), meta);
        }
    }
    for svc in caches.services.list(&Filter::all()) {
        let cluster_ip = svc.spec.as_ref().and_then(|s| s.cluster_ip.as_deref());
        if cluster_ip == Some(ip_str.as_str()) {
            return IpResolution::Service(ObjectKey::new(
                svc.metadata.namespace.clone().unwrap_or_default(),
                svc.metadata.name.clone().unwrap_or_default(),
            ));
        }
    }
    IpResolution::Unknown
}

/// Builds the current endpoint set of `<name>.<namespace>:<port>` from the
/// cache: the weighted union of the authority's backends, where the backends
/// are the leaves of an active traffic split or destination override, or the
/// service itself.
pub fn build_snapshot(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    namespace: &str,
    name: &str,
    port: u16,
) -> Snapshot {
    if caches
        .services
        .get(&ObjectKey::new(namespace, name))
        .is_none()
    {
        return Snapshot::NotFound;
    }

    let servers = caches.servers.list(&Filter::namespace(namespace));
    let mut endpoints = BTreeMap::new();
    for (backend, port, weight) in backends(caches, cluster, namespace, name, port) {
        collect_backend(
            caches,
            cluster,
            namespace,
            &backend,
            port,
            weight,
            &servers,
            &mut endpoints,
        );
    }
    Snapshot::Endpoints(endpoints)
}

/// The weighted backends of an authority. A `TrafficSplit` whose apex is the
/// service takes precedence; otherwise a profile's `dstOverrides` apply;
/// otherwise the service is its own sole backend at full weight. Splits
/// expand one level only.
fn backends(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    namespace: &str,
    name: &str,
    port: u16,
) -> Vec<(String, u16, u32)> {
    let mut splits = caches.traffic_splits.list(&Filter::namespace(namespace));
    splits.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
    for split in splits {
        let Some(spec) = &split.spec else { continue };
        if spec.service.as_deref() != Some(name) {
            continue;
        }
        let weighted: Vec<(String, u32)> = spec
            .backends
            .iter()
            .flatten()
            .filter_map(|b| Some((b.service.clone()?, b.weight.unwrap_or(0))))
            .collect();
        if weighted.iter().any(|(_, w)| *w > 0) {
            return normalize_weights(weighted)
                .into_iter()
                .map(|(svc, w)| (svc, port, w))
                .collect();
        }
    }

    let fqdn = format!("{}.{}.svc.{}", name, namespace, cluster.cluster_domain);
    if let Some(profile) = caches.profiles.get(&ObjectKey::new(namespace, &fqdn)) {
        let overrides: Vec<(String, u16, u32)> = profile
            .spec
            .as_ref()
            .and_then(|s| s.dst_overrides.as_ref())
            .into_iter()
            .flatten()
            .filter_map(|o| {
                let authority = o.authority.as_deref()?;
                // Overrides are honored within the authority's own namespace;
                // the subscription set that triggers rebuilds is scoped there.
                match Target::parse(authority, &cluster.cluster_domain).ok()? {
                    Target::Service {
                        namespace: ons,
                        name,
                        port,
                    } if ons == namespace => Some((name, port, o.weight.unwrap_or(0))),
                    _ => None,
                }
            })
            .collect();
        if overrides.iter().any(|(_, _, w)| *w > 0) {
            let normalized = normalize_weights(
                overrides.iter().map(|(n, _, w)| (n.clone(), *w)).collect(),
            );
            return normalized
                .into_iter()
                .zip(overrides)
                .map(|((svc, w), (_, port, _))| (svc, port, w))
                .collect();
        }
    }

    vec![(name.to_string(), port, DEFAULT_ENDPOINT_WEIGHT)]
}

/// Scales relative backend weights so they sum to exactly
/// [`DEFAULT_ENDPOINT_WEIGHT`]: each backend gets the floored share and the
/// rounding remainder goes to the highest-weighted backend (ties broken by
/// name order).
pub fn normalize_weights(backends: Vec<(String, u32)>) -> Vec<(String, u32)> {
    let total: u64 = backends.iter().map(|(_, w)| *w as u64).sum();
    if total == 0 {
        return backends;
    }

    let mut scaled: Vec<(String, u32)> = backends
        .iter()
        .map(|(name, w)| {
            let share = (DEFAULT_ENDPOINT_WEIGHT as u64 * *w as u64 / total) as u32;
            (name.clone(), share)
        })
        .collect();

    let remainder = DEFAULT_ENDPOINT_WEIGHT - scaled.iter().map(|(_, w)| *w).sum::<u32>();
    if remainder > 0 {
        let largest = backends
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
            .map(|(i, _)| i);
        if let Some(i) = largest {
            scaled[i].1 += remainder;
        }
    }
    scaled
}

#[allow(clippy::too_many_arguments)]
fn collect_backend(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    namespace: &str,
    name: &str,
    port: u16,
    weight: u32,
    servers: &[Arc<crate::k8s::Server>],
    out: &mut BTreeMap<SocketAddr, EndpointMeta>,
) {
    let Some(svc) = caches.services.get(&ObjectKey::new(namespace, name)) else {
        return;
    };
    let Some(port_name) = service_port_name(&svc, port) else {
        return;
    };

    let slices = caches.endpoint_slices.list(
        &Filter::namespace(namespace).with_label(SERVICE_NAME_LABEL, name),
    );
    for slice in slices {
        let Some(target_port) = slice_target_port(&slice, port_name.as_deref()) else {
            continue;
        };
        for ep in &slice.endpoints {
            if !endpoint_ready(ep) {
                continue;
            }
            let meta = endpoint_meta(caches, cluster, namespace, ep, target_port, weight, servers);
            for addr in &ep.addresses {
                if let Ok(ip) = addr.parse::<IpAddr>() {
                    out.insert(SocketAddr::new(ip, target_port), meta.clone());
                }
            }
        }
    }
}

/// Maps an authority port number to the service's port name, used to select
/// the matching `EndpointSlice` port. `None` when the service does not expose
/// the port.
fn service_port_name(svc: &Service, port: u16) -> Option<Option<String>> {
    svc.spec
        .as_ref()?
        .ports
        .as_ref()?
        .iter()
        .find(|p| p.port == port as i32)
        .map(|p| p.name.clone())
}

fn slice_target_port(slice: &EndpointSlice, port_name: Option<&str>) -> Option<u16> {
    let ports = slice.ports.as_ref()?;
    ports
        .iter()
        .find(|p| p.name.as_deref().filter(|n| !n.is_empty()) == port_name)
        .and_then(|p| p.port)
        .and_then(|p| u16::try_from(p).ok())
}

fn endpoint_ready(ep: &Endpoint) -> bool {
    ep.conditions
        .as_ref()
        .and_then(|c| c.ready)
        .unwrap_or(true)
}

fn endpoint_meta(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    namespace: &str,
    ep: &Endpoint,
    target_port: u16,
    weight: u32,
    servers: &[Arc<crate::k8s::Server>],
) -> EndpointMeta {
    let pod = ep
        .target_ref
        .as_ref()
        .filter(|r| r.kind.as_deref() == Some("Pod"))
        .and_then(|r| r.name.as_deref())
        .and_then(|name| caches.pods.get(&ObjectKey::new(namespace, name)));

    match pod {
        Some(pod) => {
            let mut meta = pod_meta(cluster, namespace, &pod, weight, Some(target_port), servers);
            if meta.zone.is_none() {
                meta.zone = ep.zone.clone();
            }
            meta
        }
        None => EndpointMeta {
            weight,
            identity: None,
            meshed: false,
            zone: ep.zone.clone(),
            pod: ep.target_ref.as_ref().and_then(|r| r.name.clone()),
            opaque_inbound_port: None,
        },
    }
}

/// Derives endpoint metadata from the backing pod: mesh membership from the
/// injector's annotations, the workload identity from the pod's service
/// account, and opaqueness from any `Server` selecting the pod's port.
pub(crate) fn pod_meta(
    cluster: &ClusterInfo,
    namespace: &str,
    pod: &Pod,
    weight: u32,
    target_port: Option<u16>,
    servers: &[Arc<crate::k8s::Server>],
) -> EndpointMeta {
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let meshed = annotations.contains_key(&annotation("proxy-version"));
    let identity_disabled =
        annotations.get(&annotation("disable-identity")).map(String::as_str) == Some("true");

    let identity = if meshed && !identity_disabled {
        Some(cluster.service_account_identity(namespace, k8s::pod_service_account(pod)))
    } else {
        None
    };

    let opaque = meshed
        && target_port
            .map(|p| {
                crate::destination::policy::protocol_for(servers, pod, p)
                    == crate::destination::policy::Protocol::Opaque
            })
            .unwrap_or(false);
    let opaque_inbound_port = if opaque {
        annotations
            .get(&annotation("proxy-inbound-port"))
            .and_then(|p| p.parse().ok())
            .or(Some(crate::inject::config::DEFAULT_INBOUND_PORT))
    } else {
        None
    };

    EndpointMeta {
        weight,
        identity,
        meshed,
        zone: pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get("topology.kubernetes.io/zone").cloned()),
        pod: pod.metadata.name.clone(),
        opaque_inbound_port,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::policy::ServerSpec;
    use k8s_openapi::api::core::v1::{ObjectReference, PodSpec, ServicePort, ServiceSpec};
    use k8s_openapi::api::discovery::v1::{EndpointConditions, EndpointPort};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const NS: &str = "emojivoto";

    fn cluster() -> ClusterInfo {
        ClusterInfo {
            cluster_domain: "cluster.local".to_string(),
            identity_domain: "identity.mesh.cluster.local".to_string(),
            control_plane_ns: "mesh-system".to_string(),
        }
    }

    fn meta(name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(NS.to_string()),
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn service(name: &str, port: i32) -> Service {
        Service {
            metadata: meta(name, &[]),
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn slice(svc: &str, name: &str, addrs: &[(&str, &str, bool)], port: i32) -> EndpointSlice {
        EndpointSlice {
            address_type: "IPv4".to_string(),
            metadata: meta(name, &[(SERVICE_NAME_LABEL, svc)]),
            endpoints: addrs
                .iter()
                .map(|(ip, pod, ready)| Endpoint {
                    addresses: vec![ip.to_string()],
                    conditions: Some(EndpointConditions {
                        ready: Some(*ready),
                        ..Default::default()
                    }),
                    target_ref: Some(ObjectReference {
                        kind: Some("Pod".to_string()),
                        name: Some(pod.to_string()),
                        namespace: Some(NS.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                })
                .collect(),
            ports: Some(vec![EndpointPort {
                port: Some(port),
                ..Default::default()
            }]),
        }
    }

    fn meshed_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                annotations: Some(
                    [(annotation("proxy-version"), "2.0.0".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..meta(name, &[("app", name)])
            },
            spec: Some(PodSpec {
                service_account_name: Some("web-sa".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn endpoints_of(snapshot: Snapshot) -> BTreeMap<SocketAddr, EndpointMeta> {
        match snapshot {
            Snapshot::Endpoints(map) => map,
            Snapshot::NotFound => panic!("expected endpoints, got NotFound"),
        }
    }

    #[test]
    fn unknown_service_is_not_found() {
        let caches = DiscoveryCaches::default();
        assert_eq!(
            build_snapshot(&caches, &cluster(), NS, "nosuch", 80),
            Snapshot::NotFound
        );
    }

    #[test]
    fn plain_service_endpoints_carry_identity_and_full_weight() {
        let caches = DiscoveryCaches::default();
        caches.services.apply(service("web", 8080));
        caches
            .endpoint_slices
            .apply(slice("web", "web-1", &[("10.0.0.1", "web-abc", true)], 8080));
        caches.pods.apply(meshed_pod("web-abc"));

        let eps = endpoints_of(build_snapshot(&caches, &cluster(), NS, "web", 8080));
        let meta = eps.get(&addr("10.0.0.1:8080")).unwrap();
        assert_eq!(meta.weight, DEFAULT_ENDPOINT_WEIGHT);
        assert!(meta.meshed);
        assert_eq!(
            meta.identity.as_deref(),
            Some("web-sa.emojivoto.serviceaccount.identity.mesh.cluster.local")
        );
    }

    #[test]
    fn scale_up_appears_in_the_snapshot() {
        let caches = DiscoveryCaches::default();
        caches.services.apply(service("web", 8080));
        caches
            .endpoint_slices
            .apply(slice("web", "web-1", &[("10.0.0.1", "a", true)], 8080));
        let before = endpoints_of(build_snapshot(&caches, &cluster(), NS, "web", 8080));
        assert_eq!(before.len(), 1);

        caches.endpoint_slices.apply(slice(
            "web",
            "web-1",
            &[("10.0.0.1", "a", true), ("10.0.0.2", "b", true)],
            8080,
        ));
        let after = endpoints_of(build_snapshot(&caches, &cluster(), NS, "web", 8080));
        assert_eq!(after.len(), 2);
        assert_eq!(
            after.get(&addr("10.0.0.2:8080")).unwrap().weight,
            DEFAULT_ENDPOINT_WEIGHT
        );
    }

    #[test]
    fn unready_endpoints_are_filtered() {
        let caches = DiscoveryCaches::default();
        caches.services.apply(service("web", 8080));
        caches.endpoint_slices.apply(slice(
            "web",
            "web-1",
            &[("10.0.0.1", "a", true), ("10.0.0.2", "b", false)],
            8080,
        ));
        let eps = endpoints_of(build_snapshot(&caches, &cluster(), NS, "web", 8080));
        assert_eq!(eps.len(), 1);
        assert!(eps.contains_key(&addr("10.0.0.1:8080")));
    }

    #[test]
    fn traffic_split_distributes_weights() {
        use crate::k8s::traffic_split::{TrafficSplitBackend, TrafficSplitSpec};

        let caches = DiscoveryCaches::default();
        caches.services.apply(service("web", 80));
        caches.services.apply(service("web-v1", 80));
        caches.services.apply(service("web-v2", 80));
        caches
            .endpoint_slices
            .apply(slice("web-v1", "v1-1", &[("10.0.1.1", "v1-a", true)], 80));
        caches
            .endpoint_slices
            .apply(slice("web-v2", "v2-1", &[("10.0.2.1", "v2-a", true)], 80));
        caches.traffic_splits.apply(crate::k8s::TrafficSplit {
            metadata: meta("web-rollout", &[]),
            spec: Some(TrafficSplitSpec {
                service: Some("web".to_string()),
                backends: Some(vec![
                    TrafficSplitBackend {
                        service: Some("web-v1".to_string()),
                        weight: Some(1),
                    },
                    TrafficSplitBackend {
                        service: Some("web-v2".to_string()),
                        weight: Some(3),
                    },
                ]),
            }),
            status: None,
        });

        let eps = endpoints_of(build_snapshot(&caches, &cluster(), NS, "web", 80));
        assert_eq!(eps.get(&addr("10.0.1.1:80")).unwrap().weight, 2_500);
        assert_eq!(eps.get(&addr("10.0.2.1:80")).unwrap().weight, 7_500);
        let total: u32 = eps.values().map(|m| m.weight).sum();
        assert_eq!(total, DEFAULT_ENDPOINT_WEIGHT);
    }

    #[test]
    fn opaque_server_sets_the_tunnel_port() {
        use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
        use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

        let caches = DiscoveryCaches::default();
        caches.services.apply(service("mysql", 3306));
        caches
            .endpoint_slices
            .apply(slice("mysql", "mysql-1", &[("10.0.0.9", "mysql-0", true)], 3306));
        let mut pod = meshed_pod("mysql-0");
        pod.metadata.labels = Some([("app".to_string(), "mysql-0".to_string())].into_iter().collect());
        caches.pods.apply(pod);
        caches.servers.apply(crate::k8s::Server {
            metadata: meta("mysql-opaque", &[]),
            spec: Some(ServerSpec {
                pod_selector: Some(LabelSelector {
                    match_labels: Some(
                        [("app".to_string(), "mysql-0".to_string())].into_iter().collect(),
                    ),
                    ..Default::default()
                }),
                port: Some(IntOrString::Int(3306)),
                proxy_protocol: Some("opaque".to_string()),
            }),
            status: None,
        });

        let eps = endpoints_of(build_snapshot(&caches, &cluster(), NS, "mysql", 3306));
        let meta = eps.get(&addr("10.0.0.9:3306")).unwrap();
        assert_eq!(
            meta.opaque_inbound_port,
            Some(crate::inject::config::DEFAULT_INBOUND_PORT)
        );
    }

    #[test]
    fn normalize_scales_to_total() {
        let scaled = normalize_weights(vec![("v1".to_string(), 1), ("v2".to_string(), 3)]);
        assert_eq!(
            scaled,
            vec![("v1".to_string(), 2_500), ("v2".to_string(), 7_500)]
        );
    }

    #[test]
    fn normalize_assigns_remainder_to_largest() {
        let scaled = normalize_weights(vec![
            ("a".to_string(), 1),
            ("b".to_string(), 1),
            ("c".to_string(), 1),
        ]);
        let total: u32 = scaled.iter().map(|(_, w)| *w).sum();
        assert_eq!(total, DEFAULT_ENDPOINT_WEIGHT);
        // floor(10000/3) = 3333 each; the remainder lands on the first of the
        // equally-weighted backends.
        assert_eq!(
            scaled,
            vec![
                ("a".to_string(), 3_334),
                ("b".to_string(), 3_333),
                ("c".to_string(), 3_333),
            ]
        );
    }

    #[test]
    fn zero_total_is_left_alone() {
        let scaled = normalize_weights(vec![("a".to_string(), 0)]);
        assert_eq!(scaled, vec![("a".to_string(), 0)]);
    }
}
