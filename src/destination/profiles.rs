//! Resolves the routing profile streamed to a proxy for one authority.
//!
//! Lookup is two-level: a `ServiceProfile` named after the authority in the
//! *client's* namespace wins over one in the service's own namespace, which
//! wins over the default empty profile. Any change to either candidate
//! re-evaluates the preference atomically, so the stream always reflects the
//! single winning profile.

use crate::cache::{Filter, ObjectKey};
use crate::destination::DiscoveryCaches;
use crate::k8s::service_profile::{
    RequestMatch, ResponseClass, ResponseMatch, RouteSpec, ServiceProfileSpec,
};
use crate::proxy_api::destination as proto;
use crate::ClusterInfo;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info_span, Instrument};

/// The retry budget delivered when a profile does not set one.
const DEFAULT_RETRY_RATIO: f32 = 0.2;
const DEFAULT_MIN_RETRIES_PER_SECOND: u32 = 10;
const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(10);

/// Spawns a task that keeps a profile channel for the authority fresh. The
/// task exits when the last receiver is dropped.
pub fn watch_profile(
    caches: DiscoveryCaches,
    cluster: ClusterInfo,
    namespace: String,
    name: String,
    port: u16,
    client_ns: Option<String>,
) -> watch::Receiver<proto::DestinationProfile> {
    let fqdn = format!("{}.{}.svc.{}", name, namespace, cluster.cluster_domain);
    let initial = resolve(&caches, &fqdn, client_ns.as_deref(), &namespace, port);
    let (tx, rx) = watch::channel(initial.clone());

    let span = info_span!("profile", authority = %fqdn, client_ns = ?client_ns);
    tokio::spawn(
        async move {
            let server_key = ObjectKey::new(&namespace, &fqdn);
            let mut server_sub = caches.profiles.subscribe(Filter::key(&server_key));
            let mut client_sub = client_ns.as_deref().map(|ns| {
                caches
                    .profiles
                    .subscribe(Filter::key(&ObjectKey::new(ns, &fqdn)))
            });

            let mut last = initial;
            loop {
                tokio::select! {
                    _ = tx.closed() => return,
                    e = server_sub.recv() => if e.is_none() { return },
                    e = recv_opt(&mut client_sub) => if e.is_none() { return },
                }

                let profile = resolve(&caches, &fqdn, client_ns.as_deref(), &namespace, port);
                if profile != last {
                    if tx.send(profile.clone()).is_err() {
                        return;
                    }
                    last = profile;
                }
            }
        }
        .instrument(span),
    );

    rx
}

/// Awaits the optional client-namespace subscription; pends forever when the
/// request carried no client context.
async fn recv_opt(
    sub: &mut Option<crate::cache::Subscription<crate::k8s::ServiceProfile>>,
) -> Option<crate::cache::Event<crate::k8s::ServiceProfile>> {
    match sub {
        Some(sub) => sub.recv().await,
        None => std::future::pending().await,
    }
}

/// One atomic evaluation of the profile preference.
fn resolve(
    caches: &DiscoveryCaches,
    fqdn: &str,
    client_ns: Option<&str>,
    server_ns: &str,
    port: u16,
) -> proto::DestinationProfile {
    let winner = client_ns
        .and_then(|ns| caches.profiles.get(&ObjectKey::new(ns, fqdn)))
        .or_else(|| caches.profiles.get(&ObjectKey::new(server_ns, fqdn)));
    to_proto(fqdn, port, winner.as_ref().and_then(|p| p.spec.as_ref()))
}

/// The default empty profile, streamed when no `ServiceProfile` names the
/// authority (or the authority is a literal address).
pub fn default_profile(fqdn: &str) -> proto::DestinationProfile {
    to_proto(fqdn, 0, None)
}

fn to_proto(fqdn: &str, port: u16, spec: Option<&ServiceProfileSpec>) -> proto::DestinationProfile {
    let routes = spec
        .and_then(|s| s.routes.as_ref())
        .into_iter()
        .flatten()
        .filter_map(route_to_proto)
        .collect();

    let retry_budget = spec
        .and_then(|s| s.retry_budget.as_ref())
        .map(|b| proto::RetryBudget {
            retry_ratio: b.retry_ratio.unwrap_or(DEFAULT_RETRY_RATIO),
            min_retries_per_second: b
                .min_retries_per_second
                .unwrap_or(DEFAULT_MIN_RETRIES_PER_SECOND),
            ttl: Some(
                duration_to_proto(
                    b.ttl
                        .as_deref()
                        .and_then(parse_duration)
                        .unwrap_or(DEFAULT_RETRY_TTL),
                ),
            ),
        })
        .or_else(|| {
            Some(proto::RetryBudget {
                retry_ratio: DEFAULT_RETRY_RATIO,
                min_retries_per_second: DEFAULT_MIN_RETRIES_PER_SECOND,
                ttl: Some(duration_to_proto(DEFAULT_RETRY_TTL)),
            })
        });

    let dst_overrides = spec
        .and_then(|s| s.dst_overrides.as_ref())
        .into_iter()
        .flatten()
        .filter_map(|o| {
            Some(proto::WeightedDst {
                authority: o.authority.clone()?,
                weight: o.weight.unwrap_or(0),
            })
        })
        .collect();

    let opaque_protocol = port != 0
        && spec
            .and_then(|s| s.opaque_ports.as_ref())
            .map(|ports| ports.contains(&port))
            .unwrap_or(false);

    proto::DestinationProfile {
        routes,
        retry_budget,
        dst_overrides,
        fully_qualified_name: fqdn.to_string(),
        opaque_protocol,
    }
}

fn route_to_proto(route: &RouteSpec) -> Option<proto::Route> {
    let condition = request_match_to_proto(route.condition.as_ref()?);

    let mut metrics_labels = std::collections::HashMap::new();
    if let Some(name) = &route.name {
        metrics_labels.insert("route".to_string(), name.clone());
    }

    Some(proto::Route {
        condition: Some(condition),
        response_classes: route
            .response_classes
            .iter()
            .flatten()
            .filter_map(response_class_to_proto)
            .collect(),
        metrics_labels,
        is_retryable: route.is_retryable.unwrap_or(false),
        timeout: route
            .timeout
            .as_deref()
            .and_then(parse_duration)
            .map(duration_to_proto),
    })
}

fn request_match_to_proto(m: &RequestMatch) -> proto::RequestMatch {
    use proto::request_match::Match;

    // A condition with several fields set means all of them; fold the set
    // fields into an `all` sequence and collapse the trivial case.
    let mut matches = Vec::new();
    if let Some(path) = &m.path_regex {
        matches.push(proto::RequestMatch {
            r#match: Some(Match::PathRegex(path.clone())),
        });
    }
    if let Some(method) = &m.method {
        matches.push(proto::RequestMatch {
            r#match: Some(Match::Method(method.to_uppercase())),
        });
    }
    if let Some(all) = &m.all {
        matches.extend(all.iter().map(request_match_to_proto));
    }
    if let Some(any) = &m.any {
        matches.push(proto::RequestMatch {
            r#match: Some(Match::Any(proto::request_match::Seq {
                matches: any.iter().map(request_match_to_proto).collect(),
            })),
        });
    }
    if let Some(not) = &m.not {
        matches.push(proto::RequestMatch {
            r#match: Some(Match::Not(Box::new(request_match_to_proto(not)))),
        });
    }

    match matches.len() {
        1 => matches.remove(0),
        _ => proto::RequestMatch {
            r#match: Some(Match::All(proto::request_match::Seq { matches })),
        },
    }
}

fn response_class_to_proto(class: &ResponseClass) -> Option<proto::ResponseClass> {
    Some(proto::ResponseClass {
        condition: Some(response_match_to_proto(class.condition.as_ref()?)),
        is_failure: class.is_failure.unwrap_or(false),
    })
}

fn response_match_to_proto(m: &ResponseMatch) -> proto::ResponseMatch {
    use proto::response_match::Match;

    let mut matches = Vec::new();
    if let Some(status) = &m.status {
        matches.push(proto::ResponseMatch {
            r#match: Some(Match::Status(proto::response_match::HttpStatusRange {
                min: status.min.unwrap_or(100),
                max: status.max.unwrap_or(599),
            })),
        });
    }
    if let Some(all) = &m.all {
        matches.extend(all.iter().map(response_match_to_proto));
    }
    if let Some(any) = &m.any {
        matches.push(proto::ResponseMatch {
            r#match: Some(Match::Any(proto::response_match::Seq {
                matches: any.iter().map(response_match_to_proto).collect(),
            })),
        });
    }
    if let Some(not) = &m.not {
        matches.push(proto::ResponseMatch {
            r#match: Some(Match::Not(Box::new(response_match_to_proto(not)))),
        });
    }

    match matches.len() {
        1 => matches.remove(0),
        _ => proto::ResponseMatch {
            r#match: Some(Match::All(proto::response_match::Seq { matches })),
        },
    }
}

/// Parses the duration literals profiles use: an integer with an `ms`, `s`,
/// `m` or `h` suffix.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

fn duration_to_proto(d: Duration) -> prost_types::Duration {
    prost_types::Duration {
        seconds: d.as_secs() as i64,
        nanos: d.subsec_nanos() as i32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::service_profile::{ServiceProfile, WeightedDst};
    use crate::k8s::ObjectMeta;

    fn profile(ns: &str, fqdn: &str, route_name: &str) -> ServiceProfile {
        ServiceProfile {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(fqdn.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceProfileSpec {
                routes: Some(vec![RouteSpec {
                    name: Some(route_name.to_string()),
                    condition: Some(RequestMatch {
                        path_regex: Some("/api/.*".to_string()),
                        method: Some("get".to_string()),
                        ..Default::default()
                    }),
                    timeout: Some("300ms".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn caches_with(profiles: Vec<ServiceProfile>) -> DiscoveryCaches {
        let caches = DiscoveryCaches::default();
        for p in profiles {
            caches.profiles.apply(p);
        }
        caches
    }

    const FQDN: &str = "web.emojivoto.svc.cluster.local";

    #[test]
    fn client_namespace_profile_wins() {
        let caches = caches_with(vec![
            profile("emojivoto", FQDN, "server-route"),
            profile("client-ns", FQDN, "client-route"),
        ]);
        let resolved = resolve(&caches, FQDN, Some("client-ns"), "emojivoto", 80);
        assert_eq!(
            resolved.routes[0].metrics_labels.get("route").unwrap(),
            "client-route"
        );
    }

    #[test]
    fn server_namespace_profile_is_the_fallback() {
        let caches = caches_with(vec![profile("emojivoto", FQDN, "server-route")]);
        let resolved = resolve(&caches, FQDN, Some("client-ns"), "emojivoto", 80);
        assert_eq!(
            resolved.routes[0].metrics_labels.get("route").unwrap(),
            "server-route"
        );
    }

    #[test]
    fn default_profile_when_nothing_matches() {
        let caches = caches_with(vec![]);
        let resolved = resolve(&caches, FQDN, Some("client-ns"), "emojivoto", 80);
        assert!(resolved.routes.is_empty());
        assert!(resolved.dst_overrides.is_empty());
        assert_eq!(resolved.fully_qualified_name, FQDN);
        assert!(resolved.retry_budget.is_some());
    }

    #[test]
    fn routes_convert_with_conditions_and_timeouts() {
        let caches = caches_with(vec![profile("emojivoto", FQDN, "r")]);
        let resolved = resolve(&caches, FQDN, None, "emojivoto", 80);
        let route = &resolved.routes[0];
        assert_eq!(
            route.timeout,
            Some(prost_types::Duration {
                seconds: 0,
                nanos: 300_000_000
            })
        );
        match route.condition.as_ref().unwrap().r#match.as_ref().unwrap() {
            proto::request_match::Match::All(seq) => {
                assert_eq!(seq.matches.len(), 2);
                assert_eq!(
                    seq.matches[1].r#match,
                    Some(proto::request_match::Match::Method("GET".to_string()))
                );
            }
            other => panic!("expected all-sequence, got {:?}", other),
        }
    }

    #[test]
    fn opaque_ports_flag_the_profile() {
        let mut p = profile("emojivoto", FQDN, "r");
        p.spec.as_mut().unwrap().opaque_ports = Some(vec![3306]);
        let caches = caches_with(vec![p]);
        assert!(resolve(&caches, FQDN, None, "emojivoto", 3306).opaque_protocol);
        assert!(!resolve(&caches, FQDN, None, "emojivoto", 80).opaque_protocol);
    }

    #[test]
    fn dst_overrides_pass_through() {
        let mut p = profile("emojivoto", FQDN, "r");
        p.spec.as_mut().unwrap().dst_overrides = Some(vec![WeightedDst {
            authority: Some("web-v2.emojivoto.svc.cluster.local:80".to_string()),
            weight: Some(100),
        }]);
        let caches = caches_with(vec![p]);
        let resolved = resolve(&caches, FQDN, None, "emojivoto", 80);
        assert_eq!(resolved.dst_overrides.len(), 1);
        assert_eq!(resolved.dst_overrides[0].weight, 100);
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("300ms"), Some(Duration::from_millis(300)));
        assert_eq!(parse_duration("10s"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("oops"), None);
        assert_eq!(parse_duration("10"), None);
    }
}
