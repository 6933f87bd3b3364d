//! Translates endpoint-set snapshots into the add/remove update stream one
//! proxy subscription observes.
//!
//! The translator owns the last state it put on the wire and emits minimal
//! diffs against it, so a cache re-list that reproduces the same endpoint set
//! is invisible to the client, and per-endpoint lifecycles stay monotone: an
//! address is never removed before the client saw it added.

use crate::destination::endpoints::{EndpointMeta, Snapshot};
use crate::proxy_api::destination as proto;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};

/// Where in its lifecycle a subscription's translator is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Nothing has been sent yet.
    Initial,

    /// The initial snapshot went out.
    Primed,

    /// Diffs are flowing.
    Streaming,
}

pub struct Translator {
    /// The authority this stream resolves, used for the concrete-service
    /// metric label on delivered sets.
    authority: String,

    state: State,
    last: BTreeMap<SocketAddr, EndpointMeta>,

    /// The `exists` flag of the last `NoEndpoints` put on the wire, used to
    /// suppress repeats.
    no_endpoints_sent: Option<bool>,
}

impl Translator {
    pub fn new(authority: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            state: State::Initial,
            last: BTreeMap::new(),
            no_endpoints_sent: None,
        }
    }

    /// Folds the next snapshot into the stream, returning the updates to put
    /// on the wire. Removals are emitted before additions; both may be empty
    /// when the snapshot coalesced to no visible change.
    pub fn advance(&mut self, snapshot: &Snapshot) -> Vec<proto::Update> {
        let mut updates = Vec::new();

        let endpoints = match snapshot {
            Snapshot::NotFound => {
                self.last.clear();
                self.push_no_endpoints(&mut updates, false);
                self.state = advance_state(self.state);
                return updates;
            }
            Snapshot::Endpoints(endpoints) => endpoints,
        };

        if endpoints.is_empty() {
            self.last.clear();
            self.push_no_endpoints(&mut updates, true);
            self.state = advance_state(self.state);
            return updates;
        }

        let removed: Vec<SocketAddr> = self
            .last
            .keys()
            .filter(|addr| !endpoints.contains_key(addr))
            .copied()
            .collect();
        let added: Vec<(SocketAddr, EndpointMeta)> = endpoints
            .iter()
            .filter(|(addr, meta)| self.last.get(addr) != Some(meta))
            .map(|(addr, meta)| (*addr, meta.clone()))
            .collect();

        if !removed.is_empty() {
            updates.push(proto::Update {
                update: Some(proto::update::Update::Remove(proto::AddrSet {
                    addrs: removed.iter().map(|a| tcp_address(*a)).collect(),
                })),
            });
        }
        if !added.is_empty() {
            updates.push(proto::Update {
                update: Some(proto::update::Update::Add(proto::WeightedAddrSet {
                    addrs: added
                        .iter()
                        .map(|(addr, meta)| weighted_addr(*addr, meta))
                        .collect(),
                    metric_labels: set_labels(&self.authority),
                })),
            });
        }

        self.last = endpoints.clone();
        self.no_endpoints_sent = None;
        self.state = advance_state(self.state);
        updates
    }

    fn push_no_endpoints(&mut self, updates: &mut Vec<proto::Update>, exists: bool) {
        if self.no_endpoints_sent != Some(exists) {
            updates.push(no_endpoints(exists));
            self.no_endpoints_sent = Some(exists);
        }
    }
}

fn advance_state(state: State) -> State {
    match state {
        State::Initial => State::Primed,
        State::Primed | State::Streaming => State::Streaming,
    }
}

pub fn no_endpoints(exists: bool) -> proto::Update {
    proto::Update {
        update: Some(proto::update::Update::NoEndpoints(proto::NoEndpoints {
            exists,
        })),
    }
}

/// A single-address add, used when a literal pod IP resolves statically.
pub fn single_addr(addr: SocketAddr, meta: &EndpointMeta, authority: &str) -> proto::Update {
    proto::Update {
        update: Some(proto::update::Update::Add(proto::WeightedAddrSet {
            addrs: vec![weighted_addr(addr, meta)],
            metric_labels: set_labels(authority),
        })),
    }
}

fn set_labels(authority: &str) -> std::collections::HashMap<String, String> {
    let mut labels = std::collections::HashMap::new();
    if let Some(service) = authority.split(':').next() {
        labels.insert("authority".to_string(), service.to_string());
    }
    labels
}

fn weighted_addr(addr: SocketAddr, meta: &EndpointMeta) -> proto::WeightedAddr {
    let mut metric_labels = std::collections::HashMap::new();
    if let Some(pod) = &meta.pod {
        metric_labels.insert("pod".to_string(), pod.clone());
    }
    if let Some(zone) = &meta.zone {
        metric_labels.insert("zone".to_string(), zone.clone());
    }

    let tls_identity = meta.identity.as_ref().map(|name| proto::TlsIdentity {
        strategy: Some(proto::tls_identity::Strategy::DnsLikeIdentity(
            proto::tls_identity::DnsLikeIdentity { name: name.clone() },
        )),
    });

    let protocol_hint = if meta.meshed {
        Some(proto::ProtocolHint {
            protocol: Some(proto::protocol_hint::Protocol::H2(
                proto::protocol_hint::H2 {},
            )),
            opaque_transport: meta.opaque_inbound_port.map(|port| {
                proto::protocol_hint::OpaqueTransport {
                    inbound_port: port as u32,
                }
            }),
        })
    } else {
        None
    };

    proto::WeightedAddr {
        addr: Some(tcp_address(addr)),
        weight: meta.weight,
        metric_labels,
        tls_identity,
        protocol_hint,
    }
}

pub fn tcp_address(addr: SocketAddr) -> proto::TcpAddress {
    let ip = match addr.ip() {
        IpAddr::V4(v4) => proto::ip_address::Ip::Ipv4(u32::from(v4)),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut first = [0u8; 8];
            let mut last = [0u8; 8];
            first.copy_from_slice(&octets[..8]);
            last.copy_from_slice(&octets[8..]);
            proto::ip_address::Ip::Ipv6(proto::IPv6 {
                first: u64::from_be_bytes(first),
                last: u64::from_be_bytes(last),
            })
        }
    };
    proto::TcpAddress {
        ip: Some(proto::IpAddress { ip: Some(ip) }),
        port: addr.port() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_ENDPOINT_WEIGHT;

    fn meta(weight: u32) -> EndpointMeta {
        EndpointMeta {
            weight,
            identity: None,
            meshed: false,
            zone: None,
            pod: None,
            opaque_inbound_port: None,
        }
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn snapshot(addrs: &[(&str, u32)]) -> Snapshot {
        Snapshot::Endpoints(
            addrs
                .iter()
                .map(|(a, w)| (addr(a), meta(*w)))
                .collect(),
        )
    }

    fn added_addrs(update: &proto::Update) -> Vec<u32> {
        match update.update.as_ref().unwrap() {
            proto::update::Update::Add(set) => set
                .addrs
                .iter()
                .map(|wa| match &wa.addr.as_ref().unwrap().ip.as_ref().unwrap().ip {
                    Some(proto::ip_address::Ip::Ipv4(ip)) => *ip,
                    _ => panic!("expected ipv4"),
                })
                .collect(),
            other => panic!("expected add, got {:?}", other),
        }
    }

    #[test]
    fn unknown_authority_is_a_single_sentinel() {
        let mut tx = Translator::new("nosuch.default.svc.cluster.local:80");
        let updates = tx.advance(&Snapshot::NotFound);
        assert_eq!(updates, vec![no_endpoints(false)]);

        // Re-delivered cache state after a re-list stays silent.
        assert!(tx.advance(&Snapshot::NotFound).is_empty());
    }

    #[test]
    fn scale_up_emits_one_add() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        let first = tx.advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]));
        assert_eq!(first.len(), 1);
        assert_eq!(added_addrs(&first[0]).len(), 1);

        let second = tx.advance(&snapshot(&[
            ("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT),
            ("10.0.0.2:8080", DEFAULT_ENDPOINT_WEIGHT),
        ]));
        assert_eq!(second.len(), 1);
        assert_eq!(
            added_addrs(&second[0]),
            vec![u32::from("10.0.0.2".parse::<std::net::Ipv4Addr>().unwrap())]
        );
    }

    #[test]
    fn scale_down_emits_remove_then_silence() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        tx.advance(&snapshot(&[
            ("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT),
            ("10.0.0.2:8080", DEFAULT_ENDPOINT_WEIGHT),
        ]));

        let updates = tx.advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]));
        assert_eq!(updates.len(), 1);
        assert!(matches!(
            updates[0].update,
            Some(proto::update::Update::Remove(_))
        ));

        // The same snapshot again coalesces to nothing.
        assert!(tx
            .advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]))
            .is_empty());
    }

    #[test]
    fn total_loss_is_no_endpoints_exists() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        tx.advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]));

        let updates = tx.advance(&snapshot(&[]));
        assert_eq!(updates, vec![no_endpoints(true)]);

        // Deleting the service afterwards flips the sentinel.
        let updates = tx.advance(&Snapshot::NotFound);
        assert_eq!(updates, vec![no_endpoints(false)]);
    }

    #[test]
    fn resync_with_identical_state_is_invisible() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        let snap = snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]);
        tx.advance(&snap);
        assert!(tx.advance(&snap).is_empty());
    }

    #[test]
    fn metadata_change_reannounces_the_address() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        tx.advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]));

        let updates = tx.advance(&snapshot(&[("10.0.0.1:8080", 2_500)]));
        assert_eq!(updates.len(), 1);
        match updates[0].update.as_ref().unwrap() {
            proto::update::Update::Add(set) => assert_eq!(set.addrs[0].weight, 2_500),
            other => panic!("expected add, got {:?}", other),
        }
    }

    #[test]
    fn recovery_after_no_endpoints() {
        let mut tx = Translator::new("web.default.svc.cluster.local:8080");
        tx.advance(&snapshot(&[]));
        let updates = tx.advance(&snapshot(&[("10.0.0.1:8080", DEFAULT_ENDPOINT_WEIGHT)]));
        assert_eq!(updates.len(), 1);
        assert!(matches!(
            updates[0].update,
            Some(proto::update::Update::Add(_))
        ));
    }
}
