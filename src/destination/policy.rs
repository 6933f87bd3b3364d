//! The inbound policy view: what protocol a (pod, port) speaks and which
//! clients may reach it, resolved from `Server` and `ServerAuthorization`
//! resources.
//!
//! Endpoint resolution consumes the protocol half (an opaque `Server` turns
//! into an opaque-transport hint on delivered endpoints); the authorization
//! half is the per-port ACL keyed by (pod, port).

use crate::cache::Filter;
use crate::destination::DiscoveryCaches;
use crate::k8s::policy::{ClientSpec, ServerAuthorization};
use crate::k8s::{self, Pod, Server};
use crate::ClusterInfo;
use ipnet::IpNet;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::sync::Arc;

/// The protocol a `Server` pins to its port. Absent a server, the proxy
/// detects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Detect,
    Http1,
    Http2,
    Grpc,
    Opaque,
    Tls,
}

impl Protocol {
    fn parse(s: Option<&str>) -> Self {
        match s {
            Some("HTTP/1") => Self::Http1,
            Some("HTTP/2") => Self::Http2,
            Some("gRPC") => Self::Grpc,
            Some("opaque") => Self::Opaque,
            Some("TLS") => Self::Tls,
            _ => Self::Detect,
        }
    }
}

/// Matches client mesh identities exactly or by suffix (`*.` prefix in the
/// resource).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IdentityMatch {
    Exact(String),
    Suffix(String),
}

impl IdentityMatch {
    fn parse(s: &str) -> Self {
        match s.strip_prefix("*.") {
            Some(suffix) => Self::Suffix(suffix.to_string()),
            None => Self::Exact(s.to_string()),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match self {
            Self::Exact(exact) => name == exact,
            Self::Suffix(suffix) => name
                .strip_suffix(suffix)
                .map_or(false, |rest| rest.ends_with('.')),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAuthentication {
    /// No TLS required at all.
    Unauthenticated,

    /// Any client that completed the mesh TLS handshake.
    TlsUnauthenticated,

    /// Clients presenting one of these identities.
    TlsAuthenticated(Vec<IdentityMatch>),
}

/// One `ServerAuthorization` rendered into its wire meaning.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientAuthorization {
    /// The name of the authorization resource, for labels and diagnostics.
    pub reference: String,

    /// Source networks the grant is limited to; empty means any.
    pub networks: Vec<IpNet>,

    pub authentication: ClientAuthentication,
}

/// The effective inbound policy of one (pod, port).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortPolicy {
    pub protocol: Protocol,

    /// The server resource that fixed the protocol, when one matched.
    pub server: Option<String>,

    pub authorizations: Vec<ClientAuthorization>,
}

/// Whether a `Server` selects this pod and port.
pub fn server_selects(server: &Server, pod: &Pod, port: u16) -> bool {
    let Some(spec) = &server.spec else {
        return false;
    };
    let labels = pod.metadata.labels.clone().unwrap_or_default();
    let selected = spec
        .pod_selector
        .as_ref()
        .map(|s| k8s::labels::selector_matches(s, &labels))
        .unwrap_or(false);
    if !selected {
        return false;
    }
    match &spec.port {
        Some(IntOrString::Int(p)) => *p == port as i32,
        Some(IntOrString::String(name)) => pod_container_port_named(pod, name) == Some(port),
        None => false,
    }
}

/// The protocol pinned by the first `Server` selecting this pod and port.
pub fn protocol_for(servers: &[Arc<Server>], pod: &Pod, port: u16) -> Protocol {
    servers
        .iter()
        .find(|srv| server_selects(srv, pod, port))
        .map(|srv| {
            Protocol::parse(
                srv.spec
                    .as_ref()
                    .and_then(|s| s.proxy_protocol.as_deref()),
            )
        })
        .unwrap_or(Protocol::Detect)
}

/// Resolves the full policy for a (pod, port) from the cache.
pub fn port_policy(
    caches: &DiscoveryCaches,
    cluster: &ClusterInfo,
    namespace: &str,
    pod: &Pod,
    port: u16,
) -> PortPolicy {
    let servers = caches.servers.list(&Filter::namespace(namespace));
    let server = match servers.iter().find(|srv| server_selects(srv, pod, port)) {
        Some(server) => server,
        None => {
            return PortPolicy {
                protocol: Protocol::Detect,
                server: None,
                authorizations: Vec::new(),
            }
        }
    };

    let authorizations = caches
        .server_authorizations
        .list(&Filter::namespace(namespace))
        .iter()
        .filter(|az| authz_targets_server(az, server))
        .filter_map(|az| render_authz(az, cluster, namespace))
        .collect();

    PortPolicy {
        protocol: Protocol::parse(
            server
                .spec
                .as_ref()
                .and_then(|s| s.proxy_protocol.as_deref()),
        ),
        server: server.metadata.name.clone(),
        authorizations,
    }
}

fn authz_targets_server(az: &ServerAuthorization, server: &Server) -> bool {
    let Some(selector) = az.spec.as_ref().and_then(|s| s.server.as_ref()) else {
        return false;
    };
    if let Some(name) = &selector.name {
        return Some(name) == server.metadata.name.as_ref();
    }
    if let Some(label_selector) = &selector.selector {
        let labels = server.metadata.labels.clone().unwrap_or_default();
        return k8s::labels::selector_matches(label_selector, &labels);
    }
    false
}

fn render_authz(
    az: &ServerAuthorization,
    cluster: &ClusterInfo,
    namespace: &str,
) -> Option<ClientAuthorization> {
    let client = az.spec.as_ref()?.client.as_ref()?;
    let reference = az.metadata.name.clone()?;

    let networks = client
        .networks
        .iter()
        .flatten()
        .filter_map(|n| n.cidr.as_deref())
        .filter_map(|cidr| cidr.parse().ok())
        .collect();

    Some(ClientAuthorization {
        reference,
        networks,
        authentication: authentication_of(client, cluster, namespace),
    })
}

fn authentication_of(
    client: &ClientSpec,
    cluster: &ClusterInfo,
    namespace: &str,
) -> ClientAuthentication {
    if client.unauthenticated == Some(true) {
        return ClientAuthentication::Unauthenticated;
    }

    let Some(mesh_tls) = &client.mesh_tls else {
        return ClientAuthentication::Unauthenticated;
    };
    if mesh_tls.unauthenticated_tls == Some(true) {
        return ClientAuthentication::TlsUnauthenticated;
    }

    let mut identities: Vec<IdentityMatch> = mesh_tls
        .identities
        .iter()
        .flatten()
        .map(|s| IdentityMatch::parse(s))
        .collect();
    identities.extend(mesh_tls.service_accounts.iter().flatten().filter_map(|sa| {
        let name = sa.name.as_deref()?;
        let ns = sa.namespace.as_deref().unwrap_or(namespace);
        Some(IdentityMatch::Exact(
            cluster.service_account_identity(ns, name),
        ))
    }));
    ClientAuthentication::TlsAuthenticated(identities)
}

fn pod_container_port_named(pod: &Pod, name: &str) -> Option<u16> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(name))
        .and_then(|p| u16::try_from(p.container_port).ok())
}
