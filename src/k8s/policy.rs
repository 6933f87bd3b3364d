use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::{Metadata, Resource};
use serde_with::skip_serializing_none;

/// # Server
/// A `Server` names one port on a set of pods and fixes the protocol the
/// proxy should assume on it. Inbound policy is keyed by the (pod, port)
/// pairs a server selects; marking a server `opaque` also propagates an
/// opaque-transport hint to clients resolving those pods.
///
/// ```yaml
/// apiVersion: mesh.nebula.technology/v1alpha1
/// kind: Server
/// metadata:
///   name: web-http
///   namespace: emojivoto
/// spec:
///   podSelector:
///     matchLabels:
///       app: web
///   port: http
///   proxyProtocol: HTTP/2
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Server {
    /// Standard object's metadata. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
    pub metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,

    /// Spec selects the pods and port this server describes.
    pub spec: Option<ServerSpec>,

    /// Most recently observed status. Populated by the system. Read-only.
    pub status: Option<()>,
}

impl Resource for Server {
    const API_VERSION: &'static str = "mesh.nebula.technology/v1alpha1";
    const GROUP: &'static str = "mesh.nebula.technology";
    const KIND: &'static str = "Server";
    const VERSION: &'static str = "v1alpha1";
    const URL_PATH_SEGMENT: &'static str = "servers";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl Metadata for Server {
    type Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    fn metadata(&self) -> &<Self as Metadata>::Ty {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut <Self as Metadata>::Ty {
        &mut self.metadata
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Selects the pods this server applies to, within the server's
    /// namespace.
    pub pod_selector: Option<LabelSelector>,

    /// A port number or container-port name on the selected pods.
    pub port: Option<IntOrString>,

    /// One of `unknown`, `HTTP/1`, `HTTP/2`, `gRPC`, `opaque`, `TLS`.
    /// Defaults to protocol detection.
    pub proxy_protocol: Option<String>,
}

/// # Server Authorization
/// A `ServerAuthorization` grants a set of clients access to one or more
/// `Server`s. Clients are named by mesh identity, by service account, by
/// network, or left unauthenticated.
///
/// ```yaml
/// apiVersion: mesh.nebula.technology/v1alpha1
/// kind: ServerAuthorization
/// metadata:
///   name: web-public
///   namespace: emojivoto
/// spec:
///   server:
///     name: web-http
///   client:
///     meshTLS:
///       identities:
///       - "*.emojivoto.serviceaccount.identity.mesh.cluster.local"
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServerAuthorization {
    /// Standard object's metadata. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
    pub metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,

    /// Spec names the servers and the clients allowed to reach them.
    pub spec: Option<ServerAuthorizationSpec>,

    /// Most recently observed status. Populated by the system. Read-only.
    pub status: Option<()>,
}

impl Resource for ServerAuthorization {
    const API_VERSION: &'static str = "mesh.nebula.technology/v1alpha1";
    const GROUP: &'static str = "mesh.nebula.technology";
    const KIND: &'static str = "ServerAuthorization";
    const VERSION: &'static str = "v1alpha1";
    const URL_PATH_SEGMENT: &'static str = "serverauthorizations";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl Metadata for ServerAuthorization {
    type Ty = k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    fn metadata(&self) -> &<Self as Metadata>::Ty {
        &self.metadata
    }
    fn metadata_mut(&mut self) -> &mut <Self as Metadata>::Ty {
        &mut self.metadata
    }
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerAuthorizationSpec {
    pub server: Option<ServerSelector>,
    pub client: Option<ClientSpec>,
}

/// Selects servers by name or by label.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSelector {
    pub name: Option<String>,
    pub selector: Option<LabelSelector>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSpec {
    /// Clients presenting a mesh identity.
    pub mesh_tls: Option<MeshTls>,

    /// Client networks granted access regardless of identity.
    pub networks: Option<Vec<NetworkSpec>>,

    /// Allow clients with no TLS at all.
    pub unauthenticated: Option<bool>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeshTls {
    /// Mesh identity names; a leading `*.` grants a whole suffix.
    pub identities: Option<Vec<String>>,

    /// Service accounts, rendered to identities in the authorization's
    /// namespace unless one is given.
    pub service_accounts: Option<Vec<ServiceAccountRef>>,

    /// Allow any client that completed the mesh TLS handshake.
    pub unauthenticated_tls: Option<bool>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountRef {
    pub name: Option<String>,
    pub namespace: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    pub cidr: Option<String>,
    pub except: Option<Vec<String>>,
}
