use k8s_openapi::{Metadata, Resource};
use serde_with::skip_serializing_none;

/// # Service Profile
/// A `ServiceProfile` describes the per-authority routing behaviour of a
/// service: how requests are classified into routes, which responses count as
/// failures, how much retrying the clients may do, and whether traffic to the
/// service should be treated as opaque TCP.
///
/// A profile is looked up by the fully-qualified authority it is named after.
/// The lookup is two-level: a profile in the *client's* namespace overrides a
/// profile in the service's own namespace, so that consumers can locally
/// reshape how they talk to a producer.
///
/// ```yaml
/// apiVersion: mesh.nebula.technology/v1alpha1
/// kind: ServiceProfile
/// metadata:
///   name: web.emojivoto.svc.cluster.local
///   namespace: emojivoto
/// spec:
///   routes:
///   - name: GET /api/list
///     condition:
///       method: GET
///       pathRegex: /api/list
///     timeout: 300ms
///     isRetryable: true
///   retryBudget:
///     retryRatio: 0.2
///     minRetriesPerSecond: 10
///     ttl: 10s
///   dstOverrides:
///   - authority: web-v2.emojivoto.svc.cluster.local:80
///     weight: 100
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ServiceProfile {
    /// Standard object's metadata. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
    pub metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,

    /// Spec defines the routing behaviour of the authority this profile names.
    pub spec: Option<ServiceProfileSpec>,

    /// Most recently observed status. Populated by the system. Read-only.
    pub status: Option<()>,
}

impl Resource for ServiceProfile {
    const API_VERSION: &'static str = "mesh.nebula.technology/v1alpha1";
    const GROUP: &'static str = "mesh.nebula.technology";
    const KIND: &'static str = "ServiceProfile";
    const VERSION: &'static str = "v1alpha1";
    const URL_PATH_SEGMENT: &'static str = "serviceprofiles";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl Metadata for ServiceProfile {
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
pub struct ServiceProfileSpec {
    /// An ordered list of route classes. The first route whose condition
    /// matches a request classifies it.
    pub routes: Option<Vec<RouteSpec>>,

    /// Bounds how much extra load retries may add to the service.
    pub retry_budget: Option<RetryBudget>,

    /// Weighted sub-authorities used to split traffic away from this
    /// authority.
    pub dst_overrides: Option<Vec<WeightedDst>>,

    /// Ports on which traffic to this service must not be protocol-detected.
    pub opaque_ports: Option<Vec<u16>>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// The route's name as it appears in metrics labels.
    pub name: Option<String>,

    /// The request matcher that classifies a request into this route.
    pub condition: Option<RequestMatch>,

    /// Classifies responses on this route as successes or failures.
    pub response_classes: Option<Vec<ResponseClass>>,

    /// Whether requests on this route are safe to retry.
    pub is_retryable: Option<bool>,

    /// Per-request timeout, e.g. `300ms` or `5s`.
    pub timeout: Option<String>,
}

/// Boolean combinators over request properties. A matcher with several fields
/// set requires all of them; `all`/`any`/`not` compose nested matchers.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RequestMatch {
    pub path_regex: Option<String>,
    pub method: Option<String>,
    pub all: Option<Vec<RequestMatch>>,
    pub any: Option<Vec<RequestMatch>>,
    pub not: Option<Box<RequestMatch>>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseClass {
    pub condition: Option<ResponseMatch>,

    /// Whether a matching response counts against the route's success rate.
    pub is_failure: Option<bool>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMatch {
    pub status: Option<HttpStatusRange>,
    pub all: Option<Vec<ResponseMatch>>,
    pub any: Option<Vec<ResponseMatch>>,
    pub not: Option<Box<ResponseMatch>>,
}

/// An inclusive range of HTTP status codes. An unset bound defaults to the
/// edge of the valid status space.
#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpStatusRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryBudget {
    /// The fraction of the original request volume that may be added as
    /// retries.
    pub retry_ratio: Option<f32>,

    /// A retry floor that keeps the budget meaningful at low volume.
    pub min_retries_per_second: Option<u32>,

    /// How long a request counts toward the budget, e.g. `10s`.
    pub ttl: Option<String>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WeightedDst {
    /// The authority traffic is redirected to, e.g.
    /// `web-v2.emojivoto.svc.cluster.local:80`.
    pub authority: Option<String>,

    /// The share of traffic this destination receives, relative to the other
    /// overrides.
    pub weight: Option<u32>,
}
