use k8s_openapi::{Metadata, Resource};
use serde_with::skip_serializing_none;

/// # Traffic Split
/// A `TrafficSplit` distributes traffic addressed to an apex service across a
/// set of backend services, in proportion to per-backend weights. This is the
/// SMI `split.smi-spec.io` resource; the mesh consumes it when resolving the
/// apex service's endpoints.
///
/// ```yaml
/// apiVersion: split.smi-spec.io/v1alpha2
/// kind: TrafficSplit
/// metadata:
///   name: web-rollout
///   namespace: emojivoto
/// spec:
///   service: web
///   backends:
///   - service: web-v1
///     weight: 1
///   - service: web-v2
///     weight: 3
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TrafficSplit {
    /// Standard object's metadata. More info: https://git.k8s.io/community/contributors/devel/sig-architecture/api-conventions.md#metadata
    pub metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,

    /// Spec names the apex service and the weighted backends.
    pub spec: Option<TrafficSplitSpec>,

    /// Most recently observed status. Populated by the system. Read-only.
    pub status: Option<()>,
}

impl Resource for TrafficSplit {
    const API_VERSION: &'static str = "split.smi-spec.io/v1alpha2";
    const GROUP: &'static str = "split.smi-spec.io";
    const KIND: &'static str = "TrafficSplit";
    const VERSION: &'static str = "v1alpha2";
    const URL_PATH_SEGMENT: &'static str = "trafficsplits";
    type Scope = k8s_openapi::NamespaceResourceScope;
}

impl Metadata for TrafficSplit {
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
pub struct TrafficSplitSpec {
    /// The apex service whose traffic is being split. A short name, resolved
    /// in the split's own namespace.
    pub service: Option<String>,

    /// The services receiving the split traffic. A backend with weight zero
    /// receives none.
    pub backends: Option<Vec<TrafficSplitBackend>>,
}

#[skip_serializing_none]
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrafficSplitBackend {
    /// A short service name in the split's namespace.
    pub service: Option<String>,

    /// The backend's relative share. Shares are normalized across all
    /// backends of the split.
    pub weight: Option<u32>,
}
