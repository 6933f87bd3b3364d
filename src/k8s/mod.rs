//! Kubernetes resource surface: re-exports of the builtin kinds the control
//! plane watches plus the mesh's own custom resources.

pub mod labels;
pub mod policy;
pub mod service_profile;
pub mod traffic_split;

pub use policy::{Server, ServerAuthorization};
pub use service_profile::ServiceProfile;
pub use traffic_split::TrafficSplit;

pub use k8s_openapi::api::core::v1::{Namespace, Pod, Secret, Service};
pub use k8s_openapi::api::discovery::v1::EndpointSlice;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
pub use kube::ResourceExt;

/// The label the orchestrator stamps on every `EndpointSlice`, naming the
/// `Service` the slice belongs to.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Returns a pod's IP, when one has been assigned.
pub fn pod_ip(pod: &Pod) -> Option<std::net::IpAddr> {
    pod.status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .and_then(|ip| ip.parse().ok())
}

/// Returns the service account a pod runs as, defaulting like the
/// orchestrator does.
pub fn pod_service_account(pod: &Pod) -> &str {
    pod.spec
        .as_ref()
        .and_then(|s| s.service_account_name.as_deref())
        .unwrap_or("default")
}
