//! # Kube Mesh Controller
//! kube-mesh-controller is the control plane for a pod-to-pod service mesh on
//! Kubernetes. It serves three cooperating subsystems on top of one shared,
//! watch-driven resource cache:
//!
//! - `destination`: a streaming discovery service that keeps every data-plane
//!   proxy informed of the endpoint set, weights, TLS identities and routing
//!   profile for the authorities it talks to.
//! - `identity`: an online certificate authority that validates
//!   orchestrator-issued service-account tokens and mints short-lived workload
//!   certificates.
//! - `inject`: a mutating admission webhook that rewrites pod specs to attach
//!   the sidecar proxy and its init container.

#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate k8s_openapi;

pub mod admin;
pub mod cache;
pub mod destination;
pub mod identity;
pub mod inject;
pub mod k8s;
pub mod lease;

/// Generated bindings for the proxy-facing gRPC APIs.
pub mod proxy_api {
    pub mod destination {
        tonic::include_proto!("io.linkerd.proxy.destination");
    }
    pub mod identity {
        tonic::include_proto!("io.linkerd.proxy.identity");
    }
}

/// The annotation/label prefix under which all mesh configuration lives.
pub const ANNOTATION_PREFIX: &str = "mesh.nebula.technology";

/// Renders a mesh annotation or label name, e.g. `proxy-version` into
/// `mesh.nebula.technology/proxy-version`.
pub fn annotation(key: &str) -> String {
    format!("{}/{}", ANNOTATION_PREFIX, key)
}

/// The total routing weight distributed across one authority's endpoints.
pub const DEFAULT_ENDPOINT_WEIGHT: u32 = 10_000;

/// Runtime knobs shared by every subsystem, fixed at process startup.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// The DNS suffix under which in-cluster services resolve.
    pub cluster_domain: String,

    /// The DNS-like suffix appended to `<sa>.<ns>.serviceaccount.` when a
    /// workload identity is rendered.
    pub identity_domain: String,

    /// The namespace this control plane runs in.
    pub control_plane_ns: String,
}

impl ClusterInfo {
    /// Renders the mesh identity of a service account.
    pub fn service_account_identity(&self, ns: &str, sa: &str) -> String {
        format!("{}.{}.serviceaccount.{}", sa, ns, self.identity_domain)
    }
}
