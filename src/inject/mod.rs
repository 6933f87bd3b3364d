//! The mutating admission webhook that injects the sidecar proxy.
//!
//! The webhook is conservative end to end: any internal failure admits the
//! pod unchanged (never blocks pod creation), and persistent
//! misconfiguration surfaces through the readiness endpoint instead.

pub mod config;
pub mod patch;

pub use config::{DefaultsFile, InjectorDefaults, ProxyConfig};
pub use patch::{Injector, Verdict};

use crate::cache::{Cache, ObjectKey};
use crate::k8s::{Namespace, Pod};
use anyhow::Context as _;
use axum::extract::Extension;
use axum::routing::post;
use axum::{Json, Router};
use hyper::server::conn::Http;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview};
use prometheus_client::metrics::counter::Counter;
use std::collections::BTreeMap;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Everything one admission request needs, fixed at startup.
pub struct Webhook {
    injector: Injector,
    namespaces: Cache<Namespace>,

    /// Counts render failures that fell back to allow-unchanged.
    pub failures: Counter,
}

// === impl Webhook ===

impl Webhook {
    pub fn new(injector: Injector, namespaces: Cache<Namespace>, failures: Counter) -> Self {
        Self {
            injector,
            namespaces,
            failures,
        }
    }

    /// Decides one admission request. Every path admits the pod; the only
    /// question is whether a patch rides along.
    pub fn admit(&self, req: AdmissionRequest<Pod>) -> AdmissionResponse {
        let response = AdmissionResponse::from(&req);

        if req.kind.kind != "Pod" {
            debug!(kind = %req.kind.kind, "not a pod; admitting unchanged");
            return response;
        }
        let pod = match &req.object {
            Some(pod) => pod,
            None => return response,
        };

        let ns_name = req
            .namespace
            .clone()
            .or_else(|| pod.metadata.namespace.clone())
            .unwrap_or_default();
        let (ns_labels, ns_annotations) = self.namespace_meta(&ns_name);

        match self.injector.inject(&ns_labels, &ns_annotations, pod) {
            Ok(Verdict::Inject(patch)) => match response.with_patch(patch) {
                Ok(response) => {
                    info!(ns = %ns_name, pod = %name_of(pod), "injecting proxy");
                    response
                }
                Err(error) => {
                    warn!(%error, "patch serialization failed; admitting unchanged");
                    self.failures.inc();
                    AdmissionResponse::from(&req)
                }
            },
            Ok(Verdict::Skip(reason)) => {
                debug!(ns = %ns_name, pod = %name_of(pod), %reason, "not injecting");
                response
            }
            Err(error) => {
                // Conservative failure mode: a bug here must not block pod
                // creation.
                warn!(ns = %ns_name, %error, "injection failed; admitting unchanged");
                self.failures.inc();
                response
            }
        }
    }

    fn namespace_meta(
        &self,
        name: &str,
    ) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
        match self.namespaces.get(&ObjectKey::new("", name)) {
            Some(ns) => (
                ns.metadata.labels.clone().unwrap_or_default(),
                ns.metadata.annotations.clone().unwrap_or_default(),
            ),
            None => Default::default(),
        }
    }
}

fn name_of(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_else(|| "<unnamed>".to_string())
}

async fn admit_handler(
    Extension(webhook): Extension<Arc<Webhook>>,
    Json(review): Json<AdmissionReview<Pod>>,
) -> Json<AdmissionReview<kube::core::DynamicObject>> {
    let response = match review.try_into() {
        Ok(req) => webhook.admit(req),
        Err(error) => {
            warn!(%error, "malformed admission review");
            AdmissionResponse::invalid(error.to_string())
        }
    };
    Json(response.into_review())
}

/// Serves the webhook over TLS until the drain fires. The serving
/// certificate is read once at startup; the orchestrator's webhook client
/// authenticates us against the CA registered in the webhook configuration.
pub async fn serve(
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    webhook: Arc<Webhook>,
    drain: drain::Watch,
) -> anyhow::Result<()> {
    let tls = server_tls_config(cert_path, key_path)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls));

    let app = Router::new()
        .route("/", post(admit_handler))
        .route("/inject", post(admit_handler))
        .layer(Extension(webhook));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding webhook listener on {}", addr))?;
    info!(%addr, "admission webhook listening");

    tokio::pin! {
        let shutdown = drain.signaled();
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted.context("accepting webhook connection")?;
                let acceptor = acceptor.clone();
                let app = app.clone();
                tokio::spawn(async move {
                    match acceptor.accept(stream).await {
                        Ok(tls) => {
                            if let Err(error) = Http::new().serve_connection(tls, app).await {
                                debug!(%error, %peer, "webhook connection error");
                            }
                        }
                        Err(error) => debug!(%error, %peer, "TLS handshake failed"),
                    }
                });
            }
            _ = &mut shutdown => {
                info!("admission webhook draining");
                return Ok(());
            }
        }
    }
}

fn server_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(
        std::fs::File::open(cert_path)
            .with_context(|| format!("reading {}", cert_path.display()))?,
    ))
    .context("parsing webhook serving certificate")?
    .into_iter()
    .map(rustls::Certificate)
    .collect();

    let key = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(
        std::fs::File::open(key_path)
            .with_context(|| format!("reading {}", key_path.display()))?,
    ))
    .context("parsing webhook serving key")?
    .into_iter()
    .next()
    .context("webhook serving key file holds no PKCS#8 key")?;

    rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(key))
        .context("assembling webhook TLS configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inject::config::InjectorDefaults;
    use crate::{annotation, ClusterInfo};
    use serde_json::json;

    fn webhook() -> Webhook {
        let namespaces = Cache::new();
        namespaces.apply(Namespace {
            metadata: crate::k8s::ObjectMeta {
                name: Some("emojivoto".to_string()),
                annotations: Some(
                    [(annotation("inject"), "enabled".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        });
        Webhook::new(
            Injector::new(
                InjectorDefaults::default(),
                ClusterInfo {
                    cluster_domain: "cluster.local".to_string(),
                    identity_domain: "identity.mesh.cluster.local".to_string(),
                    control_plane_ns: "mesh-system".to_string(),
                },
            ),
            namespaces,
            prometheus_client::metrics::counter::Counter::default(),
        )
    }

    fn review(pod: serde_json::Value) -> AdmissionReview<Pod> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "", "version": "v1", "kind": "Pod" },
                "resource": { "group": "", "version": "v1", "resource": "pods" },
                "name": "web-abc",
                "namespace": "emojivoto",
                "operation": "CREATE",
                "userInfo": {},
                "object": pod,
                "dryRun": false
            }
        }))
        .expect("admission review fixture must parse")
    }

    fn pod_json(annotations: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "web-abc",
                "namespace": "emojivoto",
                "annotations": annotations
            },
            "spec": {
                "containers": [{ "name": "web", "image": "web:1" }]
            }
        })
    }

    fn response_of(review: AdmissionReview<Pod>) -> serde_json::Value {
        let req: AdmissionRequest<Pod> = review.try_into().expect("review carries a request");
        let out = webhook().admit(req).into_review();
        serde_json::to_value(out).expect("response serializes")["response"].clone()
    }

    #[test]
    fn enabled_namespace_gets_a_patch() {
        let response = response_of(review(pod_json(json!({}))));
        assert_eq!(response["allowed"], json!(true));
        assert_eq!(response["patchType"], json!("JSONPatch"));
        assert!(!response["patch"].is_null());
    }

    #[test]
    fn invalid_annotation_admits_unchanged() {
        let response = response_of(review(pod_json(json!({
            (annotation("proxy-inbound-port")): "not-a-port"
        }))));
        assert_eq!(response["allowed"], json!(true));
        assert!(response["patch"].is_null());
    }

    #[test]
    fn opted_out_pod_admits_unchanged() {
        let response = response_of(review(pod_json(json!({
            (annotation("inject")): "disabled"
        }))));
        assert_eq!(response["allowed"], json!(true));
        assert!(response["patch"].is_null());
    }
}
