//! The workload certificate authority.
//!
//! `Certify` exchanges an orchestrator-issued service-account token and a CSR
//! for a short-lived leaf certificate. The token proves the claimed identity
//! through the orchestrator's token-review endpoint; the CSR contributes only
//! the public key and must name exactly the authenticated identity.

pub mod issuer;

use crate::proxy_api::identity as proto;
use crate::ClusterInfo;
use issuer::{SignError, SignerHandle};
use k8s_openapi::api::authentication::v1 as authnv1;
use kube::api::{Api, PostParams};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};
use x509_parser::prelude::{FromDer, GeneralName, ParsedExtension, X509CertificationRequest};

/// Token reviews are bounded so a slow orchestrator cannot pile up certify
/// requests.
const TOKEN_REVIEW_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum CertifyError {
    #[error("invalid identity {0}")]
    InvalidIdentity(String),

    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    #[error("token could not be verified: {0}")]
    TokenInvalid(String),

    #[error("token review unavailable: {0}")]
    ReviewUnavailable(String),

    #[error("token subject {found} does not match requested identity {requested}")]
    IdentityMismatch { requested: String, found: String },

    #[error("signer unavailable")]
    SignerUnavailable,

    #[error("internal: {0}")]
    Internal(String),
}

impl From<CertifyError> for Status {
    fn from(err: CertifyError) -> Self {
        match err {
            CertifyError::InvalidIdentity(_) | CertifyError::InvalidCsr(_) => {
                Status::invalid_argument(err.to_string())
            }
            CertifyError::TokenInvalid(_) => Status::unauthenticated(err.to_string()),
            CertifyError::IdentityMismatch { .. } => Status::permission_denied(err.to_string()),
            CertifyError::ReviewUnavailable(_) | CertifyError::SignerUnavailable => {
                Status::unavailable(err.to_string())
            }
            CertifyError::Internal(_) => Status::internal(err.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct IdentityService {
    client: kube::Client,
    signer: Arc<SignerHandle>,
    cluster: ClusterInfo,
    max_lifetime: Duration,
    safety_margin: Duration,

    /// Signing is CPU-bound; concurrency is capped at the host parallelism.
    permits: Arc<Semaphore>,
}

// === impl IdentityService ===

impl IdentityService {
    pub fn new(
        client: kube::Client,
        signer: Arc<SignerHandle>,
        cluster: ClusterInfo,
        max_lifetime: Duration,
        safety_margin: Duration,
    ) -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        Self {
            client,
            signer,
            cluster,
            max_lifetime,
            safety_margin,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn svc(self) -> proto::identity_server::IdentityServer<Self> {
        proto::identity_server::IdentityServer::new(self)
    }

    async fn certify(&self, req: proto::CertifyRequest) -> Result<proto::CertifyResponse, CertifyError> {
        let (sa, ns) = parse_identity(&req.identity, &self.cluster)
            .ok_or_else(|| CertifyError::InvalidIdentity(req.identity.clone()))?;

        let csr_der = validate_csr(&req.certificate_signing_request, &req.identity)?;

        let token = std::str::from_utf8(&req.token)
            .map_err(|_| CertifyError::TokenInvalid("token is not UTF-8".to_string()))?;
        self.review_token(token, &ns, &sa, &req.identity).await?;

        // The signer snapshot is taken after authentication so a concurrent
        // issuer rotation applies to queued requests; an in-flight signing
        // finishes under the snapshot it holds.
        let signer = self.signer.snapshot();
        let intermediates = signer.intermediates();
        let max_lifetime = self.max_lifetime;
        let safety_margin = self.safety_margin;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CertifyError::SignerUnavailable)?;
        let leaf = tokio::task::spawn_blocking(move || {
            signer.sign_csr(&csr_der, max_lifetime, safety_margin)
        })
        .await
        .map_err(|e| CertifyError::Internal(e.to_string()))?
        .map_err(|e| match e {
            SignError::InvalidCsr(m) => CertifyError::InvalidCsr(m),
            SignError::IssuerNearExpiry => CertifyError::SignerUnavailable,
            SignError::Signing(m) => CertifyError::Internal(m),
        })?;

        info!(identity = %req.identity, expiry = %leaf.expiry, "issued certificate");
        Ok(proto::CertifyResponse {
            leaf_certificate: leaf.der,
            intermediate_certificates: intermediates,
            valid_until: Some(prost_types::Timestamp {
                seconds: leaf.expiry.unix_timestamp(),
                nanos: leaf.expiry.nanosecond() as i32,
            }),
        })
    }

    /// Confirms through the orchestrator that `token` authenticates the
    /// service account the identity names.
    async fn review_token(
        &self,
        token: &str,
        ns: &str,
        sa: &str,
        requested: &str,
    ) -> Result<(), CertifyError> {
        let api: Api<authnv1::TokenReview> = Api::all(self.client.clone());
        let review = authnv1::TokenReview {
            metadata: Default::default(),
            spec: authnv1::TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: None,
            },
            status: None,
        };

        let reviewed = tokio::time::timeout(
            TOKEN_REVIEW_TIMEOUT,
            api.create(&PostParams::default(), &review),
        )
        .await
        .map_err(|_| CertifyError::ReviewUnavailable("token review timed out".to_string()))?
        .map_err(|e| CertifyError::ReviewUnavailable(e.to_string()))?;

        let status = reviewed.status.unwrap_or_default();
        if let Some(error) = status.error.filter(|e| !e.is_empty()) {
            return Err(CertifyError::TokenInvalid(error));
        }
        if status.authenticated != Some(true) {
            return Err(CertifyError::TokenInvalid("token rejected".to_string()));
        }

        let username = status
            .user
            .and_then(|u| u.username)
            .unwrap_or_default();
        let expected = format!("system:serviceaccount:{}:{}", ns, sa);
        if username != expected {
            debug!(%username, %expected, "token subject mismatch");
            return Err(CertifyError::IdentityMismatch {
                requested: requested.to_string(),
                found: username,
            });
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl proto::identity_server::Identity for IdentityService {
    async fn certify(
        &self,
        req: Request<proto::CertifyRequest>,
    ) -> Result<Response<proto::CertifyResponse>, Status> {
        match IdentityService::certify(self, req.into_inner()).await {
            Ok(rsp) => Ok(Response::new(rsp)),
            Err(err) => {
                warn!(%err, "certify failed");
                Err(err.into())
            }
        }
    }
}

/// Splits `<sa>.<ns>.serviceaccount.<identity-domain>` into its service
/// account and namespace.
pub fn parse_identity(identity: &str, cluster: &ClusterInfo) -> Option<(String, String)> {
    let suffix = format!(".serviceaccount.{}", cluster.identity_domain);
    let rest = identity.strip_suffix(&suffix)?;
    let (sa, ns) = rest.split_once('.')?;
    if sa.is_empty() || ns.is_empty() || ns.contains('.') {
        return None;
    }
    Some((sa.to_string(), ns.to_string()))
}

/// Validates a CSR without trusting anything but its bytes: the signature
/// must self-verify, the public-key algorithm must be allow-listed, the only
/// requested extension must be a SAN, and that SAN must carry exactly the
/// requested identity as its sole DNS name.
///
/// Accepts DER or PEM and returns the DER bytes for signing.
pub fn validate_csr(raw: &[u8], identity: &str) -> Result<Vec<u8>, CertifyError> {
    let invalid = |m: &str| CertifyError::InvalidCsr(m.to_string());

    if raw.is_empty() {
        return Err(invalid("empty CSR"));
    }
    let der: Vec<u8> = if raw.starts_with(b"-----BEGIN") {
        x509_parser::pem::Pem::iter_from_buffer(raw)
            .next()
            .ok_or_else(|| invalid("no PEM block"))?
            .map_err(|e| CertifyError::InvalidCsr(e.to_string()))?
            .contents
    } else {
        raw.to_vec()
    };

    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| CertifyError::InvalidCsr(e.to_string()))?;
    csr.verify_signature()
        .map_err(|_| invalid("CSR signature does not verify"))?;

    let alg = &csr.certification_request_info.subject_pki.algorithm.algorithm;
    if *alg != OID_KEY_TYPE_EC_PUBLIC_KEY && *alg != OID_PKCS1_RSAENCRYPTION {
        return Err(invalid("public key algorithm is not allowed"));
    }

    let mut dns_names = Vec::new();
    for ext in csr
        .requested_extensions()
        .into_iter()
        .flatten()
    {
        match ext {
            ParsedExtension::SubjectAlternativeName(san) => {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                        _ => return Err(invalid("SAN must carry only DNS names")),
                    }
                }
            }
            _ => return Err(invalid("CSR carries a foreign extension")),
        }
    }

    if dns_names.as_slice() != [identity.to_string()].as_slice() {
        return Err(CertifyError::InvalidCsr(format!(
            "CSR names {:?}, not the requested identity",
            dns_names
        )));
    }

    Ok(der)
}
