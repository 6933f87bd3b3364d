//! The signing half of the certificate authority: issuer material, its
//! validation against the trust anchors, and hot reload from the watched
//! Secret.
//!
//! The active signer is an atomically-swappable reference; a reload replaces
//! it wholesale while in-flight signing operations complete under the
//! snapshot they already hold. Invalid reloads keep the previous signer and
//! trip the issuer health flag.

use crate::cache::{Cache, Event, Filter, ObjectKey};
use crate::k8s::Secret;
use arc_swap::ArcSwap;
use rcgen::{
    Certificate, CertificateParams, CertificateSigningRequestParams, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use x509_parser::pem::Pem;
use x509_parser::prelude::{FromDer, X509Certificate};

/// The keys issuer Secrets carry, following the orchestrator's TLS secret
/// convention.
pub const ISSUER_CERT_KEY: &str = "tls.crt";
pub const ISSUER_KEY_KEY: &str = "tls.key";

/// Leaves are backdated slightly to tolerate clock skew between the signer
/// and the verifying proxies.
const BACKDATE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum IssuerError {
    #[error("issuer certificate is not valid PEM: {0}")]
    CertPem(String),

    #[error("issuer key is not valid PEM: {0}")]
    KeyPem(String),

    #[error("issuer key does not match the issuer certificate")]
    KeyMismatch,

    #[error("issuer certificate expired at {0}")]
    Expired(OffsetDateTime),

    #[error("issuer certificate does not chain to any trust anchor")]
    ChainMismatch,

    #[error("trust anchor bundle is empty or unreadable")]
    BadAnchors,

    #[error("issuer secret is missing key {0}")]
    MissingSecretKey(&'static str),
}

#[derive(Debug, Error)]
pub enum SignError {
    #[error("certificate signing request could not be parsed: {0}")]
    InvalidCsr(String),

    #[error("issuer has less than the safety margin of validity left")]
    IssuerNearExpiry,

    #[error("signing failed: {0}")]
    Signing(String),
}

/// A signed leaf certificate.
pub struct Leaf {
    pub der: Vec<u8>,
    pub expiry: OffsetDateTime,
}

/// Loaded issuer material: the signing key, a signer handle rebuilt from the
/// issuer certificate, and the original certificate for the delivered chain.
pub struct Issuer {
    key: KeyPair,
    signer_cert: Certificate,

    /// The issuer certificate exactly as loaded, DER-encoded; returned to
    /// clients as the intermediate chain.
    cert_der: Vec<u8>,

    pub not_after: OffsetDateTime,
}

impl Issuer {
    /// Parses and validates issuer material against the trust anchors.
    pub fn from_pem(
        cert_pem: &str,
        key_pem: &str,
        anchors_pem: &str,
    ) -> Result<Self, IssuerError> {
        let key =
            KeyPair::from_pem(key_pem).map_err(|e| IssuerError::KeyPem(e.to_string()))?;

        let (cert_der, not_after) = {
            let pem = Pem::iter_from_buffer(cert_pem.as_bytes())
                .next()
                .ok_or_else(|| IssuerError::CertPem("no PEM block".to_string()))?
                .map_err(|e| IssuerError::CertPem(e.to_string()))?;
            let cert = pem
                .parse_x509()
                .map_err(|e| IssuerError::CertPem(e.to_string()))?;

            if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
                return Err(IssuerError::KeyMismatch);
            }

            let not_after =
                OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp())
                    .map_err(|e| IssuerError::CertPem(e.to_string()))?;
            if not_after <= OffsetDateTime::now_utc() {
                return Err(IssuerError::Expired(not_after));
            }

            verify_chains_to_anchor(&cert, anchors_pem)?;
            (pem.contents.clone(), not_after)
        };

        // Rebuild a signer handle carrying the issuer's subject and key; the
        // leaf chain still verifies against the original certificate because
        // both share the key and distinguished name.
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| IssuerError::CertPem(e.to_string()))?;
        let signer_cert = params
            .self_signed(&key)
            .map_err(|e| IssuerError::CertPem(e.to_string()))?;

        Ok(Self {
            key,
            signer_cert,
            cert_der,
            not_after,
        })
    }

    /// Loads issuer material from the watched Secret.
    pub fn from_secret(secret: &Secret, anchors_pem: &str) -> Result<Self, IssuerError> {
        let get = |key: &'static str| -> Result<String, IssuerError> {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|v| String::from_utf8_lossy(&v.0).into_owned())
                .ok_or(IssuerError::MissingSecretKey(key))
        };
        Self::from_pem(&get(ISSUER_CERT_KEY)?, &get(ISSUER_KEY_KEY)?, anchors_pem)
    }

    /// The issuer certificate chain delivered alongside every leaf.
    pub fn intermediates(&self) -> Vec<Vec<u8>> {
        vec![self.cert_der.clone()]
    }

    /// How long a leaf signed now may live: the configured maximum, bounded
    /// so no leaf outlives the issuer minus the safety margin.
    pub fn leaf_lifetime(
        &self,
        now: OffsetDateTime,
        max_lifetime: Duration,
        safety_margin: Duration,
    ) -> Option<Duration> {
        let remaining = self.not_after - now - time::Duration::try_from(safety_margin).ok()?;
        if remaining <= time::Duration::ZERO {
            return None;
        }
        let remaining = Duration::try_from(remaining).ok()?;
        Some(remaining.min(max_lifetime))
    }

    /// Signs a validated CSR. The caller has already bound the CSR's SAN to
    /// the authenticated identity.
    pub fn sign_csr(
        &self,
        csr_der: &[u8],
        max_lifetime: Duration,
        safety_margin: Duration,
    ) -> Result<Leaf, SignError> {
        let now = OffsetDateTime::now_utc();
        let lifetime = self
            .leaf_lifetime(now, max_lifetime, safety_margin)
            .ok_or(SignError::IssuerNearExpiry)?;
        let expiry = now + lifetime;

        let mut csr = CertificateSigningRequestParams::from_der(&csr_der.to_vec().into())
            .map_err(|e| SignError::InvalidCsr(e.to_string()))?;
        csr.params.not_before = now - BACKDATE;
        csr.params.not_after = expiry;
        csr.params.is_ca = IsCa::NoCa;
        csr.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        csr.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        csr.params.serial_number =
            Some(SerialNumber::from(rand::random::<u64>().to_be_bytes().to_vec()));

        let leaf = csr
            .signed_by(&self.signer_cert, &self.key)
            .map_err(|e| SignError::Signing(e.to_string()))?;

        Ok(Leaf {
            der: leaf.der().to_vec(),
            expiry,
        })
    }
}

fn verify_chains_to_anchor(cert: &X509Certificate<'_>, anchors_pem: &str) -> Result<(), IssuerError> {
    let mut saw_anchor = false;
    for pem in Pem::iter_from_buffer(anchors_pem.as_bytes()) {
        let pem = pem.map_err(|_| IssuerError::BadAnchors)?;
        let Ok(anchor) = pem.parse_x509() else {
            return Err(IssuerError::BadAnchors);
        };
        saw_anchor = true;
        if cert.issuer() == anchor.subject()
            && cert.verify_signature(Some(anchor.public_key())).is_ok()
        {
            return Ok(());
        }
    }
    if saw_anchor {
        Err(IssuerError::ChainMismatch)
    } else {
        Err(IssuerError::BadAnchors)
    }
}

/// The atomically-swappable signer shared by all certify requests, plus the
/// health flag surfaced on the admin endpoint.
pub struct SignerHandle {
    current: ArcSwap<Issuer>,
    healthy: AtomicBool,
}

impl SignerHandle {
    pub fn new(issuer: Issuer) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(issuer),
            healthy: AtomicBool::new(true),
        })
    }

    /// A snapshot of the active signer. Operations keep using their snapshot
    /// across a concurrent swap.
    pub fn snapshot(&self) -> Arc<Issuer> {
        self.current.load_full()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    fn reload(&self, secret: &Secret, anchors_pem: &str) {
        match Issuer::from_secret(secret, anchors_pem) {
            Ok(issuer) => {
                info!(not_after = %issuer.not_after, "issuer reloaded");
                self.current.store(Arc::new(issuer));
                self.healthy.store(true, Ordering::Relaxed);
            }
            Err(error) => {
                // The previous signer keeps serving; readiness reports the
                // failure until a good reload lands.
                warn!(%error, "ignoring invalid issuer material");
                self.healthy.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Follows the issuer Secret through the cluster cache, swapping the signer
/// on every valid change.
pub async fn watch_issuer_secret(
    handle: Arc<SignerHandle>,
    secrets: Cache<Secret>,
    secret_key: ObjectKey,
    anchors_pem: String,
) {
    let mut sub = secrets.subscribe(Filter::key(&secret_key));
    while let Some(event) = sub.recv().await {
        match event {
            Event::Added(secret) | Event::Updated { new: secret, .. } => {
                handle.reload(&secret, &anchors_pem);
            }
            Event::Restarted(secrets) => {
                if let Some(secret) = secrets.first() {
                    handle.reload(secret, &anchors_pem);
                }
            }
            Event::Deleted { key, .. } => {
                warn!(%key, "issuer secret deleted; keeping the last good signer");
                handle.healthy.store(false, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rcgen::{BasicConstraints, DistinguishedName, DnType};

    /// A self-signed CA valid for `days`, returned as (cert PEM, key PEM).
    pub fn self_signed_ca(days: i64) -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "identity.mesh.cluster.local");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.not_before = OffsetDateTime::now_utc() - time::Duration::hours(1);
        params.not_after = OffsetDateTime::now_utc() + time::Duration::days(days);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    /// A CSR for `identity`, returned as (DER, key PEM).
    pub fn csr_for(identity: &str) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![identity.to_string()]).unwrap();
        let csr = params.serialize_request(&key).unwrap();
        csr.der().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn loads_and_signs() {
        let (ca_pem, ca_key) = self_signed_ca(30);
        let issuer = Issuer::from_pem(&ca_pem, &ca_key, &ca_pem).unwrap();

        let identity = "default.emojivoto.serviceaccount.identity.mesh.cluster.local";
        let csr = csr_for(identity);
        let leaf = issuer
            .sign_csr(&csr, Duration::from_secs(24 * 3600), Duration::from_secs(3600))
            .unwrap();

        let (_, cert) = X509Certificate::from_der(&leaf.der).unwrap();
        let sans: Vec<String> = cert
            .subject_alternative_name()
            .unwrap()
            .map(|ext| {
                ext.value
                    .general_names
                    .iter()
                    .map(|n| format!("{}", n))
                    .collect()
            })
            .unwrap_or_default();
        assert!(sans.iter().any(|n| n.contains(identity)), "{:?}", sans);

        // The leaf verifies against the original issuer certificate.
        let issuer_pem = Pem::iter_from_buffer(ca_pem.as_bytes())
            .next()
            .unwrap()
            .unwrap();
        let issuer_cert = issuer_pem.parse_x509().unwrap();
        cert.verify_signature(Some(issuer_cert.public_key())).unwrap();
    }

    #[test]
    fn leaf_lifetime_is_bounded_by_the_issuer() {
        let (ca_pem, ca_key) = self_signed_ca(30);
        let issuer = Issuer::from_pem(&ca_pem, &ca_key, &ca_pem).unwrap();
        let now = OffsetDateTime::now_utc();

        // Plenty of issuer left: the configured maximum applies.
        let max = Duration::from_secs(24 * 3600);
        let margin = Duration::from_secs(3600);
        assert_eq!(issuer.leaf_lifetime(now, max, margin), Some(max));

        // Close to expiry: remaining minus margin applies.
        let close = issuer.not_after - time::Duration::hours(2);
        let lifetime = issuer.leaf_lifetime(close, max, margin).unwrap();
        assert!(lifetime <= Duration::from_secs(3600));

        // Inside the margin: refuse to sign.
        let inside = issuer.not_after - time::Duration::minutes(30);
        assert_eq!(issuer.leaf_lifetime(inside, max, margin), None);
    }

    #[test]
    fn rejects_mismatched_key() {
        let (ca_pem, _) = self_signed_ca(30);
        let (_, other_key) = self_signed_ca(30);
        assert!(matches!(
            Issuer::from_pem(&ca_pem, &other_key, &ca_pem),
            Err(IssuerError::KeyMismatch)
        ));
    }

    #[test]
    fn rejects_unanchored_issuer() {
        let (ca_pem, ca_key) = self_signed_ca(30);
        let (unrelated_anchor, _) = self_signed_ca(30);
        assert!(matches!(
            Issuer::from_pem(&ca_pem, &ca_key, &unrelated_anchor),
            Err(IssuerError::ChainMismatch)
        ));
    }

    #[test]
    fn invalid_reload_keeps_the_old_signer() {
        let (ca_pem, ca_key) = self_signed_ca(30);
        let issuer = Issuer::from_pem(&ca_pem, &ca_key, &ca_pem).unwrap();
        let original_expiry = issuer.not_after;
        let handle = SignerHandle::new(issuer);

        let bad = Secret {
            data: Some(
                [(
                    ISSUER_CERT_KEY.to_string(),
                    k8s_openapi::ByteString(b"not a cert".to_vec()),
                )]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        };
        handle.reload(&bad, &ca_pem);

        assert!(!handle.is_healthy());
        assert_eq!(handle.snapshot().not_after, original_expiry);
    }
}
