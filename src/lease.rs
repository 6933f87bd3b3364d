//! A leader-elected heartbeat on a `coordination.k8s.io` Lease.
//!
//! Exactly one control-plane replica holds the lease at a time; the holder
//! renews at half the lease duration and logs a periodic heartbeat with the
//! cache generation counters so operators can see the control plane making
//! progress. Non-holders retry after a full lease duration.

use anyhow::Result;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "mesh-controller-heartbeat";
const LEASE_DURATION: Duration = Duration::from_secs(30);

pub struct Heartbeat {
    api: Api<Lease>,
    claimant: String,

    /// Reported with each heartbeat; typically the summed cache generations.
    progress: Box<dyn Fn() -> u64 + Send + Sync>,
}

// === impl Heartbeat ===

impl Heartbeat {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        claimant: String,
        progress: impl Fn() -> u64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            claimant,
            progress: Box::new(progress),
        }
    }

    /// Runs until the process shuts down. Errors are transient by
    /// definition: the lease exists to be retried.
    pub async fn run(self) {
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    info!(claimant = %self.claimant, "holding heartbeat lease");
                    debug!(progress = (self.progress)(), "heartbeat");
                    tokio::time::sleep(LEASE_DURATION / 2).await;
                }
                Ok(false) => {
                    debug!("another replica holds the heartbeat lease");
                    tokio::time::sleep(LEASE_DURATION).await;
                }
                Err(error) => {
                    warn!(%error, "heartbeat lease update failed");
                    tokio::time::sleep(LEASE_DURATION).await;
                }
            }
        }
    }

    /// Acquires or renews the lease. Returns false when another live holder
    /// has it.
    async fn try_acquire(&self) -> Result<bool> {
        let now = MicroTime(k8s_openapi::chrono::Utc::now());

        let current = match self.api.get(LEASE_NAME).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(err)) if err.code == 404 => {
                let lease = self.lease_body(&now);
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => return Ok(true),
                    // Lost the creation race; observe the winner next tick.
                    Err(kube::Error::Api(err)) if err.code == 409 => return Ok(false),
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => return Err(err.into()),
        };

        let spec = current.spec.clone().unwrap_or_default();
        let holder = spec.holder_identity.as_deref().unwrap_or_default();
        let expired = spec
            .renew_time
            .as_ref()
            .map(|t| {
                let age = k8s_openapi::chrono::Utc::now() - t.0;
                age.num_seconds() >= LEASE_DURATION.as_secs() as i64
            })
            .unwrap_or(true);

        if holder != self.claimant && !expired {
            return Ok(false);
        }

        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.claimant,
                "leaseDurationSeconds": LEASE_DURATION.as_secs(),
                "renewTime": now,
            }
        });
        self.api
            .patch(
                LEASE_NAME,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(true)
    }

    fn lease_body(&self, now: &MicroTime) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.claimant.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now.clone()),
                ..Default::default()
            }),
        }
    }
}
