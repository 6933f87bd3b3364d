//! The control-plane binary: boots the shared cluster cache, then serves the
//! destination, identity and injection subsystems until shutdown.
//!
//! Exit codes: 0 on a clean shutdown, 1 on a fatal configuration error, 2 on
//! a fatal runtime error (cache bootstrap failure or unusable signer).

use anyhow::{Context, Result};
use clap::Parser;
use futures::future;
use kube::api::{Api, ListParams};
use kube_mesh_controller::cache::{Cache, ObjectKey};
use kube_mesh_controller::destination::{DestinationService, DiscoveryCaches};
use kube_mesh_controller::identity::issuer::{self, Issuer, SignerHandle};
use kube_mesh_controller::identity::IdentityService;
use kube_mesh_controller::inject::{self, Injector, InjectorDefaults, Webhook};
use kube_mesh_controller::k8s::{Namespace, Secret};
use kube_mesh_controller::{admin, lease, ClusterInfo};
use prometheus_client::metrics::counter::Counter;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, info_span, Instrument};

/// How long the initial list of every watched resource may take before the
/// process gives up and exits for a clean restart.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Parser)]
#[clap(
    name = "kube-mesh-controller",
    about = "Service mesh control plane for Kubernetes",
    version
)]
struct Args {
    #[clap(long, default_value = "info,kube=warn", env = "MESH_CONTROLLER_LOG")]
    log_level: String,

    /// `plain` or `json`.
    #[clap(long, default_value = "plain", env = "MESH_CONTROLLER_LOG_FORMAT")]
    log_format: String,

    #[clap(long, default_value = "0.0.0.0:8086")]
    destination_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8080")]
    identity_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8443")]
    webhook_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    #[clap(long, default_value = "cluster.local")]
    cluster_domain: String,

    #[clap(long, default_value = "identity.mesh.cluster.local")]
    identity_domain: String,

    #[clap(
        long,
        default_value = "mesh-system",
        env = "MESH_CONTROLLER_NAMESPACE"
    )]
    control_plane_namespace: String,

    /// The Secret carrying the issuer certificate and key; watched for
    /// rotation.
    #[clap(long, default_value = "mesh-identity-issuer")]
    issuer_secret: String,

    /// The PEM bundle of trust anchors every issued chain must terminate in.
    #[clap(long)]
    trust_anchors: PathBuf,

    #[clap(long, default_value = "86400")]
    max_certificate_lifetime_seconds: u64,

    /// Floor of one hour: a rotating issuer must never produce a leaf that
    /// outlives its signer.
    #[clap(long, default_value = "3600")]
    certificate_safety_margin_seconds: u64,

    /// YAML file of cluster-default injection settings.
    #[clap(long)]
    inject_defaults: Option<PathBuf>,

    #[clap(long, default_value = "/var/run/mesh/tls/tls.crt")]
    webhook_cert: PathBuf,

    #[clap(long, default_value = "/var/run/mesh/tls/tls.key")]
    webhook_key: PathBuf,

    #[clap(long, default_value = "30")]
    shutdown_grace_period_seconds: u64,

    #[clap(long)]
    disable_heartbeat: bool,
}

fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .with_context(|| format!("invalid log level {}", level))?;
    if format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Configuration errors exit 1; runtime bootstrap errors exit 2.
    if let Err(error) = init_logging(&args.log_level, &args.log_format) {
        eprintln!("{:#}", error);
        std::process::exit(1);
    }
    match run(args).await {
        Ok(()) => {}
        Err(Fatal::Config(error)) => {
            error!("fatal configuration error: {:#}", error);
            std::process::exit(1);
        }
        Err(Fatal::Runtime(error)) => {
            error!("fatal runtime error: {:#}", error);
            std::process::exit(2);
        }
    }
}

enum Fatal {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run(args: Args) -> Result<(), Fatal> {
    let cluster = ClusterInfo {
        cluster_domain: args.cluster_domain.clone(),
        identity_domain: args.identity_domain.clone(),
        control_plane_ns: args.control_plane_namespace.clone(),
    };

    // Read-only configuration inputs, loaded once.
    let trust_anchors = std::fs::read_to_string(&args.trust_anchors)
        .with_context(|| format!("reading trust anchors {}", args.trust_anchors.display()))
        .map_err(Fatal::Config)?;
    let mut defaults = InjectorDefaults::default();
    if let Some(path) = &args.inject_defaults {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading injection defaults {}", path.display()))
            .map_err(Fatal::Config)?;
        let file = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing injection defaults {}", path.display()))
            .map_err(Fatal::Config)?;
        defaults = defaults.with_file(file);
    }

    let client = kube::Client::try_default()
        .await
        .context("building the orchestrator client")
        .map_err(Fatal::Config)?;

    let (close_tx, close_rx) = watch::channel(false);
    let (drain_tx, drain_rx) = drain::channel();

    // The shared cluster cache: one watch task per resource kind.
    let caches = DiscoveryCaches::default();
    let namespaces: Cache<Namespace> = Cache::new();
    let secrets: Cache<Secret> = Cache::new();

    macro_rules! spawn_watch {
        ($cache:expr, $api:expr, $params:expr, $name:literal) => {
            tokio::spawn(
                $cache
                    .clone()
                    .run($api, $params)
                    .instrument(info_span!($name)),
            );
        };
    }

    spawn_watch!(caches.pods, Api::all(client.clone()), ListParams::default(), "pods");
    spawn_watch!(
        caches.services,
        Api::all(client.clone()),
        ListParams::default(),
        "services"
    );
    spawn_watch!(
        caches.endpoint_slices,
        Api::all(client.clone()),
        ListParams::default(),
        "endpointslices"
    );
    spawn_watch!(
        caches.profiles,
        Api::all(client.clone()),
        ListParams::default(),
        "serviceprofiles"
    );
    spawn_watch!(
        caches.traffic_splits,
        Api::all(client.clone()),
        ListParams::default(),
        "trafficsplits"
    );
    spawn_watch!(
        caches.servers,
        Api::all(client.clone()),
        ListParams::default(),
        "servers"
    );
    spawn_watch!(
        caches.server_authorizations,
        Api::all(client.clone()),
        ListParams::default(),
        "serverauthorizations"
    );
    spawn_watch!(
        namespaces,
        Api::all(client.clone()),
        ListParams::default(),
        "namespaces"
    );
    spawn_watch!(
        secrets,
        Api::namespaced(client.clone(), &args.control_plane_namespace),
        ListParams::default().fields(&format!("metadata.name={}", args.issuer_secret)),
        "secrets"
    );

    // A failed list+watch bootstrap is fatal; the orchestrator restarts us
    // cleanly.
    let ready_watches = vec![
        caches.pods.ready(),
        caches.services.ready(),
        caches.endpoint_slices.ready(),
        caches.profiles.ready(),
        caches.traffic_splits.ready(),
        caches.servers.ready(),
        caches.server_authorizations.ready(),
        namespaces.ready(),
        secrets.ready(),
    ];
    tokio::time::timeout(
        BOOTSTRAP_TIMEOUT,
        future::join_all(ready_watches.into_iter().map(await_ready)),
    )
    .await
    .map_err(|_| Fatal::Runtime(anyhow::anyhow!("cache bootstrap timed out")))?;
    info!("cluster cache primed");

    // The signer must be usable before serving certify traffic.
    let issuer_key = ObjectKey::new(&args.control_plane_namespace, &args.issuer_secret);
    let signer = match secrets.get(&issuer_key) {
        Some(secret) => Issuer::from_secret(&secret, &trust_anchors)
            .with_context(|| format!("loading issuer from secret {}", issuer_key))
            .map_err(Fatal::Runtime)?,
        None => {
            return Err(Fatal::Runtime(anyhow::anyhow!(
                "issuer secret {} not found",
                issuer_key
            )))
        }
    };
    let signer = SignerHandle::new(signer);
    tokio::spawn(
        issuer::watch_issuer_secret(
            signer.clone(),
            secrets.clone(),
            issuer_key,
            trust_anchors.clone(),
        )
        .instrument(info_span!("issuer")),
    );

    // Admin endpoint: readiness aggregates the caches and the signer.
    let inject_failures = Counter::default();
    let mut admin = admin::Admin::new();
    admin.registry_mut().register(
        "inject_failures",
        "Admission requests that fell back to allow-unchanged",
        Box::new(inject_failures.clone()),
    );
    {
        let caches = caches.clone();
        let namespaces = namespaces.clone();
        admin.register_check("cluster-cache", move || {
            caches.pods.is_ready()
                && caches.services.is_ready()
                && caches.endpoint_slices.is_ready()
                && caches.profiles.is_ready()
                && caches.traffic_splits.is_ready()
                && caches.servers.is_ready()
                && caches.server_authorizations.is_ready()
                && namespaces.is_ready()
        });
    }
    {
        let signer = signer.clone();
        admin.register_check("issuer", move || signer.is_healthy());
    }
    let admin = Arc::new(admin);
    tokio::spawn(
        admin::serve(args.admin_addr, admin, drain_rx.clone()).instrument(info_span!("admin")),
    );

    // Destination gRPC server.
    let destination =
        DestinationService::new(cluster.clone(), caches.clone(), drain_rx.clone()).svc();
    {
        let addr = args.destination_addr;
        let mut close = close_rx.clone();
        tokio::spawn(
            async move {
                info!(%addr, "destination server listening");
                if let Err(error) = tonic::transport::Server::builder()
                    .add_service(destination)
                    .serve_with_shutdown(addr, async move {
                        let _ = close.changed().await;
                    })
                    .await
                {
                    error!(%error, "destination server failed");
                }
            }
            .instrument(info_span!("destination")),
        );
    }

    // Identity gRPC server.
    let identity = IdentityService::new(
        client.clone(),
        signer,
        cluster.clone(),
        Duration::from_secs(args.max_certificate_lifetime_seconds),
        Duration::from_secs(args.certificate_safety_margin_seconds.max(3600)),
    )
    .svc();
    {
        let addr = args.identity_addr;
        let mut close = close_rx.clone();
        tokio::spawn(
            async move {
                info!(%addr, "identity server listening");
                if let Err(error) = tonic::transport::Server::builder()
                    .add_service(identity)
                    .serve_with_shutdown(addr, async move {
                        let _ = close.changed().await;
                    })
                    .await
                {
                    error!(%error, "identity server failed");
                }
            }
            .instrument(info_span!("identity")),
        );
    }

    // Admission webhook.
    let webhook = Arc::new(Webhook::new(
        Injector::new(defaults, cluster.clone()),
        namespaces.clone(),
        inject_failures,
    ));
    {
        let addr = args.webhook_addr;
        let cert = args.webhook_cert.clone();
        let key = args.webhook_key.clone();
        let drain = drain_rx.clone();
        tokio::spawn(
            async move {
                if let Err(error) = inject::serve(addr, &cert, &key, webhook, drain).await {
                    error!(%error, "admission webhook failed");
                }
            }
            .instrument(info_span!("webhook")),
        );
    }

    // Leader-elected heartbeat.
    if !args.disable_heartbeat {
        let claimant = std::env::var("HOSTNAME").unwrap_or_else(|_| "mesh-controller".to_string());
        let caches = caches.clone();
        let heartbeat = lease::Heartbeat::new(
            client.clone(),
            &args.control_plane_namespace,
            claimant,
            move || {
                caches.pods.generation()
                    + caches.services.generation()
                    + caches.endpoint_slices.generation()
            },
        );
        tokio::spawn(heartbeat.run().instrument(info_span!("heartbeat")));
    }

    // Block on the shutdown signal, then drain with a bounded grace period.
    wait_for_shutdown().await;
    info!("shutting down");
    let _ = close_tx.send(true);
    let grace = Duration::from_secs(args.shutdown_grace_period_seconds);
    if tokio::time::timeout(grace, drain_tx.drain()).await.is_err() {
        info!(?grace, "grace period elapsed; aborting remaining streams");
    }
    Ok(())
}

async fn await_ready(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sig) => sig,
        Err(error) => {
            error!(%error, "failed to register SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
