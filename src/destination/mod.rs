//! The streaming service-discovery server.
//!
//! Every data-plane proxy holds one `Get` stream per authority it talks to
//! and one `GetProfile` stream per authority it routes. Each open stream owns
//! one task; that task is the sole writer to the stream's channel and tears
//! down its cache subscriptions when the client goes away or the process
//! drains.

pub mod endpoints;
pub mod policy;
pub mod profiles;
pub mod target;
pub mod translate;

use crate::cache::Cache;
use crate::k8s::{
    EndpointSlice, Pod, Server, ServerAuthorization, Service, ServiceProfile, TrafficSplit,
};
use crate::proxy_api::destination as proto;
use crate::ClusterInfo;
use endpoints::{IpResolution, Snapshot};
use futures::Stream;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use target::Target;
use tokio::sync::{mpsc, watch};
use tonic::{Request, Response, Status};
use tracing::{debug, info_span, Instrument};
use translate::Translator;

/// The cache handles the discovery server reads from.
#[derive(Clone, Default)]
pub struct DiscoveryCaches {
    pub services: Cache<Service>,
    pub endpoint_slices: Cache<EndpointSlice>,
    pub pods: Cache<Pod>,
    pub profiles: Cache<ServiceProfile>,
    pub traffic_splits: Cache<TrafficSplit>,
    pub servers: Cache<Server>,
    pub server_authorizations: Cache<ServerAuthorization>,
}

/// The JSON object proxies attach as `context_token`. Only the namespace is
/// consumed; it scopes client-namespace profile lookups.
#[derive(Deserialize, Default, Debug)]
struct ContextToken {
    #[serde(default)]
    ns: Option<String>,
}

#[derive(Clone)]
pub struct DestinationService {
    cluster: ClusterInfo,
    caches: DiscoveryCaches,
    drain: drain::Watch,
}

/// A server stream backed by the channel its task writes to. Dropping the
/// stream closes the channel, which the task observes as cancellation.
pub struct ChannelStream<T>(mpsc::Receiver<Result<T, Status>>);

impl<T> Stream for ChannelStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().0.poll_recv(cx)
    }
}

// === impl DestinationService ===

impl DestinationService {
    pub fn new(cluster: ClusterInfo, caches: DiscoveryCaches, drain: drain::Watch) -> Self {
        Self {
            cluster,
            caches,
            drain,
        }
    }

    pub fn svc(self) -> proto::destination_server::DestinationServer<Self> {
        proto::destination_server::DestinationServer::new(self)
    }

    fn client_ns(token: &str) -> Option<String> {
        if token.is_empty() {
            return None;
        }
        serde_json::from_str::<ContextToken>(token)
            .ok()
            .and_then(|t| t.ns)
            .filter(|ns| !ns.is_empty())
    }

    /// Streams endpoint diffs for a named service until the client hangs up
    /// or the process drains.
    fn spawn_endpoint_stream(
        &self,
        tx: mpsc::Sender<Result<proto::Update, Status>>,
        namespace: String,
        name: String,
        port: u16,
        authority: String,
    ) {
        let mut rx = endpoints::watch_endpoints(
            self.caches.clone(),
            self.cluster.clone(),
            namespace,
            name,
            port,
        );
        let drain = self.drain.clone();
        let span = info_span!("get", %authority);

        tokio::spawn(
            async move {
                let mut translator = Translator::new(authority);
                tokio::pin! {
                    let shutdown = drain.signaled();
                }
                loop {
                    let snapshot: Snapshot = rx.borrow_and_update().clone();
                    for update in translator.advance(&snapshot) {
                        if tx.send(Ok(update)).await.is_err() {
                            return;
                        }
                    }
                    tokio::select! {
                        res = rx.changed() => {
                            if res.is_err() {
                                return;
                            }
                        }
                        _ = tx.closed() => return,
                        _ = (&mut shutdown) => {
                            debug!("shutdown; closing stream");
                            return;
                        }
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Sends a fixed set of updates, then holds the stream open until the
    /// client hangs up or the process drains.
    fn spawn_static_stream(
        &self,
        tx: mpsc::Sender<Result<proto::Update, Status>>,
        updates: Vec<proto::Update>,
    ) {
        let drain = self.drain.clone();
        tokio::spawn(async move {
            for update in updates {
                if tx.send(Ok(update)).await.is_err() {
                    return;
                }
            }
            tokio::select! {
                _ = tx.closed() => {}
                _ = drain.signaled() => {}
            }
        });
    }

    fn spawn_profile_stream(
        &self,
        tx: mpsc::Sender<Result<proto::DestinationProfile, Status>>,
        mut rx: watch::Receiver<proto::DestinationProfile>,
    ) {
        let drain = self.drain.clone();
        tokio::spawn(async move {
            tokio::pin! {
                let shutdown = drain.signaled();
            }
            loop {
                let profile = rx.borrow_and_update().clone();
                if tx.send(Ok(profile)).await.is_err() {
                    return;
                }
                tokio::select! {
                    res = rx.changed() => {
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = tx.closed() => return,
                    _ = (&mut shutdown) => return,
                }
            }
        });
    }

    fn spawn_static_profile(
        &self,
        tx: mpsc::Sender<Result<proto::DestinationProfile, Status>>,
        profile: proto::DestinationProfile,
    ) {
        let drain = self.drain.clone();
        tokio::spawn(async move {
            if tx.send(Ok(profile)).await.is_err() {
                return;
            }
            tokio::select! {
                _ = tx.closed() => {}
                _ = drain.signaled() => {}
            }
        });
    }
}

#[tonic::async_trait]
impl proto::destination_server::Destination for DestinationService {
    type GetStream = ChannelStream<proto::Update>;

    async fn get(
        &self,
        req: Request<proto::GetDestination>,
    ) -> Result<Response<Self::GetStream>, Status> {
        let get = req.into_inner();
        let target = Target::parse(&get.path, &self.cluster.cluster_domain)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        debug!(path = %get.path, ?target, "resolving");

        let (tx, rx) = mpsc::channel(32);
        match target {
            Target::Service {
                namespace,
                name,
                port,
            } => {
                self.spawn_endpoint_stream(tx, namespace, name, port, get.path.clone());
            }
            Target::Ip(ip, port) => {
                match endpoints::resolve_ip(&self.caches, &self.cluster, ip, port) {
                    IpResolution::Pod(addr, meta) => {
                        self.spawn_static_stream(
                            tx,
                            vec![translate::single_addr(addr, &meta, &get.path)],
                        );
                    }
                    IpResolution::Service(key) => {
                        self.spawn_endpoint_stream(
                            tx,
                            key.namespace,
                            key.name,
                            port,
                            get.path.clone(),
                        );
                    }
                    IpResolution::Unknown => {
                        self.spawn_static_stream(tx, vec![translate::no_endpoints(false)]);
                    }
                }
            }
            Target::External { .. } => {
                // Out-of-cluster names resolve to the authoritative unresolved
                // sentinel; the proxy forwards opaquely.
                self.spawn_static_stream(tx, vec![translate::no_endpoints(false)]);
            }
        }

        Ok(Response::new(ChannelStream(rx)))
    }

    type GetProfileStream = ChannelStream<proto::DestinationProfile>;

    async fn get_profile(
        &self,
        req: Request<proto::GetDestination>,
    ) -> Result<Response<Self::GetProfileStream>, Status> {
        let get = req.into_inner();
        let target = Target::parse(&get.path, &self.cluster.cluster_domain)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;
        let client_ns = Self::client_ns(&get.context_token);
        debug!(path = %get.path, ?target, ?client_ns, "resolving profile");

        let (tx, rx) = mpsc::channel(32);
        match target {
            Target::Service {
                namespace,
                name,
                port,
            } => {
                let watch = profiles::watch_profile(
                    self.caches.clone(),
                    self.cluster.clone(),
                    namespace,
                    name,
                    port,
                    client_ns,
                );
                self.spawn_profile_stream(tx, watch);
            }
            Target::Ip(ip, port) => {
                match endpoints::resolve_ip(&self.caches, &self.cluster, ip, port) {
                    IpResolution::Service(key) => {
                        let watch = profiles::watch_profile(
                            self.caches.clone(),
                            self.cluster.clone(),
                            key.namespace,
                            key.name,
                            port,
                            client_ns,
                        );
                        self.spawn_profile_stream(tx, watch);
                    }
                    _ => self.spawn_static_profile(tx, profiles::default_profile("")),
                }
            }
            Target::External { host, .. } => {
                self.spawn_static_profile(tx, profiles::default_profile(&host));
            }
        }

        Ok(Response::new(ChannelStream(rx)))
    }
}
