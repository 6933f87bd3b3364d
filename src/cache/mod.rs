//! A read-mostly, watch-driven cache of cluster resources.
//!
//! One `Cache<T>` exists per resource kind. A single task per cache consumes
//! the orchestrator's watch stream and applies events to an indexed store;
//! readers take point lookups, filtered listings, or subscriptions. Each
//! subscription is an ordered event channel that always begins with a
//! snapshot of the current state, so a subscriber can never observe deltas
//! without a base.
//!
//! Events are fanned out on unbounded channels; subscribers must consume
//! them as they are sent so that the channels do not grow without bound.
//! Consecutive updates for a key may be coalesced by a slow consumer's
//! buffering, but deletes are always delivered.

use ahash::AHashMap as HashMap;
use futures::TryStreamExt;
use kube::api::{Api, ListParams};
use kube::runtime::watcher;
use kube::ResourceExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Identifies one object in one kind's store. Cluster-scoped objects use an
/// empty namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A typed store event, delivered in order per subscription.
#[derive(Debug)]
pub enum Event<T> {
    /// The object appeared.
    Added(Arc<T>),

    /// The object changed; both states are provided so that consumers can
    /// diff without keeping their own copy.
    Updated { old: Arc<T>, new: Arc<T> },

    /// The object is gone. The final observed state rides along.
    Deleted { key: ObjectKey, last: Arc<T> },

    /// The watch was (re-)established; this is the full current state for
    /// the subscription's filter. Sent once on subscribe and again on every
    /// re-list so a transient disconnect cannot leave the subscriber stale.
    Restarted(Vec<Arc<T>>),
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Event::Added(obj) => Event::Added(obj.clone()),
            Event::Updated { old, new } => Event::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            Event::Deleted { key, last } => Event::Deleted {
                key: key.clone(),
                last: last.clone(),
            },
            Event::Restarted(objs) => Event::Restarted(objs.clone()),
        }
    }
}

/// Selects the slice of a store a subscriber or listing cares about. All set
/// fields must match; an empty filter selects everything.
#[derive(Clone, Debug, Default)]
pub struct Filter {
    pub namespace: Option<String>,
    pub name: Option<String>,

    /// Equality label requirements.
    pub labels: Option<BTreeMap<String, String>>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: &ObjectKey) -> Self {
        Self {
            namespace: Some(key.namespace.clone()),
            name: Some(key.name.clone()),
            ..Self::default()
        }
    }

    pub fn namespace(ns: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    fn matches(&self, key: &ObjectKey, labels: &BTreeMap<String, String>) -> bool {
        if let Some(ns) = &self.namespace {
            if *ns != key.namespace {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if *name != key.name {
                return false;
            }
        }
        if let Some(required) = &self.labels {
            if !crate::k8s::labels::map_matches(required, labels) {
                return false;
            }
        }
        true
    }
}

/// The consuming half of a subscription.
pub struct Subscription<T> {
    rx: mpsc::UnboundedReceiver<Event<T>>,
}

impl<T> Subscription<T> {
    /// Awaits the next event. `None` once the cache has shut down.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        self.rx.recv().await
    }
}

struct Subscriber<T> {
    filter: Filter,
    tx: mpsc::UnboundedSender<Event<T>>,
}

struct State<T> {
    store: RwLock<HashMap<ObjectKey, (Arc<T>, BTreeMap<String, String>)>>,
    subscribers: Mutex<Vec<Subscriber<T>>>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
    generation: AtomicU64,
}

/// A live, indexed view of one resource kind. Cloning yields another handle
/// onto the same store.
pub struct Cache<T> {
    state: Arc<State<T>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Cache<T> {
    pub fn new() -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        Self {
            state: Arc::new(State {
                store: RwLock::new(HashMap::new()),
                subscribers: Mutex::new(Vec::new()),
                ready_tx,
                ready_rx,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// True once the initial list has been applied.
    pub fn is_ready(&self) -> bool {
        *self.state.ready_rx.borrow()
    }

    /// A watch that flips to `true` when the initial list lands.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.state.ready_rx.clone()
    }

    /// Counts every applied store mutation; a cheap liveness signal.
    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> {
        self.state.store.read().get(key).map(|(obj, _)| obj.clone())
    }

    pub fn list(&self, filter: &Filter) -> Vec<Arc<T>> {
        self.state
            .store
            .read()
            .iter()
            .filter(|(key, (_, labels))| filter.matches(key, labels))
            .map(|(_, (obj, _))| obj.clone())
            .collect()
    }

    /// Registers a subscriber. The current matching state is delivered first
    /// as `Event::Restarted`, then ordered deltas follow.
    pub fn subscribe(&self, filter: Filter) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Registration and the snapshot happen under the subscriber lock so
        // no delta can slip between them; the snapshot goes through the
        // channel so it is ordered before whatever the watch task fans out
        // next.
        let mut subscribers = self.state.subscribers.lock();
        let snapshot = self.list(&filter);
        let _ = tx.send(Event::Restarted(snapshot));
        subscribers.push(Subscriber { filter, tx });
        Subscription { rx }
    }

    /// Delivers `event` to every subscriber whose filter matches the key
    /// under any of the given label sets. An object whose labels changed is
    /// matched under both its old and new labels so that label-filtered
    /// subscribers observe it entering or leaving their slice.
    fn broadcast(&self, key: &ObjectKey, label_sets: &[&BTreeMap<String, String>], event: &Event<T>) {
        self.state.generation.fetch_add(1, Ordering::Relaxed);
        self.state.subscribers.lock().retain(|sub| {
            let matched = label_sets.iter().any(|ls| sub.filter.matches(key, ls));
            !matched || sub.tx.send(event.clone()).is_ok()
        });
    }
}

impl<T> Cache<T>
where
    T: kube::Resource<DynamicType = ()>,
{
    fn key_of(obj: &T) -> ObjectKey {
        ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name())
    }

    pub(crate) fn apply(&self, obj: T) {
        let key = Self::key_of(&obj);
        let labels = obj.labels().clone();
        let new = Arc::new(obj);
        let old = self
            .state
            .store
            .write()
            .insert(key.clone(), (new.clone(), labels.clone()));
        match old {
            None => self.broadcast(&key, &[&labels], &Event::Added(new)),
            Some((old, old_labels)) => {
                let event = Event::Updated { old, new };
                if old_labels == labels {
                    self.broadcast(&key, &[&labels], &event);
                } else {
                    self.broadcast(&key, &[&old_labels, &labels], &event);
                }
            }
        }
    }

    pub(crate) fn delete(&self, obj: T) {
        let key = Self::key_of(&obj);
        if let Some((last, labels)) = self.state.store.write().remove(&key) {
            self.broadcast(
                &key,
                &[&labels],
                &Event::Deleted {
                    key: key.clone(),
                    last,
                },
            );
        }
    }

    pub(crate) fn restart(&self, objs: Vec<T>) {
        let mut fresh = HashMap::with_capacity(objs.len());
        for obj in objs {
            let key = Self::key_of(&obj);
            let labels = obj.labels().clone();
            fresh.insert(key, (Arc::new(obj), labels));
        }
        *self.state.store.write() = fresh;
        self.state.generation.fetch_add(1, Ordering::Relaxed);

        // Every subscriber gets the full matching state again; consumers diff
        // against what they last forwarded so a re-list is invisible to their
        // own clients.
        let store = self.state.store.read();
        self.state.subscribers.lock().retain(|sub| {
            let snapshot = store
                .iter()
                .filter(|(key, (_, labels))| sub.filter.matches(key, labels))
                .map(|(_, (obj, _))| obj.clone())
                .collect();
            sub.tx.send(Event::Restarted(snapshot)).is_ok()
        });
        drop(store);

        let _ = self.state.ready_tx.send(true);
    }
}

impl<T> Cache<T>
where
    T: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
{
    /// Drives this cache from the orchestrator's watch API until the process
    /// shuts down. Transient failures back off exponentially with jitter
    /// while readers keep being served from the last known state.
    pub async fn run(self, api: Api<T>, params: ListParams) {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(30));
        let mut stream = Box::pin(watcher(api, params));
        loop {
            match stream.try_next().await {
                Ok(Some(watcher::Event::Applied(obj))) => {
                    backoff.reset();
                    self.apply(obj);
                }
                Ok(Some(watcher::Event::Deleted(obj))) => {
                    backoff.reset();
                    self.delete(obj);
                }
                Ok(Some(watcher::Event::Restarted(objs))) => {
                    backoff.reset();
                    debug!(count = objs.len(), "watch (re-)established");
                    self.restart(objs);
                }
                Ok(None) => return,
                Err(error) => {
                    let delay = backoff.advance();
                    warn!(%error, ?delay, "watch stream failed; backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Exponential backoff with full jitter.
struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn advance(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let cap = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        cap.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::k8s::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(ns: &str, name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn event_sequence_equals_fresh_list() {
        let cache = Cache::<Pod>::new();
        cache.restart(vec![pod("default", "a", &[]), pod("default", "b", &[])]);
        cache.apply(pod("default", "c", &[]));
        cache.apply(pod("default", "a", &[("touched", "yes")]));
        cache.delete(pod("default", "b", &[]));

        let mut names: Vec<_> = cache
            .list(&Filter::all())
            .iter()
            .map(|p| p.metadata.name.clone().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a", "c"]);
        assert!(cache.is_ready());
    }

    #[tokio::test]
    async fn subscription_snapshot_precedes_deltas() {
        let cache = Cache::<Pod>::new();
        cache.restart(vec![pod("default", "a", &[])]);

        let mut sub = cache.subscribe(Filter::namespace("default"));
        cache.apply(pod("default", "b", &[]));

        match sub.recv().await.unwrap() {
            Event::Restarted(snapshot) => assert_eq!(snapshot.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }
        match sub.recv().await.unwrap() {
            Event::Added(p) => assert_eq!(p.metadata.name.as_deref(), Some("b")),
            other => panic!("expected add, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn updates_are_typed_and_deletes_survive() {
        let cache = Cache::<Pod>::new();
        cache.restart(vec![]);
        let mut sub = cache.subscribe(Filter::key(&ObjectKey::new("default", "a")));
        assert!(matches!(sub.recv().await.unwrap(), Event::Restarted(s) if s.is_empty()));

        cache.apply(pod("default", "a", &[]));
        cache.apply(pod("default", "a", &[("v", "2")]));
        cache.delete(pod("default", "a", &[]));

        assert!(matches!(sub.recv().await.unwrap(), Event::Added(_)));
        assert!(matches!(sub.recv().await.unwrap(), Event::Updated { .. }));
        match sub.recv().await.unwrap() {
            Event::Deleted { key, .. } => assert_eq!(key, ObjectKey::new("default", "a")),
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn relist_redelivers_state_to_subscribers() {
        let cache = Cache::<Pod>::new();
        cache.restart(vec![pod("default", "a", &[])]);
        let mut sub = cache.subscribe(Filter::all());
        let _ = sub.recv().await.unwrap();

        // A re-list that happens to contain the same state still reaches the
        // subscriber so it can re-diff after a disconnect.
        cache.restart(vec![pod("default", "a", &[])]);
        match sub.recv().await.unwrap() {
            Event::Restarted(snapshot) => assert_eq!(snapshot.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn label_filtered_subscription() {
        let cache = Cache::<Pod>::new();
        cache.restart(vec![]);
        let mut sub =
            cache.subscribe(Filter::all().with_label("kubernetes.io/service-name", "web"));
        let _ = sub.recv().await.unwrap();

        cache.apply(pod("default", "web-abc", &[("kubernetes.io/service-name", "web")]));
        cache.apply(pod("default", "other", &[]));
        cache.apply(pod("default", "web-def", &[("kubernetes.io/service-name", "web")]));

        let mut seen = Vec::new();
        for _ in 0..2 {
            match sub.recv().await.unwrap() {
                Event::Added(p) => seen.push(p.metadata.name.clone().unwrap()),
                other => panic!("expected add, got {:?}", other),
            }
        }
        assert_eq!(seen, vec!["web-abc", "web-def"]);
    }
}
