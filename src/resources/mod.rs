//! The watchable resource-set capability.
//!
//! Each of the three watched kinds (namespaces, API-key secrets, pods)
//! exposes the same operations; the reconciler holds them as an ordered
//! sequence and treats them uniformly. Kind-specific conversion and
//! relevance logic lives entirely behind these traits: [`ResourceOps`] is
//! the pure part (relevance, conversion, cache bookkeeping) and
//! [`WatchableResourceSet`] adds the list/watch transport on top.

pub mod namespaces;
pub mod pods;
pub mod secrets;

use async_trait::async_trait;
use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Namespace as K8sNamespace, Pod as K8sPod, Secret as K8sSecret};
use kube::core::WatchEvent;
use kube::Client;
use tracing::debug;

use crate::cache::Cache;
use crate::error::Error;

/// The change kinds a watch stream can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// A raw cluster object as received from a watch stream
#[derive(Debug, Clone)]
pub enum RawObject {
    Namespace(Box<K8sNamespace>),
    Pod(Box<K8sPod>),
    Secret(Box<K8sSecret>),
}

/// A converted routing model value
#[derive(Debug, Clone)]
pub enum ResourceModel {
    Namespace(namespaces::Namespace),
    Pod(pods::PodWithRoutes),
    Secret(secrets::Secret),
}

impl ResourceModel {
    /// Cache key of the model
    pub fn id(&self) -> &str {
        match self {
            ResourceModel::Namespace(ns) => ns.id(),
            ResourceModel::Pod(pod) => pod.id(),
            ResourceModel::Secret(secret) => secret.id(),
        }
    }

    /// Content hash over the routing-relevant fields
    pub fn hash(&self) -> u64 {
        match self {
            ResourceModel::Namespace(ns) => ns.hash(),
            ResourceModel::Pod(pod) => pod.hash(),
            ResourceModel::Secret(secret) => secret.hash(),
        }
    }
}

/// A change subscription: terminates on transport loss, recovery is the
/// reconciler's job
pub type EventStream = BoxStream<'static, Result<(EventKind, RawObject), kube::Error>>;

/// Pure, kind-specific resource-set logic.
///
/// `to_model` is total on objects for which `is_relevant` returns true; it
/// returns `None` only for objects of a foreign kind, which the event
/// routing in [`process_event`] never produces.
pub trait ResourceOps: Send + Sync {
    /// Resource kind, for logging
    fn kind(&self) -> &'static str;

    /// Cheap relevance filter on a raw object
    fn is_relevant(&self, raw: &RawObject) -> bool;

    /// Convert a raw object to the routing model, precomputing its hash
    fn to_model(&self, raw: &RawObject) -> Option<ResourceModel>;

    /// Extract the cache key without a full conversion
    fn id_of(&self, raw: &RawObject) -> String;

    /// Insert the model into its cache bucket
    fn cache_add(&self, cache: &mut Cache, model: ResourceModel);

    /// Remove the entry with the given id from the cache bucket
    fn cache_remove(&self, cache: &mut Cache, id: &str);

    /// Compare a new model against the cached entry by content hash;
    /// false when the entry is absent
    fn cache_equals(&self, cache: &Cache, model: &ResourceModel) -> bool;
}

/// A resource set that can also list current cluster state and subscribe to
/// changes
#[async_trait]
pub trait WatchableResourceSet: ResourceOps {
    /// List all currently relevant objects converted to the model, plus the
    /// resource version subsequent watches may resume from
    async fn list(&self) -> Result<(Vec<ResourceModel>, String), Error>;

    /// Open a change subscription starting strictly after `resource_version`
    async fn watch(&self, resource_version: &str) -> Result<EventStream, Error>;
}

/// Couples pure resource-set logic with the API client that lists and
/// watches it
pub struct Watchable<O> {
    pub ops: O,
    pub(crate) client: Client,
}

impl<O> Watchable<O> {
    pub fn new(ops: O, client: Client) -> Self {
        Self { ops, client }
    }
}

impl<O: ResourceOps> ResourceOps for Watchable<O> {
    fn kind(&self) -> &'static str {
        self.ops.kind()
    }

    fn is_relevant(&self, raw: &RawObject) -> bool {
        self.ops.is_relevant(raw)
    }

    fn to_model(&self, raw: &RawObject) -> Option<ResourceModel> {
        self.ops.to_model(raw)
    }

    fn id_of(&self, raw: &RawObject) -> String {
        self.ops.id_of(raw)
    }

    fn cache_add(&self, cache: &mut Cache, model: ResourceModel) {
        self.ops.cache_add(cache, model)
    }

    fn cache_remove(&self, cache: &mut Cache, id: &str) {
        self.ops.cache_remove(cache, id)
    }

    fn cache_equals(&self, cache: &Cache, model: &ResourceModel) -> bool {
        self.ops.cache_equals(cache, model)
    }
}

/// Apply one watch event to the cache through the resource-set capability.
///
/// Returns true when the cache materially changed and nginx needs a reload:
/// - added + relevant: insert, material
/// - deleted: remove, material
/// - modified + relevant: replace when the content hash differs
/// - modified + no longer relevant: remove, material
pub fn process_event<S: ResourceOps + ?Sized>(
    cache: &mut Cache,
    set: &S,
    kind: EventKind,
    raw: &RawObject,
) -> bool {
    debug!(kind = set.kind(), id = %set.id_of(raw), event = ?kind, "processing event");

    match kind {
        EventKind::Added => {
            if set.is_relevant(raw) {
                if let Some(model) = set.to_model(raw) {
                    set.cache_add(cache, model);
                    return true;
                }
            }
            false
        }
        EventKind::Deleted => {
            set.cache_remove(cache, &set.id_of(raw));
            true
        }
        EventKind::Modified => {
            if set.is_relevant(raw) {
                let Some(model) = set.to_model(raw) else {
                    return false;
                };
                if set.cache_equals(cache, &model) {
                    false
                } else {
                    set.cache_add(cache, model);
                    true
                }
            } else {
                set.cache_remove(cache, &set.id_of(raw));
                true
            }
        }
    }
}

/// Adapt a raw kube watch stream into an [`EventStream`].
///
/// Bookmarks are skipped; an error payload from the API server (for example
/// 410 Gone) surfaces as an `Err` item, after which the reader tears the
/// generation down.
pub(crate) fn adapt_watch_stream<K, F>(
    stream: impl Stream<Item = kube::Result<WatchEvent<K>>> + Send + 'static,
    wrap: F,
) -> EventStream
where
    K: Send + 'static,
    F: Fn(K) -> RawObject + Send + 'static,
{
    stream
        .filter_map(move |item| {
            let mapped = match item {
                Ok(WatchEvent::Added(obj)) => Some(Ok((EventKind::Added, wrap(obj)))),
                Ok(WatchEvent::Modified(obj)) => Some(Ok((EventKind::Modified, wrap(obj)))),
                Ok(WatchEvent::Deleted(obj)) => Some(Ok((EventKind::Deleted, wrap(obj)))),
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(response)) => Some(Err(kube::Error::Api(response))),
                Err(error) => Some(Err(error)),
            };
            future::ready(mapped)
        })
        .boxed()
}
