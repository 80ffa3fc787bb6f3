//! Namespace resource set.
//!
//! Routable namespaces carry a JSON map of `hostname -> host options` in a
//! configurable annotation plus organization/environment labels. Invalid
//! hostnames or malformed SSL sub-objects drop that host with a log line;
//! the namespace itself survives.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace as K8sNamespace;
use kube::api::{Api, ListParams, WatchParams};
use serde::Deserialize;
use tracing::warn;

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::hash::ContentHasher;
use crate::validation;

use super::{
    adapt_watch_stream, EventStream, RawObject, ResourceModel, ResourceOps, Watchable,
    WatchableResourceSet,
};

/// Routing information projected from a cluster namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Namespace {
    pub name: String,
    pub hosts: BTreeMap<String, HostOptions>,
    pub organization: String,
    pub environment: String,
    hash: u64,
}

/// Per-host options from the hosts annotation
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct HostOptions {
    #[serde(default)]
    pub ssl: Option<SslOptions>,
}

/// TLS material references for a host; each ref names a field of the
/// namespace's routing secret
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct SslOptions {
    #[serde(default)]
    pub certificate: OptionValue,
    #[serde(default, rename = "certificateKey")]
    pub certificate_key: OptionValue,
    #[serde(default, rename = "clientCertificate")]
    pub client_certificate: Option<OptionValue>,
}

/// An indirect value sourced from a secret field
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct OptionValue {
    #[serde(default, rename = "valueFrom")]
    pub value_from: Option<ValueFrom>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ValueFrom {
    #[serde(default, rename = "secretKeyRef")]
    pub secret_key_ref: Option<SecretKeyRef>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SecretKeyRef {
    pub key: String,
}

impl OptionValue {
    /// The named secret field, when the reference is complete
    pub fn secret_field(&self) -> Option<&str> {
        self.value_from
            .as_ref()?
            .secret_key_ref
            .as_ref()
            .map(|r| r.key.as_str())
    }
}

impl Namespace {
    /// Build a namespace model, precomputing the content hash over the
    /// fields the renderer reads (hosts with their SSL refs, organization,
    /// environment).
    pub fn new(
        name: String,
        hosts: BTreeMap<String, HostOptions>,
        organization: String,
        environment: String,
    ) -> Self {
        let mut hasher = ContentHasher::new();
        for (host, options) in &hosts {
            hasher.write_str(host);
            match &options.ssl {
                None => hasher.write_opt(None),
                Some(ssl) => {
                    hasher.write_opt_str(ssl.certificate.secret_field());
                    hasher.write_opt_str(ssl.certificate_key.secret_field());
                    hasher.write_opt_str(
                        ssl.client_certificate
                            .as_ref()
                            .and_then(OptionValue::secret_field),
                    );
                }
            }
        }
        hasher.write_str(&organization);
        hasher.write_str(&environment);

        Self {
            name,
            hosts,
            organization,
            environment,
            hash: hasher.finish(),
        }
    }

    pub fn id(&self) -> &str {
        &self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// All valid hosts from the configured hosts annotation on a namespace
pub fn hosts_from_namespace(
    config: &Config,
    namespace: &K8sNamespace,
) -> BTreeMap<String, HostOptions> {
    let name = namespace.metadata.name.as_deref().unwrap_or_default();
    let Some(annotation) = namespace
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&config.namespace_hosts_annotation))
    else {
        return BTreeMap::new();
    };

    let mut hosts: BTreeMap<String, HostOptions> = match serde_json::from_str(annotation) {
        Ok(hosts) => hosts,
        Err(error) => {
            warn!(
                namespace = name,
                annotation = %config.namespace_hosts_annotation,
                %error,
                "hosts annotation is not valid JSON"
            );
            return BTreeMap::new();
        }
    };

    hosts.retain(|host, options| {
        if !validation::is_valid_host(host) {
            warn!(namespace = name, host, "dropping host: not a valid hostname or ip");
            return false;
        }

        if let Some(ssl) = &options.ssl {
            if let Err(reason) = validate_ssl_options(ssl) {
                warn!(namespace = name, host, reason = %reason, "dropping host: invalid ssl options");
                return false;
            }
        }

        true
    });

    hosts
}

fn validate_ssl_options(options: &SslOptions) -> Result<(), String> {
    if options.certificate.secret_field().is_none() {
        return Err("certificate option is missing a secretKeyRef".to_string());
    }
    if options.certificate_key.secret_field().is_none() {
        return Err("certificateKey option is missing a secretKeyRef".to_string());
    }
    if let Some(client) = &options.client_certificate {
        if client.secret_field().is_none() {
            return Err("clientCertificate option is missing a secretKeyRef".to_string());
        }
    }
    Ok(())
}

/// Convert a cluster namespace into the routing model
pub fn model_from(config: &Config, namespace: &K8sNamespace) -> Namespace {
    let labels = namespace.metadata.labels.clone().unwrap_or_default();
    Namespace::new(
        namespace.metadata.name.clone().unwrap_or_default(),
        hosts_from_namespace(config, namespace),
        labels
            .get(&config.namespace_org_label)
            .cloned()
            .unwrap_or_default(),
        labels
            .get(&config.namespace_env_label)
            .cloned()
            .unwrap_or_default(),
    )
}

/// Pure namespace-set logic
pub struct NamespaceOps {
    config: Arc<Config>,
}

impl NamespaceOps {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ResourceOps for NamespaceOps {
    fn kind(&self) -> &'static str {
        "namespace"
    }

    fn is_relevant(&self, raw: &RawObject) -> bool {
        let RawObject::Namespace(namespace) = raw else {
            return false;
        };
        let empty = BTreeMap::new();
        let labels = namespace.metadata.labels.as_ref().unwrap_or(&empty);
        self.config.routable_selector.matches(labels)
    }

    fn to_model(&self, raw: &RawObject) -> Option<ResourceModel> {
        let RawObject::Namespace(namespace) = raw else {
            return None;
        };
        Some(ResourceModel::Namespace(model_from(&self.config, namespace)))
    }

    fn id_of(&self, raw: &RawObject) -> String {
        let RawObject::Namespace(namespace) = raw else {
            return String::new();
        };
        namespace.metadata.name.clone().unwrap_or_default()
    }

    fn cache_add(&self, cache: &mut Cache, model: ResourceModel) {
        if let ResourceModel::Namespace(namespace) = model {
            cache.namespaces.insert(namespace.name.clone(), namespace);
        }
    }

    fn cache_remove(&self, cache: &mut Cache, id: &str) {
        cache.namespaces.remove(id);
    }

    fn cache_equals(&self, cache: &Cache, model: &ResourceModel) -> bool {
        cache
            .namespaces
            .get(model.id())
            .is_some_and(|cached| cached.hash() == model.hash())
    }
}

/// Namespace set bound to an API client
pub type NamespaceSet = Watchable<NamespaceOps>;

#[async_trait]
impl WatchableResourceSet for NamespaceSet {
    async fn list(&self) -> Result<(Vec<ResourceModel>, String), Error> {
        let api: Api<K8sNamespace> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&self.ops.config.routable_label_selector);
        let list = api.list(&params).await?;

        let version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .iter()
            .map(|namespace| ResourceModel::Namespace(model_from(&self.ops.config, namespace)))
            .collect();

        Ok((items, version))
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream, Error> {
        let api: Api<K8sNamespace> = Api::all(self.client.clone());
        let params = WatchParams::default().labels(&self.ops.config.routable_label_selector);
        let stream = api.watch(&params, resource_version).await?;

        Ok(adapt_watch_stream(stream, |namespace| {
            RawObject::Namespace(Box::new(namespace))
        }))
    }
}
