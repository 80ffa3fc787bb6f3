//! Routing-secret resource set.
//!
//! Only secrets named like the configured routing secret are relevant; each
//! namespace holds at most one. The configured routing-key field is captured
//! separately, the full field map is retained for TLS material lookup.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret as K8sSecret;
use kube::api::{Api, ListParams, WatchParams};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::hash::ContentHasher;

use super::{
    adapt_watch_stream, EventStream, RawObject, ResourceModel, ResourceOps, Watchable,
    WatchableResourceSet,
};

/// The routing secret of one namespace
#[derive(Debug, Clone, PartialEq)]
pub struct Secret {
    pub namespace: String,
    /// Raw bytes of the configured API-key field, when present
    pub routing_key: Option<Vec<u8>>,
    /// All secret fields, for TLS material lookup
    pub fields: BTreeMap<String, Vec<u8>>,
    hash: u64,
}

impl Secret {
    /// Build a secret model, precomputing the content hash over the routing
    /// key and the sorted field map.
    pub fn new(
        namespace: String,
        routing_key: Option<Vec<u8>>,
        fields: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.write_opt(routing_key.as_deref());
        for (field, value) in &fields {
            hasher.write_str(field);
            hasher.write(value);
        }

        Self {
            namespace,
            routing_key,
            fields,
            hash: hasher.finish(),
        }
    }

    pub fn id(&self) -> &str {
        &self.namespace
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }
}

/// Convert a cluster secret into the routing model
pub fn model_from(config: &Config, secret: &K8sSecret) -> Secret {
    let fields: BTreeMap<String, Vec<u8>> = secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(field, bytes)| (field.clone(), bytes.0.clone()))
                .collect()
        })
        .unwrap_or_default();

    Secret::new(
        secret.metadata.namespace.clone().unwrap_or_default(),
        fields.get(&config.api_key_secret_data_field).cloned(),
        fields,
    )
}

/// Pure secret-set logic
pub struct SecretOps {
    config: Arc<Config>,
}

impl SecretOps {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ResourceOps for SecretOps {
    fn kind(&self) -> &'static str {
        "secret"
    }

    fn is_relevant(&self, raw: &RawObject) -> bool {
        let RawObject::Secret(secret) = raw else {
            return false;
        };
        secret.metadata.name.as_deref() == Some(self.config.api_key_secret.as_str())
    }

    fn to_model(&self, raw: &RawObject) -> Option<ResourceModel> {
        let RawObject::Secret(secret) = raw else {
            return None;
        };
        Some(ResourceModel::Secret(model_from(&self.config, secret)))
    }

    fn id_of(&self, raw: &RawObject) -> String {
        let RawObject::Secret(secret) = raw else {
            return String::new();
        };
        secret.metadata.namespace.clone().unwrap_or_default()
    }

    fn cache_add(&self, cache: &mut Cache, model: ResourceModel) {
        if let ResourceModel::Secret(secret) = model {
            cache.secrets.insert(secret.namespace.clone(), secret);
        }
    }

    fn cache_remove(&self, cache: &mut Cache, id: &str) {
        cache.secrets.remove(id);
    }

    fn cache_equals(&self, cache: &Cache, model: &ResourceModel) -> bool {
        cache
            .secrets
            .get(model.id())
            .is_some_and(|cached| cached.hash() == model.hash())
    }
}

/// Secret set bound to an API client
pub type SecretSet = Watchable<SecretOps>;

#[async_trait]
impl WatchableResourceSet for SecretSet {
    async fn list(&self) -> Result<(Vec<ResourceModel>, String), Error> {
        let api: Api<K8sSecret> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        let version = list.metadata.resource_version.clone().unwrap_or_default();
        // Secret names are not selectable server-side; filter here
        let items = list
            .items
            .iter()
            .filter(|secret| secret.metadata.name.as_deref() == Some(self.ops.config.api_key_secret.as_str()))
            .map(|secret| ResourceModel::Secret(model_from(&self.ops.config, secret)))
            .collect();

        Ok((items, version))
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream, Error> {
        let api: Api<K8sSecret> = Api::all(self.client.clone());
        let stream = api.watch(&WatchParams::default(), resource_version).await?;

        Ok(adapt_watch_stream(stream, |secret| {
            RawObject::Secret(Box::new(secret))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn test_config() -> Config {
        Config::from_lookup(|_| None).expect("default config")
    }

    fn k8s_secret(name: &str, namespace: &str, fields: &[(&str, &[u8])]) -> K8sSecret {
        let data: BTreeMap<String, ByteString> = fields
            .iter()
            .map(|(field, value)| (field.to_string(), ByteString(value.to_vec())))
            .collect();

        K8sSecret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn id_is_the_namespace() {
        let config = test_config();
        let secret = model_from(&config, &k8s_secret("routing", "ns1", &[("api-key", b"ABC")]));
        assert_eq!(secret.id(), "ns1");
    }

    #[test]
    fn routing_key_is_captured_from_the_configured_field() {
        let config = test_config();

        let with_key = model_from(
            &config,
            &k8s_secret("routing", "ns1", &[("api-key", b"ABC"), ("crt", b"cert")]),
        );
        assert_eq!(with_key.routing_key.as_deref(), Some(b"ABC".as_slice()));
        assert_eq!(with_key.fields.len(), 2);

        let without_key = model_from(&config, &k8s_secret("routing", "ns1", &[("crt", b"cert")]));
        assert_eq!(without_key.routing_key, None);
    }

    #[test]
    fn only_the_routing_secret_is_relevant() {
        let ops = SecretOps::new(Arc::new(test_config()));

        let routing = k8s_secret("routing", "ns1", &[]);
        assert!(ops.is_relevant(&RawObject::Secret(Box::new(routing))));

        let other = k8s_secret("tls-material", "ns1", &[]);
        assert!(!ops.is_relevant(&RawObject::Secret(Box::new(other))));
    }

    #[test]
    fn hash_tracks_field_content() {
        let config = test_config();
        let a = model_from(&config, &k8s_secret("routing", "ns1", &[("api-key", b"ABC")]));
        let b = model_from(&config, &k8s_secret("routing", "ns1", &[("api-key", b"ABC")]));
        let c = model_from(&config, &k8s_secret("routing", "ns1", &[("api-key", b"XYZ")]));

        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn cache_roundtrip() {
        let ops = SecretOps::new(Arc::new(test_config()));
        let config = test_config();
        let mut cache = Cache::new();

        let model = model_from(&config, &k8s_secret("routing", "ns1", &[("api-key", b"ABC")]));
        let same = ResourceModel::Secret(model.clone());
        ops.cache_add(&mut cache, ResourceModel::Secret(model));

        assert!(ops.cache_equals(&cache, &same));
        ops.cache_remove(&mut cache, "ns1");
        assert!(!ops.cache_equals(&cache, &same));
    }
}
