//! Pod resource set.
//!
//! Routable pods carry a JSON array of path entries in a configurable
//! annotation: `[{"basePath": "/p", "containerPort": "3000",
//! "targetPath": "/q", "weight": 5}, ...]`. A route is kept only when its
//! port parses, is a declared container port, and its paths validate; a
//! weight of 0 on any entry drops the pod's entire route list. Kept routes
//! carry a health check derived from the declaring container's readiness
//! probe (else its liveness probe) when the probe targets the same port.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod as K8sPod, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, WatchParams};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::Config;
use crate::error::Error;
use crate::hash::ContentHasher;
use crate::validation;

use super::{
    adapt_watch_stream, EventStream, RawObject, ResourceModel, ResourceOps, Watchable,
    WatchableResourceSet,
};

const POD_RUNNING: &str = "Running";

/// A pod together with the routes derived from its paths annotation
#[derive(Debug, Clone, PartialEq)]
pub struct PodWithRoutes {
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub routes: Vec<Route>,
    hash: u64,
}

/// Incoming match and outgoing backend for one path entry
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub incoming: Incoming,
    pub outgoing: Outgoing,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub ip: String,
    /// Port as written in the annotation; 80 and 443 are elided from the
    /// upstream target
    pub port: String,
    pub target_path: Option<String>,
    pub weight: Option<u32>,
    pub health_check: Option<HealthCheck>,
}

/// Upstream health check derived from a container probe
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub http_check: bool,
    pub path: String,
    pub method: String,
    pub timeout_ms: i32,
    pub interval_ms: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    pub port: i32,
}

/// One element of the paths annotation
#[derive(Debug, Deserialize)]
struct PathAnnotation {
    #[serde(rename = "basePath")]
    base_path: String,
    #[serde(rename = "containerPort")]
    container_port: String,
    #[serde(rename = "targetPath", default)]
    target_path: Option<String>,
    #[serde(default)]
    weight: Option<u32>,
}

impl PodWithRoutes {
    /// Build a pod model, precomputing the content hash over the fields the
    /// renderer reads.
    pub fn new(name: String, namespace: String, phase: String, routes: Vec<Route>) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.write_str(&name);
        hasher.write_str(&namespace);
        hasher.write_str(&phase);
        for route in &routes {
            hasher.write_str(&route.incoming.path);
            hasher.write_str(&route.outgoing.ip);
            hasher.write_str(&route.outgoing.port);
            hasher.write_opt_str(route.outgoing.target_path.as_deref());
            match route.outgoing.weight {
                Some(weight) => {
                    hasher.write(b"+");
                    hasher.write_u32(weight);
                }
                None => hasher.write(b"-"),
            }
            match &route.outgoing.health_check {
                Some(check) => {
                    hasher.write_bool(check.http_check);
                    hasher.write_str(&check.path);
                    hasher.write_str(&check.method);
                    hasher.write_i32(check.timeout_ms);
                    hasher.write_i32(check.interval_ms);
                    hasher.write_i32(check.healthy_threshold);
                    hasher.write_i32(check.unhealthy_threshold);
                    hasher.write_i32(check.port);
                }
                None => hasher.write(b"-"),
            }
        }

        Self {
            name,
            namespace,
            phase,
            routes,
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

/// All declared container ports of a pod
fn container_ports(pod: &K8sPod) -> Vec<i32> {
    pod.spec
        .iter()
        .flat_map(|spec| &spec.containers)
        .flat_map(|container| container.ports.iter().flatten())
        .map(|port| port.container_port)
        .collect()
}

fn port_of(value: &IntOrString) -> Option<i32> {
    match value {
        IntOrString::Int(port) => Some(*port),
        IntOrString::String(name) => name.parse().ok(),
    }
}

fn check_from_probe(probe: &Probe, port: i32) -> Option<HealthCheck> {
    let (http_check, path, method, probe_port) = if let Some(http) = &probe.http_get {
        (
            true,
            http.path.clone().unwrap_or_default(),
            "GET".to_string(),
            port_of(&http.port)?,
        )
    } else if let Some(tcp) = &probe.tcp_socket {
        (false, String::new(), String::new(), port_of(&tcp.port)?)
    } else {
        return None;
    };

    if probe_port != port {
        return None;
    }

    Some(HealthCheck {
        http_check,
        path,
        method,
        timeout_ms: probe.timeout_seconds.unwrap_or(1) * 1000,
        interval_ms: probe.period_seconds.unwrap_or(10) * 1000,
        healthy_threshold: probe.success_threshold.unwrap_or(1),
        unhealthy_threshold: probe.failure_threshold.unwrap_or(3),
        port,
    })
}

/// Health check for the container declaring `port`: its readiness probe
/// wins over its liveness probe, and the probe must target the same port.
pub fn health_check_for_port(pod: &K8sPod, port: i32) -> Option<HealthCheck> {
    let spec = pod.spec.as_ref()?;
    for container in &spec.containers {
        let declares = container
            .ports
            .iter()
            .flatten()
            .any(|p| p.container_port == port);
        if !declares {
            continue;
        }

        for probe in [container.readiness_probe.as_ref(), container.liveness_probe.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(check) = check_from_probe(probe, port) {
                return Some(check);
            }
        }
    }
    None
}

/// All valid routes from the configured paths annotation on a pod
pub fn routes_from_pod(config: &Config, pod: &K8sPod) -> Vec<Route> {
    let name = pod.metadata.name.as_deref().unwrap_or_default();

    let phase = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        .unwrap_or_default();
    if phase != POD_RUNNING {
        debug!(pod = name, phase, "pod is not routable: not running");
        return Vec::new();
    }

    let Some(ip) = pod
        .status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
    else {
        debug!(pod = name, "pod is not routable: no ip assigned");
        return Vec::new();
    };

    let Some(annotation) = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(&config.pods_paths_annotation))
    else {
        return Vec::new();
    };

    let entries: Vec<PathAnnotation> = match serde_json::from_str(annotation) {
        Ok(entries) => entries,
        Err(error) => {
            warn!(
                pod = name,
                annotation = %config.pods_paths_annotation,
                %error,
                "paths annotation is not valid JSON"
            );
            return Vec::new();
        }
    };

    // Weight 0 disables routing for the whole pod
    if entries.iter().any(|entry| entry.weight == Some(0)) {
        warn!(pod = name, "dropping all routes: a path entry has weight 0");
        return Vec::new();
    }

    let ports = container_ports(pod);
    let mut routes = Vec::new();

    for entry in entries {
        let port: i32 = match entry.container_port.parse() {
            Ok(port) if validation::is_valid_port(i64::from(port)) => port,
            _ => {
                warn!(pod = name, port = %entry.container_port, "route port is not valid");
                continue;
            }
        };

        if !ports.contains(&port) {
            warn!(pod = name, port, "route port is not a declared container port");
            continue;
        }

        if !validation::is_valid_path(&entry.base_path) {
            warn!(pod = name, path = %entry.base_path, "route basePath is not valid");
            continue;
        }

        if let Some(target) = &entry.target_path {
            if !validation::is_valid_path(target) {
                warn!(pod = name, path = %target, "route targetPath is not valid");
                continue;
            }
        }

        let health_check = health_check_for_port(pod, port);
        routes.push(Route {
            incoming: Incoming {
                path: entry.base_path,
            },
            outgoing: Outgoing {
                ip: ip.to_string(),
                port: entry.container_port,
                target_path: entry.target_path,
                weight: entry.weight,
                health_check,
            },
        });
    }

    routes
}

/// Convert a cluster pod into the routing model
pub fn model_from(config: &Config, pod: &K8sPod) -> PodWithRoutes {
    PodWithRoutes::new(
        pod.metadata.name.clone().unwrap_or_default(),
        pod.metadata.namespace.clone().unwrap_or_default(),
        pod.status
            .as_ref()
            .and_then(|status| status.phase.clone())
            .unwrap_or_default(),
        routes_from_pod(config, pod),
    )
}

/// Pure pod-set logic
pub struct PodOps {
    config: Arc<Config>,
}

impl PodOps {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ResourceOps for PodOps {
    fn kind(&self) -> &'static str {
        "pod"
    }

    fn is_relevant(&self, raw: &RawObject) -> bool {
        let RawObject::Pod(pod) = raw else {
            return false;
        };

        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        if !self.config.routable_selector.matches(labels) {
            return false;
        }

        pod.status
            .as_ref()
            .and_then(|status| status.phase.as_deref())
            == Some(POD_RUNNING)
    }

    fn to_model(&self, raw: &RawObject) -> Option<ResourceModel> {
        let RawObject::Pod(pod) = raw else {
            return None;
        };
        Some(ResourceModel::Pod(model_from(&self.config, pod)))
    }

    fn id_of(&self, raw: &RawObject) -> String {
        let RawObject::Pod(pod) = raw else {
            return String::new();
        };
        pod.metadata.name.clone().unwrap_or_default()
    }

    fn cache_add(&self, cache: &mut Cache, model: ResourceModel) {
        if let ResourceModel::Pod(pod) = model {
            cache.pods.insert(pod.name.clone(), pod);
        }
    }

    fn cache_remove(&self, cache: &mut Cache, id: &str) {
        cache.pods.remove(id);
    }

    fn cache_equals(&self, cache: &Cache, model: &ResourceModel) -> bool {
        cache
            .pods
            .get(model.id())
            .is_some_and(|cached| cached.hash() == model.hash())
    }
}

/// Pod set bound to an API client
pub type PodSet = Watchable<PodOps>;

#[async_trait]
impl WatchableResourceSet for PodSet {
    async fn list(&self) -> Result<(Vec<ResourceModel>, String), Error> {
        let api: Api<K8sPod> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&self.ops.config.routable_label_selector);
        let list = api.list(&params).await?;

        let version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list
            .items
            .iter()
            .map(|pod| ResourceModel::Pod(model_from(&self.ops.config, pod)))
            .collect();

        Ok((items, version))
    }

    async fn watch(&self, resource_version: &str) -> Result<EventStream, Error> {
        let api: Api<K8sPod> = Api::all(self.client.clone());
        let params = WatchParams::default().labels(&self.ops.config.routable_label_selector);
        let stream = api.watch(&params, resource_version).await?;

        Ok(adapt_watch_stream(stream, |pod| RawObject::Pod(Box::new(pod))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, HTTPGetAction, PodSpec, PodStatus, TCPSocketAction,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn test_config() -> Config {
        Config::from_lookup(|_| None).expect("default config")
    }

    fn k8s_pod(name: &str, paths_json: &str, ip: &str, phase: &str, ports: &[i32]) -> K8sPod {
        let config = test_config();

        let mut labels = BTreeMap::new();
        labels.insert(
            "github.com/30x.dispatcher.routable".to_string(),
            "true".to_string(),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(config.pods_paths_annotation.clone(), paths_json.to_string());

        K8sPod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "main".to_string(),
                    ports: Some(
                        ports
                            .iter()
                            .map(|&port| ContainerPort {
                                container_port: port,
                                ..Default::default()
                            })
                            .collect(),
                    ),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: if ip.is_empty() { None } else { Some(ip.to_string()) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn http_probe(path: &str, port: i32) -> Probe {
        Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(port),
                ..Default::default()
            }),
            timeout_seconds: Some(23),
            period_seconds: Some(5),
            success_threshold: Some(2),
            failure_threshold: Some(3),
            ..Default::default()
        }
    }

    #[test]
    fn valid_entry_yields_a_route() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/users", "containerPort": "3000", "targetPath": "/v1/users"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );

        let routes = routes_from_pod(&config, &pod);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].incoming.path, "/users");
        assert_eq!(routes[0].outgoing.ip, "1.2.3.4");
        assert_eq!(routes[0].outgoing.port, "3000");
        assert_eq!(routes[0].outgoing.target_path.as_deref(), Some("/v1/users"));
        assert_eq!(routes[0].outgoing.weight, None);
    }

    #[test]
    fn unparseable_port_yields_no_routes() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/", "containerPort": "abcdef"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );
        assert!(routes_from_pod(&config, &pod).is_empty());
    }

    #[test]
    fn undeclared_port_yields_no_routes() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/", "containerPort": "8080"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );
        assert!(routes_from_pod(&config, &pod).is_empty());
    }

    #[test]
    fn invalid_base_path_is_skipped() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "[", "containerPort": "3000"}, {"basePath": "/ok", "containerPort": "3000"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );

        let routes = routes_from_pod(&config, &pod);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].incoming.path, "/ok");
    }

    #[test]
    fn weight_is_carried_and_zero_drops_everything() {
        let config = test_config();

        let weighted = k8s_pod(
            "p1",
            r#"[{"basePath": "/node", "containerPort": "3000", "weight": 5}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );
        let routes = routes_from_pod(&config, &weighted);
        assert_eq!(routes[0].outgoing.weight, Some(5));

        let zero = k8s_pod(
            "p2",
            r#"[{"basePath": "/node", "containerPort": "3000", "weight": 0},
                {"basePath": "/other", "containerPort": "3000"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );
        assert!(routes_from_pod(&config, &zero).is_empty());
    }

    #[test]
    fn non_running_pod_has_no_routes() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/", "containerPort": "3000"}]"#,
            "1.2.3.4",
            "Succeeded",
            &[3000],
        );
        assert!(routes_from_pod(&config, &pod).is_empty());
    }

    #[test]
    fn pod_without_ip_has_no_routes() {
        let config = test_config();
        let pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/", "containerPort": "3000"}]"#,
            "",
            "Running",
            &[3000],
        );
        assert!(routes_from_pod(&config, &pod).is_empty());
    }

    #[test]
    fn readiness_probe_becomes_http_check() {
        let mut pod = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[3000]);
        pod.spec.as_mut().expect("spec").containers[0].readiness_probe =
            Some(http_probe("/test", 3000));

        assert_eq!(health_check_for_port(&pod, 3001), None);
        assert_eq!(
            health_check_for_port(&pod, 3000),
            Some(HealthCheck {
                http_check: true,
                path: "/test".to_string(),
                method: "GET".to_string(),
                timeout_ms: 23000,
                interval_ms: 5000,
                healthy_threshold: 2,
                unhealthy_threshold: 3,
                port: 3000,
            })
        );
    }

    #[test]
    fn liveness_probe_is_the_fallback() {
        let mut pod = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[3000]);
        pod.spec.as_mut().expect("spec").containers[0].liveness_probe =
            Some(http_probe("/test", 3000));

        let check = health_check_for_port(&pod, 3000).expect("liveness check");
        assert!(check.http_check);
        assert_eq!(check.path, "/test");
    }

    #[test]
    fn tcp_probe_becomes_tcp_check() {
        let mut pod = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[3000]);
        pod.spec.as_mut().expect("spec").containers[0].liveness_probe = Some(Probe {
            tcp_socket: Some(TCPSocketAction {
                port: IntOrString::Int(3000),
                ..Default::default()
            }),
            timeout_seconds: Some(23),
            period_seconds: Some(5),
            success_threshold: Some(2),
            failure_threshold: Some(3),
            ..Default::default()
        });

        let check = health_check_for_port(&pod, 3000).expect("tcp check");
        assert!(!check.http_check);
        assert_eq!(check.path, "");
        assert_eq!(check.method, "");
        assert_eq!(check.timeout_ms, 23000);
    }

    #[test]
    fn probe_targeting_other_port_is_ignored() {
        let mut pod = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[3000, 4000]);
        pod.spec.as_mut().expect("spec").containers[0].readiness_probe =
            Some(http_probe("/test", 4000));

        assert_eq!(health_check_for_port(&pod, 3000), None);
    }

    #[test]
    fn routes_carry_the_declaring_containers_check() {
        let config = test_config();
        let mut pod = k8s_pod(
            "p1",
            r#"[{"basePath": "/users", "containerPort": "3000"}]"#,
            "1.2.3.4",
            "Running",
            &[3000],
        );
        pod.spec.as_mut().expect("spec").containers[0].readiness_probe =
            Some(http_probe("/healthz", 3000));

        let routes = routes_from_pod(&config, &pod);
        let check = routes[0].outgoing.health_check.as_ref().expect("check");
        assert_eq!(check.path, "/healthz");
    }

    #[test]
    fn hash_is_stable_and_sensitive_to_routes() {
        let config = test_config();
        let pod1 = model_from(
            &config,
            &k8s_pod("p", r#"[{"basePath": "/", "containerPort": "3000"}]"#, "1.2.3.4", "Running", &[3000]),
        );
        let pod2 = model_from(
            &config,
            &k8s_pod("p", r#"[{"basePath": "/", "containerPort": "3000"}]"#, "1.2.3.4", "Running", &[3000]),
        );
        let pod3 = model_from(
            &config,
            &k8s_pod("p", r#"[{"basePath": "/other", "containerPort": "3000"}]"#, "1.2.3.4", "Running", &[3000]),
        );

        assert_eq!(pod1.hash(), pod2.hash());
        assert_ne!(pod1.hash(), pod3.hash());
    }

    #[test]
    fn relevance_requires_label_and_running_phase() {
        let ops = PodOps::new(Arc::new(test_config()));

        let running = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[]);
        assert!(ops.is_relevant(&RawObject::Pod(Box::new(running))));

        let pending = k8s_pod("p1", "[]", "", "Pending", &[]);
        assert!(!ops.is_relevant(&RawObject::Pod(Box::new(pending))));

        let mut unlabeled = k8s_pod("p1", "[]", "1.2.3.4", "Running", &[]);
        unlabeled.metadata.labels = None;
        assert!(!ops.is_relevant(&RawObject::Pod(Box::new(unlabeled))));
    }
}
