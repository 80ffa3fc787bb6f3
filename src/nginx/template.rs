//! Deterministic projection of the routing cache into an nginx
//! configuration document.
//!
//! Rendering is a pure function of `(Config, Cache)`: hosts, locations, and
//! upstreams are emitted in sorted order and upstream servers are sorted by
//! pod name, so equal caches produce byte-identical documents. TLS material
//! is returned alongside the document for the driver to persist; only the
//! on-disk paths appear in the document itself.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use minijinja::value::Value;
use minijinja::Environment;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::Cache;
use crate::config::{Config, NginxConfig};
use crate::error::Error;
use crate::hash::fnv1a_32;
use crate::resources::namespaces::SslOptions;
use crate::resources::pods::HealthCheck;

use super::{CERT_FILE, CLIENT_CERT_FILE, KEY_FILE};

const NGINX_CONF_TMPL: &str = r#"{% include "events" %}

http {
{% include "http-preamble" %}
{% for key, upstream in upstreams|items %}
  # Upstream for {{ upstream.path }} traffic on namespace {{ upstream.namespace }}
  upstream {{ upstream.name }} {
    keepalive 1024;
{%- for server in upstream.servers %}
    # Pod {{ server.pod_name }} (namespace: {{ server.pod_namespace }})
    server {{ server.target }}{% if server.weight %} weight={{ server.weight }}{% endif %};
{%- if nginx.enable_health_checks and upstream.health_check %}
{%- if upstream.health_check.http_check %}
    check interval={{ upstream.health_check.interval_ms }} rise={{ upstream.health_check.healthy_threshold }} fall={{ upstream.health_check.unhealthy_threshold }} timeout={{ upstream.health_check.timeout_ms }} port={{ upstream.health_check.port }} type=http;
    check_http_send "{{ upstream.health_check.method }} {{ upstream.health_check.path }} HTTP/1.0\r\n\r\n";
    check_http_expect_alive http_2xx;
{%- else %}
    check interval={{ upstream.health_check.interval_ms }} rise={{ upstream.health_check.healthy_threshold }} fall={{ upstream.health_check.unhealthy_threshold }} timeout={{ upstream.health_check.timeout_ms }} port={{ upstream.health_check.port }} type=tcp;
{%- endif %}
{%- endif %}
{%- endfor %}
  }
{% endfor %}
{%- for host, server in hosts|items %}
  server {
    listen {% if server.ssl %}{{ nginx.ssl_port }} ssl{% else %}{{ nginx.port }}{% endif %};
    server_name {{ host }};
{%- if server.ssl %}
    # SSL options
    ssl_ciphers HIGH:!aNULL:!MD5:!DH+3DES:!kEDH;
    ssl_protocols TLSv1 TLSv1.1 TLSv1.2;
    ssl_certificate {{ server.ssl.certificate }};
    ssl_certificate_key {{ server.ssl.key }};
{%- if server.ssl.client_certificate %}
    ssl_client_certificate {{ server.ssl.client_certificate }};
    ssl_verify_client on;
{%- endif %}
{%- endif %}
{%- if server.needs_default_location %}
{% include "default-location" %}
{%- endif %}
{%- for path, location in server.locations|items %}

    location {{ path }} {
{%- if location.secret != "" %}
      # Check the routing API key (namespace: {{ location.namespace }})
      if ($http_{{ api_key_header }} != "{{ location.secret }}") {
        return 403;
      }
{%- endif %}
      # Force keepalive
      proxy_http_version 1.1;
      proxy_set_header Connection "";

      # Set the Host header, otherwise nginx uses the upstream name
      proxy_set_header Host $http_host;

      proxy_pass http://{{ location.upstream }}{% if location.target_path %}{{ location.target_path }}{% endif %};
    }
{%- endfor %}
  }
{% endfor %}
{% include "default-server" %}
{%- if nginx.ssl_enabled %}
{% include "default-ssl-server" %}
{%- endif %}
}
"#;

const EVENTS_TMPL: &str = r#"events {
  worker_connections  81920;
  multi_accept        on;
}"#;

const HTTP_PREAMBLE_TMPL: &str = r#"  # http://nginx.org/en/docs/http/ngx_http_core_module.html
  types_hash_max_size 2048;
  server_names_hash_max_size 512;
  server_names_hash_bucket_size 64;

  # Maximum body size in request
  client_max_body_size {{ nginx.max_client_body_size }};

  # Force HTTP 1.1 for upstream requests
  proxy_http_version 1.1;

  # Give up on upstream connections after 5s
  proxy_connect_timeout 5s;

  # Send request bodies straight to the upstream
  proxy_request_buffering off;

  # When proxying, nginx defaults 'Connection' to 'close'. Mirror the
  # client's value when one is present and fall back to 'close' otherwise.
  map $http_connection $p_connection {
    default $http_connection;
    ''      close;
  }

  # Pass through the appropriate headers
  proxy_set_header Connection $p_connection;
  proxy_set_header Host $http_host;
  proxy_set_header Upgrade $http_upgrade;
"#;

const DEFAULT_SERVER_TMPL: &str = r#"  # Default server closes the connection as if no server were available
  server {
    listen {{ nginx.port }} default_server;

    location = {{ nginx.status_path }} {
      return 200;
    }

    location / {
      return 444;
    }
  }
"#;

const DEFAULT_SSL_SERVER_TMPL: &str = r#"  # Default server closes the connection as if no server were available
  server {
    listen {{ nginx.ssl_port }} default_server ssl;
    # SSL options
    ssl_ciphers HIGH:!aNULL:!MD5:!DH+3DES:!kEDH;
    ssl_protocols TLSv1 TLSv1.1 TLSv1.2;
    ssl_certificate {{ nginx.ssl_cert }};
    ssl_certificate_key {{ nginx.ssl_key }};

    location = {{ nginx.status_path }} {
      return 200;
    }

    location / {
      return 444;
    }
  }
"#;

const DEFAULT_LOCATION_TMPL: &str = r#"    # Avoid the nginx welcome page for servers without a "/" location
    location / {
      {{ default_location_return }}
    }"#;

static TEMPLATES: LazyLock<Environment<'static>> = LazyLock::new(|| {
    let mut env = Environment::new();
    for (name, source) in [
        ("nginx.conf", NGINX_CONF_TMPL),
        ("events", EVENTS_TMPL),
        ("http-preamble", HTTP_PREAMBLE_TMPL),
        ("default-server", DEFAULT_SERVER_TMPL),
        ("default-ssl-server", DEFAULT_SSL_SERVER_TMPL),
        ("default-location", DEFAULT_LOCATION_TMPL),
    ] {
        env.add_template(name, source)
            .expect("built-in template parses");
    }
    env
});

/// A rendered configuration document together with the TLS material it
/// references
#[derive(Debug)]
pub struct RenderedConfig {
    pub document: String,
    pub ssl_material: Vec<SslMaterial>,
}

/// Per-host TLS bytes to persist under `<ssl-dir>/<hostname>/`
#[derive(Debug, Clone, PartialEq)]
pub struct SslMaterial {
    pub hostname: String,
    pub directory: PathBuf,
    pub certificate: Vec<u8>,
    pub key: Vec<u8>,
    pub client_certificate: Option<Vec<u8>>,
}

#[derive(Debug, Serialize)]
struct TemplateData<'a> {
    api_key_header: String,
    default_location_return: String,
    hosts: BTreeMap<String, HostEntry>,
    upstreams: BTreeMap<String, UpstreamEntry>,
    nginx: &'a NginxConfig,
}

#[derive(Debug, Serialize)]
struct HostEntry {
    ssl: Option<SslPaths>,
    needs_default_location: bool,
    locations: BTreeMap<String, LocationEntry>,
}

#[derive(Debug, Serialize)]
struct SslPaths {
    certificate: String,
    key: String,
    client_certificate: Option<String>,
}

#[derive(Debug, Serialize)]
struct LocationEntry {
    namespace: String,
    path: String,
    upstream: String,
    /// base64 of the namespace routing key; empty when the namespace has none
    secret: String,
    target_path: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpstreamEntry {
    name: String,
    namespace: String,
    path: String,
    servers: Vec<ServerEntry>,
    health_check: Option<HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ServerEntry {
    pod_name: String,
    pod_namespace: String,
    target: String,
    weight: Option<u32>,
}

/// Render the nginx configuration for the current cache
pub fn render_config(config: &Config, cache: &Cache) -> Result<RenderedConfig, Error> {
    let (data, ssl_material) = build_template_data(config, cache);
    let template = TEMPLATES.get_template("nginx.conf")?;
    let document = template.render(Value::from_serialize(&data))?;

    Ok(RenderedConfig {
        document,
        ssl_material,
    })
}

/// The nginx variable form of the API-key header: lowercased with
/// non-alphanumerics mapped to underscores
fn api_key_header_variable(header: &str) -> String {
    header
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// The default `/` location body: a `return` for numeric configuration,
/// otherwise a `proxy_pass`
fn default_location_directive(config: &Config) -> String {
    match config.nginx.default_location_return.parse::<i64>() {
        Ok(code) if (100..=999).contains(&code) => format!("return {code};"),
        _ => format!("proxy_pass {};", config.nginx.default_location_return),
    }
}

fn ssl_paths_for_host(
    config: &Config,
    cache: &Cache,
    namespace: &str,
    hostname: &str,
    options: &SslOptions,
) -> Result<(SslPaths, SslMaterial), String> {
    let secret = cache
        .secrets
        .get(namespace)
        .ok_or_else(|| format!("namespace secret missing for {namespace}"))?;

    let certificate_field = options
        .certificate
        .secret_field()
        .ok_or("certificate ref is incomplete")?;
    let certificate = secret
        .fields
        .get(certificate_field)
        .ok_or_else(|| format!("namespace secret missing certificate field {certificate_field}"))?;

    let key_field = options
        .certificate_key
        .secret_field()
        .ok_or("certificateKey ref is incomplete")?;
    let key = secret
        .fields
        .get(key_field)
        .ok_or_else(|| format!("namespace secret missing key field {key_field}"))?;

    let base_dir = format!("{}/{}", config.nginx.ssl_certificate_dir, hostname);
    let mut paths = SslPaths {
        certificate: format!("{base_dir}/{CERT_FILE}"),
        key: format!("{base_dir}/{KEY_FILE}"),
        client_certificate: None,
    };

    let mut client_certificate = None;
    if let Some(client_ref) = &options.client_certificate {
        let client_field = client_ref
            .secret_field()
            .ok_or("clientCertificate ref is incomplete")?;
        let bytes = secret.fields.get(client_field).ok_or_else(|| {
            format!("namespace secret missing client certificate field {client_field}")
        })?;
        paths.client_certificate = Some(format!("{base_dir}/{CLIENT_CERT_FILE}"));
        client_certificate = Some(bytes.clone());
    }

    Ok((
        paths,
        SslMaterial {
            hostname: hostname.to_string(),
            directory: PathBuf::from(base_dir),
            certificate: certificate.clone(),
            key: key.clone(),
            client_certificate,
        },
    ))
}

fn build_template_data<'a>(
    config: &'a Config,
    cache: &Cache,
) -> (TemplateData<'a>, Vec<SslMaterial>) {
    let mut hosts: BTreeMap<String, HostEntry> = BTreeMap::new();
    let mut upstreams: BTreeMap<String, UpstreamEntry> = BTreeMap::new();
    let mut ssl_material = Vec::new();

    // Hosts pass: one host record per hostname, first declaring namespace
    // wins. Iteration is sorted so the winner is stable.
    let mut namespaces: Vec<_> = cache.namespaces.values().collect();
    namespaces.sort_by(|a, b| a.name.cmp(&b.name));

    for ns in &namespaces {
        for (hostname, options) in &ns.hosts {
            if hosts.contains_key(hostname) {
                warn!(
                    host = %hostname,
                    namespace = %ns.name,
                    "duplicate hostname declaration, keeping the first"
                );
                continue;
            }

            let mut entry = HostEntry {
                ssl: None,
                needs_default_location: true,
                locations: BTreeMap::new(),
            };

            if let Some(ssl) = &options.ssl {
                if !config.nginx.ssl_enabled {
                    warn!(host = %hostname, "host has ssl options but ssl support is disabled");
                    continue;
                }

                match ssl_paths_for_host(config, cache, &ns.name, hostname, ssl) {
                    Ok((paths, material)) => {
                        entry.ssl = Some(paths);
                        ssl_material.push(material);
                    }
                    Err(reason) => {
                        warn!(
                            host = %hostname,
                            namespace = %ns.name,
                            reason = %reason,
                            "dropping host with invalid ssl options"
                        );
                        continue;
                    }
                }
            }

            hosts.insert(hostname.clone(), entry);
        }
    }

    // Upstreams and locations pass, pods in sorted order for stable output
    let mut pods: Vec<_> = cache.pods.values().collect();
    pods.sort_by(|a, b| a.name.cmp(&b.name));

    for pod in &pods {
        let Some(ns) = cache.namespaces.get(&pod.namespace) else {
            warn!(pod = %pod.name, namespace = %pod.namespace, "missing namespace for pod");
            continue;
        };

        for hostname in ns.hosts.keys() {
            let Some(host) = hosts.get_mut(hostname) else {
                // Host was dropped in the hosts pass (ssl problems)
                warn!(pod = %pod.name, host = %hostname, "missing host record for pod");
                continue;
            };

            for route in &pod.routes {
                let upstream_key = format!("{hostname}{}", route.incoming.path);
                let upstream_name = format!("upstream{}", fnv1a_32(upstream_key.as_bytes()));
                let target = if route.outgoing.port == "80" || route.outgoing.port == "443" {
                    route.outgoing.ip.clone()
                } else {
                    format!("{}:{}", route.outgoing.ip, route.outgoing.port)
                };

                if host.needs_default_location && route.incoming.path == "/" {
                    host.needs_default_location = false;
                }

                match host.locations.get_mut(&route.incoming.path) {
                    None => {
                        // API keys are namespace scoped: the location carries
                        // the base64 key of the pod's namespace, or no gate
                        let secret = cache
                            .secrets
                            .get(&pod.namespace)
                            .and_then(|secret| secret.routing_key.as_ref())
                            .map(|key| STANDARD.encode(key))
                            .unwrap_or_default();

                        host.locations.insert(
                            route.incoming.path.clone(),
                            LocationEntry {
                                namespace: pod.namespace.clone(),
                                path: route.incoming.path.clone(),
                                upstream: upstream_name.clone(),
                                secret,
                                target_path: route.outgoing.target_path.clone(),
                            },
                        );
                    }
                    Some(location) => {
                        if location.namespace != pod.namespace {
                            // Merging would leak access across namespaces
                            warn!(
                                host = %hostname,
                                path = %route.incoming.path,
                                namespace = %location.namespace,
                                pod = %pod.name,
                                pod_namespace = %pod.namespace,
                                "duplicate hostname and path across namespaces, skipping route"
                            );
                            continue;
                        }

                        if location.target_path.is_none() {
                            if let Some(target_path) = &route.outgoing.target_path {
                                info!(
                                    host = %hostname,
                                    path = %route.incoming.path,
                                    target_path = %target_path,
                                    "adopting targetPath for location"
                                );
                                location.target_path = Some(target_path.clone());
                            }
                        } else if let Some(target_path) = &route.outgoing.target_path {
                            if location.target_path.as_ref() != Some(target_path) {
                                warn!(
                                    host = %hostname,
                                    path = %route.incoming.path,
                                    conflicting = %target_path,
                                    "inconsistent targetPath for location, keeping the first"
                                );
                            }
                        }
                    }
                }

                let server = ServerEntry {
                    pod_name: pod.name.clone(),
                    pod_namespace: pod.namespace.clone(),
                    target,
                    weight: route.outgoing.weight,
                };

                match upstreams.get_mut(&upstream_key) {
                    Some(upstream) => {
                        upstream.servers.push(server);
                        if upstream.health_check.is_none() {
                            if route.outgoing.health_check.is_some() {
                                warn!(
                                    host = %hostname,
                                    path = %route.incoming.path,
                                    "inconsistent health checks within upstream, adopting the first seen"
                                );
                                upstream.health_check = route.outgoing.health_check.clone();
                            }
                        } else if let Some(check) = &route.outgoing.health_check {
                            if upstream.health_check.as_ref() != Some(check) {
                                warn!(
                                    host = %hostname,
                                    path = %route.incoming.path,
                                    "inconsistent health checks within upstream, keeping the first"
                                );
                            }
                        }
                    }
                    None => {
                        upstreams.insert(
                            upstream_key.clone(),
                            UpstreamEntry {
                                name: upstream_name.clone(),
                                namespace: pod.namespace.clone(),
                                path: route.incoming.path.clone(),
                                servers: vec![server],
                                health_check: route.outgoing.health_check.clone(),
                            },
                        );
                    }
                }
            }
        }
    }

    // Stable server order inside every upstream
    for upstream in upstreams.values_mut() {
        upstream.servers.sort_by(|a, b| a.pod_name.cmp(&b.pod_name));
    }

    (
        TemplateData {
            api_key_header: api_key_header_variable(&config.nginx.api_key_header),
            default_location_return: default_location_directive(config),
            hosts,
            upstreams,
            nginx: &config.nginx,
        },
        ssl_material,
    )
}
