//! Static configuration loaded from environment variables.
//!
//! All variables are optional and fall back to the defaults below; invalid
//! values fail fast at startup rather than surfacing later as bad nginx
//! configuration.

use std::env;
use std::path::Path;

use serde::Serialize;

use crate::error::Error;
use crate::validation::{self, LabelSelector};

/// Router configuration
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// The secret name used to store the API key for a namespace
    pub api_key_secret: String,
    /// The secret data field holding the API key
    pub api_key_secret_data_field: String,
    /// Label selector identifying routable namespaces and pods, as sent to
    /// the API server
    pub routable_label_selector: String,
    /// Parsed form of `routable_label_selector` for local matching
    #[serde(skip)]
    pub routable_selector: LabelSelector,
    /// Namespace annotation carrying the JSON hostname map
    pub namespace_hosts_annotation: String,
    /// Namespace label carrying the organization name
    pub namespace_org_label: String,
    /// Namespace label carrying the environment name
    pub namespace_env_label: String,
    /// Pod annotation carrying the JSON route array
    pub pods_paths_annotation: String,
    /// nginx specific configuration
    pub nginx: NginxConfig,
}

/// nginx specific configuration
#[derive(Debug, Clone, Serialize)]
pub struct NginxConfig {
    /// Request header carrying the API key
    pub api_key_header: String,
    /// Emit upstream health-check directives
    pub enable_health_checks: bool,
    /// Status path served by the default server
    pub status_path: String,
    /// client_max_body_size value; "0" means unlimited
    pub max_client_body_size: String,
    /// Plain listen port
    pub port: u16,
    /// TLS listen port
    pub ssl_port: u16,
    /// Directory for per-host TLS material
    pub ssl_certificate_dir: String,
    /// Default certificate for requests not matching a TLS host
    pub ssl_cert: String,
    /// Key for `ssl_cert`
    pub ssl_key: String,
    /// Derived: TLS support is on when a default cert/key pair is configured
    pub ssl_enabled: bool,
    /// Default `/` location behavior: a status code in 100..=999 or a
    /// proxy_pass URL
    pub default_location_return: String,
    /// Mock mode: log generated configuration instead of touching disk or
    /// driving the nginx process
    pub run_in_mock_mode: bool,
}

impl Config {
    /// Load and validate the configuration from the process environment
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load the configuration from an arbitrary variable source.
    ///
    /// `from_env` delegates here; tests inject maps to avoid mutating the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let routable_label_selector =
            get("ROUTABLE_LABEL_SELECTOR", "github.com/30x.dispatcher.routable=true");

        let config = Config {
            api_key_secret: get("API_KEY_SECRET_NAME", "routing"),
            api_key_secret_data_field: get("API_KEY_SECRET_FIELD", "api-key"),
            routable_selector: LabelSelector::parse(&routable_label_selector)
                .map_err(|e| Error::config(format!("ROUTABLE_LABEL_SELECTOR {e}")))?,
            routable_label_selector,
            namespace_hosts_annotation: get("HOSTS_ANNOTATION", "github.com/30x.dispatcher.hosts"),
            namespace_org_label: get("ORG_LABEL", "github.com/30x.dispatcher.org"),
            namespace_env_label: get("ENV_LABEL", "github.com/30x.dispatcher.env"),
            pods_paths_annotation: get("PATHS_ANNOTATION", "github.com/30x.dispatcher.paths"),
            nginx: NginxConfig {
                api_key_header: get("API_KEY_HEADER", "X-ROUTING-API-KEY"),
                enable_health_checks: parse_bool("NGINX_ENABLE_HEALTH_CHECKS", &get("NGINX_ENABLE_HEALTH_CHECKS", "false"))?,
                status_path: get("NGINX_STATUS_PATH", "/dispatcher/status"),
                max_client_body_size: get("NGINX_MAX_CLIENT_BODY_SIZE", "0"),
                port: parse_port("PORT", &get("PORT", "80"))?,
                ssl_port: parse_port("SSL_PORT", &get("SSL_PORT", "443"))?,
                ssl_certificate_dir: get("SSL_CERT_DIR", "/etc/nginx/ssl"),
                ssl_cert: get("SSL_CERT", ""),
                ssl_key: get("SSL_KEY", ""),
                ssl_enabled: false,
                default_location_return: get("DEFAULT_LOCATION_RETURN", "404"),
                run_in_mock_mode: false,
            },
        };

        config.validate()
    }

    fn validate(mut self) -> Result<Self, Error> {
        for annotation in [&self.namespace_hosts_annotation, &self.pods_paths_annotation] {
            validation::validate_annotation_name(annotation).map_err(Error::Config)?;
        }

        // Org/env label names parse under the same selector grammar
        for label in [&self.namespace_org_label, &self.namespace_env_label] {
            LabelSelector::parse(label)
                .map_err(|e| Error::config(format!("label {label} {e}")))?;
        }

        match self.nginx.default_location_return.parse::<i64>() {
            Ok(code) if !(100..=999).contains(&code) => {
                return Err(Error::config(format!(
                    "{code} is an invalid status code 100-999 for the default location return"
                )));
            }
            Ok(_) => {}
            Err(_) => {
                let value = &self.nginx.default_location_return;
                if !value.starts_with("http://") && !value.starts_with("https://") {
                    return Err(Error::config(format!(
                        "{value} is an invalid url for the default location return"
                    )));
                }
            }
        }

        if !validation::is_valid_path(&self.nginx.status_path) {
            return Err(Error::config(format!(
                "{} is an invalid path",
                self.nginx.status_path
            )));
        }

        if !self.nginx.ssl_cert.is_empty() {
            if self.nginx.ssl_key.is_empty() {
                return Err(Error::config(
                    "must provide an ssl key when an ssl cert is provided",
                ));
            }
            for file in [&self.nginx.ssl_cert, &self.nginx.ssl_key] {
                if !Path::new(file).exists() {
                    return Err(Error::config(format!("ssl material does not exist: {file}")));
                }
            }
            self.nginx.ssl_enabled = true;
        }

        Ok(self)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, Error> {
    value
        .parse::<bool>()
        .map_err(|_| Error::config(format!("{name} must be true or false, got {value}")))
}

fn parse_port(name: &str, value: &str) -> Result<u16, Error> {
    value
        .parse::<u16>()
        .ok()
        .filter(|&port| validation::is_valid_port(i64::from(port)))
        .ok_or_else(|| Error::config(format!("{name}: {value} is an invalid port")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<Config, Error> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_load() {
        let config = from_map(&[]).expect("default configuration is valid");

        assert_eq!(config.api_key_secret, "routing");
        assert_eq!(config.api_key_secret_data_field, "api-key");
        assert_eq!(
            config.routable_label_selector,
            "github.com/30x.dispatcher.routable=true"
        );
        assert_eq!(config.nginx.api_key_header, "X-ROUTING-API-KEY");
        assert_eq!(config.nginx.port, 80);
        assert_eq!(config.nginx.ssl_port, 443);
        assert_eq!(config.nginx.status_path, "/dispatcher/status");
        assert_eq!(config.nginx.default_location_return, "404");
        assert!(!config.nginx.enable_health_checks);
        assert!(!config.nginx.ssl_enabled);
        assert!(!config.nginx.run_in_mock_mode);
    }

    #[test]
    fn invalid_port_is_fatal() {
        assert!(from_map(&[("PORT", "abc")]).is_err());
        assert!(from_map(&[("PORT", "0")]).is_err());
        assert!(from_map(&[("SSL_PORT", "70000")]).is_err());
    }

    #[test]
    fn invalid_selector_is_fatal() {
        assert!(from_map(&[("ROUTABLE_LABEL_SELECTOR", "tier in (web)")]).is_err());
    }

    #[test]
    fn invalid_annotation_name_is_fatal() {
        assert!(from_map(&[("HOSTS_ANNOTATION", "bad//name")]).is_err());
    }

    #[test]
    fn default_location_return_validation() {
        assert!(from_map(&[("DEFAULT_LOCATION_RETURN", "503")]).is_ok());
        assert!(from_map(&[("DEFAULT_LOCATION_RETURN", "http://fallback.svc")]).is_ok());
        assert!(from_map(&[("DEFAULT_LOCATION_RETURN", "99")]).is_err());
        assert!(from_map(&[("DEFAULT_LOCATION_RETURN", "not a url")]).is_err());
    }

    #[test]
    fn ssl_cert_requires_key() {
        assert!(from_map(&[("SSL_CERT", "/tmp/cert.pem")]).is_err());
    }

    #[test]
    fn invalid_status_path_is_fatal() {
        assert!(from_map(&[("NGINX_STATUS_PATH", "")]).is_err());
    }
}
