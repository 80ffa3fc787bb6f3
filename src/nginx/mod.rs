//! nginx process driver.
//!
//! Writes the rendered configuration document and per-host TLS material to
//! disk and drives the co-located nginx daemon: `nginx` on initial start,
//! `nginx -s reload` afterwards. In mock mode every disk and process effect
//! is replaced by a log line.

pub mod template;

pub use template::{render_config, RenderedConfig, SslMaterial};

use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;

/// Where the generated configuration lands
pub const NGINX_CONF_PATH: &str = "/etc/nginx/nginx.conf";

pub(crate) const CERT_FILE: &str = "certificate.crt";
pub(crate) const KEY_FILE: &str = "certificate.key";
pub(crate) const CLIENT_CERT_FILE: &str = "clientCertificate.crt";

/// Drives the nginx daemon next to this process
pub struct NginxDriver {
    mock: bool,
}

impl NginxDriver {
    pub fn new(config: &Config) -> Self {
        Self {
            mock: config.nginx.run_in_mock_mode,
        }
    }

    /// Write the configuration and start nginx; a start failure is fatal
    pub async fn start(&self, rendered: &RenderedConfig) -> Result<(), Error> {
        if self.mock {
            info!("mock mode: skipping nginx start");
            debug!(document = %rendered.document, "generated configuration");
            return Ok(());
        }

        self.write_output(rendered).await?;

        info!("starting nginx");
        let output = Command::new("nginx")
            .output()
            .await
            .map_err(|e| Error::nginx(format!("failed to execute nginx: {e}")))?;
        if !output.status.success() {
            return Err(Error::nginx(format!(
                "nginx failed to start: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }

    /// Write the configuration and signal nginx to reload; a reload failure
    /// is logged, not fatal
    pub async fn reload(&self, rendered: &RenderedConfig) -> Result<(), Error> {
        if self.mock {
            info!("mock mode: skipping nginx reload");
            debug!(document = %rendered.document, "generated configuration");
            return Ok(());
        }

        self.write_output(rendered).await?;

        info!("reloading nginx");
        match Command::new("nginx").args(["-s", "reload"]).output().await {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "nginx reload failed"
                );
            }
            Err(error) => warn!(%error, "failed to execute nginx -s reload"),
        }

        Ok(())
    }

    async fn write_output(&self, rendered: &RenderedConfig) -> Result<(), Error> {
        // TLS material first: the configuration references the paths
        for material in &rendered.ssl_material {
            self.write_ssl_material(material).await?;
        }

        fs::write(NGINX_CONF_PATH, &rendered.document).await?;
        info!(path = NGINX_CONF_PATH, "wrote nginx configuration");

        Ok(())
    }

    async fn write_ssl_material(&self, material: &SslMaterial) -> Result<(), Error> {
        fs::create_dir_all(&material.directory).await?;
        fs::set_permissions(&material.directory, Permissions::from_mode(0o700)).await?;

        write_secret_file(
            &material.directory.join(CERT_FILE),
            &material.certificate,
            0o644,
        )
        .await?;
        write_secret_file(&material.directory.join(KEY_FILE), &material.key, 0o600).await?;
        if let Some(client) = &material.client_certificate {
            write_secret_file(&material.directory.join(CLIENT_CERT_FILE), client, 0o644).await?;
        }

        info!(host = %material.hostname, directory = %material.directory.display(), "wrote tls material");
        Ok(())
    }
}

async fn write_secret_file(path: &Path, bytes: &[u8], mode: u32) -> Result<(), Error> {
    fs::write(path, bytes).await?;
    fs::set_permissions(path, Permissions::from_mode(mode)).await?;
    Ok(())
}
