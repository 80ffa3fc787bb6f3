//! Error types for the dispatcher

use thiserror::Error;

/// Main error type for dispatcher operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid static configuration (environment variables)
    #[error("configuration error: {0}")]
    Config(String),

    /// nginx configuration template expansion failed
    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Filesystem error while writing configuration or TLS material
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure driving the nginx process
    #[error("nginx error: {0}")]
    Nginx(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an nginx driver error with the given message
    pub fn nginx(msg: impl Into<String>) -> Self {
        Self::Nginx(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_carry_their_message() {
        let err = Error::config("PORT abc is an invalid port");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("invalid port"));
    }

    #[test]
    fn nginx_errors_carry_their_message() {
        let err = Error::nginx("failed to execute nginx -s reload");
        assert!(err.to_string().contains("nginx error"));
        assert!(err.to_string().contains("reload"));
    }
}
