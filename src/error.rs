//! Error types for the network resources injector

use std::time::Duration;

use thiserror::Error;

/// Main error type for injector operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Invalid command line or runtime configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS key material could not be loaded or watched
    #[error("tls error: {0}")]
    Tls(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A bounded wait expired
    #[error("timed out after waiting '{0:?}'")]
    Timeout(Duration),

    /// Unexpected internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a TLS error with the given message
    pub fn tls(msg: impl Into<String>) -> Self {
        Self::Tls(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: startup validation reports which flag is wrong
    #[test]
    fn story_config_errors_name_the_bad_flag() {
        let err = Error::config("invalid port number 80. Choose between 1024 and 65535");
        assert!(err.to_string().contains("configuration error"));
        assert!(err.to_string().contains("1024"));

        match Error::config("any") {
            Error::Config(msg) => assert_eq!(msg, "any"),
            _ => panic!("Expected Config variant"),
        }
    }

    /// Story: timeouts carry the limit that expired
    #[test]
    fn story_timeout_reports_limit() {
        let err = Error::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }

    #[test]
    fn serde_errors_convert_to_serialization() {
        let err: Error = serde_json::from_str::<()>("nope").unwrap_err().into();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
