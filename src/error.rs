//! Error types for crrouterd

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed{}: {stderr}", .code.map(|c| format!(" with code {}", c)).unwrap_or_default())]
    CommandFailed { cmd: String, code: Option<i32>, stderr: String },

    /// Netlink request failed
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Service error (dnsmasq, nft)
    #[error("Service error: {0}")]
    ServiceError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Address pool has no free address left
    #[error("Address pool exhausted: {0}")]
    PoolExhausted(String),

    /// Operation timed out
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Plugin dependency graph contains a cycle
    #[error("Plugin dependency cycle among: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Plugin depends on a plugin that was never discovered
    #[error("Plugin '{plugin}' depends on unknown plugin '{dependency}'")]
    UnknownDependency { plugin: String, dependency: String },

    /// Traffic facility group rejected by validation
    #[error("{0}")]
    InvalidFacility(String),

    /// D-Bus error
    #[error("D-Bus error: {0}")]
    DBus(#[from] zbus::Error),
}

impl RouterError {
    /// Whether the error is a rejected request: nothing was mutated and the
    /// caller should see it as a named rejection.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RouterError::InvalidParameter(_)
                | RouterError::AlreadyExists(_)
                | RouterError::NotFound(_)
                | RouterError::InvalidFacility(_)
        )
    }

    /// Whether the error aborts daemon startup.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RouterError::DependencyCycle(_) | RouterError::UnknownDependency { .. }
        )
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(error: serde_json::Error) -> Self {
        RouterError::ParseError(error.to_string())
    }
}

impl From<rtnetlink::Error> for RouterError {
    fn from(error: rtnetlink::Error) -> Self {
        RouterError::Netlink(error.to_string())
    }
}

pub type RouterResult<T> = Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = RouterError::CommandFailed {
            cmd: "nft list table ip crrouter".to_string(),
            code: Some(1),
            stderr: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Command 'nft list table ip crrouter' failed with code 1: No such file or directory"
        );

        let err = RouterError::CommandFailed {
            cmd: "dnsmasq".to_string(),
            code: None,
            stderr: "killed".to_string(),
        };
        assert_eq!(err.to_string(), "Command 'dnsmasq' failed: killed");
    }

    #[test]
    fn test_classification() {
        assert!(RouterError::AlreadyExists("x".into()).is_rejection());
        assert!(RouterError::InvalidFacility("x".into()).is_rejection());
        assert!(!RouterError::PoolExhausted("x".into()).is_rejection());
        assert!(RouterError::DependencyCycle(vec!["a".into(), "b".into()]).is_fatal());
        assert!(!RouterError::NotFound("x".into()).is_fatal());
    }
}
