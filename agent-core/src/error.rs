//! Error taxonomy (§7). Each subsystem boundary gets its own
//! `thiserror`-derived enum; `AgentError` composes them for the
//! binary's `main` to map onto an exit code.

use thiserror::Error;

use crate::threshold::ThresholdError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },
    #[error("could not parse YAML: {0}")]
    Yaml(String),
    #[error("unknown source plug-in {0:?}")]
    UnknownSource(String),
    #[error("unknown output plug-in {0:?}")]
    UnknownOutput(String),
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("check timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("source failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection not ready")]
    NotReady,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Framing(String),
    #[error("server responded with status {0}")]
    BadStatus(u16),
    #[error("fatal transport misconfiguration: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Other(String),
}

impl AgentError {
    /// Exit code convention used by the binary's `main`: configuration
    /// errors are always fatal-at-startup and get a distinct code from
    /// other runtime failures so operators can tell them apart.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => 2,
            _ => 1,
        }
    }
}
