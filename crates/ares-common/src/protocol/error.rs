use thiserror::Error;

use super::responses::RemoteFailure;

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Node already exists: {0}")]
    NodeExists(String),

    #[error("Node does not exist: {0}")]
    NoNode(String),

    #[error("Invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Invalid provider leaf '{0}'")]
    InvalidLeaf(String),

    #[error("No providers available for service {0}")]
    NoProviders(String),

    #[error("No channel available after {0}ms")]
    PoolTimeout(u64),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Call rejected by admission control: {0}")]
    Rejected(String),

    #[error("Remote failure: {0}")]
    Remote(RemoteFailure),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Component is shut down")]
    Shutdown,
}

impl RpcError {
    /// Returns true for the uniform timeout family: result wait, pool wait and
    /// admission wait on the provider.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RpcError::Timeout(_) | RpcError::PoolTimeout(_) | RpcError::Rejected(_)
        )
    }
}

impl From<std::net::AddrParseError> for RpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        RpcError::InvalidRequest(err.to_string())
    }
}

impl From<toml::de::Error> for RpcError {
    fn from(err: toml::de::Error) -> Self {
        RpcError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
