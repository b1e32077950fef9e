use thiserror::Error;

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("fail to call")]
    CallFailed,

    #[error("invalid method: {0}")]
    InvalidMethod(String),

    #[error("tunnel not established for node {0}")]
    TunnelNotEstablished(String),

    #[error("public server not found")]
    NoPublicRelay,

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("process not found: {0}")]
    ProcessNotFound(i64),

    #[error("NAT discovery failed: {0}")]
    NatDiscovery(String),

    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] cron::error::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;
