// ABOUTME: Error types for portal-probe.
// ABOUTME: Defines ProbeError covering config, RPC, and IO failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RPC error: {0}")]
    Rpc(#[from] portal_rpc::RpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProbeError>;
