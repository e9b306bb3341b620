use crate::concurrency::LockError;
use thiserror::Error;

pub type VellumResult<T, E = VellumError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Not support: {0}")]
    NotSupport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Recovery error: {0}")]
    Recovery(String),
}
