use thiserror::Error;

#[derive(Debug, Error)]
pub enum ShaperError {
    #[error("shell executor timed out running: {0}")]
    Timeout(String),
    #[error("{0} failed: {1}")]
    CommandFailed(String, String),
}

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("shell executor timed out running: {0}")]
    Timeout(String),
    #[error("{0} failed: {1}")]
    CommandFailed(String, String),
}
