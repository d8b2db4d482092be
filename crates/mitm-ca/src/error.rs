use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to parse root certificate authority material: {0}")]
    Parse(String),
    #[error("root private key does not match the root certificate public key")]
    KeyMismatch,
    #[error("invalid hostname: {0}")]
    InvalidInput(String),
    #[error("leaf certificate signing failed: {0}")]
    Signing(String),
    #[error("certificate authority is closed")]
    Closed,
    #[error("invalid certificate authority configuration: {0}")]
    InvalidConfig(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CaError {
    fn from(value: rcgen::Error) -> Self {
        Self::Signing(value.to_string())
    }
}

impl From<rustls::Error> for CaError {
    fn from(value: rustls::Error) -> Self {
        Self::Signing(format!("TLS config build failed: {value}"))
    }
}
