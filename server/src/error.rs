use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("subdomain '{0}' is invalid")]
    InvalidSubdomain(String),

    #[error("subdomain '{0}' is already taken")]
    SubdomainTaken(String),

    #[error("device not found")]
    DeviceNotFound,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
