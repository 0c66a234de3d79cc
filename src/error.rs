use thiserror::Error;

#[derive(Debug, Error)]
pub enum MajordomoError {
    #[error("config error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse json: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Credential(#[from] CredentialError),
    #[error("{0}")]
    Internal(String),
}

/// Failure kinds for the credential resolution path. All of these surface to
/// the caller as a bare 401; the precise kind is only logged server-side.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("invalid API key")]
    InvalidKey,
    #[error("API key has been revoked")]
    Revoked,
    #[error("API key is not active")]
    Inactive,
    #[error("proxy key not found")]
    ProxyNotFound,
    #[error("proxy key has been revoked")]
    ProxyRevoked,
    #[error("proxy key is not active")]
    ProxyInactive,
    #[error("proxy key does not belong to this majordomo key")]
    WrongOwner,
    #[error("no provider key configured")]
    NoProviderMapping,
    #[error("failed to decrypt provider credential")]
    CipherFail,
}

pub type Result<T> = std::result::Result<T, MajordomoError>;
