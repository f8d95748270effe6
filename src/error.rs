//! Error types for the Sakura worker fleet.

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Translation error: {0}")]
    Translate(#[from] TranslateError),

    #[error("Fleet error: {0}")]
    Fleet(#[from] FleetError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors from a call to a remote inference endpoint.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    /// The HTTP request itself failed (unreachable, DNS, TLS, timeout).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The endpoint answered with a non-2xx status.
    #[error("Endpoint returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The endpoint answered 2xx but the body broke the response contract.
    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl TranslateError {
    /// Whether the remote endpoint violated the response contract, as opposed
    /// to being unreachable or rejecting the request.
    pub fn is_contract_violation(&self) -> bool {
        match self {
            Self::Malformed(_) => true,
            Self::Request(e) => e.is_decode(),
            Self::Status { .. } => false,
        }
    }
}

/// Fleet administration errors.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("Server registry error: {0}")]
    Registry(#[from] DatabaseError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type alias for the fleet.
pub type Result<T> = std::result::Result<T, Error>;
