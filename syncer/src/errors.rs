use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("No data: {0}")]
    NoData(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Registry error: {0}")]
    Registry(#[from] reqwest::Error),

    /// Registry refused the request itself (bad key, malformed query)
    #[error("Registry rejected request: {0}")]
    RegistryRejected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for failures of an external collaborator (registry or store).
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Error::UpstreamUnavailable(_)
                | Error::Database(_)
                | Error::Registry(_)
                | Error::RegistryRejected(_)
        )
    }

    /// Determine if a later attempt of the same unit of work may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            // Retryable errors
            Error::UpstreamUnavailable(_) => true,
            Error::Database(e) => crate::db::is_transient_error(e),
            Error::Registry(e) => e.is_timeout() || e.is_connect(),
            Error::NoData(_) => true, // Device stays pending, registry may have data later

            // Non-retryable errors
            Error::NotFound(_) => false,
            Error::PreconditionFailed(_) => false,
            Error::InvalidInput(_) => false,
            Error::RegistryRejected(_) => false,
            Error::Migration(_) => false,
            Error::Config(_) => false,
        }
    }
}
