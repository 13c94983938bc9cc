use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("Invalid harvest configuration: {0}")]
    Configuration(String),

    #[error("Browser session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("No worker could acquire a browser session")]
    NoSessions,

    #[error("Failed to persist leads: {0}")]
    Persistence(String),
}
