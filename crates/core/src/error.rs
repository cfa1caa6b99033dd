use thiserror::Error;

pub type CdpResult<T> = Result<T, CdpError>;

#[derive(Error, Debug)]
pub enum CdpError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Unknown event source: {0}")]
    UnknownSource(String),

    #[error("Transient storage error: {0}")]
    TransientStorage(String),

    #[error("Optimistic lock conflict on profile {profile_id} after {attempts} attempts")]
    OptimisticLock { profile_id: String, attempts: u32 },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Consent denied for student {student_id} on channel {channel}")]
    ConsentViolation { student_id: String, channel: String },

    #[error("Failed to publish to {topic} after {attempts} attempts")]
    PublishFailed { topic: String, attempts: u32 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CdpError {
    /// Transient errors are retried locally; everything else surfaces.
    pub fn is_transient(&self) -> bool {
        matches!(self, CdpError::TransientStorage(_) | CdpError::RateLimit(_))
    }
}
