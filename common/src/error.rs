use thiserror::Error;

pub type Result<T> = core::result::Result<T, IrrigationError>;

#[derive(Debug, Error)]
pub enum IrrigationError {
    #[error("invalid {field}: {reason}")]
    Validation {
        field: &'static str,
        reason: String,
    },
    #[error("schedule is full ({capacity} slots in use)")]
    Capacity { capacity: usize },
    #[error("no schedule slot {index}")]
    NotFound { index: usize },
    #[error("storage failure: {0:#}")]
    Storage(#[source] anyhow::Error),
    #[error("network failure: {0:#}")]
    Network(#[source] anyhow::Error),
    #[error("update partition failure: {0:#}")]
    Partition(#[source] anyhow::Error),
    #[error("a firmware update is already in progress")]
    UpdateInProgress,
}

impl IrrigationError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    /// HTTP status code used by both request surfaces.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation { .. } => 400,
            Self::NotFound { .. } => 404,
            Self::Capacity { .. } | Self::UpdateInProgress => 409,
            Self::Storage(_) | Self::Partition(_) => 500,
            Self::Network(_) => 502,
        }
    }
}
