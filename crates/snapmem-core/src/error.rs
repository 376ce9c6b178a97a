use thiserror::Error;

/// Per-record failure classification. One of these ends up inside a
/// `FetchOutcome::Failed` and in the run summary; the pipeline itself
/// keeps going.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("download failed after {attempts} attempt(s): {detail}")]
    Network { attempts: usize, detail: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("unreadable archive: {0}")]
    ArchiveCorrupt(String),

    /// Overlay composite could not be produced. Degrades to exposing the
    /// unmerged base file; never fatal for the record on its own.
    #[error("overlay merge failed: {0}")]
    MergeFailed(String),

    #[error("conversion failed: {0}")]
    ConversionFailed(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Short tag used when aggregating failures in the run summary.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Network { .. } => "network",
            PipelineError::Cancelled => "cancelled",
            PipelineError::InvalidPayload(_) => "invalid-payload",
            PipelineError::ArchiveCorrupt(_) => "archive-corrupt",
            PipelineError::MergeFailed(_) => "merge-failed",
            PipelineError::ConversionFailed(_) => "conversion-failed",
            PipelineError::ValidationFailed(_) => "validation-failed",
            PipelineError::Io(_) => "io",
        }
    }
}
