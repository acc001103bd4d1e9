/// Failure classes of the volume pipeline.
///
/// These are raised as the root cause of an `anyhow::Error`; callers that
/// need to tell them apart use `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("fetch {url}: {message}")]
    Fetch { url: String, message: String },

    #[error("obfuscation scheme mismatch: {0}")]
    Deobfuscation(String),

    #[error("image {source_ref}: {message}")]
    Image { source_ref: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn fetch(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Fetch {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn image(source_ref: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Image {
            source_ref: source_ref.into(),
            message: message.to_string(),
        }
    }
}

/// Returns the pipeline failure class carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}
