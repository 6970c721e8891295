use thiserror::Error;

/// Failures captured by the session. The display string is what ends up in `last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Error loading model: {0}")]
    ModelLoad(String),
    #[error("Error generating response: {0}")]
    Generation(String),
    #[error("Error resetting conversation: {0}")]
    Reset(String),
}

impl SessionError {
    pub fn model_load(err: &anyhow::Error) -> Self {
        Self::ModelLoad(format!("{err:#}"))
    }

    pub fn generation(err: &anyhow::Error) -> Self {
        Self::Generation(format!("{err:#}"))
    }

    pub fn reset(err: &anyhow::Error) -> Self {
        Self::Reset(format!("{err:#}"))
    }
}
