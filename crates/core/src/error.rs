use crate::types::WindowId;

/// Failure of a capture/input/window/process collaborator.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The backend itself cannot serve requests. Never retried.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("window {0} is gone")]
    WindowGone(WindowId),
    #[error("backend call failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("scene '{scene}' not found before timeout")]
    NotFound { scene: String },
    #[error("action failed at {stage}: {reason}")]
    ActionFailed { stage: String, reason: String },
    #[error("exceptional scene '{scene}' detected")]
    ExceptionalScene { scene: String },
    #[error("manual intervention required: {0}")]
    ManualInterventionRequired(String),
    #[error("recoverable failure: {0}")]
    Recoverable(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("cycle state persistence failed: {0}")]
    Persist(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that abort the cycle without retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Backend(BackendError::Unavailable(_))
                | EngineError::Persist(_)
                | EngineError::Config(_)
        )
    }

    pub fn requires_operator(&self) -> bool {
        matches!(self, EngineError::ManualInterventionRequired(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(EngineError::from(BackendError::Unavailable("gdi".into())).is_fatal());
        assert!(!EngineError::from(BackendError::WindowGone(7)).is_fatal());
        assert!(!EngineError::Recoverable("x".into()).is_fatal());
        assert!(EngineError::ManualInterventionRequired("x".into()).requires_operator());
        assert!(!EngineError::NotFound { scene: "lobby".into() }.requires_operator());
    }
}
