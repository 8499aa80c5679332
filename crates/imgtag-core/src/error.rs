use crate::model::ErrorCode;

/// The five-kind taxonomy a `Processor::process` call can end in. Every terminal job failure boils down to one of these plus a
/// free-form reason string.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("canceled")]
    Canceled,
    #[error("timeout")]
    Timeout,
    #[error("terminated")]
    Terminated,
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl ProcessError {
    pub fn code(&self) -> ErrorCode {
        match self {
            ProcessError::Canceled => ErrorCode::Canceled,
            ProcessError::Timeout => ErrorCode::Timeout,
            ProcessError::Terminated => ErrorCode::Terminated,
            ProcessError::Invalid(_) => ErrorCode::Invalid,
            ProcessError::InternalError(_) => ErrorCode::InternalError,
        }
    }

    pub fn reason(&self) -> String {
        match self {
            ProcessError::Canceled => String::new(),
            ProcessError::Timeout => "timeout".to_string(),
            ProcessError::Terminated => "terminated".to_string(),
            ProcessError::Invalid(reason) => reason.clone(),
            ProcessError::InternalError(reason) => reason.clone(),
        }
    }
}
