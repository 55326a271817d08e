use thiserror::Error;

#[derive(Error, Debug)]
pub enum GridError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transient submission failure: {0}")]
    TransientSubmission(String),

    /// Every attempt failed; the message lists each attempt's reason.
    #[error("Submission failed after {attempts} attempts:\n{message}")]
    SubmissionFailed { attempts: u32, message: String },

    #[error("Master unavailable")]
    MasterUnavailable,

    #[error("Method \"{0}\" is not supported for obtaining finished job information")]
    UnsupportedMethod(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A call to a running bridge's HTTP API failed.
    #[error("API error: {0}")]
    Api(String),
}

impl From<reqwest::Error> for GridError {
    fn from(err: reqwest::Error) -> Self {
        GridError::Api(err.to_string())
    }
}

impl From<rusqlite::Error> for GridError {
    fn from(err: rusqlite::Error) -> Self {
        GridError::Persistence(err.to_string())
    }
}

impl GridError {
    /// Wire form returned to the orchestrator, distinct from any job identifier.
    pub fn to_wire(&self) -> String {
        match self {
            GridError::SubmissionFailed { message, .. } => format!("ERROR:{}", message),
            other => format!("ERROR:{}", other),
        }
    }
}

pub type Result<T> = std::result::Result<T, GridError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_is_prefixed() {
        let err = GridError::SubmissionFailed {
            attempts: 2,
            message: "Attempt 1: a\nAttempt 2: b\n".to_string(),
        };
        assert_eq!(err.to_wire(), "ERROR:Attempt 1: a\nAttempt 2: b\n");
        assert!(GridError::MasterUnavailable.to_wire().starts_with("ERROR:"));
    }

    #[test]
    fn rusqlite_errors_become_persistence() {
        let err: GridError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, GridError::Persistence(_)));
    }
}
