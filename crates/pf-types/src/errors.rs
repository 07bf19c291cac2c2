use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the phasefit system
#[derive(Error, Debug)]
pub enum PfError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Bounds error: {0}")]
    Bounds(#[from] BoundsError),

    #[error("Results error: {0}")]
    Results(#[from] ResultsError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Pipeline cancelled")]
    Cancelled,

    #[error("Phase '{phase}' failed ({kind}): {source}; completed phases: [{}]", completed.join(", "))]
    PhaseFailed {
        phase: String,
        kind: ErrorKind,
        completed: Vec<String>,
        #[source]
        source: Box<PfError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by misuse of a results collection or by looking up a
/// parameter that a result does not carry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResultsError {
    #[error("No result stored for phase '{name}'")]
    NotFound { name: String },

    #[error("A result named '{name}' is already stored")]
    DuplicateName { name: String },

    #[error("Results collection is empty")]
    Empty,

    #[error("Parameter {path} not found in result")]
    ParameterNotFound { path: String },

    #[error("Component '{component}' not found in result")]
    ComponentNotFound { component: String },

    #[error("Phase '{name}' has no hyper-combined result")]
    NoHyperCombined { name: String },
}

/// A linked prior range collapsed or inverted.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BoundsError {
    #[error("Linked range for {path} is empty or inverted: [{lower}, {upper}]")]
    EmptyRange {
        path: String,
        lower: f64,
        upper: f64,
    },

    #[error("Invalid width {value} for {path}")]
    InvalidWidth { path: String, value: f64 },
}

/// Failures of the optimizer boundary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptimizationError {
    #[error("Optimizer failed: {message}")]
    Failed { message: String },

    #[error("Optimizer exceeded its deadline of {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("Optimizer returned an invalid result: {message}")]
    InvalidResult { message: String },
}

impl OptimizationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Checkpoint storage errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("Checkpoint for phase '{phase}' is marked complete but {file} is missing")]
    MissingFile { phase: String, file: String },

    #[error("Checkpoint for phase '{phase}' is corrupt: {message}")]
    Corrupt { phase: String, message: String },
}

/// Coarse classification of a failure, reported alongside the failing phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Config,
    Bounds,
    NotFound,
    DuplicateName,
    Empty,
    Optimization,
    Timeout,
    Checkpoint,
    Io,
    Cancelled,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Config => "ConfigError",
            ErrorKind::Bounds => "BoundsError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::DuplicateName => "DuplicateNameError",
            ErrorKind::Empty => "EmptyError",
            ErrorKind::Optimization => "OptimizationError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Checkpoint => "CheckpointError",
            ErrorKind::Io => "IoError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(name)
    }
}

impl PfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PfError::Config(_) => ErrorKind::Config,
            PfError::Bounds(_) => ErrorKind::Bounds,
            PfError::Results(e) => match e {
                ResultsError::DuplicateName { .. } => ErrorKind::DuplicateName,
                ResultsError::Empty => ErrorKind::Empty,
                _ => ErrorKind::NotFound,
            },
            PfError::Optimization(OptimizationError::Timeout { .. }) => ErrorKind::Timeout,
            PfError::Optimization(_) => ErrorKind::Optimization,
            PfError::Checkpoint(_) => ErrorKind::Checkpoint,
            PfError::Io(_) => ErrorKind::Io,
            PfError::Serialization(_) => ErrorKind::Checkpoint,
            PfError::Cancelled => ErrorKind::Cancelled,
            PfError::PhaseFailed { kind, .. } => *kind,
            PfError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry policy may re-run the call that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PfError::Optimization(_))
    }
}

/// Result type alias for phasefit operations
pub type PfResult<T> = Result<T, PfError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::PfError::Config(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::PfError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = BoundsError::EmptyRange {
            path: "lens.einstein_radius".to_string(),
            lower: 2.0,
            upper: 1.0,
        };

        assert!(error.to_string().contains("lens.einstein_radius"));
        assert!(error.to_string().contains("[2, 1]"));
    }

    #[test]
    fn test_error_conversion() {
        let results_error = ResultsError::NotFound {
            name: "phase_1".to_string(),
        };
        let pf_error: PfError = results_error.into();

        match pf_error {
            PfError::Results(_) => (),
            _ => panic!("Expected Results error"),
        }
    }

    #[test]
    fn test_kind_mapping() {
        let timeout: PfError = OptimizationError::Timeout { timeout_ms: 10 }.into();
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.is_retryable());

        let invalid: PfError = OptimizationError::InvalidResult {
            message: "nan evidence".into(),
        }
        .into();
        assert_eq!(invalid.kind(), ErrorKind::Optimization);
        assert!(invalid.is_retryable());
        assert!(!PfError::Config("bad".into()).is_retryable());

        let dup: PfError = ResultsError::DuplicateName { name: "x".into() }.into();
        assert_eq!(dup.kind(), ErrorKind::DuplicateName);
        assert_eq!(PfError::from(ResultsError::Empty).kind(), ErrorKind::Empty);
        assert_eq!(
            PfError::from(ResultsError::ParameterNotFound { path: "a.b".into() }).kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_phase_failed_reports_context() {
        let err = PfError::PhaseFailed {
            phase: "phase_2".into(),
            kind: ErrorKind::Optimization,
            completed: vec!["phase_1".into()],
            source: Box::new(OptimizationError::failed("diverged").into()),
        };
        let text = err.to_string();
        assert!(text.contains("phase_2"));
        assert!(text.contains("OptimizationError"));
        assert!(text.contains("phase_1"));
        assert_eq!(err.kind(), ErrorKind::Optimization);
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Missing required field: {}", "name");
        assert_eq!(config_err.kind(), ErrorKind::Config);
        let internal_err = internal_error!("Something went wrong");
        assert_eq!(internal_err.kind(), ErrorKind::Internal);
    }
}
