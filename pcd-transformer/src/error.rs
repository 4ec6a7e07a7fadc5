#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("{criterion}: {message}")]
    InvalidParameter {
        criterion: &'static str,
        message: String,
    },
    #[error("{criterion}: attribute index {index} is out of range, the source declares {available} extra attributes")]
    AttributeOutOfRange {
        criterion: &'static str,
        index: usize,
        available: usize,
    },
    #[error("'{0}' needs to be preceded by at least {1} filters")]
    MissingOperands(&'static str, usize),
}

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("{operation}: {message}")]
    InvalidParameter {
        operation: &'static str,
        message: String,
    },
    #[error(transparent)]
    Filter(#[from] FilterError),
}
