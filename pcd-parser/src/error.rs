use pcd_transformer::{FilterError, TransformError};

/// Contradictory or incomplete reader configuration, detected before anything is opened.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no input specified")]
    NoInput,
    #[error("cannot read from stdin and from files at the same time")]
    StdinWithFiles,
    #[error("{0} input files need to be merged or split into one configuration per file")]
    UnmergedInputs(usize),
    #[error("buffering neighbors needs exactly one primary file, got {0}")]
    BufferedManyFiles(usize),
    #[error("neighbor files were given but the buffer size is {0}")]
    NoBufferSize(f64),
    #[error("a buffer size of {0} was given without neighbor files")]
    NoNeighbors(f64),
    #[error("pipe-on was requested without a consumer")]
    MissingSink,
    #[error("invalid scale factor {0} for {1}")]
    InvalidScale(f64, char),
    #[error(transparent)]
    Filter(#[from] FilterError),
    #[error(transparent)]
    Transform(#[from] TransformError),
}

#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("LAS error: {0}")]
    Las(#[from] las::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("spatial index error: {0}")]
    Index(#[from] bitcode::Error),
    #[error("{path}: {message}")]
    Format { path: String, message: String },
    #[error("required attribute '{0}' is missing")]
    MissingField(&'static str),
    #[error("the source cannot seek")]
    NotSeekable,
    #[error("cannot seek to point {index}, the source has {count} points")]
    SeekOutOfRange { index: u64, count: u64 },
    #[error("no points were stored")]
    NothingStored,
    #[error("the reader is closed")]
    Closed,
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
