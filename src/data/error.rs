use std::{error::Error, fmt, io};

/// The data module's result type.
pub type Result<T> = std::result::Result<T, DataError>;

/// Errors produced while loading, validating or partitioning a dataset.
#[derive(Debug)]
pub enum DataError {
    /// The feature buffer doesn't match `labels.len() * feature_dim`.
    SizeMismatch { got: usize, expected: usize },
    /// A sample's label is not in `[0, num_classes)`.
    LabelOutOfRange {
        index: usize,
        label: usize,
        num_classes: usize,
    },
    /// The inputs can't produce a valid dataset or partition.
    Configuration(String),
    /// A dataset file has an unparsable row.
    Parse { line: usize, msg: String },
    Io(io::Error),
}

impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataError::SizeMismatch { got, expected } => {
                write!(f, "feature buffer has {got} values, expected {expected}")
            }
            DataError::LabelOutOfRange {
                index,
                label,
                num_classes,
            } => write!(
                f,
                "sample {index} has label {label}, outside of [0, {num_classes})"
            ),
            DataError::Configuration(msg) => write!(f, "configuration error: {msg}"),
            DataError::Parse { line, msg } => write!(f, "line {line}: {msg}"),
            DataError::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for DataError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DataError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DataError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}
