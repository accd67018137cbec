use std::{error::Error, fmt};

/// The parameter-server client's result type.
pub type Result<T> = std::result::Result<T, PsError>;

/// Failures raised by a parameter-server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PsError {
    /// A table handle that was never created on this cluster.
    UnknownTable {
        table: usize,
    },
    /// A worker tried to attach to an existing table with a different shape.
    ShapeMismatch {
        table: usize,
        got: (usize, usize),
        expected: (usize, usize),
    },
    /// A buffer passed to `add`/`get` does not match the table's element count.
    SizeMismatch {
        table: usize,
        got: usize,
        expected: usize,
    },
    /// The client was used after `shutdown`.
    Disconnected,
}

impl fmt::Display for PsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsError::UnknownTable { table } => {
                write!(f, "unknown table {table}: no such table was created")
            }
            PsError::ShapeMismatch {
                table,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch attaching to table {table}: got {}x{}, expected {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            PsError::SizeMismatch {
                table,
                got,
                expected,
            } => write!(
                f,
                "buffer length mismatch on table {table}: got {got}, expected {expected}"
            ),
            PsError::Disconnected => write!(f, "client is disconnected from the cluster"),
        }
    }
}

impl Error for PsError {}
