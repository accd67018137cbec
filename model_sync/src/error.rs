use std::{error::Error, fmt, io};

use ps_client::PsError;

use crate::buffers::SlotState;
use crate::device::DeviceError;
use crate::state::Phase;

/// The synchronization module's result type.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Model synchronization failures.
#[derive(Debug)]
pub enum SyncError {
    /// A decay coefficient outside `[0, 1]`.
    CoefficientOutOfRange { got: f32 },
    /// `init_model` was called on an engine that already holds state.
    AlreadyInitialized,
    /// An operation that needs an initialized engine ran in another phase.
    NotReady { phase: Phase },
    /// The model had no parameter tensors to register.
    EmptyModel,
    /// A tensor with a zero dimension at registration.
    InvalidShape {
        table: usize,
        rows: usize,
        cols: usize,
    },
    /// The caller passed a different number of tensors than were registered.
    TensorCountMismatch { got: usize, expected: usize },
    /// A tensor's element count drifted from its registered shape.
    TensorSizeMismatch {
        table: usize,
        got: usize,
        expected: usize,
    },
    /// A mirrored engine was given a tensor without device storage.
    MirrorUnsupported { table: usize },
    /// A buffer slot hand-over that conflicts with the slot's current owner.
    SlotUnavailable { slot: usize, state: SlotState },
    /// The background merge task panicked instead of returning.
    MergePanicked { detail: String },
    Server(PsError),
    Device(DeviceError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::CoefficientOutOfRange { got } => {
                write!(f, "decay coefficient out of range: got {got}, expected [0, 1]")
            }
            SyncError::AlreadyInitialized => {
                write!(f, "the engine model is already initialized")
            }
            SyncError::NotReady { phase } => {
                write!(f, "operation needs an initialized engine, but it is {phase}")
            }
            SyncError::EmptyModel => write!(f, "the model has no parameter tensors"),
            SyncError::InvalidShape { table, rows, cols } => {
                write!(f, "tensor {table} has a zero dimension: {rows}x{cols}")
            }
            SyncError::TensorCountMismatch { got, expected } => {
                write!(f, "tensor count mismatch: got {got}, expected {expected}")
            }
            SyncError::TensorSizeMismatch {
                table,
                got,
                expected,
            } => write!(
                f,
                "tensor {table} size mismatch: got {got} values, expected {expected}"
            ),
            SyncError::MirrorUnsupported { table } => {
                write!(f, "tensor {table} has no device storage to mirror")
            }
            SyncError::SlotUnavailable { slot, state } => {
                write!(f, "buffer slot {slot} cannot change hands while {state}")
            }
            SyncError::MergePanicked { detail } => {
                write!(f, "background merge panicked: {detail}")
            }
            SyncError::Server(e) => write!(f, "parameter server error: {e}"),
            SyncError::Device(e) => write!(f, "device error: {e}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            SyncError::Server(e) => Some(e),
            SyncError::Device(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PsError> for SyncError {
    fn from(value: PsError) -> Self {
        Self::Server(value)
    }
}

impl From<DeviceError> for SyncError {
    fn from(value: DeviceError) -> Self {
        Self::Device(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SyncError> for io::Error {
    fn from(value: SyncError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, value)
    }
}
