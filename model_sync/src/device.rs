use std::fmt;

/// Failure of a device memory operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The runtime could not allocate a buffer of `len` values.
    Alloc { len: usize },
    /// A copy failed or was attempted between buffers of different lengths.
    Copy { direction: &'static str },
    /// Waiting for outstanding device work failed.
    Sync,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Alloc { len } => {
                write!(f, "failed to allocate a device buffer of {len} values")
            }
            DeviceError::Copy { direction } => write!(f, "device copy failed ({direction})"),
            DeviceError::Sync => write!(f, "device synchronization failed"),
        }
    }
}

impl std::error::Error for DeviceError {}

/// Memory operations of the accelerator holding the model parameters.
///
/// The engine keeps per-slot mirrors of the model in device memory so that
/// staging a parameter copy is a device-to-device transfer instead of a trip
/// through the host. All methods are synchronous from the caller's point of
/// view; an asynchronous backend queues the copy and makes `synchronize` wait
/// for completion.
pub trait DeviceRuntime: Send + Sync + 'static {
    /// A device-resident buffer of `f32` values.
    type Buf: Send + 'static;

    /// Allocates a zeroed device buffer of `len` values.
    fn alloc(&self, len: usize) -> Result<Self::Buf, DeviceError>;

    /// Copies host values into a device buffer of the same length.
    fn upload(&self, src: &[f32], dst: &mut Self::Buf) -> Result<(), DeviceError>;

    /// Copies a device buffer into a host slice of the same length.
    fn download(&self, src: &Self::Buf, dst: &mut [f32]) -> Result<(), DeviceError>;

    /// Copies between two device buffers of the same length.
    fn transfer(&self, src: &Self::Buf, dst: &mut Self::Buf) -> Result<(), DeviceError>;

    /// Waits until every queued copy has completed.
    fn synchronize(&self) -> Result<(), DeviceError>;
}

/// A runtime whose "device" is plain host memory.
///
/// Copies complete immediately, so `synchronize` is a no-op. Useful for tests
/// and for exercising the mirrored path without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostRuntime;

impl HostRuntime {
    pub fn new() -> Self {
        HostRuntime
    }
}

fn copy_checked(src: &[f32], dst: &mut [f32], direction: &'static str) -> Result<(), DeviceError> {
    if src.len() != dst.len() {
        return Err(DeviceError::Copy { direction });
    }
    dst.copy_from_slice(src);
    Ok(())
}

impl DeviceRuntime for HostRuntime {
    type Buf = Vec<f32>;

    fn alloc(&self, len: usize) -> Result<Self::Buf, DeviceError> {
        Ok(vec![0.0; len])
    }

    fn upload(&self, src: &[f32], dst: &mut Self::Buf) -> Result<(), DeviceError> {
        copy_checked(src, dst, "host to device")
    }

    fn download(&self, src: &Self::Buf, dst: &mut [f32]) -> Result<(), DeviceError> {
        copy_checked(src, dst, "device to host")
    }

    fn transfer(&self, src: &Self::Buf, dst: &mut Self::Buf) -> Result<(), DeviceError> {
        copy_checked(src, dst, "device to device")
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_buffers_round_trip() {
        let runtime = HostRuntime::new();
        let mut buf = runtime.alloc(4).unwrap();
        assert_eq!(buf, vec![0.0; 4]);

        runtime.upload(&[1.0, 2.0, 3.0, 4.0], &mut buf).unwrap();

        let mut other = runtime.alloc(4).unwrap();
        runtime.transfer(&buf, &mut other).unwrap();

        let mut host = [0.0; 4];
        runtime.download(&other, &mut host).unwrap();
        assert_eq!(host, [1.0, 2.0, 3.0, 4.0]);
        runtime.synchronize().unwrap();
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let runtime = HostRuntime::new();
        let mut buf = runtime.alloc(3).unwrap();

        let err = runtime.upload(&[1.0, 2.0], &mut buf).unwrap_err();
        assert_eq!(
            err,
            DeviceError::Copy {
                direction: "host to device"
            }
        );

        let mut host = [0.0; 5];
        assert!(runtime.download(&buf, &mut host).is_err());
    }
}
