use crate::device::{DeviceRuntime, HostRuntime};

/// One parameter tensor of the local model.
///
/// The engine moves values between tensors and its flat buffers through this
/// trait. A tensor lives on the host unless it reports device storage, in
/// which case a mirrored engine copies it with the device runtime instead of
/// `read_into` / `write_from`.
pub trait ParamTensor<R: DeviceRuntime = HostRuntime> {
    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    /// Total number of `f32` values in the tensor.
    fn element_count(&self) -> usize {
        self.rows() * self.cols()
    }

    /// Copies the tensor's values into `dst`, which holds exactly
    /// `element_count` values.
    fn read_into(&self, dst: &mut [f32]);

    /// Overwrites the tensor's values from `src`, which holds exactly
    /// `element_count` values.
    fn write_from(&mut self, src: &[f32]);

    /// The tensor's device buffer, when it keeps its values on a device.
    fn device_storage(&self) -> Option<&R::Buf> {
        None
    }

    fn device_storage_mut(&mut self) -> Option<&mut R::Buf> {
        None
    }
}

/// A host tensor backed by a flat row-major `Vec<f32>`.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    rows: usize,
    cols: usize,
    values: Vec<f32>,
}

impl DenseTensor {
    /// Creates a zero-filled `rows` by `cols` tensor.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            values: vec![0.0; rows * cols],
        }
    }

    /// Creates a tensor from row-major values.
    ///
    /// Panics when `values` does not hold exactly `rows * cols` entries.
    pub fn from_values(rows: usize, cols: usize, values: Vec<f32>) -> Self {
        assert_eq!(values.len(), rows * cols, "tensor value count");
        Self { rows, cols, values }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.values
    }
}

impl<R: DeviceRuntime> ParamTensor<R> for DenseTensor {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn read_into(&self, dst: &mut [f32]) {
        dst.copy_from_slice(&self.values);
    }

    fn write_from(&mut self, src: &[f32]) {
        self.values.copy_from_slice(src);
    }
}

/// A tensor that advertises device storage, for exercising the mirrored path
/// with the [`HostRuntime`].
#[derive(Debug, Clone, PartialEq)]
pub struct MirroredTensor {
    rows: usize,
    cols: usize,
    storage: Vec<f32>,
}

impl MirroredTensor {
    /// Creates a tensor from row-major values held as host "device" storage.
    ///
    /// Panics when `values` does not hold exactly `rows * cols` entries.
    pub fn from_values(rows: usize, cols: usize, values: Vec<f32>) -> Self {
        assert_eq!(values.len(), rows * cols, "tensor value count");
        Self {
            rows,
            cols,
            storage: values,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.storage
    }

    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.storage
    }
}

impl<R> ParamTensor<R> for MirroredTensor
where
    R: DeviceRuntime<Buf = Vec<f32>>,
{
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn read_into(&self, dst: &mut [f32]) {
        dst.copy_from_slice(&self.storage);
    }

    fn write_from(&mut self, src: &[f32]) {
        self.storage.copy_from_slice(src);
    }

    fn device_storage(&self) -> Option<&Vec<f32>> {
        Some(&self.storage)
    }

    fn device_storage_mut(&mut self) -> Option<&mut Vec<f32>> {
        Some(&mut self.storage)
    }
}
