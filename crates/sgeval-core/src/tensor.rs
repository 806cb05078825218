use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape:?} does not match {len} elements")]
    ShapeMismatch { shape: Vec<usize>, len: usize },
    #[error("transpose expects a tensor with at most 2 dims, got {0}")]
    TransposeRank(usize),
    #[error("expected a {expected}-d tensor, got shape {shape:?}")]
    Rank { expected: usize, shape: Vec<usize> },
}

/// An n-d array tagged with the device its storage belongs to.
///
/// Moving between devices only retags the storage here; real accelerator
/// backends copy through the `Backend` seam in the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<A = f32> {
    pub data: ArrayD<A>,
    pub device: Device,
}

impl<A> Tensor<A> {
    pub fn new(data: ArrayD<A>, device: Device) -> Self {
        Self { data, device }
    }

    /// Host tensor built from a flat buffer in row-major order.
    pub fn from_shape_vec(shape: &[usize], values: Vec<A>) -> Result<Self, TensorError> {
        let len = values.len();
        let data =
            ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|_| TensorError::ShapeMismatch {
                shape: shape.to_vec(),
                len,
            })?;
        Ok(Self::new(data, Device::Cpu))
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn to(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Swaps the two axes of a matrix; 0-d and 1-d tensors are returned as is.
    ///
    /// The result shares the element order of the input, so it is generally not
    /// contiguous. Call [`Tensor::contiguous`] to re-pack it.
    pub fn t(self) -> Result<Self, TensorError> {
        if self.ndim() > 2 {
            return Err(TensorError::TransposeRank(self.ndim()));
        }
        Ok(Self {
            data: self.data.reversed_axes(),
            device: self.device,
        })
    }

    pub fn is_contiguous(&self) -> bool {
        self.data.is_standard_layout()
    }

    pub fn ensure_rank(&self, expected: usize) -> Result<(), TensorError> {
        if self.ndim() != expected {
            return Err(TensorError::Rank {
                expected,
                shape: self.shape().to_vec(),
            });
        }
        Ok(())
    }
}

impl<A: Clone> Tensor<A> {
    pub fn contiguous(self) -> Self {
        if self.is_contiguous() {
            return self;
        }
        Self {
            data: self.data.as_standard_layout().into_owned(),
            device: self.device,
        }
    }

    /// Elements in logical row-major order.
    pub fn to_vec(&self) -> Vec<A> {
        self.data.iter().cloned().collect()
    }
}

impl Tensor<f32> {
    pub fn full(shape: &[usize], value: f32, device: Device) -> Self {
        Self::new(ArrayD::from_elem(IxDyn(shape), value), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_shape_vec_rejects_bad_length() {
        let err = Tensor::from_shape_vec(&[2, 3], vec![0.0f32; 5]).unwrap_err();
        assert_eq!(
            err,
            TensorError::ShapeMismatch {
                shape: vec![2, 3],
                len: 5
            }
        );
    }

    #[test]
    fn transpose_then_contiguous_repacks_storage() {
        let pairs = Tensor::from_shape_vec(&[3, 2], vec![0i64, 1, 1, 2, 2, 0]).unwrap();
        let t = pairs.t().unwrap();
        assert_eq!(t.shape(), &[2, 3]);
        assert!(!t.is_contiguous());

        let t = t.contiguous();
        assert!(t.is_contiguous());
        assert_eq!(t.to_vec(), vec![0, 1, 2, 1, 2, 0]);
    }

    #[test]
    fn transpose_rejects_3d() {
        let x = Tensor::full(&[1, 2, 3], 0.0, Device::Cpu);
        assert_eq!(x.t().unwrap_err(), TensorError::TransposeRank(3));
    }

    #[test]
    fn transpose_of_vector_is_identity() {
        let x = Tensor::from_shape_vec(&[3], vec![1.0f32, 2.0, 3.0]).unwrap();
        let y = x.clone().t().unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn to_retags_device() {
        let x = Tensor::full(&[2], 1.0, Device::Cpu).to(Device::Cuda(1));
        assert_eq!(x.device, Device::Cuda(1));
        assert_eq!(x.to_vec(), vec![1.0, 1.0]);
    }
}
