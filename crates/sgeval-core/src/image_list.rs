use ndarray::{s, Array4, Ix3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;
use crate::tensor::Tensor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageListError {
    #[error("cannot build an image list from zero images")]
    Empty,
    #[error("image {index} must have shape (C, H, W), got {shape:?}")]
    BadShape { index: usize, shape: Vec<usize> },
    #[error("image {index} has {got} channels, expected {expected}")]
    ChannelMismatch {
        index: usize,
        got: usize,
        expected: usize,
    },
}

/// Images of different sizes zero-padded into one `(B, C, H, W)` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageList {
    pub tensors: Tensor<f32>,
    /// `(height, width)` of every image before padding.
    pub image_sizes: Vec<(usize, usize)>,
}

impl ImageList {
    /// Pads every image to the batch maximum, rounded up to a multiple of
    /// `size_divisibility` (0 disables rounding). The result lives on the
    /// device of the first image.
    pub fn from_tensors(
        images: &[Tensor<f32>],
        size_divisibility: usize,
    ) -> Result<Self, ImageListError> {
        let first = images.first().ok_or(ImageListError::Empty)?;
        let device = first.device;

        let mut channels = None;
        let mut max_h = 0usize;
        let mut max_w = 0usize;
        let mut image_sizes = Vec::with_capacity(images.len());
        for (index, image) in images.iter().enumerate() {
            let shape = image.shape();
            if shape.len() != 3 {
                return Err(ImageListError::BadShape {
                    index,
                    shape: shape.to_vec(),
                });
            }
            let expected = *channels.get_or_insert(shape[0]);
            if shape[0] != expected {
                return Err(ImageListError::ChannelMismatch {
                    index,
                    got: shape[0],
                    expected,
                });
            }
            max_h = max_h.max(shape[1]);
            max_w = max_w.max(shape[2]);
            image_sizes.push((shape[1], shape[2]));
        }

        let max_h = round_up(max_h, size_divisibility);
        let max_w = round_up(max_w, size_divisibility);
        let c = channels.unwrap_or(0);

        let mut batched = Array4::<f32>::zeros((images.len(), c, max_h, max_w));
        for (i, image) in images.iter().enumerate() {
            let (h, w) = image_sizes[i];
            let view = image
                .data
                .view()
                .into_dimensionality::<Ix3>()
                .map_err(|_| ImageListError::BadShape {
                    index: i,
                    shape: image.shape().to_vec(),
                })?;
            batched.slice_mut(s![i, .., ..h, ..w]).assign(&view);
        }

        Ok(Self {
            tensors: Tensor::new(batched.into_dyn(), device),
            image_sizes,
        })
    }

    pub fn len(&self) -> usize {
        self.image_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image_sizes.is_empty()
    }

    pub fn to(self, device: Device) -> Self {
        Self {
            tensors: self.tensors.to(device),
            image_sizes: self.image_sizes,
        }
    }
}

fn round_up(value: usize, divisor: usize) -> usize {
    if divisor == 0 {
        value
    } else {
        value.div_ceil(divisor) * divisor
    }
}
