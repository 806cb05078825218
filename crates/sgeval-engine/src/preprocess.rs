use ::image::imageops::{self, FilterType};
use ::image::{GrayImage, RgbImage};
use ndarray::{Array3, ArrayView3, Axis, Ix3};
use rayon::prelude::*;
use thiserror::Error;

use sgeval_core::device::Device;
use sgeval_core::tensor::Tensor;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("image must have shape (C, H, W) with C in {{1, 3}}, got {0:?}")]
    BadShape(Vec<usize>),
    #[error("image of {width}x{height} does not fit the 8-bit buffer")]
    BufferMismatch { width: u32, height: u32 },
    #[error("cannot stack images of shapes {first:?} and {other:?}")]
    StackShape { first: Vec<usize>, other: Vec<usize> },
    #[error("cannot stack an empty image list")]
    EmptyStack,
}

/// Resizes a float `(C, H, W)` image in `[0, 1]` to `size x size`.
///
/// The image is quantized to 8 bits first and resized with a bilinear filter,
/// so results match a decode-resize-reload round trip through an RGB or luma
/// bitmap.
pub fn resize_square(image: &Tensor<f32>, size: u32) -> Result<Tensor<f32>, PreprocessError> {
    let view = image
        .data
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|_| PreprocessError::BadShape(image.shape().to_vec()))?;
    let (c, h, w) = view.dim();
    if c != 1 && c != 3 {
        return Err(PreprocessError::BadShape(image.shape().to_vec()));
    }
    let (width, height) = (w as u32, h as u32);
    let pixels = to_interleaved_u8(view);

    let side = size as usize;
    let resized = if c == 3 {
        let rgb = RgbImage::from_raw(width, height, pixels)
            .ok_or(PreprocessError::BufferMismatch { width, height })?;
        imageops::resize(&rgb, size, size, FilterType::Triangle).into_raw()
    } else {
        let luma = GrayImage::from_raw(width, height, pixels)
            .ok_or(PreprocessError::BufferMismatch { width, height })?;
        imageops::resize(&luma, size, size, FilterType::Triangle).into_raw()
    };

    let out = Array3::from_shape_fn((c, side, side), |(ch, y, x)| {
        f32::from(resized[(y * side + x) * c + ch]) / 255.0
    });
    Ok(Tensor::new(out.into_dyn(), image.device))
}

/// Resizes every image of a batch in parallel.
pub fn resize_batch(
    images: &[Tensor<f32>],
    size: u32,
) -> Result<Vec<Tensor<f32>>, PreprocessError> {
    images
        .par_iter()
        .map(|image| resize_square(image, size))
        .collect()
}

/// Stacks same-shaped images into one `(B, C, H, W)` tensor on `device`.
pub fn stack_images(
    images: &[Tensor<f32>],
    device: Device,
) -> Result<Tensor<f32>, PreprocessError> {
    let first = images.first().ok_or(PreprocessError::EmptyStack)?;
    if let Some(other) = images.iter().find(|i| i.shape() != first.shape()) {
        return Err(PreprocessError::StackShape {
            first: first.shape().to_vec(),
            other: other.shape().to_vec(),
        });
    }
    let views: Vec<_> = images.iter().map(|i| i.data.view()).collect();
    let stacked = ndarray::stack(Axis(0), &views).map_err(|_| PreprocessError::StackShape {
        first: first.shape().to_vec(),
        other: first.shape().to_vec(),
    })?;
    Ok(Tensor::new(stacked, device))
}

fn to_interleaved_u8(view: ArrayView3<'_, f32>) -> Vec<u8> {
    let (c, h, w) = view.dim();
    let mut out = Vec::with_capacity(c * h * w);
    for y in 0..h {
        for x in 0..w {
            for ch in 0..c {
                // `as` saturates, so out-of-range values clamp to 0 / 255.
                out.push((view[[ch, y, x]] * 255.0) as u8);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_image_stays_constant() {
        let img = Tensor::full(&[3, 5, 9], 1.0, Device::Cpu);
        let out = resize_square(&img, 4).unwrap();
        assert_eq!(out.shape(), &[3, 4, 4]);
        assert!(out.to_vec().iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn grayscale_is_supported() {
        let img = Tensor::full(&[1, 2, 2], 0.0, Device::Cuda(0));
        let out = resize_square(&img, 3).unwrap();
        assert_eq!(out.shape(), &[1, 3, 3]);
        assert_eq!(out.device, Device::Cuda(0));
    }

    #[test]
    fn rejects_unsupported_channels() {
        let img = Tensor::full(&[2, 4, 4], 0.0, Device::Cpu);
        assert_eq!(
            resize_square(&img, 2).unwrap_err(),
            PreprocessError::BadShape(vec![2, 4, 4])
        );
    }

    #[test]
    fn stack_builds_a_batch() {
        let a = Tensor::full(&[3, 2, 2], 0.0, Device::Cpu);
        let b = Tensor::full(&[3, 2, 2], 1.0, Device::Cpu);
        let batch = stack_images(&[a, b], Device::Cuda(0)).unwrap();
        assert_eq!(batch.shape(), &[2, 3, 2, 2]);
        assert_eq!(batch.device, Device::Cuda(0));
        assert_eq!(batch.data[[1, 2, 1, 1]], 1.0);
    }

    #[test]
    fn stack_rejects_mixed_shapes() {
        let a = Tensor::full(&[3, 2, 2], 0.0, Device::Cpu);
        let b = Tensor::full(&[3, 2, 3], 0.0, Device::Cpu);
        assert!(matches!(
            stack_images(&[a, b], Device::Cpu),
            Err(PreprocessError::StackShape { .. })
        ));
    }
}
