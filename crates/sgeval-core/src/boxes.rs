use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxMode {
    Xyxy,
    Xywh,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BoxListError {
    #[error("boxes must have shape (N, 4), got {0:?}")]
    BadBoxShape(Vec<usize>),
    #[error("field {field} has {got} rows, expected {expected}")]
    FieldLength {
        field: String,
        got: usize,
        expected: usize,
    },
}

/// Boxes of one image together with their per-box fields (`scores`, `labels`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoxList {
    pub boxes: Tensor<f32>,
    /// Image size as `(width, height)`.
    pub image_size: (u32, u32),
    pub mode: BoxMode,
    pub fields: BTreeMap<String, Tensor<f32>>,
}

impl BoxList {
    pub fn new(
        boxes: Tensor<f32>,
        image_size: (u32, u32),
        mode: BoxMode,
    ) -> Result<Self, BoxListError> {
        let shape = boxes.shape();
        if shape.len() != 2 || shape[1] != 4 {
            return Err(BoxListError::BadBoxShape(shape.to_vec()));
        }
        Ok(Self {
            boxes,
            image_size,
            mode,
            fields: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.boxes.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        values: Tensor<f32>,
    ) -> Result<(), BoxListError> {
        let name = name.into();
        let rows = values.shape().first().copied().unwrap_or(0);
        if rows != self.len() {
            return Err(BoxListError::FieldLength {
                field: name,
                got: rows,
                expected: self.len(),
            });
        }
        self.fields.insert(name, values);
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&Tensor<f32>> {
        self.fields.get(name)
    }

    pub fn device(&self) -> Device {
        self.boxes.device
    }

    pub fn to(self, device: Device) -> Self {
        Self {
            boxes: self.boxes.to(device),
            image_size: self.image_size,
            mode: self.mode,
            fields: self
                .fields
                .into_iter()
                .map(|(k, v)| (k, v.to(device)))
                .collect(),
        }
    }
}
