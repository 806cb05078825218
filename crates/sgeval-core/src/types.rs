use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::boxes::BoxList;
use crate::device::Device;
use crate::tensor::Tensor;

/// Dataset-assigned index of one evaluation item; the join key across workers.
pub type SampleId = u64;

/// Per-worker results, keyed by sample id. Duplicate inserts overwrite.
pub type ResultsDict = BTreeMap<SampleId, Prediction>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRange {
    pub start_id: u64,
    pub end_id: u64, // half-open [start_id, end_id)
}

impl WorkRange {
    pub fn len(&self) -> u64 {
        self.end_id.saturating_sub(self.start_id)
    }

    pub fn is_empty(&self) -> bool {
        self.start_id >= self.end_id
    }

    pub fn contains(&self, sample_id: u64) -> bool {
        self.start_id <= sample_id && sample_id < self.end_id
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShardError {
    #[error("world_size must be > 0")]
    EmptyWorld,
    #[error("rank {rank} out of range for world_size {world_size}")]
    RankOutOfRange { rank: usize, world_size: usize },
}

/// Contiguous, non-shuffled split of a dataset over `world_size` workers.
///
/// Every rank receives `ceil(total / world_size)` ids. The id space is padded
/// by wrapping around to the start, so the last rank may see ids that another
/// rank also owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardPlan {
    pub total_samples: u64,
    pub world_size: usize,
    pub samples_per_rank: u64,
}

impl ShardPlan {
    pub fn new(total_samples: u64, world_size: usize) -> Result<Self, ShardError> {
        if world_size == 0 {
            return Err(ShardError::EmptyWorld);
        }
        let samples_per_rank = total_samples.div_ceil(world_size as u64);
        Ok(Self {
            total_samples,
            world_size,
            samples_per_rank,
        })
    }

    /// Padded total; equal to `total_samples` when the split is even.
    pub fn padded_total(&self) -> u64 {
        self.samples_per_rank * self.world_size as u64
    }

    /// Range of positions in the padded id space owned by `rank`.
    pub fn range(&self, rank: usize) -> Result<WorkRange, ShardError> {
        if rank >= self.world_size {
            return Err(ShardError::RankOutOfRange {
                rank,
                world_size: self.world_size,
            });
        }
        let start_id = self.samples_per_rank * rank as u64;
        Ok(WorkRange {
            start_id,
            end_id: start_id + self.samples_per_rank,
        })
    }

    pub fn sample_ids(&self, rank: usize) -> Result<Vec<SampleId>, ShardError> {
        let range = self.range(rank)?;
        if self.total_samples == 0 {
            return Ok(Vec::new());
        }
        Ok((range.start_id..range.end_id)
            .map(|pos| pos % self.total_samples)
            .collect())
    }
}

/// One sample's model output, always host-resident once it leaves the
/// inference loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prediction {
    Boxes(BoxList),
    Loss(f32),
}

impl Prediction {
    pub fn as_loss(&self) -> Option<f32> {
        match self {
            Prediction::Loss(v) => Some(*v),
            Prediction::Boxes(_) => None,
        }
    }

    pub fn as_boxes(&self) -> Option<&BoxList> {
        match self {
            Prediction::Boxes(b) => Some(b),
            Prediction::Loss(_) => None,
        }
    }

    pub fn is_host_resident(&self) -> bool {
        match self {
            Prediction::Boxes(b) => b.device().is_cpu(),
            Prediction::Loss(_) => true,
        }
    }

    pub fn to(self, device: Device) -> Self {
        match self {
            Prediction::Boxes(b) => Prediction::Boxes(b.to(device)),
            loss => loss,
        }
    }
}

/// One loader step: per-sample images `(C, H, W)`, targets and ids, aligned by position.
#[derive(Debug, Clone)]
pub struct Batch {
    pub images: Vec<Tensor<f32>>,
    pub targets: Vec<BoxList>,
    pub sample_ids: Vec<SampleId>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch has {images} images, {targets} targets and {ids} sample ids")]
    Misaligned {
        images: usize,
        targets: usize,
        ids: usize,
    },
}

impl Batch {
    pub fn sample_count(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn validate(&self) -> Result<(), BatchError> {
        let ids = self.sample_ids.len();
        if self.images.len() != ids || self.targets.len() != ids {
            return Err(BatchError::Misaligned {
                images: self.images.len(),
                targets: self.targets.len(),
                ids,
            });
        }
        Ok(())
    }
}
