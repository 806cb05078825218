use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{field} must be > 0")]
    NonPositive { field: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerLoss {
    /// Margin ranking loss over `format_scores` operands.
    #[default]
    MarginRanking,
    /// Mean squared error over `format_scores_reg` operands.
    Regression,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Square side the listener's image encoder expects.
    pub image_size: u32,
    pub gnn_output: usize,
    pub cnn_output: usize,
    pub loss: ListenerLoss,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            gnn_output: 64,
            cnn_output: 64,
            loss: ListenerLoss::MarginRanking,
        }
    }
}

impl ListenerConfig {
    /// Input width of the listener head: image features concatenated with graph features.
    pub fn end_input_width(&self) -> usize {
        self.cnn_output + self.gnn_output
    }
}

/// Evaluation settings, passed explicitly into every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub allow_load_from_cache: bool,
    pub bbox_aug_enabled: bool,
    pub device: Device,
    /// Gather partial results after every batch instead of once at the end.
    pub sync_gather: bool,
    pub size_divisibility: usize,
    pub listener: ListenerConfig,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            allow_load_from_cache: false,
            bbox_aug_enabled: false,
            device: Device::default(),
            sync_gather: true,
            size_divisibility: 32,
            listener: ListenerConfig::default(),
        }
    }
}

impl EvalConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listener.image_size == 0 {
            return Err(ConfigError::NonPositive {
                field: "listener.image_size",
            });
        }
        if self.listener.gnn_output == 0 {
            return Err(ConfigError::NonPositive {
                field: "listener.gnn_output",
            });
        }
        if self.listener.cnn_output == 0 {
            return Err(ConfigError::NonPositive {
                field: "listener.cnn_output",
            });
        }
        Ok(())
    }
}
