use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a tensor's storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Device {
    Cpu,
    Cuda(u32),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceParseError {
    #[error("empty device string")]
    Empty,
    #[error("unknown device kind {0:?}; expected 'cpu', 'cuda' or 'cuda:<ordinal>'")]
    UnknownKind(String),
    #[error("invalid device ordinal {0:?}")]
    InvalidOrdinal(String),
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl Default for Device {
    fn default() -> Self {
        Device::Cuda(0)
    }
}

impl FromStr for Device {
    type Err = DeviceParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let input = input.trim();
        if input.is_empty() {
            return Err(DeviceParseError::Empty);
        }

        let (kind, ordinal) = match input.split_once(':') {
            Some((kind, ordinal)) => (kind, Some(ordinal)),
            None => (input, None),
        };

        match (kind.to_ascii_lowercase().as_str(), ordinal) {
            ("cpu", None) => Ok(Device::Cpu),
            ("cuda", None) => Ok(Device::Cuda(0)),
            ("cuda", Some(ordinal)) => ordinal
                .parse::<u32>()
                .map(Device::Cuda)
                .map_err(|_| DeviceParseError::InvalidOrdinal(ordinal.to_string())),
            _ => Err(DeviceParseError::UnknownKind(input.to_string())),
        }
    }
}

impl TryFrom<String> for Device {
    type Error = DeviceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Device> for String {
    fn from(value: Device) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
        }
    }
}
