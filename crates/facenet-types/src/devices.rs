//! Device types

use crate::FacenetError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Device the model parameters live on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// CPU device
    #[default]
    Cpu,
    /// NVIDIA CUDA device with device index
    Cuda(usize),
    /// Apple GPU
    Metal(usize),
}

impl Device {
    /// Check if device is GPU-based
    pub fn is_gpu(&self) -> bool {
        !matches!(self, Device::Cpu)
    }

    /// Get device index for GPU devices
    pub fn index(&self) -> Option<usize> {
        match self {
            Device::Cuda(idx) | Device::Metal(idx) => Some(*idx),
            Device::Cpu => None,
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(idx) => write!(f, "cuda:{}", idx),
            Device::Metal(idx) => write!(f, "metal:{}", idx),
        }
    }
}

impl FromStr for Device {
    type Err = FacenetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        let (kind, index) = match lower.split_once(':') {
            Some((kind, idx)) => {
                let idx = idx
                    .parse::<usize>()
                    .map_err(|_| FacenetError::device(format!("Invalid device index in '{}'", s)))?;
                (kind.to_string(), idx)
            }
            None => (lower.clone(), 0),
        };

        match kind.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(index)),
            "metal" | "mps" => Ok(Device::Metal(index)),
            _ => Err(FacenetError::device(format!("Unknown device '{}'", s))),
        }
    }
}
