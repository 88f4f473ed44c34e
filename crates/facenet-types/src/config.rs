//! Configuration enums shared by the model builder and the CLI

use crate::FacenetError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Channel-ordering convention of image tensors.
///
/// `ChannelsLast` (`NHWC`) is the default and the ordering the published
/// FaceNet weights were produced under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    /// `NCHW`
    ChannelsFirst,
    /// `NHWC`
    #[default]
    ChannelsLast,
}

impl DataFormat {
    /// Axis holding the channel dimension of a rank-4 tensor.
    pub fn channel_axis(self) -> usize {
        match self {
            DataFormat::ChannelsFirst => 1,
            DataFormat::ChannelsLast => 3,
        }
    }

    /// Axes holding the (height, width) dimensions of a rank-4 tensor.
    pub fn spatial_axes(self) -> (usize, usize) {
        match self {
            DataFormat::ChannelsFirst => (2, 3),
            DataFormat::ChannelsLast => (1, 2),
        }
    }

    pub fn is_default(self) -> bool {
        self == DataFormat::default()
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::ChannelsFirst => write!(f, "channels_first"),
            DataFormat::ChannelsLast => write!(f, "channels_last"),
        }
    }
}

impl FromStr for DataFormat {
    type Err = FacenetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "channels_first" | "nchw" => Ok(DataFormat::ChannelsFirst),
            "channels_last" | "nhwc" => Ok(DataFormat::ChannelsLast),
            other => Err(FacenetError::config(format!(
                "Unknown data format '{}', expected 'channels_first' or 'channels_last'",
                other
            ))),
        }
    }
}

/// Pooling applied to the last convolutional output when no classification
/// head is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// Keep the rank-4 output of the last block
    #[default]
    None,
    /// Global average pooling
    Avg,
    /// Global max pooling
    Max,
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pooling::None => write!(f, "none"),
            Pooling::Avg => write!(f, "avg"),
            Pooling::Max => write!(f, "max"),
        }
    }
}

impl FromStr for Pooling {
    type Err = FacenetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "" => Ok(Pooling::None),
            "avg" | "average" => Ok(Pooling::Avg),
            "max" => Ok(Pooling::Max),
            other => Err(FacenetError::config(format!(
                "Unknown pooling mode '{}', expected 'none', 'avg' or 'max'",
                other
            ))),
        }
    }
}

/// Which parameters to initialize the model with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Weights {
    /// Random initialization
    #[default]
    None,
    /// Pre-trained FaceNet weights (20170512-110547)
    Facenet,
}

impl Weights {
    pub fn is_pretrained(self) -> bool {
        self == Weights::Facenet
    }
}

impl fmt::Display for Weights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Weights::None => write!(f, "none"),
            Weights::Facenet => write!(f, "facenet"),
        }
    }
}

impl FromStr for Weights {
    type Err = FacenetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "random" => Ok(Weights::None),
            "facenet" | "pretrained" => Ok(Weights::Facenet),
            other => Err(FacenetError::config(format!(
                "The `weights` argument should be either `none` (random initialization) \
                 or `facenet` (pre-training on FaceNet), got '{}'",
                other
            ))),
        }
    }
}
