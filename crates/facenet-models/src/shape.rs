//! Symbolic tensor shapes and the spatial arithmetic of convolutions and pools

use facenet_types::{DataFormat, FacenetError, Result, Weights};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Default input resolution of the network.
pub const DEFAULT_SIZE: usize = 299;

/// Smallest spatial size that still leaves a 3x3 map after `Mixed_7a`.
pub const MIN_SIZE: usize = 139;

/// Padding mode of convolutions and pools
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// Pad so that `out = ceil(in / stride)`
    Same,
    /// No padding
    Valid,
}

/// Output length of a windowed op along one spatial dimension.
///
/// `None` propagates an unknown input size.
pub fn conv_output_length(
    input: Option<usize>,
    kernel: usize,
    stride: usize,
    padding: Padding,
) -> Result<Option<usize>> {
    let Some(input) = input else {
        return Ok(None);
    };
    let out = match padding {
        Padding::Same => input.div_ceil(stride),
        Padding::Valid => {
            if input < kernel {
                return Err(FacenetError::config(format!(
                    "Negative dimension size: input of size {} is smaller than kernel {}",
                    input, kernel
                )));
            }
            (input - kernel) / stride + 1
        }
    };
    if out == 0 {
        return Err(FacenetError::config(format!(
            "Spatial dimension collapsed to zero (input {}, kernel {}, stride {})",
            input, kernel, stride
        )));
    }
    Ok(Some(out))
}

/// Zero padding `(before, after)` that realises `Padding::Same` for a concrete
/// input length. The odd element goes after.
pub fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let out = input.div_ceil(stride);
    let total = ((out.saturating_sub(1)) * stride + kernel).saturating_sub(input);
    let before = total / 2;
    (before, total - before)
}

/// Shape of one input image, batch dimension excluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputShape {
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub channels: usize,
}

impl InputShape {
    pub const fn new(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            channels,
        }
    }

    pub const fn square(size: usize, channels: usize) -> Self {
        Self::new(size, size, channels)
    }

    /// Spatial dimensions left to be decided by the input fed at run time.
    pub const fn dynamic(channels: usize) -> Self {
        Self {
            height: None,
            width: None,
            channels,
        }
    }
}

impl Default for InputShape {
    fn default() -> Self {
        Self::square(DEFAULT_SIZE, 3)
    }
}

impl fmt::Display for InputShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {})",
            fmt_dim(self.height),
            fmt_dim(self.width),
            self.channels
        )
    }
}

/// Validate the requested input shape, filling in the default when absent.
pub fn obtain_input_shape(
    input_shape: Option<InputShape>,
    default_size: usize,
    min_size: usize,
    weights: Weights,
) -> Result<InputShape> {
    let Some(shape) = input_shape else {
        return Ok(InputShape::square(default_size, 3));
    };

    if shape.channels == 0 {
        return Err(FacenetError::config(
            "`input_shape` must have at least one channel",
        ));
    }
    if weights.is_pretrained() && shape.channels != 3 {
        return Err(FacenetError::config(format!(
            "The input must have 3 channels when loading pre-trained weights; got `input_shape={}`",
            shape
        )));
    }
    if !weights.is_pretrained() && shape.channels != 1 && shape.channels != 3 {
        warn!(
            "This model usually expects 1 or 3 input channels. However, it was passed an \
             input_shape with {} input channels.",
            shape.channels
        );
    }

    let too_small = |dim: Option<usize>| dim.is_some_and(|d| d < min_size);
    if too_small(shape.height) || too_small(shape.width) {
        return Err(FacenetError::config(format!(
            "Input size must be at least {}x{}; got `input_shape={}`",
            min_size, min_size, shape
        )));
    }

    Ok(shape)
}

/// Symbolic handle to the output of a layer.
///
/// Dimensions are laid out in `format` order; the batch dimension is always
/// unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolicTensor {
    dims: Vec<Option<usize>>,
    format: DataFormat,
}

impl SymbolicTensor {
    /// Rank-4 image handle for a batch of `shape` images.
    pub fn image(shape: InputShape, format: DataFormat) -> Self {
        Self::image_dims(shape.height, shape.width, Some(shape.channels), format)
    }

    fn image_dims(
        height: Option<usize>,
        width: Option<usize>,
        channels: Option<usize>,
        format: DataFormat,
    ) -> Self {
        let dims = match format {
            DataFormat::ChannelsFirst => vec![None, channels, height, width],
            DataFormat::ChannelsLast => vec![None, height, width, channels],
        };
        Self { dims, format }
    }

    /// Rank-2 `(batch, features)` handle.
    pub fn features(features: Option<usize>, format: DataFormat) -> Self {
        Self {
            dims: vec![None, features],
            format,
        }
    }

    pub fn from_dims(dims: Vec<Option<usize>>, format: DataFormat) -> Self {
        Self { dims, format }
    }

    pub fn dims(&self) -> &[Option<usize>] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn format(&self) -> DataFormat {
        self.format
    }

    /// Channel (or feature) count, if known.
    pub fn channels(&self) -> Option<usize> {
        match self.rank() {
            4 => self.dims[self.format.channel_axis()],
            2 => self.dims[1],
            _ => None,
        }
    }

    /// `(height, width)` of a rank-4 handle.
    pub fn spatial(&self) -> (Option<usize>, Option<usize>) {
        if self.rank() != 4 {
            return (None, None);
        }
        let (h, w) = self.format.spatial_axes();
        (self.dims[h], self.dims[w])
    }

    /// Same format, new image dimensions.
    pub fn with_image(
        &self,
        height: Option<usize>,
        width: Option<usize>,
        channels: Option<usize>,
    ) -> Self {
        Self::image_dims(height, width, channels, self.format)
    }

    pub(crate) fn expect_image(&self, op: &str) -> Result<()> {
        if self.rank() != 4 {
            return Err(FacenetError::config(format!(
                "{} expects a rank-4 input, got shape {}",
                op, self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for SymbolicTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.dims.iter().map(|d| fmt_dim(*d)).collect();
        if parts.len() == 1 {
            write!(f, "({},)", parts[0])
        } else {
            write!(f, "({})", parts.join(", "))
        }
    }
}

fn fmt_dim(dim: Option<usize>) -> String {
    dim.map_or_else(|| "None".to_string(), |d| d.to_string())
}
