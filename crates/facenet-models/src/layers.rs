//! Layer primitives composed by the blocks
//!
//! Every layer is created through a [`GraphBuilder`]: it takes the symbolic
//! handle of its input, registers its parameters under its name and returns
//! the executable module together with the handle of its output. At run time
//! all modules operate on `NCHW` tensors; the model converts at its borders.

use crate::graph::{GraphBuilder, LayerKind};
use crate::shape::{conv_output_length, same_padding, Padding, SymbolicTensor};
use crate::utils::candle_err;
use candle_core::{Module, ModuleT, Tensor};
use candle_nn::{BatchNorm, Init, Linear};
use facenet_types::{FacenetError, Result};
use serde::{Deserialize, Serialize};
use tracing::trace;

const BN_EPSILON: f64 = 1e-3;

/// Convolution kernel size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelSize {
    pub height: usize,
    pub width: usize,
}

impl KernelSize {
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub const fn square(size: usize) -> Self {
        Self::new(size, size)
    }
}

impl From<usize> for KernelSize {
    fn from(size: usize) -> Self {
        Self::square(size)
    }
}

impl From<(usize, usize)> for KernelSize {
    fn from((height, width): (usize, usize)) -> Self {
        Self::new(height, width)
    }
}

/// Element-wise activation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Relu,
    /// Normalizes the last axis into a probability distribution.
    Softmax,
}

impl Activation {
    pub fn apply(self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Softmax => candle_nn::ops::softmax_last_dim(xs),
        }
    }
}

/// Parameters of a conv-bn-act unit.
///
/// Defaults: stride 1, `same` padding, ReLU, no bias (so batch
/// normalization is applied), auto-generated name.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvSpec {
    pub filters: usize,
    pub kernel: KernelSize,
    pub stride: usize,
    pub padding: Padding,
    pub activation: Option<Activation>,
    pub use_bias: bool,
    pub name: Option<String>,
}

impl ConvSpec {
    pub fn new(filters: usize, kernel: impl Into<KernelSize>) -> Self {
        Self {
            filters,
            kernel: kernel.into(),
            stride: 1,
            padding: Padding::Same,
            activation: Some(Activation::Relu),
            use_bias: false,
            name: None,
        }
    }

    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    /// Shorthand for `padding(Padding::Valid)`.
    pub fn valid(self) -> Self {
        self.padding(Padding::Valid)
    }

    pub fn activation(mut self, activation: Option<Activation>) -> Self {
        self.activation = activation;
        self
    }

    pub fn use_bias(mut self, use_bias: bool) -> Self {
        self.use_bias = use_bias;
        self
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Convolution, then batch normalization (only without bias, scale
/// disabled), then an optional activation.
#[derive(Debug, Clone)]
pub struct ConvBnAct {
    name: String,
    weight: Tensor,
    bias: Option<Tensor>,
    bn: Option<BatchNorm>,
    activation: Option<Activation>,
    kernel: KernelSize,
    stride: usize,
    padding: Padding,
}

impl ConvBnAct {
    pub fn new(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        spec: &ConvSpec,
    ) -> Result<(Self, SymbolicTensor)> {
        x.expect_image("Conv2D")?;
        if spec.filters == 0 || spec.stride == 0 {
            return Err(FacenetError::config(format!(
                "Conv2D needs positive filters and stride, got filters={} stride={}",
                spec.filters, spec.stride
            )));
        }
        let in_channels = x.channels().ok_or_else(|| {
            FacenetError::config(format!(
                "The channel dimension of the inputs should be defined, got shape {}",
                x
            ))
        })?;

        let (h, w) = x.spatial();
        let out = x.with_image(
            conv_output_length(h, spec.kernel.height, spec.stride, spec.padding)?,
            conv_output_length(w, spec.kernel.width, spec.stride, spec.padding)?,
            Some(spec.filters),
        );

        let name = g.layer_name(spec.name.as_deref(), LayerKind::Conv2d);
        let vb = g.vars(&name);
        let weight = vb
            .get_with_hints(
                (spec.filters, in_channels, spec.kernel.height, spec.kernel.width),
                "weight",
                candle_nn::init::DEFAULT_KAIMING_NORMAL,
            )
            .map_err(candle_err("conv2d weight"))?;
        let bias = if spec.use_bias {
            Some(
                vb.get_with_hints(spec.filters, "bias", Init::Const(0.))
                    .map_err(candle_err("conv2d bias"))?,
            )
        } else {
            None
        };
        let mut params = spec.filters * in_channels * spec.kernel.height * spec.kernel.width;
        if spec.use_bias {
            params += spec.filters;
        }
        g.record(name.clone(), LayerKind::Conv2d, &out, params)?;

        let bn = if spec.use_bias {
            None
        } else {
            let bn_name = spec.name.as_ref().map(|n| format!("{}_bn", n));
            let bn_name = g.layer_name(bn_name.as_deref(), LayerKind::BatchNorm);
            let bn = batch_norm_no_scale(g, &bn_name, spec.filters)?;
            g.record(bn_name, LayerKind::BatchNorm, &out, 3 * spec.filters)?;
            Some(bn)
        };

        if spec.activation.is_some() {
            let ac_name = spec.name.as_ref().map(|n| format!("{}_ac", n));
            let ac_name = g.layer_name(ac_name.as_deref(), LayerKind::Activation);
            g.record(ac_name, LayerKind::Activation, &out, 0)?;
        }

        let unit = Self {
            name,
            weight,
            bias,
            bn,
            activation: spec.activation,
            kernel: spec.kernel,
            stride: spec.stride,
            padding: spec.padding,
        };
        Ok((unit, out))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn out_channels(&self) -> usize {
        self.weight.dims()[0]
    }

    fn pad(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        if self.padding == Padding::Valid {
            return Ok(xs.clone());
        }
        let (_, _, h, w) = xs.dims4()?;
        let (top, bottom) = same_padding(h, self.kernel.height, self.stride);
        let (left, right) = same_padding(w, self.kernel.width, self.stride);
        let mut xs = xs.clone();
        if top + bottom > 0 {
            xs = xs.pad_with_zeros(2, top, bottom)?;
        }
        if left + right > 0 {
            xs = xs.pad_with_zeros(3, left, right)?;
        }
        Ok(xs)
    }
}

impl ModuleT for ConvBnAct {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        trace!(layer = %self.name, shape = ?xs.dims(), "conv2d");
        let xs = self.pad(xs)?;
        let mut ys = xs.conv2d(&self.weight, 0, self.stride, 1, 1)?;
        if let Some(bias) = &self.bias {
            ys = ys.broadcast_add(&bias.reshape((1, (), 1, 1))?)?;
        }
        if let Some(bn) = &self.bn {
            ys = ys.apply_t(bn, train)?;
        }
        match self.activation {
            Some(act) => act.apply(&ys),
            None => Ok(ys),
        }
    }
}

/// Batch normalization over the channel axis with the learned scale fixed to
/// one; only the offset and the moving statistics are parameters.
fn batch_norm_no_scale(g: &GraphBuilder, name: &str, channels: usize) -> Result<BatchNorm> {
    let vb = g.vars(name);
    let running_mean = vb
        .get_with_hints(channels, "running_mean", Init::Const(0.))
        .map_err(candle_err("batch norm running_mean"))?;
    let running_var = vb
        .get_with_hints(channels, "running_var", Init::Const(1.))
        .map_err(candle_err("batch norm running_var"))?;
    let bias = vb
        .get_with_hints(channels, "bias", Init::Const(0.))
        .map_err(candle_err("batch norm bias"))?;
    let weight = Tensor::ones(channels, bias.dtype(), bias.device())
        .map_err(candle_err("batch norm weight"))?;
    BatchNorm::new(channels, running_mean, running_var, weight, bias, BN_EPSILON)
        .map_err(candle_err("batch norm"))
}

/// Max pooling with `valid` padding
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    kernel: usize,
    stride: usize,
}

impl MaxPool2d {
    pub fn new(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        kernel: usize,
        stride: usize,
        name: Option<&str>,
    ) -> Result<(Self, SymbolicTensor)> {
        x.expect_image("MaxPooling2D")?;
        let (h, w) = x.spatial();
        let out = x.with_image(
            conv_output_length(h, kernel, stride, Padding::Valid)?,
            conv_output_length(w, kernel, stride, Padding::Valid)?,
            x.channels(),
        );
        let name = g.layer_name(name, LayerKind::MaxPool2d);
        g.record(name, LayerKind::MaxPool2d, &out, 0)?;
        Ok((Self { kernel, stride }, out))
    }
}

impl Module for MaxPool2d {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.max_pool2d_with_stride(
            (self.kernel, self.kernel),
            (self.stride, self.stride),
        )
    }
}

/// Concatenate handles along the channel axis of the active data format.
pub fn concatenate(
    g: &mut GraphBuilder,
    inputs: &[SymbolicTensor],
    name: Option<&str>,
) -> Result<SymbolicTensor> {
    let first = inputs
        .first()
        .ok_or_else(|| FacenetError::config("Concatenate needs at least one input"))?;
    first.expect_image("Concatenate")?;

    let (mut height, mut width) = first.spatial();
    let mut channels = Some(0usize);
    for input in inputs {
        input.expect_image("Concatenate")?;
        if input.format() != g.data_format() {
            return Err(FacenetError::config(format!(
                "Concatenate inputs must use {}, got {}",
                g.data_format(),
                input.format()
            )));
        }
        let (h, w) = input.spatial();
        height = merge_dim(height, h, "height")?;
        width = merge_dim(width, w, "width")?;
        channels = match (channels, input.channels()) {
            (Some(total), Some(c)) => Some(total + c),
            _ => None,
        };
    }

    let out = first.with_image(height, width, channels);
    let name = g.layer_name(name, LayerKind::Concatenate);
    g.record(name, LayerKind::Concatenate, &out, 0)?;
    Ok(out)
}

fn merge_dim(a: Option<usize>, b: Option<usize>, axis: &str) -> Result<Option<usize>> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(FacenetError::config(format!(
            "Concatenate requires inputs with matching {}, got {} and {}",
            axis, x, y
        ))),
        (Some(x), _) | (None, Some(x)) => Ok(Some(x)),
        (None, None) => Ok(None),
    }
}

/// Global pooling over both spatial axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalPool {
    Avg,
    Max,
}

impl GlobalPool {
    pub fn build(
        self,
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        name: Option<&str>,
    ) -> Result<SymbolicTensor> {
        x.expect_image("GlobalPooling2D")?;
        let kind = match self {
            GlobalPool::Avg => LayerKind::GlobalAvgPool,
            GlobalPool::Max => LayerKind::GlobalMaxPool,
        };
        let out = SymbolicTensor::features(x.channels(), x.format());
        let name = g.layer_name(name, kind);
        g.record(name, kind, &out, 0)?;
        Ok(out)
    }
}

impl Module for GlobalPool {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            GlobalPool::Avg => xs.mean((2, 3)),
            GlobalPool::Max => xs.max(3)?.max(2),
        }
    }
}

/// Fully connected layer with an optional activation
#[derive(Debug, Clone)]
pub struct Dense {
    linear: Linear,
    activation: Option<Activation>,
}

impl Dense {
    pub fn new(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        units: usize,
        activation: Option<Activation>,
        name: Option<&str>,
    ) -> Result<(Self, SymbolicTensor)> {
        if x.rank() != 2 {
            return Err(FacenetError::config(format!(
                "Dense expects a rank-2 input, got shape {}",
                x
            )));
        }
        if units == 0 {
            return Err(FacenetError::config("Dense needs at least one unit"));
        }
        let in_features = x.channels().ok_or_else(|| {
            FacenetError::config("The last dimension of the inputs to Dense should be defined")
        })?;

        let name = g.layer_name(name, LayerKind::Dense);
        let linear = candle_nn::linear(in_features, units, g.vars(&name))
            .map_err(candle_err("dense"))?;
        let out = SymbolicTensor::features(Some(units), x.format());
        g.record(name, LayerKind::Dense, &out, in_features * units + units)?;
        Ok((Self { linear, activation }, out))
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let ys = self.linear.forward(xs)?;
        match self.activation {
            Some(act) => act.apply(&ys),
            None => Ok(ys),
        }
    }
}
