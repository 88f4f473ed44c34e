//! Inception-ResNet V1, the FaceNet embedding network
//!
//! Reference: "Inception-v4, Inception-ResNet and the Impact of Residual
//! Connections on Learning" (Szegedy et al., 2016), with the V1 stem and the
//! channel widths of the FaceNet 20170512-110547 checkpoint.

use crate::blocks::{BlockType, InceptionResNetBlock, ReductionBlock};
use crate::graph::{GraphBuilder, LayerKind, LayerSummary};
use crate::layers::{Activation, ConvBnAct, ConvSpec, Dense, GlobalPool, MaxPool2d};
use crate::shape::{obtain_input_shape, InputShape, SymbolicTensor, DEFAULT_SIZE, MIN_SIZE};
use crate::utils::candle_err;
use crate::weights::{self, FetchRequest, WeightFetcher};
use candle_core::{DType, Device as CandleDevice, Module, ModuleT, Tensor};
use candle_nn::{VarBuilder, VarMap};
use facenet_types::{DataFormat, FacenetError, Pooling, Result, Weights};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info, warn};

/// Number of identities in the classification head of the published
/// checkpoint.
pub const FACENET_CLASSES: usize = 44051;

const BLOCK35_SCALE: f64 = 0.17;
const BLOCK17_SCALE: f64 = 0.1;
const BLOCK8_SCALE: f64 = 0.2;

/// Construction options for [`InceptionResNetV1`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InceptionResNetV1Config {
    /// Add the `avg_pool` + softmax `predictions` head.
    pub include_top: bool,
    pub weights: Weights,
    /// Pre-built input handle; takes precedence over `input_shape`.
    pub input_tensor: Option<SymbolicTensor>,
    /// `None` selects 299x299x3.
    pub input_shape: Option<InputShape>,
    /// Feature pooling when `include_top` is false.
    pub pooling: Pooling,
    pub classes: usize,
    pub data_format: DataFormat,
}

impl Default for InceptionResNetV1Config {
    fn default() -> Self {
        Self {
            include_top: false,
            weights: Weights::None,
            input_tensor: None,
            input_shape: None,
            pooling: Pooling::None,
            classes: FACENET_CLASSES,
            data_format: DataFormat::ChannelsLast,
        }
    }
}

impl InceptionResNetV1Config {
    pub fn with_include_top(mut self, include_top: bool) -> Self {
        self.include_top = include_top;
        self
    }

    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_input_tensor(mut self, input: SymbolicTensor) -> Self {
        self.input_tensor = Some(input);
        self
    }

    pub fn with_input_shape(mut self, shape: InputShape) -> Self {
        self.input_shape = Some(shape);
        self
    }

    pub fn with_pooling(mut self, pooling: Pooling) -> Self {
        self.pooling = pooling;
        self
    }

    pub fn with_classes(mut self, classes: usize) -> Self {
        self.classes = classes;
        self
    }

    pub fn with_data_format(mut self, format: DataFormat) -> Self {
        self.data_format = format;
        self
    }

    /// Argument checks that need no graph and no I/O.
    pub fn validate(&self) -> Result<()> {
        if self.include_top && self.classes == 0 {
            return Err(FacenetError::config(
                "`classes` must be positive when `include_top` is true",
            ));
        }
        if self.include_top && self.weights.is_pretrained() {
            if self.classes != FACENET_CLASSES {
                return Err(FacenetError::config(format!(
                    "If using `weights` as facenet with `include_top` as true, `classes` should \
                     be {}",
                    FACENET_CLASSES
                )));
            }
            return Err(FacenetError::unsupported(
                "Pre-trained weights are only published without the classification top",
            ));
        }
        Ok(())
    }

    /// The input handle the graph starts from.
    pub fn resolve_input(&self) -> Result<SymbolicTensor> {
        let Some(tensor) = &self.input_tensor else {
            let shape = obtain_input_shape(self.input_shape, DEFAULT_SIZE, MIN_SIZE, self.weights)?;
            return Ok(SymbolicTensor::image(shape, self.data_format));
        };

        tensor.expect_image("input_tensor")?;
        if tensor.format() != self.data_format {
            return Err(FacenetError::config(format!(
                "`input_tensor` uses {} but the model is built with {}",
                tensor.format(),
                self.data_format
            )));
        }
        let channels = tensor.channels().ok_or_else(|| {
            FacenetError::config(format!(
                "The channel dimension of `input_tensor` should be defined, got shape {}",
                tensor
            ))
        })?;
        let (height, width) = tensor.spatial();
        let shape = InputShape {
            height,
            width,
            channels,
        };
        if let Some(requested) = self.input_shape {
            if requested != shape {
                return Err(FacenetError::config(format!(
                    "`input_shape={}` does not match `input_tensor` of shape {}",
                    requested, tensor
                )));
            }
        }
        obtain_input_shape(Some(shape), DEFAULT_SIZE, MIN_SIZE, self.weights)?;
        Ok(tensor.clone())
    }
}

/// Warning to emit when pre-trained weights meet a non-default data format.
pub fn compatibility_warning(config: &InceptionResNetV1Config) -> Option<String> {
    if config.weights.is_pretrained() && config.data_format == DataFormat::ChannelsFirst {
        Some(
            "Loading weights trained with channels_last ordering into a channels_first model. \
             For best performance, build the model with `data_format = channels_last`."
                .to_string(),
        )
    } else {
        None
    }
}

#[derive(Debug, Clone)]
enum Head {
    Classifier { pool: GlobalPool, dense: Dense },
    Pool(GlobalPool),
    Features,
}

/// A built Inception-ResNet V1 graph.
///
/// Runtime tensors are fed in the configured [`DataFormat`]; the body runs in
/// NCHW and converts at its borders.
pub struct InceptionResNetV1 {
    stem: Vec<ConvBnAct>,
    stem_pool: MaxPool2d,
    stem_tail: Vec<ConvBnAct>,
    block35: Vec<InceptionResNetBlock>,
    mixed_6a: ReductionBlock,
    block17: Vec<InceptionResNetBlock>,
    mixed_7a: ReductionBlock,
    block8: Vec<InceptionResNetBlock>,
    head: Head,
    input: SymbolicTensor,
    output: SymbolicTensor,
    layers: Vec<LayerSummary>,
    varmap: VarMap,
    device: CandleDevice,
    config: InceptionResNetV1Config,
}

impl std::fmt::Debug for InceptionResNetV1 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InceptionResNetV1")
            .field("input", &self.input)
            .field("output", &self.output)
            .field("layers", &self.layers.len())
            .field("device", &self.device)
            .finish()
    }
}

impl InceptionResNetV1 {
    pub const NAME: &'static str = "inception_resnet_v1";

    /// Build the graph with freshly initialized parameters. No I/O.
    pub fn build_topology(config: &InceptionResNetV1Config, device: &CandleDevice) -> Result<Self> {
        config.validate()?;
        let input = config.resolve_input()?;
        info!("🔨 Building {} with input {}", Self::NAME, input);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut g = GraphBuilder::new(vb, config.data_format);
        let input_name = g.layer_name(None, LayerKind::Input);
        g.record(input_name, LayerKind::Input, &input, 0)?;

        let mut stem = Vec::with_capacity(3);
        let mut x = input.clone();
        for spec in [
            ConvSpec::new(32, 3).stride(2).valid(),
            ConvSpec::new(32, 3).valid(),
            ConvSpec::new(64, 3),
        ] {
            let (unit, out) = ConvBnAct::new(&mut g, &x, &spec)?;
            stem.push(unit);
            x = out;
        }
        let (stem_pool, out) = MaxPool2d::new(&mut g, &x, 3, 2, None)?;
        x = out;
        let mut stem_tail = Vec::with_capacity(3);
        for spec in [
            ConvSpec::new(80, 1).valid(),
            ConvSpec::new(192, 3).valid(),
            ConvSpec::new(256, 3).stride(2).valid(),
        ] {
            let (unit, out) = ConvBnAct::new(&mut g, &x, &spec)?;
            stem_tail.push(unit);
            x = out;
        }
        debug!("Stem output {}", x);

        let (block35, x) = Self::repeat(&mut g, &x, BlockType::Block35, 5, BLOCK35_SCALE)?;
        let (mixed_6a, x) = ReductionBlock::mixed_6a(&mut g, &x)?;
        let (block17, x) = Self::repeat(&mut g, &x, BlockType::Block17, 10, BLOCK17_SCALE)?;
        let (mixed_7a, x) = ReductionBlock::mixed_7a(&mut g, &x)?;
        let (mut block8, x) = Self::repeat(&mut g, &x, BlockType::Block8, 5, BLOCK8_SCALE)?;
        let (last, x) = InceptionResNetBlock::new(&mut g, &x, BlockType::Block8, 6, 1.0, None)?;
        block8.push(last);

        let (head, output) = if config.include_top {
            let pooled = GlobalPool::Avg.build(&mut g, &x, Some("avg_pool"))?;
            let (dense, out) = Dense::new(
                &mut g,
                &pooled,
                config.classes,
                Some(Activation::Softmax),
                Some("predictions"),
            )?;
            (
                Head::Classifier {
                    pool: GlobalPool::Avg,
                    dense,
                },
                out,
            )
        } else {
            match config.pooling {
                Pooling::None => (Head::Features, x),
                Pooling::Avg => {
                    let out = GlobalPool::Avg.build(&mut g, &x, None)?;
                    (Head::Pool(GlobalPool::Avg), out)
                }
                Pooling::Max => {
                    let out = GlobalPool::Max.build(&mut g, &x, None)?;
                    (Head::Pool(GlobalPool::Max), out)
                }
            }
        };

        let layers = g.into_layers();
        let model = Self {
            stem,
            stem_pool,
            stem_tail,
            block35,
            mixed_6a,
            block17,
            mixed_7a,
            block8,
            head,
            input,
            output,
            layers,
            varmap,
            device: device.clone(),
            config: config.clone(),
        };
        info!(
            "✅ {} built: {} layers, {} parameters, output {}",
            Self::NAME,
            model.layers.len(),
            model.num_parameters(),
            model.output
        );
        Ok(model)
    }

    /// Build the graph and, when requested, fetch and load the pre-trained
    /// weights. Argument errors are raised before any fetch.
    pub async fn from_config(
        config: &InceptionResNetV1Config,
        device: &CandleDevice,
        fetcher: &dyn WeightFetcher,
    ) -> Result<Self> {
        config.validate()?;
        let mut model = Self::build_topology(config, device)?;

        if config.weights.is_pretrained() {
            if let Some(message) = compatibility_warning(config) {
                warn!("{}", message);
            }
            let path = fetcher.fetch(&FetchRequest::facenet_notop()).await?;
            model.load_weights(&path)?;
        }
        Ok(model)
    }

    fn repeat(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        block_type: BlockType,
        count: usize,
        scale: f64,
    ) -> Result<(Vec<InceptionResNetBlock>, SymbolicTensor)> {
        let mut blocks = Vec::with_capacity(count + 1);
        let mut x = x.clone();
        for block_idx in 1..=count {
            let activation = Some(Activation::Relu);
            let (block, out) =
                InceptionResNetBlock::new(g, &x, block_type, block_idx, scale, activation)?;
            blocks.push(block);
            x = out;
        }
        Ok((blocks, x))
    }

    /// Inference-mode forward pass.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.forward_t(xs, false)
    }

    /// Forward pass over a batch laid out in the configured data format.
    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.check_input(xs)?;
        self.run(xs, train).map_err(candle_err("inception_resnet_v1 forward"))
    }

    fn check_input(&self, xs: &Tensor) -> Result<()> {
        let dims = xs.dims();
        if dims.len() != 4 {
            return Err(FacenetError::invalid_parameter(format!(
                "Expected a rank-4 batch matching {}, got {:?}",
                self.input, dims
            )));
        }
        let format = self.config.data_format;
        let (h_axis, w_axis) = format.spatial_axes();
        let expected = self.input.dims();
        if expected[format.channel_axis()] != Some(dims[format.channel_axis()]) {
            return Err(FacenetError::invalid_parameter(format!(
                "Expected a batch matching {}, got {:?}",
                self.input, dims
            )));
        }
        for axis in [h_axis, w_axis] {
            let ok = match expected[axis] {
                Some(size) => size == dims[axis],
                None => dims[axis] >= MIN_SIZE,
            };
            if !ok {
                return Err(FacenetError::invalid_parameter(format!(
                    "Expected a batch matching {} (spatial size at least {}), got {:?}",
                    self.input, MIN_SIZE, dims
                )));
            }
        }
        Ok(())
    }

    fn run(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let channels_last = self.config.data_format == DataFormat::ChannelsLast;
        let mut x = if channels_last {
            xs.permute((0, 3, 1, 2))?.contiguous()?
        } else {
            xs.clone()
        };

        for unit in &self.stem {
            x = unit.forward_t(&x, train)?;
        }
        x = self.stem_pool.forward(&x)?;
        for unit in &self.stem_tail {
            x = unit.forward_t(&x, train)?;
        }
        for block in &self.block35 {
            x = block.forward_t(&x, train)?;
        }
        x = self.mixed_6a.forward_t(&x, train)?;
        for block in &self.block17 {
            x = block.forward_t(&x, train)?;
        }
        x = self.mixed_7a.forward_t(&x, train)?;
        for block in &self.block8 {
            x = block.forward_t(&x, train)?;
        }

        match &self.head {
            Head::Classifier { pool, dense } => dense.forward(&pool.forward(&x)?),
            Head::Pool(pool) => pool.forward(&x),
            Head::Features if channels_last => x.permute((0, 2, 3, 1))?.contiguous(),
            Head::Features => Ok(x),
        }
    }

    /// Symbolic input handle.
    pub fn input(&self) -> &SymbolicTensor {
        &self.input
    }

    /// Symbolic output handle.
    pub fn output(&self) -> &SymbolicTensor {
        &self.output
    }

    pub fn output_shape(&self) -> &[Option<usize>] {
        self.output.dims()
    }

    /// Layer table in construction order.
    pub fn layers(&self) -> &[LayerSummary] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&LayerSummary> {
        self.layers.iter().find(|l| l.name == name)
    }

    /// Parameter count, including batch norm moving statistics.
    pub fn num_parameters(&self) -> usize {
        self.layers.iter().map(|l| l.params).sum()
    }

    /// Replace every parameter value with the one stored under the same layer
    /// name in a safetensors or Keras HDF5 file.
    pub fn load_weights(&mut self, path: &Path) -> Result<()> {
        weights::load_weights(&mut self.varmap, path)
    }

    pub fn save_weights(&self, path: &Path) -> Result<()> {
        weights::save_weights(&self.varmap, path)
    }

    pub fn config(&self) -> &InceptionResNetV1Config {
        &self.config
    }

    pub fn device(&self) -> &CandleDevice {
        &self.device
    }
}

impl ModuleT for InceptionResNetV1 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.check_input(xs)
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        self.run(xs, train)
    }
}
