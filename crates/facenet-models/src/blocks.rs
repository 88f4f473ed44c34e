//! Inception-ResNet blocks and the two reduction blocks

use crate::graph::{GraphBuilder, LayerKind};
use crate::layers::{concatenate, Activation, ConvBnAct, ConvSpec, KernelSize, MaxPool2d};
use crate::shape::SymbolicTensor;
use candle_core::{Module, ModuleT, Tensor};
use facenet_types::{FacenetError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// One branch of a block: a chain of `(filters, kernel)` conv-bn-relu units.
pub type BranchRecipe = &'static [(usize, KernelSize)];

const K1: KernelSize = KernelSize::square(1);
const K3: KernelSize = KernelSize::square(3);

const BLOCK35: &[BranchRecipe] = &[
    &[(32, K1)],
    &[(32, K1), (32, K3)],
    &[(32, K1), (32, K3), (32, K3)],
];

const BLOCK17: &[BranchRecipe] = &[
    &[(128, K1)],
    &[(128, K1), (128, KernelSize::new(1, 7)), (128, KernelSize::new(7, 1))],
];

const BLOCK8: &[BranchRecipe] = &[
    &[(192, K1)],
    &[(192, K1), (192, KernelSize::new(1, 3)), (192, KernelSize::new(3, 1))],
];

/// Residual block variants, named after the TF-slim scopes:
/// Inception-ResNet-A (`block35`), -B (`block17`) and -C (`block8`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Block35,
    Block17,
    Block8,
}

impl BlockType {
    pub fn tag(self) -> &'static str {
        match self {
            BlockType::Block35 => "block35",
            BlockType::Block17 => "block17",
            BlockType::Block8 => "block8",
        }
    }

    /// Branch topology of the residual path.
    pub fn recipe(self) -> &'static [BranchRecipe] {
        match self {
            BlockType::Block35 => BLOCK35,
            BlockType::Block17 => BLOCK17,
            BlockType::Block8 => BLOCK8,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for BlockType {
    type Err = FacenetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "block35" => Ok(BlockType::Block35),
            "block17" => Ok(BlockType::Block17),
            "block8" => Ok(BlockType::Block8),
            other => Err(FacenetError::config(format!(
                "Unknown Inception-ResNet block type. Expects \"block35\", \"block17\" or \
                 \"block8\", but got: {}",
                other
            ))),
        }
    }
}

fn build_chain(
    g: &mut GraphBuilder,
    x: &SymbolicTensor,
    specs: impl IntoIterator<Item = ConvSpec>,
) -> Result<(Vec<ConvBnAct>, SymbolicTensor)> {
    let mut units = Vec::new();
    let mut y = x.clone();
    for spec in specs {
        let (unit, out) = ConvBnAct::new(g, &y, &spec)?;
        units.push(unit);
        y = out;
    }
    Ok((units, y))
}

fn forward_chain(chain: &[ConvBnAct], xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
    let mut ys = xs.clone();
    for unit in chain {
        ys = unit.forward_t(&ys, train)?;
    }
    Ok(ys)
}

/// `x + scale * project(concat(branches(x)))`, optionally activated.
#[derive(Debug, Clone)]
pub struct InceptionResNetBlock {
    name: String,
    block_type: BlockType,
    branches: Vec<Vec<ConvBnAct>>,
    up: ConvBnAct,
    scale: f64,
    activation: Option<Activation>,
}

impl InceptionResNetBlock {
    /// Layers are named with the common prefix `<block_type>_<block_idx>`.
    pub fn new(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        block_type: BlockType,
        block_idx: usize,
        scale: f64,
        activation: Option<Activation>,
    ) -> Result<(Self, SymbolicTensor)> {
        x.expect_image(block_type.tag())?;
        let block_name = format!("{}_{}", block_type, block_idx);
        let in_channels = x.channels().ok_or_else(|| {
            FacenetError::config(format!(
                "{} needs a known input channel count, got shape {}",
                block_name, x
            ))
        })?;

        let mut branches = Vec::with_capacity(block_type.recipe().len());
        let mut outputs = Vec::with_capacity(block_type.recipe().len());
        for recipe in block_type.recipe() {
            let specs = recipe.iter().map(|&(filters, kernel)| ConvSpec::new(filters, kernel));
            let (chain, out) = build_chain(g, x, specs)?;
            branches.push(chain);
            outputs.push(out);
        }

        let mixed = concatenate(g, &outputs, Some(&format!("{}_mixed", block_name)))?;
        let spec = ConvSpec::new(in_channels, 1)
            .activation(None)
            .use_bias(true)
            .named(format!("{}_conv", block_name));
        let (up, projected) = ConvBnAct::new(g, &mixed, &spec)?;

        if projected != *x {
            return Err(FacenetError::config(format!(
                "{}: residual branch shape {} does not match input shape {}",
                block_name, projected, x
            )));
        }
        g.record(block_name.clone(), LayerKind::ScaledResidual, x, 0)?;
        if activation.is_some() {
            g.record(format!("{}_ac", block_name), LayerKind::Activation, x, 0)?;
        }
        debug!("Built {} (scale {})", block_name, scale);

        let block = Self {
            name: block_name,
            block_type,
            branches,
            up,
            scale,
            activation,
        };
        Ok((block, x.clone()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }
}

impl ModuleT for InceptionResNetBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let outs = self
            .branches
            .iter()
            .map(|chain| forward_chain(chain, xs, train))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let mixed = Tensor::cat(&outs, 1)?;
        let up = self.up.forward_t(&mixed, train)?;
        let ys = (xs + up.affine(self.scale, 0.)?)?;
        match self.activation {
            Some(act) => act.apply(&ys),
            None => Ok(ys),
        }
    }
}

/// Downsampling block: strided conv chains next to a 3x3/2 max pool,
/// concatenated on the channel axis.
#[derive(Debug, Clone)]
pub struct ReductionBlock {
    name: String,
    branches: Vec<Vec<ConvBnAct>>,
    pool: MaxPool2d,
}

impl ReductionBlock {
    /// Mixed 6a (Reduction-A): 35x35x256 -> 17x17x896 at the default size.
    pub fn mixed_6a(g: &mut GraphBuilder, x: &SymbolicTensor) -> Result<(Self, SymbolicTensor)> {
        Self::build(
            g,
            x,
            "Mixed_6a",
            vec![
                vec![ConvSpec::new(384, 3).stride(2).valid()],
                vec![
                    ConvSpec::new(192, 1),
                    ConvSpec::new(192, 3),
                    ConvSpec::new(256, 3).stride(2).valid(),
                ],
            ],
        )
    }

    /// Mixed 7a (Reduction-B): 17x17x896 -> 8x8x1792 at the default size.
    pub fn mixed_7a(g: &mut GraphBuilder, x: &SymbolicTensor) -> Result<(Self, SymbolicTensor)> {
        Self::build(
            g,
            x,
            "Mixed_7a",
            vec![
                vec![ConvSpec::new(256, 1), ConvSpec::new(384, 3).stride(2).valid()],
                vec![ConvSpec::new(256, 1), ConvSpec::new(256, 3).stride(2).valid()],
                vec![
                    ConvSpec::new(256, 1),
                    ConvSpec::new(256, 3),
                    ConvSpec::new(256, 3).stride(2).valid(),
                ],
            ],
        )
    }

    fn build(
        g: &mut GraphBuilder,
        x: &SymbolicTensor,
        name: &str,
        chains: Vec<Vec<ConvSpec>>,
    ) -> Result<(Self, SymbolicTensor)> {
        let mut branches = Vec::with_capacity(chains.len());
        let mut outputs = Vec::with_capacity(chains.len() + 1);
        for specs in chains {
            let (chain, out) = build_chain(g, x, specs)?;
            branches.push(chain);
            outputs.push(out);
        }
        let (pool, pooled) = MaxPool2d::new(g, x, 3, 2, None)?;
        outputs.push(pooled);

        let out = concatenate(g, &outputs, Some(name))?;
        debug!("Built {} -> {}", name, out);
        Ok((
            Self {
                name: name.to_string(),
                branches,
                pool,
            },
            out,
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ModuleT for ReductionBlock {
    fn forward_t(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        let mut outs = self
            .branches
            .iter()
            .map(|chain| forward_chain(chain, xs, train))
            .collect::<candle_core::Result<Vec<_>>>()?;
        outs.push(self.pool.forward(xs)?);
        Tensor::cat(&outs, 1)
    }
}
