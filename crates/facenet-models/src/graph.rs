//! Graph construction state: parameter store, layer naming and the layer table

use crate::shape::SymbolicTensor;
use candle_nn::VarBuilder;
use facenet_types::{DataFormat, FacenetError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Operation performed by a layer node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Input,
    Conv2d,
    BatchNorm,
    Activation,
    MaxPool2d,
    Concatenate,
    ScaledResidual,
    GlobalAvgPool,
    GlobalMaxPool,
    Dense,
}

impl LayerKind {
    /// Prefix used for auto-generated layer names (`conv2d_3`, ...).
    pub fn name_prefix(self) -> &'static str {
        match self {
            LayerKind::Input => "input",
            LayerKind::Conv2d => "conv2d",
            LayerKind::BatchNorm => "batch_normalization",
            LayerKind::Activation => "activation",
            LayerKind::MaxPool2d => "max_pooling2d",
            LayerKind::Concatenate => "concatenate",
            LayerKind::ScaledResidual => "lambda",
            LayerKind::GlobalAvgPool => "global_average_pooling2d",
            LayerKind::GlobalMaxPool => "global_max_pooling2d",
            LayerKind::Dense => "dense",
        }
    }
}

impl fmt::Display for LayerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LayerKind::Input => "InputLayer",
            LayerKind::Conv2d => "Conv2D",
            LayerKind::BatchNorm => "BatchNormalization",
            LayerKind::Activation => "Activation",
            LayerKind::MaxPool2d => "MaxPooling2D",
            LayerKind::Concatenate => "Concatenate",
            LayerKind::ScaledResidual => "ScaledResidual",
            LayerKind::GlobalAvgPool => "GlobalAveragePooling2D",
            LayerKind::GlobalMaxPool => "GlobalMaxPooling2D",
            LayerKind::Dense => "Dense",
        };
        write!(f, "{}", label)
    }
}

/// One row of the model's layer table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub name: String,
    pub kind: LayerKind,
    pub output_shape: SymbolicTensor,
    pub params: usize,
}

/// Accumulates layers while a model is assembled.
///
/// Parameters are requested from the `VarBuilder` under the layer's name, so
/// a weight container keyed by the same names can be loaded onto the graph
/// afterwards.
pub struct GraphBuilder<'a> {
    vb: VarBuilder<'a>,
    format: DataFormat,
    counters: HashMap<LayerKind, usize>,
    names: HashSet<String>,
    layers: Vec<LayerSummary>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(vb: VarBuilder<'a>, format: DataFormat) -> Self {
        Self {
            vb,
            format,
            counters: HashMap::new(),
            names: HashSet::new(),
            layers: Vec::new(),
        }
    }

    pub fn data_format(&self) -> DataFormat {
        self.format
    }

    /// Use `name` when given, otherwise `<prefix>_<n>` with a per-kind counter
    /// starting at 1.
    pub fn layer_name(&mut self, name: Option<&str>, kind: LayerKind) -> String {
        match name {
            Some(name) => name.to_string(),
            None => {
                let counter = self.counters.entry(kind).or_insert(0);
                *counter += 1;
                format!("{}_{}", kind.name_prefix(), counter)
            }
        }
    }

    /// Parameter scope of a layer.
    pub(crate) fn vars(&self, layer: &str) -> VarBuilder<'a> {
        self.vb.pp(layer)
    }

    pub(crate) fn record(
        &mut self,
        name: String,
        kind: LayerKind,
        output: &SymbolicTensor,
        params: usize,
    ) -> Result<()> {
        if !self.names.insert(name.clone()) {
            return Err(FacenetError::config(format!(
                "All layer names should be unique, '{}' is used twice",
                name
            )));
        }
        self.layers.push(LayerSummary {
            name,
            kind,
            output_shape: output.clone(),
            params,
        });
        Ok(())
    }

    pub fn layers(&self) -> &[LayerSummary] {
        &self.layers
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn into_layers(self) -> Vec<LayerSummary> {
        self.layers
    }
}
