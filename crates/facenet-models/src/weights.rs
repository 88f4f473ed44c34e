//! Pre-trained weight artifacts: where they live, how they are fetched and how
//! their values are mapped onto a built graph.

use crate::hdf5::{self, Dataset, Hdf5File};
use crate::utils::candle_err;
use async_trait::async_trait;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;
use facenet_types::{FacenetError, Result};
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Release hosting the FaceNet (20170512-110547) weights.
pub const BASE_WEIGHT_URL: &str =
    "https://github.com/yunhaia/keras-inception-resnet-v2/releases/download/0.2/";

/// Artifact without the classification top.
pub const WEIGHTS_FILE_NAME: &str =
    "inception_resnet_v1_weights_tf_dim_ordering_tf_kernels_notop.h5";

/// MD5 of [`WEIGHTS_FILE_NAME`].
pub const WEIGHTS_FILE_HASH: &str = "f691b708b23c3eb2e03a453625f4209c";

/// Sub-directory of the cache root holding model artifacts.
pub const CACHE_SUBDIR: &str = "models";

/// A remote artifact to be made available locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub file_name: String,
    pub url: String,
    /// Hex digest; 64 characters select SHA-256, anything else MD5.
    pub file_hash: Option<String>,
    pub cache_subdir: String,
}

impl FetchRequest {
    /// The published no-top FaceNet weights.
    pub fn facenet_notop() -> Self {
        Self {
            file_name: WEIGHTS_FILE_NAME.to_string(),
            url: format!("{}{}", BASE_WEIGHT_URL, WEIGHTS_FILE_NAME),
            file_hash: Some(WEIGHTS_FILE_HASH.to_string()),
            cache_subdir: CACHE_SUBDIR.to_string(),
        }
    }
}

/// Makes a remote artifact available on the local filesystem.
#[async_trait]
pub trait WeightFetcher: Send + Sync {
    /// Return the local path of the artifact, downloading it if needed.
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf>;
}

/// Container format of a weights file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    SafeTensors,
    Hdf5,
    Unknown,
}

/// Sniff the container format from the first bytes of a file.
pub fn detect_format(path: &Path) -> Result<WeightFormat> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        FacenetError::io(format!("Failed to open weights {}: {}", path.display(), e))
    })?;
    let mut head = [0u8; 9];
    let mut read = 0;
    while read < head.len() {
        let n = file.read(&mut head[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }

    if hdf5::is_hdf5(&head[..read]) {
        return Ok(WeightFormat::Hdf5);
    }
    // safetensors: u64 header length followed by a JSON object
    if read == 9 && head[8] == b'{' {
        return Ok(WeightFormat::SafeTensors);
    }
    Ok(WeightFormat::Unknown)
}

/// Overwrite every parameter in `varmap` with the value stored under the
/// same layer name in the file at `path`. Every parameter must be present.
///
/// Both safetensors files keyed `<layer>.<param>` and Keras HDF5 weight files
/// are accepted.
pub fn load_weights(varmap: &mut VarMap, path: &Path) -> Result<()> {
    match detect_format(path)? {
        WeightFormat::SafeTensors => load_safetensors(varmap, path),
        WeightFormat::Hdf5 => load_keras_hdf5(varmap, path),
        WeightFormat::Unknown => Err(FacenetError::invalid_format(format!(
            "{} is neither a safetensors nor an HDF5 file",
            path.display()
        ))),
    }
}

fn load_safetensors(varmap: &mut VarMap, path: &Path) -> Result<()> {
    debug!("Loading weights from {}", path.display());
    varmap.load(path).map_err(|e| {
        FacenetError::model(format!(
            "Failed to load weights from {}: {}",
            path.display(),
            e
        ))
    })?;
    info!(
        "Loaded {} parameter tensors from {}",
        varmap.all_vars().len(),
        path.display()
    );
    Ok(())
}

/// Dataset names a Keras layer stores a parameter under, `:0` suffix removed.
fn keras_names(param: &str) -> &'static [&'static str] {
    match param {
        "weight" => &["kernel"],
        // convolution and dense layers store `bias`, batch norm its offset `beta`
        "bias" => &["bias", "beta"],
        "running_mean" => &["moving_mean"],
        "running_var" => &["moving_variance"],
        _ => &[],
    }
}

/// Each layer is a root group holding its datasets, usually one level down as
/// `<layer>/<layer>/kernel:0`.
fn load_keras_hdf5(varmap: &VarMap, path: &Path) -> Result<()> {
    debug!("Loading Keras weights from {}", path.display());
    let file = Hdf5File::open(path)?;
    let root = file.root()?;

    let data = varmap
        .data()
        .lock()
        .map_err(|_| FacenetError::internal("Parameter store lock poisoned"))?;
    let mut by_layer: BTreeMap<&str, Vec<(&str, &Var)>> = BTreeMap::new();
    for (name, var) in data.iter() {
        let (layer, param) = name.rsplit_once('.').ok_or_else(|| {
            FacenetError::model(format!("Parameter {} is not scoped by a layer", name))
        })?;
        by_layer.entry(layer).or_default().push((param, var));
    }

    let mut loaded = 0;
    for (layer, params) in by_layer {
        let group = file.group(&root, layer)?.ok_or_else(|| {
            FacenetError::model(format!(
                "{} holds no weights for layer {}",
                path.display(),
                layer
            ))
        })?;
        let mut stored: HashMap<String, Dataset> = file
            .datasets(&group)?
            .into_iter()
            .map(|(key, dataset)| {
                let leaf = key.rsplit('/').next().unwrap_or(&key);
                (leaf.trim_end_matches(":0").to_string(), dataset)
            })
            .collect();

        for (param, var) in params {
            let name = format!("{}.{}", layer, param);
            let dataset = keras_names(param)
                .iter()
                .find_map(|key| stored.remove(*key))
                .ok_or_else(|| {
                    FacenetError::model(format!(
                        "{} holds no value for {}",
                        path.display(),
                        name
                    ))
                })?;
            let value = keras_to_candle(dataset, var.as_tensor(), &name)?;
            var.set(&value).map_err(candle_err("assign parameter"))?;
            loaded += 1;
        }
    }

    info!("Loaded {} parameter tensors from {}", loaded, path.display());
    Ok(())
}

/// Convert a Keras value to the layout of `target`: convolution kernels are
/// stored `HWIO` and dense kernels `(in, out)`.
fn keras_to_candle(dataset: Dataset, target: &Tensor, name: &str) -> Result<Tensor> {
    let Dataset { shape, values } = dataset;
    let value = Tensor::from_vec(values, shape.as_slice(), target.device())
        .map_err(candle_err("read parameter"))?;
    let value = match value.rank() {
        4 => value.permute((3, 2, 0, 1)),
        2 => value.t(),
        _ => Ok(value),
    }
    .map_err(candle_err("transpose parameter"))?;

    if value.dims() != target.dims() {
        return Err(FacenetError::model(format!(
            "{} has shape {:?} in the weights file, the graph expects {:?}",
            name,
            shape,
            target.dims()
        )));
    }
    value
        .to_dtype(target.dtype())
        .map_err(candle_err("convert parameter"))
}

/// Write every parameter in `varmap` to a safetensors file.
pub fn save_weights(varmap: &VarMap, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    varmap.save(path).map_err(|e| {
        FacenetError::model(format!("Failed to save weights to {}: {}", path.display(), e))
    })?;
    info!("Saved weights to {}", path.display());
    Ok(())
}
