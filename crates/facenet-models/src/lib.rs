//! Inception-ResNet V1 (FaceNet) model layer
//!
//! This crate assembles the network as a graph of candle layers, tracks the
//! symbolic shape and name of every layer, and fetches and loads the
//! published pre-trained parameters by layer name.

pub mod architectures;
pub mod blocks;
pub mod download;
pub mod graph;
pub mod hdf5;
pub mod layers;
pub mod preprocess;
pub mod shape;
pub mod utils;
pub mod weights;

pub use architectures::{
    compatibility_warning, InceptionResNetV1, InceptionResNetV1Config, FACENET_CLASSES,
};
pub use blocks::{BlockType, InceptionResNetBlock, ReductionBlock};
pub use download::{HashAlgorithm, HttpFetcher, HttpFetcherConfig};
pub use graph::{GraphBuilder, LayerKind, LayerSummary};
pub use layers::{Activation, ConvBnAct, ConvSpec, KernelSize};
pub use preprocess::{l2_normalize, load_image, load_images, preprocess_input};
pub use shape::{obtain_input_shape, InputShape, Padding, SymbolicTensor};
pub use utils::to_candle_device;
pub use weights::{FetchRequest, WeightFetcher, WeightFormat};

pub use facenet_types::{DataFormat, Device, FacenetError, Pooling, Result, Weights};
