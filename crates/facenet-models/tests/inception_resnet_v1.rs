mod common;

use async_trait::async_trait;
use candle_core::{Device, Tensor};
use facenet_models::{
    preprocess_input, DataFormat, FacenetError, FetchRequest, InceptionResNetV1,
    InceptionResNetV1Config, InputShape, LayerKind, Pooling, Result, WeightFetcher, Weights,
    FACENET_CLASSES,
};
use facenet_models::weights::WEIGHTS_FILE_NAME;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Records every request and serves a fixed local file.
struct RecordingFetcher {
    path: Option<PathBuf>,
    calls: Mutex<Vec<FetchRequest>>,
}

impl RecordingFetcher {
    fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn calls(&self) -> Vec<FetchRequest> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl WeightFetcher for RecordingFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf> {
        self.calls.lock().push(request.clone());
        self.path
            .clone()
            .ok_or_else(|| FacenetError::network("offline"))
    }
}

fn build(config: &InceptionResNetV1Config) -> InceptionResNetV1 {
    InceptionResNetV1::build_topology(config, &Device::Cpu).unwrap()
}

#[tokio::test]
async fn top_with_non_default_classes_fails_before_fetch() {
    let fetcher = RecordingFetcher::new(None);
    let config = InceptionResNetV1Config::default()
        .with_include_top(true)
        .with_weights(Weights::Facenet)
        .with_classes(10);

    let err = InceptionResNetV1::from_config(&config, &Device::Cpu, &fetcher)
        .await
        .unwrap_err();
    assert!(matches!(err, FacenetError::Config { .. }));
    assert!(fetcher.calls().is_empty());
}

#[tokio::test]
async fn top_with_pretrained_weights_is_unsupported() {
    let fetcher = RecordingFetcher::new(None);
    let config = InceptionResNetV1Config::default()
        .with_include_top(true)
        .with_weights(Weights::Facenet)
        .with_classes(FACENET_CLASSES);

    let err = InceptionResNetV1::from_config(&config, &Device::Cpu, &fetcher)
        .await
        .unwrap_err();
    assert!(matches!(err, FacenetError::Unsupported { .. }));
    assert!(fetcher.calls().is_empty());
}

#[test]
fn invalid_weights_selector_is_a_config_error() {
    let err = "imagenet".parse::<Weights>().unwrap_err();
    assert!(err.is_config_error());
}

#[test]
fn avg_pooling_yields_embedding_vector() {
    let model = build(&InceptionResNetV1Config::default().with_pooling(Pooling::Avg));
    assert_eq!(model.output_shape(), &[None, Some(1792)]);
    assert_eq!(model.input().dims(), &[None, Some(299), Some(299), Some(3)]);
}

#[test]
fn feature_map_layout_follows_data_format() {
    let last = build(&InceptionResNetV1Config::default());
    assert_eq!(last.output_shape(), &[None, Some(8), Some(8), Some(1792)]);

    let first =
        build(&InceptionResNetV1Config::default().with_data_format(DataFormat::ChannelsFirst));
    assert_eq!(first.output_shape(), &[None, Some(1792), Some(8), Some(8)]);
    assert_eq!(first.input().dims(), &[None, Some(3), Some(299), Some(299)]);
}

#[test]
fn dynamic_spatial_input_keeps_unknown_dims() {
    let model = build(&InceptionResNetV1Config::default().with_input_shape(InputShape::dynamic(3)));
    assert_eq!(model.output_shape(), &[None, None, None, Some(1792)]);
}

#[test]
fn single_and_four_channel_inputs_are_accepted() {
    for channels in [1, 4] {
        let config = InceptionResNetV1Config::default()
            .with_input_shape(InputShape::dynamic(channels))
            .with_pooling(Pooling::Max);
        let model = build(&config);
        assert_eq!(model.input().channels(), Some(channels));
        assert_eq!(model.output_shape(), &[None, Some(1792)]);
    }
}

#[test]
fn pretrained_weights_require_rgb_input() {
    let config = InceptionResNetV1Config::default()
        .with_weights(Weights::Facenet)
        .with_input_shape(InputShape::square(160, 1));
    let err = InceptionResNetV1::build_topology(&config, &Device::Cpu).unwrap_err();
    assert!(err.is_config_error());
}

#[test]
fn inputs_below_minimum_size_are_rejected() {
    let config = InceptionResNetV1Config::default().with_input_shape(InputShape::square(138, 3));
    assert!(InceptionResNetV1::build_topology(&config, &Device::Cpu).is_err());
}

#[test]
fn layer_table_uses_keras_names() {
    let model = build(&InceptionResNetV1Config::default());
    let names: Vec<&str> = model.layers().iter().map(|l| l.name.as_str()).collect();

    assert_eq!(
        &names[..4],
        &["input_1", "conv2d_1", "batch_normalization_1", "activation_1"]
    );
    for expected in [
        "block35_1_mixed",
        "block35_5_ac",
        "Mixed_6a",
        "block17_10_conv",
        "Mixed_7a",
        "block8_5_ac",
        "block8_6_conv",
        "block8_6",
    ] {
        assert!(names.contains(&expected), "missing layer {}", expected);
    }
    assert!(!names.contains(&"block8_6_ac"));
    assert_eq!(names.last(), Some(&"block8_6"));

    let mixed_6a = model.layer("Mixed_6a").unwrap();
    assert_eq!(mixed_6a.kind, LayerKind::Concatenate);
    assert_eq!(
        mixed_6a.output_shape.dims(),
        &[None, Some(17), Some(17), Some(896)]
    );
    let projection = model.layer("block35_1_conv").unwrap();
    assert_eq!(projection.params, 96 * 256 + 256);
}

#[test]
fn classification_head_names() {
    let config = InceptionResNetV1Config::default()
        .with_include_top(true)
        .with_classes(10);
    let model = build(&config);

    let tail: Vec<&str> = model
        .layers()
        .iter()
        .rev()
        .take(2)
        .map(|l| l.name.as_str())
        .collect();
    assert_eq!(tail, vec!["predictions", "avg_pool"]);
    assert_eq!(model.output_shape(), &[None, Some(10)]);
    assert_eq!(model.layer("predictions").unwrap().params, 1792 * 10 + 10);
}

#[test]
fn parameter_count_matches_saved_tensors() {
    let model = build(&InceptionResNetV1Config::default().with_pooling(Pooling::Avg));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("random.safetensors");
    model.save_weights(&path).unwrap();

    let tensors = candle_core::safetensors::load(&path, &Device::Cpu).unwrap();
    let stored: usize = tensors.values().map(|t| t.elem_count()).sum();
    assert_eq!(stored, model.num_parameters());
    assert!(tensors.contains_key("conv2d_1.weight"));
    assert!(tensors.contains_key("batch_normalization_1.running_var"));
    assert!(tensors.contains_key("block8_6_conv.bias"));
}

#[test]
fn forward_pass_at_minimum_size() {
    let device = Device::Cpu;
    let model = build(&InceptionResNetV1Config::default().with_input_shape(InputShape::dynamic(3)));

    let pixels = Tensor::rand(0f32, 255f32, (1, 139, 139, 3), &device).unwrap();
    let ys = model.forward(&preprocess_input(&pixels).unwrap()).unwrap();
    assert_eq!(ys.dims(), &[1, 3, 3, 1792]);

    let wrong_channels = Tensor::zeros((1, 139, 139, 1), candle_core::DType::F32, &device).unwrap();
    assert!(model.forward(&wrong_channels).is_err());
    let too_small = Tensor::zeros((1, 120, 120, 3), candle_core::DType::F32, &device).unwrap();
    assert!(model.forward(&too_small).is_err());
}

#[test]
fn channels_first_forward_matches_symbolic_shape() {
    let device = Device::Cpu;
    let config = InceptionResNetV1Config::default()
        .with_data_format(DataFormat::ChannelsFirst)
        .with_input_shape(InputShape::square(150, 3));
    let model = build(&config);

    let xs = Tensor::rand(-1f32, 1f32, (2, 3, 150, 150), &device).unwrap();
    let ys = model.forward(&xs).unwrap();
    assert_eq!(ys.dims(), &[2, 1792, 3, 3]);
    assert_eq!(model.output_shape(), &[None, Some(1792), Some(3), Some(3)]);
}

#[tokio::test]
async fn pretrained_model_fetches_once_and_loads_by_name() {
    let device = Device::Cpu;
    let config = InceptionResNetV1Config::default()
        .with_input_shape(InputShape::square(139, 3))
        .with_pooling(Pooling::Avg);

    let source = build(&config);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("facenet.safetensors");
    source.save_weights(&path).unwrap();

    let fetcher = RecordingFetcher::new(Some(path));
    let pretrained = config.clone().with_weights(Weights::Facenet);
    let model = InceptionResNetV1::from_config(&pretrained, &device, &fetcher)
        .await
        .unwrap();

    let calls = fetcher.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0], FetchRequest::facenet_notop());
    assert_eq!(
        calls[0].url,
        "https://github.com/yunhaia/keras-inception-resnet-v2/releases/download/0.2/\
         inception_resnet_v1_weights_tf_dim_ordering_tf_kernels_notop.h5"
    );
    assert_eq!(
        calls[0].file_hash.as_deref(),
        Some("f691b708b23c3eb2e03a453625f4209c")
    );

    let xs = Tensor::rand(-1f32, 1f32, (1, 139, 139, 3), &device).unwrap();
    let expected = source.forward(&xs).unwrap().flatten_all().unwrap();
    let actual = model.forward(&xs).unwrap().flatten_all().unwrap();
    let diff = (expected - actual)
        .unwrap()
        .abs()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap();
    assert!(diff < 1e-4, "max abs diff {}", diff);
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

/// Random parameters of a headless model, written where the fetcher serves
/// the published artifact from.
fn keras_artifact(dir: &Path) -> (HashMap<String, Tensor>, PathBuf) {
    let source = build(&InceptionResNetV1Config::default().with_input_shape(InputShape::dynamic(3)));
    let staged = dir.join("source.safetensors");
    source.save_weights(&staged).unwrap();
    let tensors = candle_core::safetensors::load(&staged, &Device::Cpu).unwrap();

    let path = dir.join(WEIGHTS_FILE_NAME);
    common::write_keras_weights(&path, &tensors);
    (tensors, path)
}

#[tokio::test]
async fn keras_artifact_loads_through_fetcher() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let (_, path) = keras_artifact(dir.path());

    let config = InceptionResNetV1Config::default()
        .with_input_shape(InputShape::square(139, 3))
        .with_pooling(Pooling::Avg);
    let mut reference = build(&config);
    reference
        .load_weights(&dir.path().join("source.safetensors"))
        .unwrap();

    let fetcher = RecordingFetcher::new(Some(path));
    let pretrained = config.with_weights(Weights::Facenet);
    let model = InceptionResNetV1::from_config(&pretrained, &device, &fetcher)
        .await
        .unwrap();
    assert_eq!(fetcher.calls().len(), 1);

    let xs = Tensor::rand(-1f32, 1f32, (1, 139, 139, 3), &device).unwrap();
    let expected = reference.forward(&xs).unwrap();
    let actual = model.forward(&xs).unwrap();
    let diff = max_abs_diff(&expected, &actual);
    assert!(diff < 1e-4, "max abs diff {}", diff);
}

#[tokio::test]
async fn default_pretrained_build_requests_notop_weights() {
    let dir = tempfile::tempdir().unwrap();
    let (tensors, path) = keras_artifact(dir.path());

    let fetcher = RecordingFetcher::new(Some(path));
    let config = InceptionResNetV1Config::default().with_weights(Weights::Facenet);
    let model = InceptionResNetV1::from_config(&config, &Device::Cpu, &fetcher)
        .await
        .unwrap();

    assert_eq!(fetcher.calls(), vec![FetchRequest::facenet_notop()]);
    assert_eq!(model.input().dims(), &[None, Some(299), Some(299), Some(3)]);
    assert_eq!(model.output_shape(), &[None, Some(8), Some(8), Some(1792)]);

    let saved = dir.path().join("loaded.safetensors");
    model.save_weights(&saved).unwrap();
    let loaded = candle_core::safetensors::load(&saved, &Device::Cpu).unwrap();
    assert_eq!(loaded.len(), tensors.len());
    for name in [
        "conv2d_1.weight",
        "batch_normalization_1.running_var",
        "block35_1_conv.bias",
        "block8_6_conv.weight",
    ] {
        assert_eq!(max_abs_diff(&loaded[name], &tensors[name]), 0.0, "{}", name);
    }
}

#[tokio::test]
async fn fetch_failures_are_fatal() {
    let fetcher = RecordingFetcher::new(None);
    let config = InceptionResNetV1Config::default().with_weights(Weights::Facenet);
    let err = InceptionResNetV1::from_config(&config, &Device::Cpu, &fetcher)
        .await
        .unwrap_err();
    assert!(matches!(err, FacenetError::Network { .. }));
    assert_eq!(fetcher.calls().len(), 1);
}
