mod common;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Init, VarBuilder, VarMap};
use common::{keras_layout, to_hdf5, write_keras_weights, Node, Style};
use facenet_models::hdf5::Hdf5File;
use facenet_models::weights::{detect_format, load_weights, save_weights};
use facenet_models::{FacenetError, WeightFormat};
use std::collections::HashMap;

fn kernel_file(style: Style) -> Vec<u8> {
    let kernel = Node::dataset(&[3, 3, 1, 2], (0..18).map(|v| v as f32).collect());
    let root = vec![
        (
            "conv2d_1".to_string(),
            Node::group(vec![("conv2d_1", Node::group(vec![("kernel:0", kernel)]))]),
        ),
        ("empty".to_string(), Node::group(vec![])),
    ];
    to_hdf5(&root, style)
}

#[test]
fn nested_groups_and_datasets_are_readable() {
    let styles = [
        Style::default(),
        Style {
            link_messages: true,
            continuation: false,
        },
        Style {
            link_messages: false,
            continuation: true,
        },
        Style {
            link_messages: true,
            continuation: true,
        },
    ];
    for style in styles {
        let file = Hdf5File::from_bytes(kernel_file(style)).unwrap();
        let root = file.root().unwrap();
        assert_eq!(root.names().collect::<Vec<_>>(), ["conv2d_1", "empty"]);

        let layer = file.group(&root, "conv2d_1").unwrap().unwrap();
        let datasets = file.datasets(&layer).unwrap();
        assert_eq!(datasets.len(), 1, "{:?}", style);
        let kernel = &datasets["conv2d_1/kernel:0"];
        assert_eq!(kernel.shape, vec![3, 3, 1, 2]);
        assert_eq!(kernel.values[17], 17.0);

        let empty = file.group(&root, "empty").unwrap().unwrap();
        assert!(empty.is_empty());
        assert!(file.group(&root, "missing").unwrap().is_none());
        assert!(file.dataset(&root, "conv2d_1").is_err());

        let inner = file.group(&layer, "conv2d_1").unwrap().unwrap();
        assert!(file.group(&inner, "kernel:0").is_err());
        assert_eq!(file.dataset(&inner, "kernel:0").unwrap().unwrap(), *kernel);
    }
}

#[test]
fn large_groups_span_several_symbol_nodes() {
    let root: Vec<(String, Node)> = (0..20)
        .map(|i| {
            let name = format!("layer_{:02}", i);
            let group = Node::group(vec![("v:0", Node::dataset(&[1], vec![i as f32]))]);
            (name, group)
        })
        .collect();
    let file = Hdf5File::from_bytes(to_hdf5(&root, Style::default())).unwrap();

    let top = file.root().unwrap();
    assert_eq!(top.len(), 20);
    for i in 0..20 {
        let group = file.group(&top, &format!("layer_{:02}", i)).unwrap().unwrap();
        let value = file.dataset(&group, "v:0").unwrap().unwrap();
        assert_eq!(value.values, vec![i as f32]);
    }
}

#[test]
fn truncated_files_are_invalid() {
    let bytes = kernel_file(Style::default());
    let cut = bytes[..bytes.len() - 16].to_vec();
    let err = Hdf5File::from_bytes(cut)
        .and_then(|file| file.root().map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, FacenetError::InvalidFormat { .. }));

    let err = Hdf5File::from_bytes(b"not an hdf5 file".to_vec()).unwrap_err();
    assert!(matches!(err, FacenetError::InvalidFormat { .. }));
}

/// A conv layer, its batch norm and a dense head, shaped like the real graph.
fn small_varmap(random: bool) -> VarMap {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let init = if random {
        Init::Uniform { lo: -1.0, up: 1.0 }
    } else {
        Init::Const(0.)
    };
    vb.pp("conv2d_1")
        .get_with_hints((4, 2, 3, 3), "weight", init)
        .unwrap();
    let bn = vb.pp("batch_normalization_1");
    for param in ["bias", "running_mean", "running_var"] {
        bn.get_with_hints(4, param, init).unwrap();
    }
    let dense = vb.pp("predictions");
    dense.get_with_hints((5, 4), "weight", init).unwrap();
    dense.get_with_hints(5, "bias", init).unwrap();
    varmap
}

fn tensors_of(varmap: &VarMap, dir: &std::path::Path) -> HashMap<String, Tensor> {
    let path = dir.join("source.safetensors");
    save_weights(varmap, &path).unwrap();
    candle_core::safetensors::load(&path, &Device::Cpu).unwrap()
}

#[test]
fn keras_weights_map_onto_parameters_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let source = tensors_of(&small_varmap(true), dir.path());
    let path = dir.path().join("weights.h5");
    write_keras_weights(&path, &source);
    assert_eq!(detect_format(&path).unwrap(), WeightFormat::Hdf5);

    let mut target = small_varmap(false);
    load_weights(&mut target, &path).unwrap();

    let loaded = tensors_of(&target, dir.path());
    assert_eq!(loaded.len(), 6);
    for (name, expected) in &source {
        let actual = &loaded[name];
        assert_eq!(actual.dims(), expected.dims(), "{}", name);
        let diff = (expected - actual)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert_eq!(diff, 0.0, "{}", name);
    }
}

#[test]
fn missing_layers_and_wrong_shapes_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let mut source = tensors_of(&small_varmap(true), dir.path());

    let wrong = dir.path().join("wrong.h5");
    let mut reshaped = source.clone();
    reshaped.insert(
        "predictions.weight".to_string(),
        Tensor::zeros((5, 3), DType::F32, &Device::Cpu).unwrap(),
    );
    write_keras_weights(&wrong, &reshaped);
    let err = load_weights(&mut small_varmap(false), &wrong).unwrap_err();
    assert!(matches!(err, FacenetError::Model { .. }));

    source.retain(|name, _| !name.starts_with("predictions"));
    let partial = dir.path().join("partial.h5");
    std::fs::write(&partial, to_hdf5(&keras_layout(&source), Style::default())).unwrap();
    let err = load_weights(&mut small_varmap(false), &partial).unwrap_err();
    assert!(err.to_string().contains("predictions"), "{}", err);
}
