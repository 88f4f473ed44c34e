//! Model architecture implementations

pub mod inception_resnet_v1;

pub use inception_resnet_v1::{
    compatibility_warning, InceptionResNetV1, InceptionResNetV1Config, FACENET_CLASSES,
};
