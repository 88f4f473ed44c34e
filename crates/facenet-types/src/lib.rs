//! Core type definitions for the Inception-ResNet V1 workspace
//!
//! Errors and the configuration enums shared by the model builder and the
//! command line tool.

pub mod config;
pub mod devices;
pub mod errors;

pub use config::*;
pub use devices::*;
pub use errors::*;

/// Result type used throughout the workspace
pub type Result<T> = std::result::Result<T, FacenetError>;
