//! # FaceNet CLI Library
//!
//! Command-line interface for the Inception-ResNet V1 (FaceNet) model.
//!
//! ## Commands
//!
//! - `summary`: Build the network and print its layer table
//! - `pull`: Download the pre-trained weights into the cache
//! - `embed`: Compute face embeddings for image files

pub mod commands;
pub mod config;
pub mod output;
pub mod utils;

// Re-exports
pub use config::CliConfig;
