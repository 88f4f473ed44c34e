//! Embed command - Compute face embeddings for image files

use crate::config::CliConfig;
use crate::output::print_warning;
use candle_core::Tensor;
use clap::{Args, ValueEnum};
use colored::Colorize;
use facenet_models::{
    l2_normalize, load_images, preprocess_input, to_candle_device, HttpFetcher, InceptionResNetV1,
};
use facenet_types::{FacenetError, Pooling, Result, Weights};
use serde::Serialize;
use std::path::PathBuf;

/// Embedding encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EmbedFormat {
    Json,
    Csv,
}

/// Compute an embedding per image with the headless network
#[derive(Args, Debug)]
pub struct EmbedCommand {
    /// Image files (jpeg or png)
    #[arg(required = true)]
    pub images: Vec<PathBuf>,

    /// Parameters to use: none or facenet (defaults to model.weights)
    #[arg(short, long)]
    pub weights: Option<Weights>,

    /// Pooling of the last feature map: avg or max (defaults to model.pooling)
    #[arg(short, long)]
    pub pooling: Option<Pooling>,

    /// Output encoding
    #[arg(short, long, value_enum, default_value = "json")]
    pub output: EmbedFormat,

    /// Skip L2 normalization
    #[arg(long)]
    pub raw: bool,
}

#[derive(Serialize)]
struct Embedding {
    image: String,
    dimensions: usize,
    embedding: Vec<f32>,
}

pub async fn execute(cmd: EmbedCommand, config: CliConfig) -> Result<()> {
    let mut model_config = config.model_config();
    if let Some(weights) = cmd.weights {
        model_config = model_config.with_weights(weights);
    }
    let pooling = cmd.pooling.unwrap_or(model_config.pooling);
    if pooling == Pooling::None {
        print_warning("Embeddings need a pooled feature vector, using avg pooling");
        model_config = model_config.with_pooling(Pooling::Avg);
    } else {
        model_config = model_config.with_pooling(pooling);
    }

    let device = to_candle_device(config.device()?)?;
    eprintln!(
        "{}",
        format!(
            "Building {} ({} weights) on {}...",
            InceptionResNetV1::NAME,
            model_config.weights,
            config.model.device
        )
        .dimmed()
    );
    let fetcher = HttpFetcher::new(config.fetcher_config())?;
    let model = InceptionResNetV1::from_config(&model_config, &device, &fetcher).await?;
    if !model_config.weights.is_pretrained() {
        print_warning("Using randomly initialized weights; embeddings are not meaningful");
    }

    let size = (config.model.input_size, config.model.input_size);
    let pixels = load_images(
        &cmd.images,
        size,
        config.model.channels,
        model_config.data_format,
        &device,
    )?;
    let features = model.forward(&preprocess_input(&pixels)?)?;
    let features = if cmd.raw {
        features
    } else {
        l2_normalize(&features)?
    };
    let rows = to_rows(&features)?;

    let embeddings: Vec<Embedding> = cmd
        .images
        .iter()
        .zip(rows)
        .map(|(path, embedding)| Embedding {
            image: path.display().to_string(),
            dimensions: embedding.len(),
            embedding,
        })
        .collect();

    match cmd.output {
        EmbedFormat::Json => crate::output::print_json(&embeddings)?,
        EmbedFormat::Csv => {
            if let Some(first) = embeddings.first() {
                let header: Vec<String> =
                    (0..first.dimensions).map(|i| format!("dim_{}", i)).collect();
                println!("image,{}", header.join(","));
            }
            for e in &embeddings {
                let values: Vec<String> = e.embedding.iter().map(|v| format!("{:.6}", v)).collect();
                println!("\"{}\",{}", e.image.replace('"', "\\\""), values.join(","));
            }
        }
    }

    Ok(())
}

fn to_rows(features: &Tensor) -> Result<Vec<Vec<f32>>> {
    features
        .to_vec2::<f32>()
        .map_err(|e| FacenetError::model(format!("Failed to read embeddings: {}", e)))
}
