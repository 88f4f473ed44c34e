//! Summary command - Build the graph and print its layer table

use crate::config::CliConfig;
use crate::output::{print_json, table_header, OutputFormat};
use crate::utils::format_count;
use clap::Args;
use colored::*;
use facenet_models::{to_candle_device, InceptionResNetV1, InputShape, LayerSummary};
use facenet_types::{DataFormat, Pooling, Result, Weights};
use serde::Serialize;

#[derive(Args, Debug)]
pub struct SummaryCommand {
    /// Square input size (defaults to model.input_size)
    #[arg(long)]
    pub input_size: Option<usize>,

    /// Leave the spatial input dimensions unknown
    #[arg(long, conflicts_with = "input_size")]
    pub dynamic: bool,

    /// Add the classification head
    #[arg(long)]
    pub include_top: bool,

    /// Classes of the classification head
    #[arg(long, requires = "include_top")]
    pub classes: Option<usize>,

    /// Pooling when no head is built: none, avg or max
    #[arg(long)]
    pub pooling: Option<Pooling>,

    /// channels_first or channels_last
    #[arg(long)]
    pub data_format: Option<DataFormat>,
}

#[derive(Serialize)]
struct ModelSummary<'a> {
    name: &'static str,
    input_shape: Vec<Option<usize>>,
    output_shape: Vec<Option<usize>>,
    total_params: usize,
    layers: &'a [LayerSummary],
}

pub async fn execute(cmd: SummaryCommand, config: CliConfig, format: OutputFormat) -> Result<()> {
    let mut model_config = config.model_config().with_weights(Weights::None);
    if cmd.dynamic {
        model_config = model_config.with_input_shape(InputShape::dynamic(config.model.channels));
    } else if let Some(size) = cmd.input_size {
        model_config =
            model_config.with_input_shape(InputShape::square(size, config.model.channels));
    }
    if let Some(pooling) = cmd.pooling {
        model_config = model_config.with_pooling(pooling);
    }
    if let Some(data_format) = cmd.data_format {
        model_config = model_config.with_data_format(data_format);
    }
    if cmd.include_top {
        model_config = model_config.with_include_top(true);
        if let Some(classes) = cmd.classes {
            model_config = model_config.with_classes(classes);
        }
    }

    let device = to_candle_device(config.device()?)?;
    let model = InceptionResNetV1::build_topology(&model_config, &device)?;

    let summary = ModelSummary {
        name: InceptionResNetV1::NAME,
        input_shape: model.input().dims().to_vec(),
        output_shape: model.output_shape().to_vec(),
        total_params: model.num_parameters(),
        layers: model.layers(),
    };

    match format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Pretty => {
            print_table(&summary, &model.output().to_string());
            Ok(())
        }
    }
}

fn print_table(summary: &ModelSummary<'_>, output: &str) {
    println!("{} {}", "Model:".bold(), summary.name.cyan());
    println!(
        "{}",
        table_header(&[("Layer (type)", 44), ("Output Shape", 26), ("Param #", 12)])
    );
    for layer in summary.layers {
        let label = format!("{} ({})", layer.name, layer.kind);
        println!(
            "{:<44} {:<26} {:<12}",
            label,
            layer.output_shape.to_string(),
            format_count(layer.params)
        );
    }
    println!("{}", "═".repeat(82));
    println!(
        "{} {}",
        "Total params:".bold(),
        format_count(summary.total_params)
    );
    println!("{} {}", "Output shape:".bold(), output);
}
