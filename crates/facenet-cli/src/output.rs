//! Output formatting utilities

use colored::*;
use facenet_types::{FacenetError, Result};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
}

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(data: &T) -> Result<()> {
    let output = serde_json::to_string_pretty(data)
        .map_err(|e| FacenetError::serialization(format!("JSON serialization failed: {}", e)))?;
    println!("{}", output);
    Ok(())
}

/// Print error with formatting
pub fn print_error(error: &FacenetError) {
    eprintln!("{} {}", "Error:".red().bold(), error);
}

/// Print warning with formatting
pub fn print_warning(message: &str) {
    eprintln!("{} {}", "Warning:".yellow().bold(), message);
}

/// Print success message
pub fn print_success(message: &str) {
    eprintln!("{} {}", "✓".green().bold(), message.green());
}

/// Create a table header
pub fn table_header(columns: &[(&str, usize)]) -> String {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$} ", name, width = *width))
        .collect();
    let separator = "─".repeat(header.trim_end().chars().count());
    format!("{}\n{}", header.trim_end().bold(), separator)
}
