//! Pull command - Download the pre-trained weights into the cache

use crate::config::CliConfig;
use clap::Args;
use colored::*;
use facenet_models::{FetchRequest, HttpFetcher, WeightFetcher};
use facenet_types::Result;

#[derive(Args, Debug)]
pub struct PullCommand {
    /// Discard any cached copy and download again
    #[arg(long)]
    pub force: bool,
}

pub async fn execute(cmd: PullCommand, config: CliConfig) -> Result<()> {
    let request = FetchRequest::facenet_notop();
    println!("{} {}", "Pulling".cyan().bold(), request.file_name);

    let fetcher = HttpFetcher::new(config.fetcher_config())?;
    println!(
        "{}",
        format!("Cache: {}", fetcher.cache_dir().display()).dimmed()
    );

    let cached = fetcher.cached_path(&request);
    if cmd.force && cached.exists() {
        tokio::fs::remove_file(&cached).await?;
    }

    match fetcher.fetch(&request).await {
        Ok(path) => {
            println!();
            println!("{} Weights ready at:", "✓".green().bold());
            println!("  {}", path.display());
            Ok(())
        }
        Err(e) => {
            eprintln!();
            eprintln!("{} Failed to pull weights: {}", "✗".red().bold(), e);
            eprintln!();
            eprintln!("Tips:");
            eprintln!("  • Check your internet connection");
            eprintln!("  • Set proxy: HTTPS_PROXY=socks5h://host:port");
            eprintln!("  • Point FACENET_HOME at a writable cache directory");
            Err(e)
        }
    }
}
