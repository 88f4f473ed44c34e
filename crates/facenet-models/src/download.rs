//! Cached artifact downloader with resume and hash verification
//!
//! Features:
//! - HTTP/SOCKS proxy support via environment variables
//! - Resumable downloads through `.incomplete` files and `Range` requests
//! - Progress bar with speed display
//! - MD5 / SHA-256 verification of cached and downloaded files

use crate::weights::{FetchRequest, WeightFetcher};
use async_trait::async_trait;
use facenet_types::{FacenetError, Result};
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use md5::Md5;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Digest used to verify an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Md5,
    Sha256,
}

impl HashAlgorithm {
    /// Pick the algorithm from the length of a published hex digest.
    pub fn for_hash(hash: &str) -> Self {
        if hash.len() == 64 {
            HashAlgorithm::Sha256
        } else {
            HashAlgorithm::Md5
        }
    }
}

/// Hex digest of a file.
pub fn hash_file(path: &Path, algorithm: HashAlgorithm) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; 64 * 1024];
    match algorithm {
        HashAlgorithm::Md5 => {
            let mut hasher = Md5::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
        HashAlgorithm::Sha256 => {
            let mut hasher = Sha256::new();
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Compare a file against a published hex digest (case-insensitive).
pub async fn validate_file(path: &Path, expected: &str) -> Result<bool> {
    Ok(file_digest(path, expected).await?.eq_ignore_ascii_case(expected))
}

async fn file_digest(path: &Path, expected: &str) -> Result<String> {
    let algorithm = HashAlgorithm::for_hash(expected);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file(&path, algorithm))
        .await
        .map_err(|e| FacenetError::internal(format!("Hashing task failed: {}", e)))?
}

/// Default cache root: `$FACENET_HOME`, else `~/.facenet`, else a directory
/// under the system temp dir.
pub fn default_cache_dir() -> PathBuf {
    if let Ok(home) = std::env::var("FACENET_HOME") {
        if !home.is_empty() {
            return PathBuf::from(home);
        }
    }
    match std::env::var("HOME").or_else(|_| std::env::var("USERPROFILE")) {
        Ok(home) if !home.is_empty() => PathBuf::from(home).join(".facenet"),
        _ => std::env::temp_dir().join(".facenet"),
    }
}

/// Downloader settings
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub cache_dir: PathBuf,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub show_progress: bool,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            timeout: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(30),
            show_progress: true,
        }
    }
}

/// Fetches artifacts over HTTP into `<cache_dir>/<cache_subdir>/<file_name>`.
pub struct HttpFetcher {
    client: Client,
    config: HttpFetcherConfig,
}

impl HttpFetcher {
    /// Create a new fetcher with proxy support
    pub fn new(config: HttpFetcherConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout);

        if let Ok(proxy_url) = std::env::var("HTTPS_PROXY")
            .or_else(|_| std::env::var("https_proxy"))
            .or_else(|_| std::env::var("ALL_PROXY"))
            .or_else(|_| std::env::var("all_proxy"))
        {
            if !proxy_url.is_empty() {
                info!("Using proxy: {}", proxy_url);
                let proxy = reqwest::Proxy::all(&proxy_url)
                    .map_err(|e| FacenetError::config(format!("Invalid proxy URL: {}", e)))?
                    .no_proxy(reqwest::NoProxy::from_env());
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| FacenetError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.config.cache_dir
    }

    /// Local path an artifact is cached under.
    pub fn cached_path(&self, request: &FetchRequest) -> PathBuf {
        self.config
            .cache_dir
            .join(&request.cache_subdir)
            .join(&request.file_name)
    }

    /// Download `url` into `dest`, resuming from `dest.incomplete` if present.
    async fn download_with_resume(&self, url: &str, dest: &Path) -> Result<()> {
        let incomplete_path = dest.with_extension(format!(
            "{}.incomplete",
            dest.extension().and_then(|e| e.to_str()).unwrap_or("")
        ));

        let (response, resume_from) = loop {
            let resume_from = match fs::metadata(&incomplete_path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };

            let mut request = self.client.get(url);
            if resume_from > 0 {
                request = request.header("Range", format!("bytes={}-", resume_from));
            }

            let response = request
                .send()
                .await
                .map_err(|e| FacenetError::network(format!("Failed to download {}: {}", url, e)))?;

            // The partial file already holds the whole body, or more.
            if resume_from > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
                warn!(
                    "Discarding {} after the server rejected resuming at byte {}",
                    incomplete_path.display(),
                    resume_from
                );
                fs::remove_file(&incomplete_path).await?;
                continue;
            }
            break (response, resume_from);
        };

        let status = response.status();
        if !status.is_success() {
            return Err(FacenetError::network(format!(
                "Failed to download {} ({})",
                url, status
            )));
        }

        // A server ignoring the Range header answers 200 with the whole body.
        let resumed = resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let (mut file, start_pos) = if resumed {
            let file = OpenOptions::new()
                .append(true)
                .open(&incomplete_path)
                .await?;
            (file, resume_from)
        } else {
            (File::create(&incomplete_path).await?, 0u64)
        };

        let total_size = response.content_length().map(|len| len + start_pos);
        let pb = self.progress_bar(dest, total_size)?;
        if resumed {
            pb.set_position(start_pos);
            debug!("Resuming {} at byte {}", url, start_pos);
        }

        let mut stream = response.bytes_stream();
        let mut downloaded = start_pos;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| FacenetError::network(format!("Download error for {}: {}", url, e)))?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush().await?;
        drop(file);

        if let Some(total) = total_size {
            if downloaded != total {
                pb.abandon();
                return Err(FacenetError::network(format!(
                    "Incomplete download for {}: got {} bytes, expected {}",
                    url, downloaded, total
                )));
            }
        }

        fs::rename(&incomplete_path, dest).await?;
        pb.finish();
        Ok(())
    }

    fn progress_bar(&self, dest: &Path, total: Option<u64>) -> Result<ProgressBar> {
        if !self.config.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let pb = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::default_bar()
            .template("  {spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
            .map_err(|e| FacenetError::internal(format!("Invalid progress template: {}", e)))?
            .progress_chars("█▓▒░");
        pb.set_style(style);
        pb.set_message(
            dest.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
        );
        Ok(pb)
    }
}

#[async_trait]
impl WeightFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<PathBuf> {
        let path = self.cached_path(request);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        if path.exists() {
            let valid = match &request.file_hash {
                Some(hash) => validate_file(&path, hash).await?,
                None => true,
            };
            if valid {
                info!("Using cached {}", path.display());
                return Ok(path);
            }
            warn!(
                "A local file was found, but it seems to be incomplete or outdated because \
                 its hash does not match the published value, so the data will be downloaded \
                 again"
            );
        }

        info!("Downloading data from {}", request.url);
        self.download_with_resume(&request.url, &path).await?;

        if let Some(hash) = &request.file_hash {
            let actual = file_digest(&path, hash).await?;
            if !actual.eq_ignore_ascii_case(hash) {
                fs::remove_file(&path).await.ok();
                return Err(FacenetError::hash_mismatch(
                    request.file_name.clone(),
                    hash.clone(),
                    actual,
                ));
            }
        }

        Ok(path)
    }
}
