//! Image acquisition.
//!
//! Photos usually live behind a storage provider's share links, which do not
//! serve the raw image. Such links are rewritten to a direct download,
//! fetched and materialized into a temporary local file that is decoded and
//! then deleted. Other URLs are fetched into memory; bytes and paths are used
//! as they are.

use image::DynamicImage;
use reqwest::Url;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Where an image comes from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Url(String),
    Path(PathBuf),
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
            ImageSource::Url(url) => f.write_str(url),
            ImageSource::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("invalid image url: {0}")]
    InvalidUrl(String),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: reqwest::StatusCode },
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Direct-download URL for a Google Drive share link, or `None` when `url`
/// is not a share link.
///
/// Recognizes `/file/d/<id>/...`, `/open?id=<id>` and `/uc?id=<id>`.
pub fn storage_download_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    if parsed.host_str()? != "drive.google.com" {
        return None;
    }

    let from_path = {
        let segments: Vec<&str> = parsed.path_segments()?.collect();
        match segments.as_slice() {
            ["file", "d", id, ..] if !id.is_empty() => Some(id.to_string()),
            _ => None,
        }
    };
    let id = from_path.or_else(|| {
        parsed
            .query_pairs()
            .find(|(k, v)| k == "id" && !v.is_empty())
            .map(|(_, v)| v.into_owned())
    })?;

    Some(format!("https://drive.google.com/uc?export=download&id={id}"))
}

/// An image temporarily written to local disk. The file is deleted when
/// this value is dropped.
pub struct MaterializedImage {
    file: NamedTempFile,
}

impl MaterializedImage {
    fn write(bytes: &[u8]) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new().prefix("guestlens-").tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

impl Drop for MaterializedImage {
    fn drop(&mut self) {
        tracing::trace!(path = %self.file.path().display(), "releasing materialized image");
    }
}

/// Image bytes ready for decoding.
pub enum AcquiredImage {
    Memory(Vec<u8>),
    Materialized(MaterializedImage),
}

impl AcquiredImage {
    /// Decode the image, releasing any temporary file afterwards.
    pub fn decode(self) -> Result<DynamicImage, image::ImageError> {
        match self {
            AcquiredImage::Memory(bytes) => image::load_from_memory(&bytes),
            AcquiredImage::Materialized(local) => {
                image::ImageReader::open(local.path())?
                    .with_guessed_format()?
                    .decode()
            }
        }
    }
}

/// Fetches images over HTTP.
#[derive(Clone, Default)]
pub struct ImageFetcher {
    client: reqwest::Client,
}

impl ImageFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub async fn acquire(&self, source: &ImageSource) -> Result<AcquiredImage, FetchError> {
        match source {
            ImageSource::Bytes(bytes) => Ok(AcquiredImage::Memory(bytes.clone())),
            ImageSource::Path(path) => Ok(AcquiredImage::Memory(tokio::fs::read(path).await?)),
            ImageSource::Url(url) => match storage_download_url(url) {
                Some(direct) => {
                    tracing::debug!(%url, %direct, "materializing storage link");
                    let bytes = self.fetch(&direct).await?;
                    let local = tokio::task::spawn_blocking(move || MaterializedImage::write(&bytes))
                        .await
                        .map_err(std::io::Error::other)??;
                    Ok(AcquiredImage::Materialized(local))
                }
                None => Ok(AcquiredImage::Memory(self.fetch(url).await?)),
            },
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;

        let http = |source| FetchError::Http {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(parsed).send().await.map_err(http)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response.bytes().await.map_err(http)?.to_vec())
    }
}
