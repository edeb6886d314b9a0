use std::future::Future;
use std::path::PathBuf;

use tracing::debug;

use crate::catalog::{Image, ImageId};
use crate::error::LoadError;

/// A decoded image sitting in the off-screen buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedImage {
    pub id: ImageId,
    pub width: u32,
    pub height: u32,
}

/// Brings an image into memory. Completion is the "load" signal the
/// renderer waits for before swapping buffers.
pub trait ImageLoader: Send + Sync {
    fn load(&self, image: &Image) -> impl Future<Output = Result<LoadedImage, LoadError>> + Send;
}

/// Fetches bytes over HTTP or from disk and decodes them on a blocking
/// thread so the session loop stays responsive.
#[derive(Debug, Clone, Default)]
pub struct DecodingLoader {
    client: reqwest::Client,
}

impl DecodingLoader {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, LoadError> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let bytes = self
                .client
                .get(url)
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            Ok(bytes.to_vec())
        } else {
            let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
            Ok(tokio::fs::read(path).await?)
        }
    }
}

impl ImageLoader for DecodingLoader {
    async fn load(&self, image: &Image) -> Result<LoadedImage, LoadError> {
        let bytes = self.fetch_bytes(&image.url).await?;
        let (width, height) = tokio::task::spawn_blocking(move || {
            image::load_from_memory(&bytes).map(|img| (img.width(), img.height()))
        })
        .await??;
        debug!(id = image.id, width, height, "image decoded");
        Ok(LoadedImage {
            id: image.id,
            width,
            height,
        })
    }
}
