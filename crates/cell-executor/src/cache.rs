// Dependency cache client and artifact uploader contracts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::container::ByteStream;

/// Optional content checksum verified by the cache after fetching.
/// An empty algorithm means no verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChecksumInfo {
    pub algorithm: String,
    pub value: String,
}

impl ChecksumInfo {
    pub fn new(algorithm: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            value: value.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.algorithm.is_empty()
    }
}

/// Content-addressed download cache shared by every container on the host.
///
/// Directories handed out by [`CachedDownloader::fetch_as_directory`] are
/// reference counted and must be returned with
/// [`CachedDownloader::close_directory`].
#[async_trait]
pub trait CachedDownloader: Send + Sync {
    /// Fetch an archive as a stream. Returns the stream and its size in bytes.
    async fn fetch(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: &ChecksumInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(ByteStream, u64)>;

    /// Fetch an archive and expand it into a cache directory. Returns the
    /// directory and the number of bytes downloaded.
    async fn fetch_as_directory(
        &self,
        url: &Url,
        cache_key: &str,
        checksum: &ChecksumInfo,
        cancel: &CancellationToken,
    ) -> anyhow::Result<(PathBuf, u64)>;

    /// Release one reference to a directory returned by `fetch_as_directory`.
    async fn close_directory(&self, cache_key: &str, dir: &Path) -> anyhow::Result<()>;

    /// Persist the cache index.
    async fn save_state(&self) -> anyhow::Result<()>;
}

/// Uploads artifacts streamed out of containers.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Upload `stream` to `to`. Returns the number of bytes uploaded.
    async fn upload(
        &self,
        stream: ByteStream,
        to: &Url,
        cancel: &CancellationToken,
    ) -> anyhow::Result<u64>;
}
