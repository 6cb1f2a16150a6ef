// DependencyManager: downloads a container's cached dependencies under the
// process-wide download limiter and turns them into bind mounts.

use cell_sdk::{LogStreamer, RateLimiter, StringUtil};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::cache::{CachedDownloader, ChecksumInfo};
use crate::container::{BindMount, CachedDependency};

/// Errors raised while acquiring or releasing cached dependencies.
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("invalid download url `{from}`")]
    InvalidUrl {
        from: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to download cached dependency {cache_key}: {error:#}")]
    Fetch {
        cache_key: String,
        error: anyhow::Error,
    },

    #[error("failed to release cached dependency {cache_key}: {error:#}")]
    Release {
        cache_key: String,
        error: anyhow::Error,
    },

    #[error("dependency download cancelled")]
    Cancelled,

    #[error("dependency download task failed: {0}")]
    TaskFailed(String),
}

/// A cache reference held by a container, released on destroy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheKeyDir {
    pub cache_key: String,
    pub dir: PathBuf,
}

/// Resolved dependencies of one container.
///
/// `cache_keys()[i]` is the cache reference backing `bind_mounts()[i]`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindMounts {
    cache_keys: Vec<CacheKeyDir>,
    bind_mounts: Vec<BindMount>,
}

impl BindMounts {
    pub fn add_bind_mount(&mut self, cache_key: CacheKeyDir, mount: BindMount) {
        self.cache_keys.push(cache_key);
        self.bind_mounts.push(mount);
    }

    pub fn cache_keys(&self) -> &[CacheKeyDir] {
        &self.cache_keys
    }

    pub fn bind_mounts(&self) -> &[BindMount] {
        &self.bind_mounts
    }

    pub fn len(&self) -> usize {
        self.cache_keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache_keys.is_empty()
    }

    pub fn into_parts(self) -> (Vec<CacheKeyDir>, Vec<BindMount>) {
        (self.cache_keys, self.bind_mounts)
    }
}

/// Acquires and releases cached dependencies for containers.
///
/// The limiter is shared with download steps, so the ceiling applies to every
/// download on the host.
#[derive(Clone)]
pub struct DependencyManager {
    cache: Arc<dyn CachedDownloader>,
    limiter: RateLimiter,
}

impl DependencyManager {
    pub fn new(cache: Arc<dyn CachedDownloader>, limiter: RateLimiter) -> Self {
        Self { cache, limiter }
    }

    /// Download every dependency and return the resulting bind mounts in input order.
    ///
    /// Returns as soon as the first download fails. Directories already
    /// obtained are closed before returning. The remaining downloads are told
    /// to stop; any of them that still finishes has its directory closed in
    /// the background.
    pub async fn download_cached_dependencies(
        &self,
        dependencies: &[CachedDependency],
        streamer: &LogStreamer,
    ) -> Result<BindMounts, DependencyError> {
        if dependencies.is_empty() {
            return Ok(BindMounts::default());
        }

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();
        for (index, dependency) in dependencies.iter().cloned().enumerate() {
            let cache = Arc::clone(&self.cache);
            let limiter = self.limiter.clone();
            let streamer = streamer.with_source(&dependency.log_source);
            let cancel = cancel.clone();
            tasks.spawn(async move {
                download_dependency(cache, limiter, dependency, streamer, cancel)
                    .await
                    .map(|resolved| (index, resolved))
            });
        }

        let mut resolved: Vec<Option<(CacheKeyDir, BindMount)>> = vec![None; dependencies.len()];
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| DependencyError::TaskFailed(e.to_string()));
            match outcome.and_then(|result| result) {
                Ok((index, entry)) => resolved[index] = Some(entry),
                Err(err) => {
                    tracing::error!("Failed to download cached dependencies: {}", err);
                    cancel.cancel();
                    for (key, _) in resolved.into_iter().flatten() {
                        close_quietly(self.cache.as_ref(), &key).await;
                    }
                    let cache = Arc::clone(&self.cache);
                    tokio::spawn(async move {
                        while let Some(joined) = tasks.join_next().await {
                            if let Ok(Ok((_, (key, _)))) = joined {
                                close_quietly(cache.as_ref(), &key).await;
                            }
                        }
                    });
                    return Err(err);
                }
            }
        }

        let mut bind_mounts = BindMounts::default();
        for (cache_key, mount) in resolved.into_iter().flatten() {
            bind_mounts.add_bind_mount(cache_key, mount);
        }
        Ok(bind_mounts)
    }

    /// Release cache references. Stops at the first failure; references
    /// released before it stay released.
    pub async fn release_cached_dependencies(
        &self,
        keys: &[CacheKeyDir],
    ) -> Result<(), DependencyError> {
        for key in keys {
            if let Err(error) = self.cache.close_directory(&key.cache_key, &key.dir).await {
                tracing::error!(cache_key = %key.cache_key, "Failed to close cached directory: {:#}", error);
                return Err(DependencyError::Release {
                    cache_key: key.cache_key.clone(),
                    error,
                });
            }
        }
        Ok(())
    }

    /// Persist the cache index. Failures are logged.
    pub async fn stop(&self) {
        if let Err(e) = self.cache.save_state().await {
            tracing::error!("Failed to save cache state: {:#}", e);
        }
    }
}

async fn close_quietly(cache: &dyn CachedDownloader, key: &CacheKeyDir) {
    if let Err(error) = cache.close_directory(&key.cache_key, &key.dir).await {
        tracing::error!(cache_key = %key.cache_key, "Failed to close cached directory: {:#}", error);
    }
}

async fn download_dependency(
    cache: Arc<dyn CachedDownloader>,
    limiter: RateLimiter,
    dependency: CachedDependency,
    streamer: LogStreamer,
    cancel: CancellationToken,
) -> Result<(CacheKeyDir, BindMount), DependencyError> {
    let waiting = Instant::now();
    let _permit = limiter
        .acquire_cancellable(&cancel)
        .await
        .map_err(|_| DependencyError::Cancelled)?;
    tracing::debug!(
        cache_key = %dependency.cache_key,
        wait_ms = waiting.elapsed().as_millis() as u64,
        "dependency-limiter-acquired"
    );

    let emit = |message: String| {
        if !dependency.name.is_empty() {
            streamer.stdout(&message);
        }
    };

    emit(format!("Downloading {}...", dependency.name));

    let url = match Url::parse(&dependency.from) {
        Ok(url) => url,
        Err(source) => {
            emit(format!("Downloading {} failed", dependency.name));
            return Err(DependencyError::InvalidUrl {
                from: dependency.from.clone(),
                source,
            });
        }
    };

    let checksum = ChecksumInfo::new(
        dependency.checksum_algorithm.clone(),
        dependency.checksum_value.clone(),
    );
    let started = Instant::now();
    match cache
        .fetch_as_directory(&url, &dependency.cache_key, &checksum, &cancel)
        .await
    {
        Ok((dir, size)) => {
            if size == 0 {
                emit(format!("Downloaded {}", dependency.name));
            } else {
                emit(format!(
                    "Downloaded {} ({})",
                    dependency.name,
                    StringUtil::format_byte_size(size)
                ));
            }
            tracing::info!(
                cache_key = %dependency.cache_key,
                size,
                duration_ms = started.elapsed().as_millis() as u64,
                "dependency-downloaded"
            );
            let mount = BindMount::host_read_only(dir.to_string_lossy(), dependency.to.clone());
            let key = CacheKeyDir {
                cache_key: dependency.cache_key.clone(),
                dir,
            };
            Ok((key, mount))
        }
        Err(error) => {
            emit(format!("Downloading {} failed", dependency.name));
            if cancel.is_cancelled() {
                return Err(DependencyError::Cancelled);
            }
            Err(DependencyError::Fetch {
                cache_key: dependency.cache_key.clone(),
                error,
            })
        }
    }
}
