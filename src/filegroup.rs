//! Parallel transfer of a group of pre-hashed files
//!
//! Uploads ask the remote which digests it lacks and push only those, one
//! task per distinct digest. Downloads fetch each distinct digest once and
//! fill any further paths sharing it by local copy. Both run under a
//! bounded semaphore and report their stats even when some files fail.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    build::bazel::remote::execution::v2::Digest,
    client::{prepare_target, DownloadOutcome, KvClient},
    config::RetryPolicy,
    digest::sha256_of_reader,
    error::{KvError, Result},
    retry::retry_cancellable,
};

mod manifest;

pub use manifest::manifest_key;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: PathBuf,
    pub size: u64,
    /// Lower-case hex SHA-256 of the content.
    pub hash: String,
    pub mod_time: SystemTime,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl FileInfo {
    pub fn digest(&self) -> Digest {
        Digest {
            hash: self.hash.clone(),
            size_bytes: self.size as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    pub path: PathBuf,
    pub mod_time: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkInfo {
    pub path: PathBuf,
    pub target: PathBuf,
    pub mod_time: SystemTime,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileGroup {
    pub files: Vec<FileInfo>,
    #[serde(default)]
    pub directories: Vec<DirectoryInfo>,
    #[serde(default)]
    pub symlinks: Vec<SymlinkInfo>,
}

impl FileGroup {
    pub fn new(files: Vec<FileInfo>) -> Self {
        Self {
            files,
            ..Default::default()
        }
    }

    /// Distinct digests in first-seen order.
    pub fn digests(&self) -> Vec<Digest> {
        let mut seen = HashSet::new();
        self.files
            .iter()
            .filter(|f| seen.insert((f.hash.as_str(), f.size)))
            .map(FileInfo::digest)
            .collect()
    }

    pub fn largest_file_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    pub concurrency: usize,
    /// Attempts per upload task.
    pub upload_attempts: u32,
    /// Attempts per download task.
    pub download_attempts: u32,
    pub task_wait: Duration,
    /// Per-file errors beyond this many are counted but not logged.
    pub error_log_limit: usize,
    pub skip_existing: bool,
    pub force_overwrite: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            upload_attempts: 2,
            download_attempts: 3,
            task_wait: Duration::from_secs(3),
            error_log_limit: 10,
            skip_existing: false,
            force_overwrite: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadFilesStats {
    pub total_files: usize,
    pub files_to_upload: usize,
    pub files_uploaded: usize,
    pub files_failed: usize,
    pub upload_size: u64,
    pub largest_file_size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DownloadFilesStats {
    pub total_files: usize,
    pub files_downloaded: usize,
    pub files_skipped: usize,
    pub files_missing: usize,
    pub files_failed: usize,
    pub download_size: u64,
    pub largest_file_size: u64,
}

/// Logs the first `limit` per-file failures, then only counts them.
struct ErrorLog {
    limit: usize,
    logged: usize,
}

impl ErrorLog {
    fn new(limit: usize) -> Self {
        Self { limit, logged: 0 }
    }

    fn record(&mut self, path: &Path, err: &KvError) {
        if self.logged < self.limit {
            error!(path = %path.display(), "transfer failed: {err}");
        } else if self.logged == self.limit {
            warn!("further per-file transfer errors suppressed");
        }
        self.logged += 1;
    }
}

pub struct FileGroupTransfer {
    client: Arc<KvClient>,
    config: TransferConfig,
}

impl FileGroupTransfer {
    pub fn new(client: Arc<KvClient>, config: TransferConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &Arc<KvClient> {
        &self.client
    }

    fn semaphore(&self) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(self.config.concurrency.max(1)))
    }

    /// Upload every file of `group` the remote is missing.
    ///
    /// Stats are returned even on failure so partial progress is visible.
    pub async fn upload(
        &self,
        group: &FileGroup,
        token: &CancellationToken,
    ) -> (UploadFilesStats, Result<()>) {
        let mut stats = UploadFilesStats {
            total_files: group.files.len(),
            largest_file_size: group.largest_file_size(),
            ..Default::default()
        };

        let missing = match self.client.find_missing(&group.digests()).await {
            Ok(missing) => missing,
            Err(e) => return (stats, Err(e)),
        };
        let mut missing_set: HashMap<String, Digest> = missing
            .into_iter()
            .map(|digest| (digest.hash.clone(), digest))
            .collect();
        debug!(
            total = stats.total_files,
            missing = missing_set.len(),
            "computed missing set"
        );

        let policy = RetryPolicy::constant(self.config.upload_attempts, self.config.task_wait);
        let semaphore = self.semaphore();
        let abort = token.child_token();
        let mut tasks = JoinSet::new();

        for file in &group.files {
            // Claiming the digest here means one upload per digest, however
            // many files share it.
            if missing_set.remove(&file.hash).is_none() {
                continue;
            }
            stats.files_to_upload += 1;
            stats.upload_size += file.size;

            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = abort.cancelled() => break,
            };
            let client = Arc::clone(&self.client);
            let file = file.clone();
            let abort = abort.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = retry_cancellable(&policy, "upload file", &abort, |_| {
                    upload_member(&client, &file)
                })
                .await;
                (file, result)
            });
        }

        let mut errors = ErrorLog::new(self.config.error_log_limit);
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(()))) => stats.files_uploaded += 1,
                Ok((file, Err(e))) => {
                    stats.files_failed += 1;
                    errors.record(&file.path, &e);
                    if matches!(e, KvError::CacheUnauthenticated(_)) {
                        abort.cancel();
                        fatal.get_or_insert(e);
                    }
                }
                Err(e) => {
                    stats.files_failed += 1;
                    error!("upload task panicked: {e}");
                }
            }
        }
        // Files claimed but never spawned because of an abort.
        stats.files_failed += stats.files_to_upload - stats.files_uploaded - stats.files_failed;

        info!(
            total = stats.total_files,
            to_upload = stats.files_to_upload,
            uploaded = stats.files_uploaded,
            failed = stats.files_failed,
            bytes = stats.upload_size,
            "file group upload finished"
        );

        let result = match fatal {
            Some(e) => Err(e),
            None if token.is_cancelled() && stats.files_failed > 0 => Err(KvError::Cancelled),
            None if stats.files_failed > 0 => Err(KvError::Group {
                failed: stats.files_failed,
                missing: 0,
            }),
            None => Ok(()),
        };
        (stats, result)
    }

    /// Download every file of `group`, restoring mode and mtime.
    pub async fn download(
        &self,
        group: &FileGroup,
        token: &CancellationToken,
    ) -> (DownloadFilesStats, Result<()>) {
        let mut stats = DownloadFilesStats {
            total_files: group.files.len(),
            largest_file_size: group.largest_file_size(),
            ..Default::default()
        };
        debug!(
            total = stats.total_files,
            largest = stats.largest_file_size,
            "starting file group download"
        );

        // Group paths by digest, keeping first-seen order.
        let mut order: Vec<(String, u64)> = Vec::new();
        let mut by_digest: HashMap<(String, u64), Vec<FileInfo>> = HashMap::new();
        for file in &group.files {
            let id = (file.hash.clone(), file.size);
            by_digest
                .entry(id.clone())
                .or_insert_with(|| {
                    order.push(id);
                    Vec::new()
                })
                .push(file.clone());
        }

        let policy = RetryPolicy::constant(self.config.download_attempts, self.config.task_wait);
        let semaphore = self.semaphore();
        let abort = token.child_token();
        let mut tasks = JoinSet::new();

        for id in order {
            let files = by_digest.remove(&id).unwrap_or_default();
            let permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = abort.cancelled() => break,
            };
            let client = Arc::clone(&self.client);
            let abort = abort.clone();
            let config = self.config;
            tasks.spawn(async move {
                let _permit = permit;
                download_digest(&client, files, &policy, &config, &abort).await
            });
        }

        let mut errors = ErrorLog::new(self.config.error_log_limit);
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            let results = match joined {
                Ok(results) => results,
                Err(e) => {
                    error!("download task panicked: {e}");
                    continue;
                }
            };
            for (file, result) in results {
                match result {
                    Ok(DownloadOutcome::Downloaded) => {
                        stats.files_downloaded += 1;
                        stats.download_size += file.size;
                    }
                    Ok(DownloadOutcome::Skipped) => stats.files_skipped += 1,
                    Err(KvError::CacheNotFound) => {
                        stats.files_missing += 1;
                        debug!(path = %file.path.display(), "not in cache");
                    }
                    Err(e) => {
                        stats.files_failed += 1;
                        errors.record(&file.path, &e);
                        if matches!(e, KvError::CacheUnauthenticated(_)) {
                            abort.cancel();
                            fatal.get_or_insert(e);
                        }
                    }
                }
            }
        }
        // Whatever is unaccounted for was never spawned or was lost to a panic.
        let accounted =
            stats.files_downloaded + stats.files_skipped + stats.files_missing + stats.files_failed;
        stats.files_failed += stats.total_files.saturating_sub(accounted);

        info!(
            total = stats.total_files,
            downloaded = stats.files_downloaded,
            skipped = stats.files_skipped,
            missing = stats.files_missing,
            failed = stats.files_failed,
            bytes = stats.download_size,
            "file group download finished"
        );

        let result = match fatal {
            Some(e) => Err(e),
            None if token.is_cancelled() && stats.files_failed > 0 => Err(KvError::Cancelled),
            None if stats.files_failed > 0 || stats.files_missing > 0 => Err(KvError::Group {
                failed: stats.files_failed,
                missing: stats.files_missing,
            }),
            None => Ok(()),
        };
        (stats, result)
    }
}

/// Upload `file` under its listed hash, refusing if the bytes on disk no
/// longer hash to it.
async fn upload_member(client: &KvClient, file: &FileInfo) -> Result<()> {
    let mut source = tokio::fs::File::open(&file.path).await?;
    let (sha256, size) = sha256_of_reader(&mut source).await?;
    if sha256 != file.hash || size != file.size {
        warn!(path = %file.path.display(), "file changed after it was hashed");
        return Err(KvError::ContentChanged {
            path: file.path.clone(),
            expected: file.hash.clone(),
            actual: sha256,
        });
    }
    debug!(path = %file.path.display(), size, "uploading file");
    client.put(&mut source, &file.hash, &sha256, size).await
}

/// Fetch one digest to the first path that needs it and copy it to the rest.
async fn download_digest(
    client: &KvClient,
    files: Vec<FileInfo>,
    policy: &RetryPolicy,
    config: &TransferConfig,
    token: &CancellationToken,
) -> Vec<(FileInfo, Result<DownloadOutcome>)> {
    let mut files = files.into_iter();
    let primary = match files.next() {
        Some(primary) => primary,
        None => return Vec::new(),
    };

    let outcome = retry_cancellable(policy, "download file", token, |_| {
        client.download_file(
            &primary.path,
            &primary.hash,
            primary.mode,
            config.skip_existing,
            config.force_overwrite,
        )
    })
    .await;
    let outcome = match outcome {
        Ok(DownloadOutcome::Downloaded) => restore_mtime(&primary.path, primary.mod_time)
            .await
            .map(|_| DownloadOutcome::Downloaded),
        other => other,
    };

    let mut results = Vec::new();
    let source_ok = outcome.is_ok();
    for copy in files {
        let result = if source_ok {
            copy_local(&primary.path, &copy, config).await
        } else {
            Err(match &outcome {
                Err(KvError::CacheNotFound) => KvError::CacheNotFound,
                Err(KvError::CacheUnauthenticated(m)) => KvError::CacheUnauthenticated(m.clone()),
                Err(KvError::Cancelled) => KvError::Cancelled,
                _ => KvError::InvalidArgument(format!(
                    "source {} for shared digest unavailable",
                    primary.path.display()
                )),
            })
        };
        results.push((copy, result));
    }
    results.insert(0, (primary, outcome));
    results
}

/// Whether `a` and `b` name the same file on disk, however they are spelt.
async fn is_same_file(a: &Path, b: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        match (tokio::fs::metadata(a).await, tokio::fs::metadata(b).await) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        match (tokio::fs::canonicalize(a).await, tokio::fs::canonicalize(b).await) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

async fn copy_local(
    source: &Path,
    target: &FileInfo,
    config: &TransferConfig,
) -> Result<DownloadOutcome> {
    // Listed twice, or reached again through a symlinked directory.
    if is_same_file(source, &target.path).await {
        debug!(path = %target.path.display(), "target is the downloaded file itself");
        return Ok(DownloadOutcome::Skipped);
    }
    if let Some(outcome) =
        prepare_target(&target.path, config.skip_existing, config.force_overwrite).await?
    {
        return Ok(outcome);
    }

    let staging = staging_path(&target.path);
    let copied = stage_copy(source, &staging, target).await;
    let copied = match copied {
        Ok(()) => tokio::fs::rename(&staging, &target.path)
            .await
            .map_err(KvError::from),
        Err(e) => Err(e),
    };
    if let Err(e) = copied {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(e);
    }
    Ok(DownloadOutcome::Downloaded)
}

/// A unique sibling of `path` to build the copy in.
fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.part", name, Uuid::new_v4()))
}

async fn stage_copy(source: &Path, staging: &Path, target: &FileInfo) -> Result<()> {
    tokio::fs::copy(source, staging).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if target.mode == 0 { 0o644 } else { target.mode };
        tokio::fs::set_permissions(staging, std::fs::Permissions::from_mode(mode)).await?;
    }
    restore_mtime(staging, target.mod_time).await
}

pub(crate) async fn restore_mtime(path: &Path, mod_time: SystemTime) -> Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        filetime::set_file_mtime(&path, FileTime::from_system_time(mod_time))
    })
    .await
    .map_err(|e| KvError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;
    Ok(())
}
