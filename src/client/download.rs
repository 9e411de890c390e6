//! Streaming downloads with optional integrity verification

use std::{io::ErrorKind, path::Path};

use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt},
};
use tracing::{debug, warn};

use super::KvClient;
use crate::{
    bytestream::{BlobReader, ByteStreamReader},
    digest::StreamHasher,
    error::{KvError, Result},
    retry::retry,
    transport::HEADER_VALIDATION_SHA256,
};

const COPY_BUFFER: usize = 64 * 1024;
const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded,
    /// The target already existed and `skip_existing` was set.
    Skipped,
}

/// Apply the existing-target policy to `path` before writing it.
///
/// Returns `Some(Skipped)` when the caller should leave the target alone.
pub(crate) async fn prepare_target(
    path: &Path,
    skip_existing: bool,
    force_overwrite: bool,
) -> Result<Option<DownloadOutcome>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    match fs::symlink_metadata(path).await {
        Ok(_) if skip_existing => {
            debug!(path = %path.display(), "target exists, skipping");
            Ok(Some(DownloadOutcome::Skipped))
        }
        Ok(meta) if meta.permissions().readonly() => {
            if !force_overwrite {
                return Err(KvError::FileExistsAndNotWritable(path.to_path_buf()));
            }
            let mut permissions = meta.permissions();
            #[allow(clippy::permissions_set_readonly_false)]
            permissions.set_readonly(false);
            fs::set_permissions(path, permissions).await?;
            fs::remove_file(path).await?;
            Ok(None)
        }
        Ok(meta) if meta.file_type().is_symlink() => {
            fs::remove_file(path).await?;
            Ok(None)
        }
        Ok(_) => Ok(None),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

impl KvClient {
    /// Stream `key` into `sink` in a single attempt.
    ///
    /// When the remote announces the blob checksum the received bytes are
    /// hashed as they pass and compared once the stream ends.
    pub async fn download_stream<W>(&self, sink: &mut W, key: &str) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        self.download_stream_with(sink, key, &Self::new_operation_id())
            .await
    }

    async fn download_stream_with<W>(&self, sink: &mut W, key: &str, operation_id: &str) -> Result<u64>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        let mut reader =
            ByteStreamReader::open(&self.bytestream, self.metadata(operation_id, None), key, None)
                .await?;
        let expected = reader.metadata().get(HEADER_VALIDATION_SHA256).cloned();
        let mut hasher = expected.as_ref().map(|_| StreamHasher::new());

        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&buffer[..n]);
            }
            sink.write_all(&buffer[..n]).await?;
            total += n as u64;
        }
        sink.flush().await?;

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            let actual = hasher.finish();
            if !actual.eq_ignore_ascii_case(&expected) {
                return Err(KvError::IntegrityMismatch { expected, actual });
            }
        }
        debug!(key, bytes = total, "downloaded");
        Ok(total)
    }

    /// Fetch `key` into memory, retrying per the download policy.
    pub async fn download_bytes(&self, key: &str) -> Result<Vec<u8>> {
        let operation_id = Self::new_operation_id();
        let operation_id = operation_id.as_str();
        retry(&self.config.download_policy, "download", |_| async move {
            let mut data = Vec::new();
            self.download_stream_with(&mut data, key, operation_id)
                .await?;
            Ok(data)
        })
        .await
    }

    /// Download `key` to `path`.
    ///
    /// An existing target is skipped when `skip_existing` is set. Otherwise
    /// a writable target is truncated and overwritten, and a read-only one
    /// is either refused or, with `force_overwrite`, made writable and
    /// unlinked first. A failed download leaves no file behind.
    pub async fn download_file(
        &self,
        path: &Path,
        key: &str,
        mode: u32,
        skip_existing: bool,
        force_overwrite: bool,
    ) -> Result<DownloadOutcome> {
        if let Some(outcome) = prepare_target(path, skip_existing, force_overwrite).await? {
            return Ok(outcome);
        }

        let mode = if mode == 0 { DEFAULT_FILE_MODE } else { mode };
        let operation_id = Self::new_operation_id();
        let operation_id = operation_id.as_str();
        let result = retry(&self.config.download_policy, "download file", |_| async move {
            let mut options = OpenOptions::new();
            options.read(true).write(true).create(true).truncate(true);
            #[cfg(unix)]
            options.mode(mode);
            let mut file = options.open(path).await?;
            self.download_stream_with(&mut file, key, operation_id)
                .await
        })
        .await;

        if let Err(e) = result {
            if let Err(remove) = fs::remove_file(path).await {
                if remove.kind() != ErrorKind::NotFound {
                    warn!(path = %path.display(), "failed to clean up partial download: {remove}");
                }
            }
            return Err(e);
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        }
        Ok(DownloadOutcome::Downloaded)
    }
}
