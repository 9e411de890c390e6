//! Resumable uploads

use std::{io::Cursor, io::SeekFrom, path::Path, time::Duration};

use tokio::{
    fs::File,
    io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt},
};
use tonic::Code;
use tracing::{debug, info, warn};

use super::KvClient;
use crate::{
    bytestream::{BlobWriter, ByteStreamWriter, CHUNK_SIZE},
    digest::{sha256_hex, sha256_of_reader},
    error::{KvError, Result},
    transport::WriteHeaders,
};

const BYTES_PER_SECOND_BUDGET: f64 = 10.0 * 1024.0 * 1024.0;
const MIN_UPLOAD_TIMEOUT: Duration = Duration::from_secs(20);
const MAX_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// One second per 10 MiB, clamped to [20 s, 120 s].
pub fn upload_timeout(size: u64) -> Duration {
    Duration::from_secs_f64(size as f64 / BYTES_PER_SECOND_BUDGET)
        .clamp(MIN_UPLOAD_TIMEOUT, MAX_UPLOAD_TIMEOUT)
}

impl KvClient {
    /// Hash and upload a local file under `key`.
    pub async fn upload_file(&self, path: &Path, key: &str) -> Result<()> {
        let mut file = File::open(path).await?;
        let (sha256, size) = sha256_of_reader(&mut file).await?;
        debug!(path = %path.display(), key, size, "uploading file");
        self.put(&mut file, key, &sha256, size).await
    }

    /// Upload `size` bytes from a seekable source under `key`.
    pub async fn upload_stream<R>(&self, mut source: R, key: &str, size: u64) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let (sha256, available) = sha256_of_reader(&mut source).await?;
        if available != size {
            return Err(KvError::InvalidArgument(format!(
                "source holds {} bytes, {} declared",
                available, size
            )));
        }
        self.put(&mut source, key, &sha256, size).await
    }

    pub async fn upload_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let sha256 = sha256_hex(&data);
        let size = data.len() as u64;
        self.put(&mut Cursor::new(data), key, &sha256, size).await
    }

    /// The upload state machine: resume through `QueryWriteStatus` between
    /// attempts, restart once from zero with delete-on-rewrite when the
    /// remote reports a colliding blob.
    pub(crate) async fn put<R>(&self, source: &mut R, key: &str, sha256: &str, size: u64) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        let policy = self.config.upload_policy;
        let timeout = upload_timeout(size);
        let operation_id = Self::new_operation_id();
        let size = size as i64;

        let mut committed = 0i64;
        let mut delete_on_rewrite = false;
        let mut resume = false;
        let mut attempt = 0u32;

        loop {
            if resume {
                committed = 0;
                match self.query_write_status_with(key, &operation_id).await {
                    Ok(status) if status.complete => {
                        debug!(key, "remote reports upload complete");
                        return Ok(());
                    }
                    Ok(status) => committed = status.committed_size.clamp(0, size),
                    Err(KvError::CacheNotFound) => {}
                    Err(e) => warn!(key, "query write status failed: {e}"),
                }
                if committed >= size && size > 0 {
                    return Ok(());
                }
            }

            let headers = WriteHeaders {
                sha256: sha256.to_string(),
                delete_on_rewrite,
            };
            let err = match self
                .put_from(source, key, &headers, committed, size, timeout, &operation_id)
                .await
            {
                Ok(()) => {
                    info!(key, size, resumed_at = committed, "uploaded");
                    return Ok(());
                }
                Err(e) => e,
            };

            if err.code() == Some(Code::AlreadyExists) && !delete_on_rewrite {
                warn!(key, "blob already exists remotely, rewriting from scratch");
                delete_on_rewrite = true;
                committed = 0;
                resume = false;
                continue;
            }
            if !err.is_retryable() {
                return Err(err);
            }
            attempt += 1;
            if attempt >= policy.max_attempts {
                return Err(err);
            }
            let delay = policy.delay_for(attempt);
            warn!(
                key,
                "upload attempt {}/{} failed, retrying in {:?}: {err}",
                attempt,
                policy.max_attempts,
                delay,
            );
            tokio::time::sleep(delay).await;
            resume = true;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn put_from<R>(
        &self,
        source: &mut R,
        key: &str,
        headers: &WriteHeaders,
        offset: i64,
        size: i64,
        timeout: Duration,
        operation_id: &str,
    ) -> Result<()>
    where
        R: AsyncRead + AsyncSeek + Unpin + Send,
    {
        source.seek(SeekFrom::Start(offset as u64)).await?;
        let mut writer = ByteStreamWriter::open(
            &self.bytestream,
            self.metadata(operation_id, Some(headers)),
            key,
            offset,
            size,
            timeout,
        );

        let mut remaining = (&mut *source).take((size - offset) as u64);
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let n = remaining.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            writer.write(&buffer[..n]).await?;
            if writer.response().is_some() {
                break;
            }
        }

        let response = writer.close().await?;
        if response.committed_size != size {
            return Err(KvError::ShortWrite {
                committed: response.committed_size,
                expected: size,
            });
        }
        Ok(())
    }
}
