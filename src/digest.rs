//! SHA-256 helpers

use std::io::SeekFrom;

use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::{build::bazel::remote::execution::v2::Digest, error::Result};

const HASH_BUFFER: usize = 64 * 1024;

/// Lower-case hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    sha256::digest(data)
}

/// Raw 32-byte SHA-256 of a byte slice.
pub fn sha256_raw(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn digest_of(data: &[u8]) -> Digest {
    Digest {
        hash: sha256_hex(data),
        size_bytes: data.len() as i64,
    }
}

/// Hash everything in `source` from the start, leaving it rewound.
pub async fn sha256_of_reader<R>(source: &mut R) -> Result<(String, u64)>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    source.seek(SeekFrom::Start(0)).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    source.seek(SeekFrom::Start(0)).await?;
    Ok((hex::encode(hasher.finalize()), total))
}

/// Incremental hasher used to verify streamed downloads.
#[derive(Default)]
pub struct StreamHasher {
    inner: Sha256,
}

impl StreamHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finish(self) -> String {
        hex::encode(self.inner.finalize())
    }
}
