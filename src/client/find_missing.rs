//! Bulk presence checks

use std::collections::HashSet;

use prost::Message;
use tracing::debug;

use super::{with_deadline, KvClient, FIND_MISSING_TIMEOUT};
use crate::{
    build::bazel::remote::execution::v2::{digest_function, Digest, FindMissingBlobsRequest},
    error::Result,
    retry::retry,
    transport::build_request,
};

/// Max gRPC message size, minus a KiB for framing and headers.
pub const MAX_REQUEST_SIZE: usize = (4 * 1024 * 1024) - 1024;

/// Split `digests` so each chunk's request stays under `limit` bytes,
/// sized from the average encoded cost of one digest in `encoded_len`.
pub fn chunk_digests(digests: Vec<Digest>, encoded_len: usize, limit: usize) -> Vec<Vec<Digest>> {
    if digests.is_empty() {
        return Vec::new();
    }
    if encoded_len <= limit {
        return vec![digests];
    }
    let per_digest = encoded_len.div_ceil(digests.len());
    let per_chunk = (limit / per_digest).max(1);
    digests
        .chunks(per_chunk)
        .map(|chunk| chunk.to_vec())
        .collect()
}

fn find_missing_request(blob_digests: Vec<Digest>) -> FindMissingBlobsRequest {
    FindMissingBlobsRequest {
        instance_name: String::new(),
        blob_digests,
        digest_function: digest_function::Value::Sha256 as i32,
    }
}

impl KvClient {
    /// Return the subset of `digests` the remote does not hold.
    ///
    /// Duplicate digests are submitted once. Requests too large for a
    /// single gRPC message are split and the answers concatenated.
    pub async fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut seen = HashSet::new();
        let unique: Vec<Digest> = digests
            .iter()
            .filter(|d| seen.insert((d.hash.clone(), d.size_bytes)))
            .cloned()
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let encoded_len = find_missing_request(unique.clone()).encoded_len();
        let chunks = chunk_digests(unique, encoded_len, MAX_REQUEST_SIZE);
        if chunks.len() > 1 {
            debug!(
                chunks = chunks.len(),
                encoded_len, "find missing request exceeds message limit, splitting"
            );
        }

        let mut missing = Vec::new();
        for chunk in chunks {
            missing.extend(self.find_missing_chunk(chunk).await?);
        }
        Ok(missing)
    }

    async fn find_missing_chunk(&self, chunk: Vec<Digest>) -> Result<Vec<Digest>> {
        let operation_id = Self::new_operation_id();
        let operation_id = operation_id.as_str();
        let chunk = &chunk;
        retry(&self.config.find_missing_policy, "find missing", |_| {
            let mut client = self.cas.clone();
            let request = build_request(
                find_missing_request(chunk.clone()),
                self.metadata(operation_id, None),
                Some(FIND_MISSING_TIMEOUT),
            );
            async move {
                let response =
                    with_deadline(FIND_MISSING_TIMEOUT, client.find_missing_blobs(request)).await?;
                Ok(response.into_inner().missing_blob_digests)
            }
        })
        .await
    }
}
