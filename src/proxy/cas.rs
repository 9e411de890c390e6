//! Compiler CAS service
//!
//! Objects (data plus references) are stored as an encoded `StoredObject`
//! keyed by the SHA-256 of that encoding. Bare blobs are stored as-is,
//! keyed by the SHA-256 of their bytes.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use prost::Message;
use tokio::fs::{self, File};
use tonic::{async_trait, Request, Response, Status};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::ProxyState;
use crate::{
    client::KvClient,
    compilation_cache_service::cas::v1::{
        cas_bytes, cas_get_response, cas_load_response, cas_put_response, cas_save_response,
        casdb_service_server::CasdbService, CasBlob, CasBytes, CasDataId, CasGetRequest,
        CasGetResponse, CasLoadRequest, CasLoadResponse, CasObject, CasPutRequest,
        CasPutResponse, CasSaveRequest, CasSaveResponse, ResponseError,
    },
    digest::{sha256_of_reader, sha256_raw},
    error::KvError,
    storage_proto::StoredObject,
};

pub(crate) struct CasService {
    state: Arc<ProxyState>,
}

impl CasService {
    pub(crate) fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }

    /// Hand `data` back inline, or via a file in the scratch directory.
    async fn contents(
        &self,
        key: &str,
        data: Vec<u8>,
        write_to_disk: bool,
    ) -> Result<CasBytes, KvError> {
        let contents = if write_to_disk {
            let path = self.state.scratch_dir.join(key);
            materialize(&self.state.scratch_dir, &path, &data).await?;
            cas_bytes::Contents::FilePath(path.to_string_lossy().into_owned())
        } else {
            cas_bytes::Contents::Blob(data)
        };
        Ok(CasBytes {
            contents: Some(contents),
        })
    }
}

/// Place `data` at `path` without ever exposing a partly written file.
///
/// Files are named by content, so one that already has the right size is
/// left as is. Otherwise the data is staged under a unique name and renamed
/// over `path`; readers holding the old file keep reading it intact.
async fn materialize(dir: &Path, path: &Path, data: &[u8]) -> Result<(), KvError> {
    if let Ok(meta) = fs::metadata(path).await {
        if meta.is_file() && meta.len() == data.len() as u64 {
            return Ok(());
        }
    }
    fs::create_dir_all(dir).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = dir.join(format!(".{}.{}.part", name, Uuid::new_v4()));
    let written = match fs::write(&staging, data).await {
        Ok(()) => fs::rename(&staging, path).await,
        Err(e) => Err(e),
    };
    if let Err(e) = written {
        let _ = fs::remove_file(&staging).await;
        return Err(e.into());
    }
    Ok(())
}

fn cas_key(id: &CasDataId) -> Result<String, Status> {
    if id.id.is_empty() {
        return Err(Status::invalid_argument("empty CAS id"));
    }
    Ok(hex::encode(&id.id))
}

fn response_error(e: &KvError) -> ResponseError {
    ResponseError {
        description: e.to_string(),
    }
}

/// Materialize inline or on-disk bytes from a request.
async fn read_bytes(bytes: Option<CasBytes>) -> Result<Vec<u8>, Status> {
    match bytes.and_then(|b| b.contents) {
        Some(cas_bytes::Contents::Blob(data)) => Ok(data),
        Some(cas_bytes::Contents::FilePath(path)) => fs::read(&path)
            .await
            .map_err(|e| Status::invalid_argument(format!("cannot read {}: {}", path, e))),
        None => Err(Status::invalid_argument("missing blob contents")),
    }
}

#[async_trait]
impl CasdbService for CasService {
    #[instrument(skip_all)]
    async fn get(
        &self,
        request: Request<CasGetRequest>,
    ) -> Result<Response<CasGetResponse>, Status> {
        let session = self.state.begin().await?;
        let request = request.into_inner();
        let key = cas_key(&request.cas_id.unwrap_or_default())?;
        let stats = &session.stats;

        let raw = match session.client.download_bytes(&key).await {
            Ok(raw) => raw,
            Err(KvError::CacheNotFound) => {
                debug!(key, "cas object miss");
                stats.increment_misses();
                return Ok(Response::new(CasGetResponse {
                    outcome: cas_get_response::Outcome::ObjectNotFound as i32,
                    contents: None,
                }));
            }
            Err(e) => {
                error!(key, "cas get failed: {e}");
                return Ok(Response::new(CasGetResponse {
                    outcome: cas_get_response::Outcome::Error as i32,
                    contents: Some(cas_get_response::Contents::Error(response_error(&e))),
                }));
            }
        };
        stats.add_download_bytes(raw.len() as i64);

        let object = StoredObject::decode(raw.as_slice())
            .map_err(|e| Status::data_loss(format!("stored object {} is corrupt: {}", key, e)))?;
        let blob = match self.contents(&key, object.data, request.write_to_disk).await {
            Ok(blob) => blob,
            Err(e) => {
                return Ok(Response::new(CasGetResponse {
                    outcome: cas_get_response::Outcome::Error as i32,
                    contents: Some(cas_get_response::Contents::Error(response_error(&e))),
                }))
            }
        };
        stats.increment_hits();
        Ok(Response::new(CasGetResponse {
            outcome: cas_get_response::Outcome::Success as i32,
            contents: Some(cas_get_response::Contents::Data(CasObject {
                blob: Some(blob),
                references: object
                    .references
                    .into_iter()
                    .map(|id| CasDataId { id })
                    .collect(),
            })),
        }))
    }

    #[instrument(skip_all)]
    async fn put(
        &self,
        request: Request<CasPutRequest>,
    ) -> Result<Response<CasPutResponse>, Status> {
        let session = self.state.begin().await?;
        let object = request
            .into_inner()
            .data
            .ok_or_else(|| Status::invalid_argument("missing object"))?;
        let stored = StoredObject {
            data: read_bytes(object.blob).await?,
            references: object.references.into_iter().map(|r| r.id).collect(),
        };
        let encoded = stored.encode_to_vec();
        let id = sha256_raw(&encoded);
        let key = hex::encode(&id);

        if self.state.push_enabled {
            let size = encoded.len() as i64;
            if let Err(e) = session.client.upload_bytes(&key, encoded).await {
                error!(key, "cas put failed: {e}");
                return Ok(Response::new(CasPutResponse {
                    contents: Some(cas_put_response::Contents::Error(response_error(&e))),
                }));
            }
            session.stats.add_upload_bytes(size);
        }
        Ok(Response::new(CasPutResponse {
            contents: Some(cas_put_response::Contents::CasId(CasDataId { id })),
        }))
    }

    #[instrument(skip_all)]
    async fn load(
        &self,
        request: Request<CasLoadRequest>,
    ) -> Result<Response<CasLoadResponse>, Status> {
        let session = self.state.begin().await?;
        let request = request.into_inner();
        let key = cas_key(&request.cas_id.unwrap_or_default())?;
        let stats = &session.stats;

        let result = match session.client.download_bytes(&key).await {
            Ok(data) => {
                let size = data.len() as i64;
                self.contents(&key, data, request.write_to_disk)
                    .await
                    .map(|blob| (blob, size))
            }
            Err(e) => Err(e),
        };
        let response = match result {
            Ok((blob, size)) => {
                stats.increment_hits();
                stats.add_download_bytes(size);
                CasLoadResponse {
                    outcome: cas_load_response::Outcome::Success as i32,
                    contents: Some(cas_load_response::Contents::Data(CasBlob {
                        blob: Some(blob),
                    })),
                }
            }
            Err(KvError::CacheNotFound) => {
                debug!(key, "cas blob miss");
                stats.increment_misses();
                CasLoadResponse {
                    outcome: cas_load_response::Outcome::ObjectNotFound as i32,
                    contents: None,
                }
            }
            Err(e) => {
                error!(key, "cas load failed: {e}");
                CasLoadResponse {
                    outcome: cas_load_response::Outcome::Error as i32,
                    contents: Some(cas_load_response::Contents::Error(response_error(&e))),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all)]
    async fn save(
        &self,
        request: Request<CasSaveRequest>,
    ) -> Result<Response<CasSaveResponse>, Status> {
        let session = self.state.begin().await?;
        let contents = request
            .into_inner()
            .data
            .and_then(|blob| blob.blob)
            .and_then(|bytes| bytes.contents)
            .ok_or_else(|| Status::invalid_argument("missing blob contents"))?;

        let result = match contents {
            cas_bytes::Contents::Blob(data) => {
                let id = sha256_raw(&data);
                let key = hex::encode(&id);
                let size = data.len() as i64;
                if self.state.push_enabled {
                    session
                        .client
                        .upload_bytes(&key, data)
                        .await
                        .map(|_| (id, size))
                } else {
                    Ok((id, 0))
                }
            }
            cas_bytes::Contents::FilePath(path) => {
                self.save_file(&session.client, PathBuf::from(path)).await
            }
        };

        let response = match result {
            Ok((id, uploaded)) => {
                session.stats.add_upload_bytes(uploaded);
                CasSaveResponse {
                    contents: Some(cas_save_response::Contents::CasId(CasDataId { id })),
                }
            }
            Err(e) => {
                error!("cas save failed: {e}");
                CasSaveResponse {
                    contents: Some(cas_save_response::Contents::Error(response_error(&e))),
                }
            }
        };
        Ok(Response::new(response))
    }
}

impl CasService {
    /// Hash and stream a file without loading it into memory. Returns the
    /// id and the number of bytes pushed.
    async fn save_file(
        &self,
        client: &KvClient,
        path: PathBuf,
    ) -> Result<(Vec<u8>, i64), KvError> {
        let mut file = File::open(&path).await?;
        let (sha256, size) = sha256_of_reader(&mut file).await?;
        let id = hex::decode(&sha256)
            .map_err(|e| KvError::InvalidArgument(format!("bad digest {}: {}", sha256, e)))?;
        if !self.state.push_enabled {
            return Ok((id, 0));
        }
        debug!(path = %path.display(), size, "saving file blob");
        client.put(&mut file, &sha256, &sha256, size).await?;
        Ok((id, size as i64))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn materialize_replaces_short_files() -> Result<(), KvError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("abcd");
        fs::write(&path, b"trunc").await?;

        materialize(dir.path(), &path, b"full contents").await?;
        assert_eq!(fs::read(&path).await?, b"full contents");

        let mut entries = fs::read_dir(dir.path()).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        assert_eq!(names, vec![std::ffi::OsString::from("abcd")]);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn materialize_keeps_complete_files_in_place() -> Result<(), KvError> {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("abcd");
        materialize(dir.path(), &path, b"payload").await?;
        let first = fs::metadata(&path).await?.ino();
        materialize(dir.path(), &path, b"payload").await?;
        assert_eq!(fs::metadata(&path).await?.ino(), first);
        Ok(())
    }
}
