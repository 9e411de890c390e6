//! Compiler key/value service

use std::sync::Arc;

use prost::Message;
use tonic::{async_trait, Request, Response, Status};
use tracing::{debug, error, instrument};

use super::ProxyState;
use crate::{
    compilation_cache_service::keyvalue::v1::{
        get_value_response, key_value_db_server::KeyValueDb, GetValueRequest, GetValueResponse,
        PutValueRequest, PutValueResponse, ResponseError, Value,
    },
    error::KvError,
};

const KEY_PREFIX: &str = "llvm/kv/";

/// Remote key for a compiler KV key.
pub(crate) fn remote_key(key: &[u8]) -> String {
    format!("{}{}", KEY_PREFIX, hex::encode(key))
}

pub(crate) struct KvService {
    state: Arc<ProxyState>,
}

impl KvService {
    pub(crate) fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }
}

fn response_error(e: &KvError) -> ResponseError {
    ResponseError {
        description: e.to_string(),
    }
}

#[async_trait]
impl KeyValueDb for KvService {
    #[instrument(skip_all)]
    async fn get_value(
        &self,
        request: Request<GetValueRequest>,
    ) -> Result<Response<GetValueResponse>, Status> {
        let session = self.state.begin().await?;
        let key = remote_key(&request.into_inner().key);
        let stats = &session.stats;

        let response = match session.client.download_bytes(&key).await {
            Ok(raw) => {
                let value = Value::decode(raw.as_slice())
                    .map_err(|e| Status::data_loss(format!("value {} is corrupt: {}", key, e)))?;
                stats.increment_hits();
                stats.add_download_bytes(raw.len() as i64);
                GetValueResponse {
                    outcome: get_value_response::Outcome::Success as i32,
                    contents: Some(get_value_response::Contents::Value(value)),
                }
            }
            Err(KvError::CacheNotFound) => {
                debug!(key, "kv miss");
                stats.increment_misses();
                GetValueResponse {
                    outcome: get_value_response::Outcome::KeyNotFound as i32,
                    contents: None,
                }
            }
            Err(e) => {
                error!(key, "kv get failed: {e}");
                GetValueResponse {
                    outcome: get_value_response::Outcome::Error as i32,
                    contents: Some(get_value_response::Contents::Error(response_error(&e))),
                }
            }
        };
        Ok(Response::new(response))
    }

    #[instrument(skip_all)]
    async fn put_value(
        &self,
        request: Request<PutValueRequest>,
    ) -> Result<Response<PutValueResponse>, Status> {
        let session = self.state.begin().await?;
        let request = request.into_inner();
        if !self.state.push_enabled {
            return Ok(Response::new(PutValueResponse { error: None }));
        }

        let key = remote_key(&request.key);
        let encoded = request.value.unwrap_or_default().encode_to_vec();
        let size = encoded.len() as i64;
        let error = match session.client.upload_bytes(&key, encoded).await {
            Ok(()) => {
                session.stats.add_upload_bytes(size);
                None
            }
            Err(e) => {
                error!(key, "kv put failed: {e}");
                Some(response_error(&e))
            }
        };
        Ok(Response::new(PutValueResponse { error }))
    }
}
