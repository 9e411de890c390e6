//! Remote key/value cache client
//!
//! One [`KvClient`] owns one channel to the remote and every stub built on
//! it. Stubs are cloned per call, so a client can be shared freely between
//! tasks (wrap it in an `Arc`).

use std::{future::Future, time::Duration};

use tonic::{metadata::MetadataMap, transport::Channel, Status};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    build::bazel::remote::execution::v2::{
        capabilities_client::CapabilitiesClient,
        content_addressable_storage_client::ContentAddressableStorageClient,
        GetCapabilitiesRequest,
    },
    bytestream::resource_name,
    config::ClientConfig,
    error::{KvError, Result},
    google::bytestream::{
        byte_stream_client::ByteStreamClient, QueryWriteStatusRequest, QueryWriteStatusResponse,
        ReadRequest,
    },
    kv_storage::kv_storage_client::KvStorageClient,
    retry::retry,
    session::{Session, SessionState},
    transport::{self, build_request, request_metadata, WriteHeaders},
};

mod download;
mod find_missing;
mod upload;

pub use download::DownloadOutcome;
pub(crate) use download::prepare_target;
pub use find_missing::{chunk_digests, MAX_REQUEST_SIZE};
pub use upload::upload_timeout;

pub const CAPABILITIES_TIMEOUT: Duration = Duration::from_secs(5);
pub const FIND_MISSING_TIMEOUT: Duration = Duration::from_secs(20);
pub const DELETE_TIMEOUT: Duration = Duration::from_secs(10);
pub const QUERY_WRITE_STATUS_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct KvClient {
    config: ClientConfig,
    session: Session,
    bytestream: ByteStreamClient<Channel>,
    cas: ContentAddressableStorageClient<Channel>,
    capabilities: CapabilitiesClient<Channel>,
    kv: KvStorageClient<Channel>,
}

/// Await `fut` for at most `deadline`, folding the outcome into [`KvError`].
pub(crate) async fn with_deadline<T>(
    deadline: Duration,
    fut: impl Future<Output = Result<T, Status>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result.map_err(KvError::from),
        Err(_) => Err(KvError::Timeout(deadline)),
    }
}

impl KvClient {
    /// Dial the configured endpoint and build a client on it.
    pub async fn connect(config: ClientConfig, session: SessionState) -> Result<Self> {
        let channel = transport::connect(&config.endpoint).await?;
        info!(endpoint = %config.endpoint, client = %config.client_name, "connected to remote cache");
        Ok(Self::with_channel(channel, config, session))
    }

    /// Build a client on an existing channel.
    pub fn with_channel(channel: Channel, config: ClientConfig, session: SessionState) -> Self {
        Self {
            config,
            session: Session::new(session),
            bytestream: ByteStreamClient::new(channel.clone()),
            cas: ContentAddressableStorageClient::new(channel.clone()),
            capabilities: CapabilitiesClient::new(channel.clone()),
            kv: KvStorageClient::new(channel),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn session(&self) -> SessionState {
        self.session.snapshot()
    }

    /// Atomically replace the session stamped on subsequent requests.
    pub fn change_session(&self, state: SessionState) {
        debug!(
            invocation_id = %state.invocation_id,
            app_id = %state.app_id,
            build_id = %state.build_id,
            step_id = %state.step_id,
            "session changed"
        );
        self.session.replace(state);
    }

    /// A client on the same channel with its own session, unaffected by
    /// later `change_session` calls on `self`.
    pub fn with_session(&self, state: SessionState) -> Self {
        Self {
            session: Session::new(state),
            ..self.clone()
        }
    }

    fn metadata(&self, operation_id: &str, write: Option<&WriteHeaders>) -> MetadataMap {
        request_metadata(&self.config, &self.session.snapshot(), operation_id, write)
    }

    fn new_operation_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Ask the remote for its capabilities. The answer is discarded; this exists to validate
    /// connectivity and credentials early.
    pub async fn get_capabilities(&self) -> Result<()> {
        let operation_id = Self::new_operation_id();
        let operation_id = operation_id.as_str();
        retry(&self.config.capabilities_policy, "get capabilities", |_| {
            let mut client = self.capabilities.clone();
            let request = build_request(
                GetCapabilitiesRequest {
                    instance_name: String::new(),
                },
                self.metadata(operation_id, None),
                Some(CAPABILITIES_TIMEOUT),
            );
            async move {
                with_deadline(CAPABILITIES_TIMEOUT, client.get_capabilities(request)).await?;
                Ok(())
            }
        })
        .await
    }

    pub async fn query_write_status(&self, key: &str) -> Result<QueryWriteStatusResponse> {
        self.query_write_status_with(key, &Self::new_operation_id())
            .await
    }

    async fn query_write_status_with(
        &self,
        key: &str,
        operation_id: &str,
    ) -> Result<QueryWriteStatusResponse> {
        let mut client = self.bytestream.clone();
        let request = build_request(
            QueryWriteStatusRequest {
                resource_name: resource_name(key),
            },
            self.metadata(operation_id, None),
            Some(QUERY_WRITE_STATUS_TIMEOUT),
        );
        let response = with_deadline(QUERY_WRITE_STATUS_TIMEOUT, client.query_write_status(request))
            .await?;
        Ok(response.into_inner())
    }

    /// Best-effort removal of `key` from the remote.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.kv.clone();
        let request = build_request(
            ReadRequest {
                resource_name: resource_name(key),
                read_offset: 0,
                read_limit: 0,
            },
            self.metadata(&Self::new_operation_id(), None),
            Some(DELETE_TIMEOUT),
        );
        with_deadline(DELETE_TIMEOUT, client.delete(request)).await?;
        debug!(key, "deleted");
        Ok(())
    }
}
