//! In-memory remote cache served over real gRPC for integration tests

#![allow(dead_code)]

use std::{
    cmp::min,
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use flarecache::{
    build::bazel::remote::execution::v2::{
        capabilities_server::{Capabilities, CapabilitiesServer},
        content_addressable_storage_server::{
            ContentAddressableStorage, ContentAddressableStorageServer,
        },
        digest_function, CacheCapabilities, FindMissingBlobsRequest, FindMissingBlobsResponse,
        GetCapabilitiesRequest, ServerCapabilities,
    },
    config::{AuthConfig, ClientConfig, Endpoint, RetryPolicy},
    digest::sha256_hex,
    google::bytestream::{
        byte_stream_server::{ByteStream, ByteStreamServer},
        QueryWriteStatusRequest, QueryWriteStatusResponse, ReadRequest, ReadResponse,
        WriteRequest, WriteResponse,
    },
    kv_storage::kv_storage_server::{KvStorage, KvStorageServer},
    transport::{HEADER_AUTHORIZATION, HEADER_VALIDATION_SHA256},
    KvClient, SessionState,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot},
};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{
    async_trait, metadata::MetadataMap, transport::Server, Code, Request, Response, Status,
    Streaming,
};

pub const TOKEN: &str = "test-token";
const READ_CHUNK: usize = 64 * 1024;

/// Misbehaviour to inject into the next matching calls.
#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Abort the next write with UNAVAILABLE once this many bytes arrived,
    /// keeping them as committed progress.
    pub fail_write_after: Option<usize>,
    /// Reject this many of the next writes with ALREADY_EXISTS.
    pub already_exists: usize,
    /// Announce a wrong checksum on reads.
    pub bogus_validation_header: bool,
    /// Reject every call carrying this bearer token.
    pub rejected_token: Option<String>,
    /// Reject writes, and only writes, as unauthenticated.
    pub unauthenticated_writes: bool,
}

#[derive(Default)]
pub struct RemoteState {
    blobs: HashMap<String, Vec<u8>>,
    partial: HashMap<String, Vec<u8>>,
    calls: HashMap<&'static str, usize>,
    metadata: Vec<(&'static str, MetadataMap)>,
    write_offsets: Vec<(String, i64)>,
    faults: Faults,
}

type Shared = Arc<Mutex<RemoteState>>;

fn lock(state: &Shared) -> MutexGuard<'_, RemoteState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Count the call, keep its metadata and apply the token check.
fn record(state: &Shared, method: &'static str, metadata: &MetadataMap) -> Result<(), Status> {
    let mut state = lock(state);
    *state.calls.entry(method).or_default() += 1;
    state.metadata.push((method, metadata.clone()));
    if let Some(rejected) = &state.faults.rejected_token {
        let presented = metadata
            .get(HEADER_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented == format!("bearer {}", rejected) {
            return Err(Status::unauthenticated("token rejected"));
        }
    }
    Ok(())
}

fn key_of(resource_name: &str) -> Result<String, Status> {
    resource_name
        .strip_prefix("kv/")
        .map(str::to_string)
        .ok_or_else(|| Status::invalid_argument(format!("bad resource '{}'", resource_name)))
}

pub struct FakeRemote {
    pub addr: SocketAddr,
    state: Shared,
    shutdown: Option<oneshot::Sender<()>>,
}

impl FakeRemote {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(RemoteState::default()));
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake remote");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();

        let server = Server::builder()
            .add_service(ByteStreamServer::new(FakeByteStream(Arc::clone(&state))))
            .add_service(ContentAddressableStorageServer::new(FakeCas(Arc::clone(
                &state,
            ))))
            .add_service(CapabilitiesServer::new(FakeCapabilities(Arc::clone(
                &state,
            ))))
            .add_service(KvStorageServer::new(FakeKvStorage(Arc::clone(&state))));
        tokio::spawn(async move {
            server
                .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async {
                    rx.await.ok();
                })
                .await
                .expect("fake remote serve");
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
        }
    }

    pub fn config(&self) -> ClientConfig {
        let endpoint = Endpoint::parse(&format!("grpc://127.0.0.1:{}", self.addr.port()))
            .expect("valid endpoint");
        ClientConfig::new(
            endpoint,
            "flare-test",
            AuthConfig {
                auth_token: TOKEN.into(),
                workspace_id: "ws-test".into(),
            },
        )
        .with_retry_policy(RetryPolicy::constant(3, Duration::from_millis(10)))
    }

    pub async fn client(&self) -> KvClient {
        KvClient::connect(
            self.config(),
            SessionState::new("inv-1", "app-1", "build-1", "step-1"),
        )
        .await
        .expect("connect to fake remote")
    }

    pub fn set_faults(&self, faults: Faults) {
        lock(&self.state).faults = faults;
    }

    pub fn insert(&self, key: &str, data: &[u8]) {
        lock(&self.state).blobs.insert(key.to_string(), data.to_vec());
    }

    pub fn blob(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.state).blobs.get(key).cloned()
    }

    pub fn blob_count(&self) -> usize {
        lock(&self.state).blobs.len()
    }

    pub fn calls(&self, method: &str) -> usize {
        lock(&self.state).calls.get(method).copied().unwrap_or(0)
    }

    /// Metadata of every call to `method`, oldest first.
    pub fn metadata(&self, method: &str) -> Vec<MetadataMap> {
        lock(&self.state)
            .metadata
            .iter()
            .filter(|(m, _)| *m == method)
            .map(|(_, md)| md.clone())
            .collect()
    }

    /// Every call with its metadata, in arrival order.
    pub fn journal(&self) -> Vec<(&'static str, MetadataMap)> {
        lock(&self.state).metadata.clone()
    }

    /// `(key, first write_offset)` of every write call, oldest first.
    pub fn write_offsets(&self) -> Vec<(String, i64)> {
        lock(&self.state).write_offsets.clone()
    }
}

impl Drop for FakeRemote {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

pub fn header(metadata: &MetadataMap, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

struct FakeByteStream(Shared);

#[async_trait]
impl ByteStream for FakeByteStream {
    type ReadStream = ReceiverStream<Result<ReadResponse, Status>>;

    async fn read(
        &self,
        request: Request<ReadRequest>,
    ) -> Result<Response<Self::ReadStream>, Status> {
        record(&self.0, "Read", request.metadata())?;
        let key = key_of(&request.get_ref().resource_name)?;
        let (data, bogus) = {
            let state = lock(&self.0);
            match state.blobs.get(&key) {
                Some(data) => (data.clone(), state.faults.bogus_validation_header),
                None => return Err(Status::new(Code::NotFound, "not found")),
            }
        };
        let announced = if bogus {
            "0".repeat(64)
        } else {
            sha256_hex(&data)
        };

        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let mut pos = 0;
            while pos < data.len() {
                let to_send = min(data.len() - pos, READ_CHUNK);
                let response = ReadResponse {
                    data: data[pos..pos + to_send].to_vec(),
                };
                pos += to_send;
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        let mut response = Response::new(ReceiverStream::new(rx));
        response.metadata_mut().insert(
            HEADER_VALIDATION_SHA256,
            announced.parse().map_err(|_| Status::internal("header"))?,
        );
        Ok(response)
    }

    async fn write(
        &self,
        request: Request<Streaming<WriteRequest>>,
    ) -> Result<Response<WriteResponse>, Status> {
        record(&self.0, "Write", request.metadata())?;
        if lock(&self.0).faults.unauthenticated_writes {
            return Err(Status::unauthenticated("writes not permitted"));
        }
        let declared = request
            .metadata()
            .get(HEADER_VALIDATION_SHA256)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut stream = request.into_inner();
        let first = match stream.message().await? {
            Some(first) => first,
            None => return Err(Status::invalid_argument("no write messages")),
        };
        let key = key_of(&first.resource_name)?;

        let (mut data, fail_after) = {
            let mut state = lock(&self.0);
            state.write_offsets.push((key.clone(), first.write_offset));
            if state.faults.already_exists > 0 {
                state.faults.already_exists -= 1;
                return Err(Status::already_exists("blob exists"));
            }
            let mut data = state.partial.remove(&key).unwrap_or_default();
            if first.write_offset as usize > data.len() {
                return Err(Status::invalid_argument("write offset beyond committed size"));
            }
            data.truncate(first.write_offset as usize);
            (data, state.faults.fail_write_after.take())
        };
        let start = data.len();

        let mut message = Some(first);
        let mut finished = false;
        while let Some(msg) = message {
            if msg.write_offset as usize != data.len() {
                return Err(Status::invalid_argument("non-contiguous write"));
            }
            data.extend_from_slice(&msg.data);
            if let Some(limit) = fail_after {
                if data.len() - start >= limit {
                    data.truncate(start + limit);
                    lock(&self.0).partial.insert(key, data);
                    return Err(Status::unavailable("connection reset"));
                }
            }
            if msg.finish_write {
                finished = true;
                break;
            }
            message = stream.message().await?;
        }

        if !finished {
            let committed = data.len() as i64;
            lock(&self.0).partial.insert(key, data);
            return Err(Status::aborted(format!(
                "stream ended at {} without finish_write",
                committed
            )));
        }
        if let Some(declared) = declared {
            let actual = sha256_hex(&data);
            if declared != actual {
                return Err(Status::invalid_argument(format!(
                    "checksum mismatch: declared {}, got {}",
                    declared, actual
                )));
            }
        }

        let committed_size = data.len() as i64;
        lock(&self.0).blobs.insert(key, data);
        Ok(Response::new(WriteResponse { committed_size }))
    }

    async fn query_write_status(
        &self,
        request: Request<QueryWriteStatusRequest>,
    ) -> Result<Response<QueryWriteStatusResponse>, Status> {
        record(&self.0, "QueryWriteStatus", request.metadata())?;
        let key = key_of(&request.get_ref().resource_name)?;
        let state = lock(&self.0);
        let response = if let Some(data) = state.blobs.get(&key) {
            QueryWriteStatusResponse {
                committed_size: data.len() as i64,
                complete: true,
            }
        } else if let Some(data) = state.partial.get(&key) {
            QueryWriteStatusResponse {
                committed_size: data.len() as i64,
                complete: false,
            }
        } else {
            return Err(Status::not_found("no such upload"));
        };
        Ok(Response::new(response))
    }
}

struct FakeCas(Shared);

#[async_trait]
impl ContentAddressableStorage for FakeCas {
    async fn find_missing_blobs(
        &self,
        request: Request<FindMissingBlobsRequest>,
    ) -> Result<Response<FindMissingBlobsResponse>, Status> {
        record(&self.0, "FindMissingBlobs", request.metadata())?;
        let state = lock(&self.0);
        let missing_blob_digests = request
            .into_inner()
            .blob_digests
            .into_iter()
            .filter(|d| !state.blobs.contains_key(&d.hash))
            .collect();
        Ok(Response::new(FindMissingBlobsResponse {
            missing_blob_digests,
        }))
    }
}

struct FakeCapabilities(Shared);

#[async_trait]
impl Capabilities for FakeCapabilities {
    async fn get_capabilities(
        &self,
        request: Request<GetCapabilitiesRequest>,
    ) -> Result<Response<ServerCapabilities>, Status> {
        record(&self.0, "GetCapabilities", request.metadata())?;
        Ok(Response::new(ServerCapabilities {
            cache_capabilities: Some(CacheCapabilities {
                digest_functions: vec![digest_function::Value::Sha256 as i32],
                max_batch_total_size_bytes: 4193280,
            }),
            low_api_version: None,
            high_api_version: None,
        }))
    }
}

struct FakeKvStorage(Shared);

#[async_trait]
impl KvStorage for FakeKvStorage {
    async fn delete(&self, request: Request<ReadRequest>) -> Result<Response<()>, Status> {
        record(&self.0, "Delete", request.metadata())?;
        let key = key_of(&request.get_ref().resource_name)?;
        lock(&self.0).blobs.remove(&key);
        Ok(Response::new(()))
    }
}
