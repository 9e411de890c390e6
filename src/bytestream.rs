//! ByteStream reader/writer adapters
//!
//! A [`BlobWriter`] turns a sequence of chunks into one `ByteStream.Write`
//! call and a [`BlobReader`] drains one `ByteStream.Read` call. Both are
//! traits so callers can be driven by something other than a live channel.

use std::{cmp::min, collections::HashMap, time::Duration};

use bytes::BytesMut;
use tokio::{
    sync::mpsc::{self, Sender},
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{
    async_trait,
    metadata::{KeyAndValueRef, MetadataMap},
    transport::Channel,
    Status, Streaming,
};
use tracing::{debug, trace};

use crate::{
    error::{KvError, Result},
    google::bytestream::{
        byte_stream_client::ByteStreamClient, ReadRequest, ReadResponse, WriteRequest,
        WriteResponse,
    },
    transport::build_request,
};

/// Largest data payload placed in a single `WriteRequest`.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// How long a read may go without receiving a message.
pub const READ_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Resource name used on the wire for a cache key.
pub fn resource_name(key: &str) -> String {
    format!("kv/{}", key)
}

#[async_trait]
pub trait BlobWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Half-close the stream and wait for the commit response.
    async fn close(&mut self) -> Result<WriteResponse>;

    fn response(&self) -> Option<&WriteResponse>;
}

#[async_trait]
pub trait BlobReader: Send {
    /// Read into `buf`, returning 0 at end of stream.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Response headers.
    fn metadata(&self) -> HashMap<String, String>;

    /// Trailing metadata, populated once the stream has ended.
    fn trailers(&self) -> HashMap<String, String>;
}

fn metadata_to_map(metadata: &MetadataMap) -> HashMap<String, String> {
    metadata
        .iter()
        .filter_map(|entry| match entry {
            KeyAndValueRef::Ascii(key, value) => value
                .to_str()
                .ok()
                .map(|v| (key.as_str().to_string(), v.to_string())),
            KeyAndValueRef::Binary(..) => None,
        })
        .collect()
}

pub struct ByteStreamWriter {
    resource_name: String,
    offset: i64,
    file_size: i64,
    finished: bool,
    writer: Option<Sender<WriteRequest>>,
    writer_task: Option<JoinHandle<Result<WriteResponse, Status>>>,
    response: Option<WriteResponse>,
}

impl ByteStreamWriter {
    /// Start a write of `file_size` total bytes, resuming at `offset`.
    pub fn open(
        client: &ByteStreamClient<Channel>,
        metadata: MetadataMap,
        key: &str,
        offset: i64,
        file_size: i64,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<WriteRequest>(4);
        let mut client = client.clone();
        let request = build_request(ReceiverStream::new(rx), metadata, Some(timeout));
        let writer_task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, client.write(request)).await {
                Ok(response) => response.map(|r| r.into_inner()),
                Err(_) => Err(Status::deadline_exceeded(format!(
                    "write did not complete within {:?}",
                    timeout
                ))),
            }
        });
        Self {
            resource_name: resource_name(key),
            offset,
            file_size,
            finished: false,
            writer: Some(tx),
            writer_task: Some(writer_task),
            response: None,
        }
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    async fn join(&mut self) -> Result<WriteResponse> {
        drop(self.writer.take());
        match self.writer_task.take() {
            Some(task) => task
                .await
                .map_err(|e| KvError::Rpc(Status::internal(format!("writer task: {}", e))))?
                .map_err(KvError::from),
            None => self
                .response
                .clone()
                .ok_or_else(|| KvError::Rpc(Status::failed_precondition("writer already closed"))),
        }
    }

    async fn send(&mut self, request: WriteRequest) -> Result<()> {
        let sent = match self.writer.as_ref() {
            Some(writer) => writer.send(request).await.is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The call ended before we finished; find out why.
        let response = self.join().await?;
        if response.committed_size == self.file_size {
            debug!(resource = %self.resource_name, "server committed the blob early");
            self.finished = true;
            self.response = Some(response);
            Ok(())
        } else {
            Err(KvError::ShortWrite {
                committed: response.committed_size,
                expected: self.file_size,
            })
        }
    }
}

#[async_trait]
impl BlobWriter for ByteStreamWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.response.is_some() {
            return Ok(());
        }
        for piece in chunk.chunks(CHUNK_SIZE) {
            let finish_write = self.offset + piece.len() as i64 == self.file_size;
            let request = WriteRequest {
                resource_name: self.resource_name.clone(),
                write_offset: self.offset,
                finish_write,
                data: piece.to_vec(),
            };
            trace!(offset = self.offset, len = piece.len(), finish_write, "write chunk");
            self.send(request).await?;
            if self.response.is_some() {
                return Ok(());
            }
            self.offset += piece.len() as i64;
            self.finished = finish_write;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<WriteResponse> {
        if let Some(response) = self.response.clone() {
            return Ok(response);
        }
        if self.offset != self.file_size {
            drop(self.writer.take());
            if let Some(task) = self.writer_task.take() {
                task.abort();
            }
            return Err(KvError::ShortWrite {
                committed: self.offset,
                expected: self.file_size,
            });
        }
        if !self.finished {
            // Nothing carried the finish flag yet, e.g. an empty blob.
            let request = WriteRequest {
                resource_name: self.resource_name.clone(),
                write_offset: self.offset,
                finish_write: true,
                data: Vec::new(),
            };
            self.send(request).await?;
            self.finished = true;
            if let Some(response) = self.response.clone() {
                return Ok(response);
            }
        }
        let response = self.join().await?;
        if response.committed_size != self.offset {
            return Err(KvError::ShortWrite {
                committed: response.committed_size,
                expected: self.offset,
            });
        }
        self.response = Some(response.clone());
        Ok(response)
    }

    fn response(&self) -> Option<&WriteResponse> {
        self.response.as_ref()
    }
}

impl Drop for ByteStreamWriter {
    fn drop(&mut self) {
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

pub struct ByteStreamReader {
    stream: Streaming<ReadResponse>,
    buffer: BytesMut,
    metadata: HashMap<String, String>,
    trailers: HashMap<String, String>,
    done: bool,
}

impl ByteStreamReader {
    pub async fn open(
        client: &ByteStreamClient<Channel>,
        metadata: MetadataMap,
        key: &str,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let request = ReadRequest {
            resource_name: resource_name(key),
            read_offset: 0,
            read_limit: 0,
        };
        let mut client = client.clone();
        let response = match tokio::time::timeout(
            READ_IDLE_TIMEOUT,
            client.read(build_request(request, metadata, timeout)),
        )
        .await
        {
            Ok(response) => response?,
            Err(_) => return Err(KvError::Timeout(READ_IDLE_TIMEOUT)),
        };
        let metadata = metadata_to_map(response.metadata());
        Ok(Self {
            stream: response.into_inner(),
            buffer: BytesMut::new(),
            metadata,
            trailers: HashMap::new(),
            done: false,
        })
    }

    async fn read_trailers(&mut self) {
        if let Ok(Some(trailers)) = self.stream.trailers().await {
            self.trailers = metadata_to_map(&trailers);
        }
    }
}

#[async_trait]
impl BlobReader for ByteStreamReader {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.buffer.is_empty() && !self.done {
            let message = match tokio::time::timeout(READ_IDLE_TIMEOUT, self.stream.message()).await
            {
                Ok(message) => message,
                Err(_) => return Err(KvError::Timeout(READ_IDLE_TIMEOUT)),
            };
            match message {
                Ok(Some(response)) => self.buffer.extend_from_slice(&response.data),
                Ok(None) => {
                    self.done = true;
                    self.read_trailers().await;
                }
                Err(status) => {
                    self.done = true;
                    self.read_trailers().await;
                    return Err(KvError::from(status));
                }
            }
        }
        let n = min(buf.len(), self.buffer.len());
        let chunk = self.buffer.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.metadata.clone()
    }

    fn trailers(&self) -> HashMap<String, String> {
        self.trailers.clone()
    }
}
