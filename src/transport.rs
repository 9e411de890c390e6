//! gRPC channel setup and per-call metadata

use std::time::Duration;

use prost::Message;
use tonic::{
    metadata::{MetadataMap, MetadataValue},
    transport::{Channel, ClientTlsConfig},
    Request,
};
use tracing::{debug, warn};

use crate::{
    build::bazel::remote::execution::v2::{RequestMetadata, ToolDetails},
    config::{ClientConfig, Endpoint},
    error::Result,
    session::SessionState,
};

pub const HEADER_AUTHORIZATION: &str = "authorization";
pub const HEADER_BUILD_TOOL: &str = "x-flare-buildtool";
pub const HEADER_OPERATION_ID: &str = "x-cache-operation-id";
pub const HEADER_ORG_ID: &str = "x-org-id";
pub const HEADER_APP_ID: &str = "x-app-id";
pub const HEADER_BUILD_ID: &str = "x-flare-build-id";
pub const HEADER_WORKFLOW_NAME: &str = "x-workflow-name";
pub const HEADER_STEP_ID: &str = "x-flare-step-id";
pub const HEADER_REPOSITORY_URL: &str = "x-repository-url";
pub const HEADER_CI_PROVIDER: &str = "x-ci-provider";
pub const HEADER_VALIDATION_LEVEL: &str = "x-flare-blob-validation-level";
pub const HEADER_AC_VALIDATION_MODE: &str = "x-flare-ac-validation-mode";
pub const HEADER_VALIDATION_SHA256: &str = "x-flare-blob-validation-sha256";
pub const HEADER_NO_SKIP_DUPLICATE_WRITES: &str = "x-flare-no-skip-duplicate-writes";
pub const HEADER_DELETE_ON_REWRITE: &str = "x-flare-delete-on-rewrite";
pub const HEADER_REQUEST_METADATA: &str = "build.bazel.remote.execution.v2.requestmetadata-bin";

/// Open the single channel a client instance uses for its whole life.
pub async fn connect(endpoint: &Endpoint) -> Result<Channel> {
    let mut builder = tonic::transport::Endpoint::from_shared(endpoint.uri())?
        .connect_timeout(Duration::from_secs(10))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_while_idle(true);
    if endpoint.tls {
        builder = builder.tls_config(
            ClientTlsConfig::new()
                .with_native_roots()
                .domain_name(endpoint.host.clone()),
        )?;
    }
    debug!(%endpoint, "connecting to remote cache");
    Ok(builder.connect().await?)
}

/// Extra headers attached to a write that declares its checksum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteHeaders {
    pub sha256: String,
    pub delete_on_rewrite: bool,
}

fn insert(metadata: &mut MetadataMap, key: &'static str, value: &str) {
    if value.is_empty() {
        return;
    }
    match MetadataValue::try_from(value) {
        Ok(value) => {
            metadata.insert(key, value);
        }
        Err(_) => warn!(key, "dropping header with non-ASCII value"),
    }
}

/// Build the metadata for one outgoing call.
///
/// Session fields win over the static config fields when both are set.
pub fn request_metadata(
    config: &ClientConfig,
    session: &SessionState,
    operation_id: &str,
    write: Option<&WriteHeaders>,
) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    insert(
        &mut metadata,
        HEADER_AUTHORIZATION,
        &format!("bearer {}", config.auth.auth_token),
    );
    insert(&mut metadata, HEADER_BUILD_TOOL, &config.client_name);
    insert(&mut metadata, HEADER_OPERATION_ID, operation_id);
    insert(&mut metadata, HEADER_ORG_ID, &config.auth.workspace_id);

    let pick = |session_value: &str, config_value: &str| -> String {
        if session_value.is_empty() {
            config_value.to_string()
        } else {
            session_value.to_string()
        }
    };
    insert(
        &mut metadata,
        HEADER_APP_ID,
        &pick(&session.app_id, &config.metadata.app_id),
    );
    insert(
        &mut metadata,
        HEADER_BUILD_ID,
        &pick(&session.build_id, &config.metadata.build_id),
    );
    insert(
        &mut metadata,
        HEADER_STEP_ID,
        &pick(&session.step_id, &config.metadata.step_id),
    );
    insert(
        &mut metadata,
        HEADER_WORKFLOW_NAME,
        &config.metadata.workflow_name,
    );
    insert(
        &mut metadata,
        HEADER_REPOSITORY_URL,
        &config.metadata.repository_url,
    );
    insert(&mut metadata, HEADER_CI_PROVIDER, &config.metadata.ci_provider);
    insert(&mut metadata, HEADER_AC_VALIDATION_MODE, "fast");

    match write {
        Some(write) => {
            insert(&mut metadata, HEADER_VALIDATION_LEVEL, "error");
            insert(&mut metadata, HEADER_VALIDATION_SHA256, &write.sha256);
            insert(&mut metadata, HEADER_NO_SKIP_DUPLICATE_WRITES, "true");
            if write.delete_on_rewrite {
                insert(&mut metadata, HEADER_DELETE_ON_REWRITE, "true");
            }
        }
        None => insert(&mut metadata, HEADER_VALIDATION_LEVEL, "WARN"),
    }

    let request_metadata = RequestMetadata {
        tool_details: Some(ToolDetails {
            tool_name: config.client_name.clone(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
        }),
        tool_invocation_id: session.invocation_id.clone(),
        ..Default::default()
    };
    metadata.insert_bin(
        HEADER_REQUEST_METADATA,
        MetadataValue::from_bytes(&request_metadata.encode_to_vec()),
    );

    metadata
}

/// Wrap a message with metadata and a server-side deadline.
pub fn build_request<T>(message: T, metadata: MetadataMap, timeout: Option<Duration>) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = metadata;
    if let Some(timeout) = timeout {
        request.set_timeout(timeout);
    }
    request
}
