//! Client configuration
//!
//! Everything the wire client consumes is packaged here up front; nothing
//! below this module reads the process environment.

use std::{fmt, time::Duration};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{KvError, Result};

pub const ENV_AUTH_TOKEN: &str = "BITRISE_BUILD_CACHE_AUTH_TOKEN";
pub const ENV_SERVICES_ACCESS_TOKEN: &str = "BITRISEIO_BITRISE_SERVICES_ACCESS_TOKEN";
pub const ENV_WORKSPACE_ID: &str = "BITRISE_BUILD_CACHE_WORKSPACE_ID";
pub const ENV_ENDPOINT: &str = "BITRISE_BUILD_CACHE_ENDPOINT";
pub const ENV_DATACENTER: &str = "BITRISE_DEN_VM_DATACENTER";
pub const ENV_INVOCATION_ID: &str = "INVOCATION_ID";

const DEFAULT_ENDPOINT: &str = "grpcs://remote-build-cache.services.bitrise.io:443";

lazy_static! {
    static ref ENDPOINT_PARTS: Regex =
        Regex::new("^(grpcs?)://([A-Za-z0-9.\\-]+|\\[[0-9A-Fa-f:]+\\]):([0-9]{1,5})/?$").unwrap();
}

/// A parsed `grpc[s]://host:port` target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub tls: bool,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let parts = ENDPOINT_PARTS
            .captures(raw.trim())
            .ok_or_else(|| KvError::InvalidEndpoint(raw.to_string()))?;
        let tls = &parts[1] == "grpcs";
        let host = parts[2].to_string();
        let port = parts[3]
            .parse()
            .map_err(|_| KvError::InvalidEndpoint(raw.to_string()))?;
        Ok(Self { tls, host, port })
    }

    /// The endpoint from `BITRISE_BUILD_CACHE_ENDPOINT`, or the datacenter
    /// default when unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(endpoint) = non_empty(lookup(ENV_ENDPOINT)) {
            return Self::parse(&endpoint);
        }
        match non_empty(lookup(ENV_DATACENTER)) {
            Some(dc) => Self::parse(&format!(
                "grpcs://{}.remote-build-cache.services.bitrise.io:443",
                dc.to_lowercase()
            )),
            None => Self::parse(DEFAULT_ENDPOINT),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }

    /// URI handed to the HTTP/2 transport.
    pub fn uri(&self) -> String {
        format!(
            "{}://{}:{}",
            if self.tls { "https" } else { "http" },
            self.host,
            self.port
        )
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}://{}:{}",
            if self.tls { "grpcs" } else { "grpc" },
            self.host,
            self.port
        )
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthConfig {
    pub auth_token: String,
    pub workspace_id: String,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("auth_token", &"<redacted>")
            .field("workspace_id", &self.workspace_id)
            .finish()
    }
}

impl AuthConfig {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let auth_token = non_empty(lookup(ENV_AUTH_TOKEN))
            .or_else(|| non_empty(lookup(ENV_SERVICES_ACCESS_TOKEN)))
            .ok_or_else(|| {
                KvError::Config(format!(
                    "neither {} nor {} is set",
                    ENV_AUTH_TOKEN, ENV_SERVICES_ACCESS_TOKEN
                ))
            })?;
        Ok(Self {
            auth_token,
            workspace_id: non_empty(lookup(ENV_WORKSPACE_ID)).unwrap_or_default(),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(env_lookup)
    }
}

/// CI and repository fields stamped on every request when non-empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheMetadata {
    pub ci_provider: String,
    pub repository_url: String,
    pub workflow_name: String,
    pub app_id: String,
    pub build_id: String,
    pub step_id: String,
}

impl CacheMetadata {
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let ci_provider = if non_empty(lookup("BITRISE_IO")).is_some() {
            "bitrise".to_string()
        } else {
            String::new()
        };
        Self {
            ci_provider,
            repository_url: non_empty(lookup("GIT_REPOSITORY_URL")).unwrap_or_default(),
            workflow_name: non_empty(lookup("BITRISE_TRIGGERED_WORKFLOW_TITLE"))
                .unwrap_or_default(),
            app_id: non_empty(lookup("BITRISE_APP_SLUG")).unwrap_or_default(),
            build_id: non_empty(lookup("BITRISE_BUILD_SLUG")).unwrap_or_default(),
            step_id: non_empty(lookup("BITRISE_STEP_EXECUTION_ID")).unwrap_or_default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Wait the same amount between every attempt.
    Constant,
    /// Wait `wait * attempt` before the next attempt.
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn constant(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            wait,
            backoff: Backoff::Constant,
        }
    }

    pub const fn linear(max_attempts: u32, wait: Duration) -> Self {
        Self {
            max_attempts,
            wait,
            backoff: Backoff::Linear,
        }
    }

    pub const fn transfer() -> Self {
        Self::constant(3, Duration::from_secs(1))
    }

    pub const fn find_missing() -> Self {
        Self::constant(3, Duration::from_secs(3))
    }

    pub const fn capabilities() -> Self {
        Self::linear(10, Duration::from_secs(3))
    }

    /// Delay before attempt number `attempt` (zero based, so the first
    /// retry is attempt 1).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.wait,
            Backoff::Linear => self.wait * attempt.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Reported as `x-flare-buildtool` and in the REv2 tool details.
    pub client_name: String,
    pub auth: AuthConfig,
    pub metadata: CacheMetadata,
    pub upload_policy: RetryPolicy,
    pub download_policy: RetryPolicy,
    pub find_missing_policy: RetryPolicy,
    pub capabilities_policy: RetryPolicy,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint, client_name: impl Into<String>, auth: AuthConfig) -> Self {
        Self {
            endpoint,
            client_name: client_name.into(),
            auth,
            metadata: CacheMetadata::default(),
            upload_policy: RetryPolicy::transfer(),
            download_policy: RetryPolicy::transfer(),
            find_missing_policy: RetryPolicy::find_missing(),
            capabilities_policy: RetryPolicy::capabilities(),
        }
    }

    pub fn from_env(client_name: impl Into<String>) -> Result<Self> {
        let mut config = Self::new(Endpoint::from_env()?, client_name, AuthConfig::from_env()?);
        config.metadata = CacheMetadata::from_env();
        Ok(config)
    }

    pub fn with_metadata(mut self, metadata: CacheMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Use one policy for every operation; mostly useful in tests.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.upload_policy = policy;
        self.download_policy = policy;
        self.find_missing_policy = policy;
        self.capabilities_policy = policy;
        self
    }
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
