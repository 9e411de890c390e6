//! One capabilities check per session

use tokio::sync::OnceCell;
use tonic::{Code, Status};
use tracing::{debug, warn};

use crate::{client::KvClient, error::KvError};

type Outcome = Result<(), (Code, String)>;

/// Holds the outcome of one session's capabilities check.
///
/// Concurrent first callers all wait on the same cell, so exactly one check
/// runs and everyone sees its outcome. Failures are cached too; a new
/// session comes with a new gate.
#[derive(Default)]
pub(crate) struct CapabilitiesGate {
    cell: OnceCell<Outcome>,
}

impl CapabilitiesGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.cell.initialized()
    }

    pub(crate) async fn check(&self, client: &KvClient) -> Result<(), Status> {
        let outcome = self
            .cell
            .get_or_init(|| async {
                debug!("checking remote capabilities for session");
                match client.get_capabilities().await {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        warn!("capabilities check failed: {e}");
                        let code = match e {
                            KvError::CacheUnauthenticated(_) => Code::Unauthenticated,
                            _ => Code::Unavailable,
                        };
                        Err((code, e.to_string()))
                    }
                }
            })
            .await;
        outcome
            .clone()
            .map_err(|(code, message)| Status::new(code, message))
    }
}
