//! Session control service used by the supervising build wrapper

use std::sync::Arc;

use tonic::{async_trait, Request, Response, Status};
use tracing::info;

use super::ProxyState;
use crate::{
    session::SessionState,
    xcelerate::session::v1::{
        session_server::Session, GetSessionStatsRequest, GetSessionStatsResponse,
        SetSessionRequest, SetSessionResponse,
    },
};

pub(crate) struct SessionService {
    state: Arc<ProxyState>,
}

impl SessionService {
    pub(crate) fn new(state: Arc<ProxyState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Session for SessionService {
    async fn set_session(
        &self,
        request: Request<SetSessionRequest>,
    ) -> Result<Response<SetSessionResponse>, Status> {
        let request = request.into_inner();
        info!(
            invocation_id = %request.invocation_id,
            app = %request.app_slug,
            build = %request.build_slug,
            step = %request.step_slug,
            "new proxy session"
        );
        self.state.reset_session(SessionState::new(
            request.invocation_id,
            request.app_slug,
            request.build_slug,
            request.step_slug,
        ));
        Ok(Response::new(SetSessionResponse {}))
    }

    async fn get_session_stats(
        &self,
        _request: Request<GetSessionStatsRequest>,
    ) -> Result<Response<GetSessionStatsResponse>, Status> {
        let stats = self.state.current().stats.get_stats();
        Ok(Response::new(GetSessionStatsResponse {
            uploaded_bytes: stats.uploaded_bytes,
            downloaded_bytes: stats.downloaded_bytes,
            hits: stats.hits,
            misses: stats.misses,
        }))
    }
}
