//! Per-process session record stamped on every outgoing request

use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::ENV_INVOCATION_ID;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub invocation_id: String,
    pub app_id: String,
    pub build_id: String,
    pub step_id: String,
}

impl SessionState {
    pub fn new(
        invocation_id: impl Into<String>,
        app_id: impl Into<String>,
        build_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            app_id: app_id.into(),
            build_id: build_id.into(),
            step_id: step_id.into(),
        }
    }

    /// Initial session: `INVOCATION_ID` if exported, else a fresh UUID.
    pub fn from_env() -> Self {
        let invocation_id = std::env::var(ENV_INVOCATION_ID)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            invocation_id,
            ..Default::default()
        }
    }
}

/// Shared, mutex-guarded handle to the active session.
///
/// Readers always take a full snapshot under the lock, so a request sees
/// either the old or the new session in its entirety.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionState>>,
}

impl Session {
    pub fn new(state: SessionState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        // The guarded value is plain data, a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SessionState {
        self.lock().clone()
    }

    /// Replace all four fields at once, returning the previous session.
    pub fn replace(&self, state: SessionState) -> SessionState {
        std::mem::replace(&mut *self.lock(), state)
    }
}
