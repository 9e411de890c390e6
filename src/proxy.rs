//! Local compilation-cache proxy
//!
//! Serves the compiler-facing CAS and KV services plus a small session
//! control service on a Unix-domain socket. Every CAS/KV call turns into
//! exactly one remote operation on the shared [`KvClient`].

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use tokio::{
    fs,
    net::UnixListener,
    signal::unix::{signal, SignalKind},
};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, info, warn};

use crate::{
    client::KvClient,
    compilation_cache_service::{
        cas::v1::casdb_service_server::CasdbServiceServer,
        keyvalue::v1::key_value_db_server::KeyValueDbServer,
    },
    error::{KvError, Result},
    session::SessionState,
    stats::{SessionStats, StatsSnapshot},
    xcelerate::session::v1::session_server::SessionServer,
};

mod cas;
mod gate;
mod kv;
mod session;

use cas::CasService;
use gate::CapabilitiesGate;
use kv::KvService;
use session::SessionService;

pub const ENV_SOCKET_PATH: &str = "BITRISE_XCELERATE_SOCKET_PATH";
const DEFAULT_SOCKET_NAME: &str = "xcelerate-proxy.sock";

/// How long `stop` waits after SIGTERM before sending SIGKILL.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub socket_path: PathBuf,
    pub pid_file: PathBuf,
    /// When false, Put/Save/PutValue succeed without touching the remote.
    pub push_enabled: bool,
    /// Where `write_to_disk` reads land.
    pub scratch_dir: PathBuf,
}

impl ProxyConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let socket_path = socket_path.into();
        let pid_file = socket_path.with_extension("pid");
        let scratch_dir = socket_path.with_extension("blobs");
        Self {
            socket_path,
            pid_file,
            push_enabled: true,
            scratch_dir,
        }
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let socket_path = lookup(ENV_SOCKET_PATH)
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let tmp = lookup("TMPDIR")
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(std::env::temp_dir);
                tmp.join(DEFAULT_SOCKET_NAME)
            });
        Self::new(socket_path)
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn with_push_enabled(mut self, push_enabled: bool) -> Self {
        self.push_enabled = push_enabled;
        self
    }
}

/// Everything tied to one session: the client stamping its requests, its
/// counters and its capabilities check. `SetSession` installs a new one
/// whole, so a request never mixes two sessions.
pub(crate) struct ActiveSession {
    pub(crate) client: KvClient,
    pub(crate) stats: SessionStats,
    gate: CapabilitiesGate,
}

impl ActiveSession {
    fn new(client: KvClient) -> Self {
        Self {
            client,
            stats: SessionStats::new(),
            gate: CapabilitiesGate::new(),
        }
    }
}

/// State shared by the three services.
pub(crate) struct ProxyState {
    client: Arc<KvClient>,
    current: RwLock<Arc<ActiveSession>>,
    push_enabled: bool,
    scratch_dir: PathBuf,
}

impl ProxyState {
    fn new(client: Arc<KvClient>, config: &ProxyConfig) -> Self {
        let active = ActiveSession::new(client.with_session(client.session()));
        Self {
            client,
            current: RwLock::new(Arc::new(active)),
            push_enabled: config.push_enabled,
            scratch_dir: config.scratch_dir.clone(),
        }
    }

    /// The current session. A request keeps using the instance it started
    /// with even if the session changes meanwhile.
    pub(crate) fn current(&self) -> Arc<ActiveSession> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    /// Start a new session: new request metadata, fresh counters and a
    /// pending capabilities check, swapped in as one.
    pub(crate) fn reset_session(&self, state: SessionState) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        self.client.change_session(state.clone());
        *current = Arc::new(ActiveSession::new(self.client.with_session(state)));
    }

    /// The current session, after its capabilities check has passed.
    pub(crate) async fn begin(&self) -> std::result::Result<Arc<ActiveSession>, tonic::Status> {
        let session = self.current();
        session.gate.check(&session.client).await?;
        Ok(session)
    }
}

/// A proxy bound to one client, ready to serve on a listener.
pub struct Proxy {
    state: Arc<ProxyState>,
}

impl Proxy {
    pub fn new(client: Arc<KvClient>, config: &ProxyConfig) -> Self {
        Self {
            state: Arc::new(ProxyState::new(client, config)),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.state.current().stats.get_stats()
    }

    /// Serve on `listener` until `shutdown` resolves.
    pub async fn serve_on(
        &self,
        listener: UnixListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<()> {
        let scratch_dir = &self.state.scratch_dir;
        remove_dir_if_exists(scratch_dir).await?;
        fs::create_dir_all(scratch_dir).await?;
        let served = Server::builder()
            .add_service(CasdbServiceServer::new(CasService::new(Arc::clone(
                &self.state,
            ))))
            .add_service(KeyValueDbServer::new(KvService::new(Arc::clone(
                &self.state,
            ))))
            .add_service(SessionServer::new(SessionService::new(Arc::clone(
                &self.state,
            ))))
            .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
            .await;
        if let Err(e) = remove_dir_if_exists(scratch_dir).await {
            warn!(dir = %scratch_dir.display(), "cannot clear scratch directory: {e}");
        }
        served?;
        Ok(())
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = terminate.recv() => info!("received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
    }
}

/// Run the proxy until SIGTERM or SIGINT, owning the socket and PID file
/// for the duration.
pub async fn serve(config: ProxyConfig, client: Arc<KvClient>) -> Result<()> {
    if let Some(parent) = config.socket_path.parent() {
        fs::create_dir_all(parent).await?;
    }
    remove_if_exists(&config.socket_path).await?;
    let listener = UnixListener::bind(&config.socket_path)?;
    fs::write(&config.pid_file, std::process::id().to_string()).await?;
    info!(
        socket = %config.socket_path.display(),
        pid_file = %config.pid_file.display(),
        push_enabled = config.push_enabled,
        "proxy listening"
    );

    let proxy = Proxy::new(client, &config);
    let result = proxy.serve_on(listener, shutdown_signal()).await;

    let stats = proxy.stats();
    info!(
        hits = stats.hits,
        misses = stats.misses,
        uploaded_bytes = stats.uploaded_bytes,
        downloaded_bytes = stats.downloaded_bytes,
        "proxy stopped"
    );
    remove_if_exists(&config.socket_path).await?;
    remove_if_exists(&config.pid_file).await?;
    result
}

fn signal_group(pid: Pid, sig: Signal) -> std::result::Result<(), Errno> {
    match killpg(pid, sig) {
        // Not a group leader; fall back to the process itself.
        Err(Errno::ESRCH) => kill(pid, sig),
        other => other,
    }
}

/// Stop the proxy recorded in `pid_file`.
///
/// Returns `false` when no proxy was running.
pub async fn stop(pid_file: &Path) -> Result<bool> {
    let raw = match fs::read_to_string(pid_file).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    let pid: i32 = raw
        .trim()
        .parse()
        .map_err(|_| KvError::Config(format!("bad PID file {}", pid_file.display())))?;
    let pid = Pid::from_raw(pid);

    match signal_group(pid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(Errno::ESRCH) => {
            debug!(%pid, "proxy already gone");
            remove_if_exists(pid_file).await?;
            return Ok(false);
        }
        Err(e) => return Err(std::io::Error::from(e).into()),
    }

    let deadline = tokio::time::Instant::now() + STOP_GRACE;
    while tokio::time::Instant::now() < deadline {
        if kill(pid, None) == Err(Errno::ESRCH) {
            info!(%pid, "proxy stopped");
            remove_if_exists(pid_file).await?;
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    warn!(%pid, "proxy ignored SIGTERM, killing");
    match signal_group(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(std::io::Error::from(e).into()),
    }
    remove_if_exists(pid_file).await?;
    Ok(true)
}
