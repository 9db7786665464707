use std::env;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use cadence_error::CadenceError;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

const LISTENING_MARKER: &str = "opencode server listening on ";
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const MONITOR_DELAY_MS: u64 = 500;
const ROOT_ENV: &str = "CADENCE_OPENCODE_ROOT";
const BUN_ENV: &str = "BUN";

#[derive(Debug, Clone)]
pub struct OpenCodeServerManagerConfig {
    /// Checkout containing `packages/opencode`.
    pub root: PathBuf,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub startup_timeout: Duration,
}

impl OpenCodeServerManagerConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let program = env::var_os(BUN_ENV)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("bun"));
        Self {
            root: root.into(),
            program,
            args: ["run", "src/index.ts", "serve", "--hostname", "127.0.0.1", "--port", "0"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.root.join("packages").join("opencode")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub base_url: String,
    pub working_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct OpenCodeServerManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: OpenCodeServerManagerConfig,
    ensure_lock: Mutex<()>,
    state: Mutex<ManagerState>,
}

#[derive(Debug, Default)]
struct ManagerState {
    server: Option<RunningServer>,
    start_count: u64,
    shutdown_requested: bool,
    last_error: Option<String>,
}

type SharedChild = Arc<StdMutex<Option<Child>>>;

#[derive(Debug, Clone)]
struct RunningServer {
    info: ServerInfo,
    child: SharedChild,
    instance_id: u64,
}

impl OpenCodeServerManager {
    pub fn new(config: OpenCodeServerManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ensure_lock: Mutex::new(()),
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// Returns the running server, starting one if needed.
    ///
    /// Concurrent callers wait on the same start and all observe its outcome.
    pub async fn ensure_server(&self) -> Result<ServerInfo, CadenceError> {
        let _guard = self.inner.ensure_lock.lock().await;

        if let Some(info) = self.running_info().await {
            return Ok(info);
        }

        let (info, child) = match self.spawn_server().await {
            Ok(started) => started,
            Err(err) => {
                let mut state = self.inner.state.lock().await;
                state.last_error = Some(err.to_string());
                return Err(err);
            }
        };

        let instance_id = {
            let mut state = self.inner.state.lock().await;
            state.shutdown_requested = false;
            state.start_count += 1;
            let instance_id = state.start_count;
            state.server = Some(RunningServer {
                info: info.clone(),
                child: child.clone(),
                instance_id,
            });
            state.last_error = None;
            instance_id
        };

        info!(base_url = %info.base_url, instance_id, "opencode server started");
        self.spawn_monitor_task(instance_id, child);

        Ok(info)
    }

    pub async fn info(&self) -> Option<ServerInfo> {
        self.running_info().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.state.lock().await.last_error.clone()
    }

    pub async fn shutdown(&self) {
        let _guard = self.inner.ensure_lock.lock().await;

        let child = {
            let mut state = self.inner.state.lock().await;
            state.shutdown_requested = true;
            state.server.take().map(|server| server.child)
        };

        if let Some(child) = child {
            kill_child(&child);
            debug!("opencode server stopped");
        }
    }

    async fn running_info(&self) -> Option<ServerInfo> {
        let running = {
            let state = self.inner.state.lock().await;
            state.server.clone()
        }?;

        if child_is_alive(&running.child) {
            return Some(running.info);
        }

        let mut state = self.inner.state.lock().await;
        if state
            .server
            .as_ref()
            .map(|server| server.instance_id == running.instance_id)
            .unwrap_or(false)
        {
            state.server = None;
        }

        None
    }

    async fn spawn_server(&self) -> Result<(ServerInfo, SharedChild), CadenceError> {
        let config = &self.inner.config;
        let working_dir = config.working_dir();

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|err| {
            server_start(format!(
                "failed to spawn `{}` in {}: {err}",
                config.program.display(),
                working_dir.display()
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| server_start("opencode serve stdout was not captured".to_string()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let (address_tx, address_rx) = oneshot::channel();
        tokio::spawn(watch_stdout(stdout, address_tx));
        let child: SharedChild = Arc::new(StdMutex::new(Some(child)));

        let base_url = match timeout(config.startup_timeout, address_rx).await {
            Ok(Ok(base_url)) => base_url,
            Ok(Err(_)) => {
                let exit = describe_exit(&child);
                kill_child(&child);
                return Err(server_start(format!(
                    "opencode serve exited before announcing its address ({exit})"
                )));
            }
            Err(_) => {
                kill_child(&child);
                return Err(server_start(format!(
                    "opencode serve did not announce its address within {}s; check that bun and the opencode dependencies are installed",
                    config.startup_timeout.as_secs_f32()
                )));
            }
        };

        Ok((
            ServerInfo {
                base_url,
                working_dir,
            },
            child,
        ))
    }

    fn spawn_monitor_task(&self, instance_id: u64, child: SharedChild) {
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let status = {
                    let mut guard = match child.lock() {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                    match guard.as_mut() {
                        Some(child) => match child.try_wait() {
                            Ok(status) => status,
                            Err(_) => None,
                        },
                        None => return,
                    }
                };

                if let Some(status) = status {
                    manager.handle_process_exit(instance_id, status).await;
                    return;
                }

                sleep(Duration::from_millis(MONITOR_DELAY_MS)).await;
            }
        });
    }

    async fn handle_process_exit(&self, instance_id: u64, status: ExitStatus) {
        let mut state = self.inner.state.lock().await;
        let Some(server) = state.server.as_ref() else {
            return;
        };
        if server.instance_id != instance_id {
            return;
        }

        let message = format!("opencode server exited with {status}");
        state.server = None;
        if !state.shutdown_requested {
            warn!(instance_id, %status, "opencode server exited unexpectedly");
            state.last_error = Some(message);
        }
    }
}

/// Extracts the base URL from the server's startup announcement.
pub fn parse_listening_line(line: &str) -> Option<String> {
    // ASCII lowercasing keeps byte offsets, so the index is valid in `line`.
    let start = line.to_ascii_lowercase().find(LISTENING_MARKER)? + LISTENING_MARKER.len();
    let candidate = line[start..].split_whitespace().next()?;
    if !candidate.to_ascii_lowercase().starts_with("http://") {
        return None;
    }
    Some(candidate.trim_end_matches('/').to_string())
}

/// Locates an opencode checkout: `CADENCE_OPENCODE_ROOT`, then sibling directories
/// of the working directory and of the executable.
pub fn resolve_opencode_root() -> Result<PathBuf, CadenceError> {
    if let Some(root) = env::var_os(ROOT_ENV).filter(|value| !value.is_empty()) {
        let root = PathBuf::from(root);
        if root.exists() {
            return Ok(root);
        }
        warn!(root = %root.display(), "{ROOT_ENV} does not exist; searching sibling directories");
    }

    let mut candidates = Vec::new();
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join("..").join("opencode"));
    }
    if let Some(exe_dir) = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
    {
        candidates.push(exe_dir.join("..").join("opencode"));
        candidates.push(exe_dir.join("..").join("..").join("opencode"));
    }

    find_opencode_root(candidates).ok_or_else(|| {
        server_start(format!(
            "no sibling opencode checkout found; set {ROOT_ENV}"
        ))
    })
}

pub fn find_opencode_root(candidates: impl IntoIterator<Item = PathBuf>) -> Option<PathBuf> {
    candidates.into_iter().find(|candidate| {
        candidate
            .join("packages")
            .join("opencode")
            .join("src")
            .join("index.ts")
            .is_file()
    })
}

async fn watch_stdout<R: AsyncRead + Unpin>(stdout: R, address_tx: oneshot::Sender<String>) {
    let mut lines = BufReader::new(stdout).lines();
    let mut address_tx = Some(address_tx);
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if address_tx.is_some() {
                    if let Some(base_url) = parse_listening_line(&line) {
                        if let Some(address_tx) = address_tx.take() {
                            let _ = address_tx.send(base_url);
                        }
                        continue;
                    }
                }
                debug!(target: "opencode", line = %line, "server stdout");
            }
            Ok(None) => return,
            Err(err) => {
                debug!(error = %err, "failed to read opencode stdout");
                return;
            }
        }
    }
}

async fn forward_stderr<R: AsyncRead + Unpin>(stderr: R) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "opencode", line = %line, "server stderr");
    }
}

fn server_start(message: String) -> CadenceError {
    CadenceError::ServerStart { message }
}

fn describe_exit(child: &SharedChild) -> String {
    let Ok(mut guard) = child.lock() else {
        return "process state unavailable".to_string();
    };
    match guard.as_mut().map(Child::try_wait) {
        Some(Ok(Some(status))) => status.to_string(),
        _ => "stdout closed".to_string(),
    }
}

fn child_is_alive(child: &SharedChild) -> bool {
    let mut guard = match child.lock() {
        Ok(guard) => guard,
        Err(_) => return false,
    };
    let Some(process) = guard.as_mut() else {
        return false;
    };
    match process.try_wait() {
        Ok(Some(_)) => {
            *guard = None;
            false
        }
        Ok(None) => true,
        Err(_) => false,
    }
}

fn kill_child(child: &SharedChild) {
    if let Ok(mut guard) = child.lock() {
        if let Some(process) = guard.as_mut() {
            let _ = process.start_kill();
        }
        *guard = None;
    }
}
