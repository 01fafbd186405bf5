use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use capa_shared::error::CommonError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, warn};

/// Mirrors the supervisor's state machine: `starting -> running -> (stopped | crashed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

/// Spawn parameters for one subprocess MCP server, stripped down from
/// [`capa_shared::types::McpServerTransport::Subprocess`] plus the project's working
/// directory, so the supervisor can re-spawn without holding onto the whole `Capabilities`.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub cmd: String,
    pub args: Vec<String>,
    pub env: std::collections::HashMap<String, String>,
    pub cwd: std::path::PathBuf,
}

/// Bounded restart bookkeeping: sliding 60s window, cap of 3, backoff 1s/2s/4s.
#[derive(Debug, Default)]
struct RestartState {
    count: u32,
    last_restart: Option<Instant>,
}

const RESTART_WINDOW: Duration = Duration::from_secs(60);
const RESTART_CAP: u32 = 3;
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct StdioHandles {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// One supervised subprocess, keyed by `config_hash` at the [`crate::Supervisor`] level.
/// Owns a background task driving spawn/wait/restart; callers observe state through
/// `status_rx` and claim the piped stdin/stdout once via [`ManagedProcess::take_stdio`].
pub struct ManagedProcess {
    pub server_id: String,
    pub config_hash: String,
    status_tx: watch::Sender<ProcessStatus>,
    status_rx: watch::Receiver<ProcessStatus>,
    stdio: Arc<AsyncMutex<Option<StdioHandles>>>,
    pid: Arc<AsyncMutex<Option<u32>>>,
    stop_requested: Arc<std::sync::atomic::AtomicBool>,
    task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ManagedProcess {
    pub fn spawn(server_id: String, config_hash: String, spec: SpawnSpec) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(ProcessStatus::Starting);
        let stdio = Arc::new(AsyncMutex::new(None));
        let pid = Arc::new(AsyncMutex::new(None));
        let stop_requested = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let task = tokio::spawn(run_supervised(
                server_id.clone(),
                spec,
                status_tx.clone(),
                stdio.clone(),
                pid.clone(),
                stop_requested.clone(),
        ));

        Arc::new(Self {
                server_id,
                config_hash,
                status_tx,
                status_rx,
                stdio,
                pid,
                stop_requested,
                task: std::sync::Mutex::new(Some(task)),
        })
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status_rx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ProcessStatus> {
        self.status_rx.clone()
    }

    pub async fn pid(&self) -> Option<u32> {
        *self.pid.lock().await
    }

    /// Hands the current generation's piped stdin/stdout to the caller. Returns `None`
    /// once already taken for this generation, or if the process isn't running yet.
    pub async fn take_stdio(&self) -> Option<StdioHandles> {
        self.stdio.lock().await.take()
    }

    /// `SIGTERM`, escalating to `SIGKILL` after 5s.
    pub async fn stop(&self) -> Result<(), CommonError> {
        self.stop_requested
            .store(true, std::sync::atomic::Ordering::SeqCst);

        if let Some(pid) = self.pid().await {
            let nix_pid = Pid::from_raw(pid as i32);
            let _ = signal::kill(nix_pid, Signal::SIGTERM);

            let deadline = Instant::now() + STOP_GRACE;
            loop {
                if self.status() != ProcessStatus::Running {
                    break;
                }
                if Instant::now() >= deadline {
                    let _ = signal::kill(nix_pid, Signal::SIGKILL);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        if let Some(task) = self.task.lock().expect("supervisor task lock poisoned").take() {
            task.abort();
        }
        let _ = self.status_tx.send(ProcessStatus::Stopped);
        Ok(())
    }
}

async fn run_supervised(
    server_id: String,
    spec: SpawnSpec,
    status_tx: watch::Sender<ProcessStatus>,
    stdio: Arc<AsyncMutex<Option<StdioHandles>>>,
    pid: Arc<AsyncMutex<Option<u32>>>,
    stop_requested: Arc<std::sync::atomic::AtomicBool>,
) {
    let mut restart = RestartState::default();

    loop {
        let _ = status_tx.send(ProcessStatus::Starting);

        let mut command = Command::new(&spec.cmd);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(server_id, error = %e, "failed to spawn mcp subprocess");
                let _ = status_tx.send(ProcessStatus::Crashed);
                return;
            }
        };

        *pid.lock().await = child.id();
        install_stdio(&server_id, &mut child, &stdio).await;
        let _ = status_tx.send(ProcessStatus::Running);

        let exit_status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                warn!(server_id, error = %e, "error waiting on mcp subprocess");
                let _ = status_tx.send(ProcessStatus::Crashed);
                return;
            }
        };

        *pid.lock().await = None;

        if stop_requested.load(std::sync::atomic::Ordering::SeqCst) {
            let _ = status_tx.send(ProcessStatus::Stopped);
            return;
        }

        let clean_exit = matches!(exit_status.code(), Some(0) | None);
        if clean_exit {
            debug!(server_id, "mcp subprocess exited cleanly");
            let _ = status_tx.send(ProcessStatus::Stopped);
            return;
        }

        let now = Instant::now();
        if let Some(last) = restart.last_restart
        && now.duration_since(last) > RESTART_WINDOW
        {
            restart.count = 0;
        }

        if restart.count >= RESTART_CAP {
            warn!(server_id, "mcp subprocess exceeded restart cap, marking crashed");
            let _ = status_tx.send(ProcessStatus::Crashed);
            return;
        }

        restart.count += 1;
        restart.last_restart = Some(now);
        let backoff = Duration::from_secs(1u64 << (restart.count - 1));
        warn!(
            server_id,
            attempt = restart.count,
            backoff_secs = backoff.as_secs(),
            "mcp subprocess crashed, restarting"
        );
        tokio::time::sleep(backoff).await;
    }
}

async fn install_stdio(server_id: &str, child: &mut Child, stdio: &Arc<AsyncMutex<Option<StdioHandles>>>) {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    if let (Some(stdin), Some(stdout)) = (stdin, stdout) {
        *stdio.lock().await = Some(StdioHandles { stdin, stdout });
    }

    if let Some(stderr) = stderr {
        let server_id = server_id.to_string();
        tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server_id = %server_id, "{}", line);
                }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cmd: &str, args: &[&str]) -> SpawnSpec {
        SpawnSpec {
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: std::collections::HashMap::new(),
            cwd: std::env::temp_dir(),
        }
    }

    async fn wait_for(rx: &mut watch::Receiver<ProcessStatus>, target: ProcessStatus) {
        loop {
            if *rx.borrow() == target {
                return;
            }
            rx.changed().await.unwrap();
        }
    }

    #[tokio::test]
    async fn clean_exit_marks_stopped_and_does_not_restart() {
        let process = ManagedProcess::spawn("t1".into(), "hash1".into(), spec("true", &[]));
        let mut rx = process.watch();
        wait_for(&mut rx, ProcessStatus::Stopped).await;
        assert_eq!(process.status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn running_process_can_be_stopped_gracefully() {
        let process = ManagedProcess::spawn("t2".into(), "hash2".into(), spec("sleep", &["30"]));
        let mut rx = process.watch();
        wait_for(&mut rx, ProcessStatus::Running).await;
        process.stop().await.unwrap();
        assert_eq!(process.status(), ProcessStatus::Stopped);
    }

    #[tokio::test]
    async fn crashing_process_exceeds_restart_cap_and_is_marked_crashed() {
        let process = ManagedProcess::spawn("t3".into(), "hash3".into(), spec("false", &[]));
        let mut rx = process.watch();
        wait_for(&mut rx, ProcessStatus::Crashed).await;
        assert_eq!(process.status(), ProcessStatus::Crashed);
    }
}
