pub mod process;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use capa_shared::error::CommonError;
use capa_store::repository::{SubprocessRecord, SubprocessRepositoryLike, SubprocessStatus};
use chrono::Utc;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub use process::{ManagedProcess, ProcessStatus, SpawnSpec, StdioHandles};

/// Owns the lifecycle of local MCP server subprocesses, keyed by `config_hash`.
/// Not backed by a third-party process-manager crate (see DESIGN.md): the restart-cap
/// state machine is narrow and timing-specific enough that hand-rolling it on
/// `tokio::process::Child` is less code than bending a general-purpose manager to fit.
pub struct Supervisor<R: SubprocessRepositoryLike> {
    store: Arc<R>,
    processes: RwLock<HashMap<String, Arc<ManagedProcess>>>,
}

impl<R: SubprocessRepositoryLike + 'static> Supervisor<R> {
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            processes: RwLock::new(HashMap::new()),
        }
    }

    /// On startup, purges persisted subprocess rows whose PID is no longer alive.
    /// Records whose PID is alive are left as durable metadata only — their stdio
    /// handles are gone with the previous broker process, so the next call to
    /// [`Supervisor::get_or_create_subprocess`] will still spawn a fresh one keyed by
    /// the same `config_hash`, replacing the row (Subprocess Record lifecycle).
    pub async fn prune_orphans_on_startup(&self) -> Result<(), CommonError> {
        let records = self.store.list_all_subprocesses().await?;
        let mut pruned = 0u32;
        for record in records {
            let alive = record
                .pid
                .map(|pid| kill(Pid::from_raw(pid as i32), None).is_ok())
                .unwrap_or(false);

            if !alive {
                self.store
                    .delete_subprocess(&record.project_id, &record.config_hash)
                    .await?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            info!(pruned, "pruned orphaned subprocess records on startup");
        }
        Ok(())
    }

    /// Returns the process cached under `config_hash`, spawning one if absent. A
    /// cached entry is reused regardless of its current status — `Crashed` and
    /// `Stopped` included — so a process that gave up after exhausting its restart
    /// cap stays put until an explicit [`Supervisor::reset_subprocess`] clears it;
    /// nothing here silently respawns a crashed process on the next call.
    pub async fn get_or_create_subprocess(
        &self,
        project_id: &str,
        server_id: &str,
        config_hash: &str,
        spec: SpawnSpec,
    ) -> Result<Arc<ManagedProcess>, CommonError> {
        if let Some(existing) = self.processes.read().await.get(config_hash) {
            return Ok(existing.clone());
        }

        let mut processes = self.processes.write().await;
        if let Some(existing) = processes.get(config_hash) {
            return Ok(existing.clone());
        }

        let process = ManagedProcess::spawn(server_id.to_string(), config_hash.to_string(), spec);
        processes.insert(config_hash.to_string(), process.clone());
        drop(processes);

        // Give the spawn a tick to land a PID before the first persisted row —
        // best effort, the watcher below keeps the record current from here on.
        tokio::task::yield_now().await;
        let pid = process.pid().await;
        let started_at = Utc::now();
        self.store
            .upsert_subprocess(&SubprocessRecord {
                project_id: project_id.to_string(),
                server_id: server_id.to_string(),
                config_hash: config_hash.to_string(),
                pid: pid.map(|p| p as i64),
                status: SubprocessStatus::Starting,
                started_at,
                last_health_check: None,
        })
            .await?;

        self.spawn_status_watcher(
            project_id.to_string(),
            server_id.to_string(),
            config_hash.to_string(),
            started_at,
            process.clone(),
        );

        Ok(process)
    }

    /// Subscribes to a freshly spawned process's status and mirrors every transition
    /// into the durable record: `Running`/`Crashed` are upserted with the current PID,
    /// a clean-exit or explicit-stop `Stopped` deletes the row outright (Durable Record
    /// lifecycle). Runs until the process reaches a terminal state.
    fn spawn_status_watcher(
        &self,
        project_id: String,
        server_id: String,
        config_hash: String,
        started_at: chrono::DateTime<Utc>,
        process: Arc<ManagedProcess>,
    ) {
        let store = self.store.clone();
        tokio::spawn(async move {
            let mut rx = process.watch();
            loop {
                if rx.changed().await.is_err() {
                    return;
                }

                let status = process.status();
                if status == ProcessStatus::Stopped {
                    if let Err(e) = store.delete_subprocess(&project_id, &config_hash).await {
                        warn!(%project_id, %config_hash, error = %e, "failed to delete subprocess record on stop");
                    }
                    return;
                }

                let db_status = match status {
                    ProcessStatus::Starting => SubprocessStatus::Starting,
                    ProcessStatus::Running => SubprocessStatus::Running,
                    ProcessStatus::Crashed => SubprocessStatus::Crashed,
                    ProcessStatus::Stopped => unreachable!("handled above"),
                };
                let pid = process.pid().await;
                if let Err(e) = store
                    .upsert_subprocess(&SubprocessRecord {
                        project_id: project_id.clone(),
                        server_id: server_id.clone(),
                        config_hash: config_hash.clone(),
                        pid: pid.map(|p| p as i64),
                        status: db_status,
                        started_at,
                        last_health_check: None,
                })
                    .await
                {
                    warn!(%project_id, %config_hash, error = %e, "failed to persist subprocess status transition");
                }

                if status == ProcessStatus::Crashed {
                    return;
                }
            }
        });
    }

    /// Clears a cached/persisted subprocess so the next [`Supervisor::
    /// get_or_create_subprocess`] call for the same server spawns fresh with a reset
    /// restart count — the only sanctioned way out of a `Crashed` terminal state.
    pub async fn reset_subprocess(&self, project_id: &str, server_id: &str) -> Result<usize, CommonError> {
        let records = self.store.list_subprocesses_for_project(project_id).await?;
        let mut reset = 0usize;
        for record in records.into_iter().filter(|r| r.server_id == server_id) {
            let process = self.processes.write().await.remove(&record.config_hash);
            if let Some(process) = process {
                process.stop().await?;
            }
            self.store.delete_subprocess(project_id, &record.config_hash).await?;
            reset += 1;
        }
        Ok(reset)
    }

    pub async fn stop_subprocess(&self, config_hash: &str) -> Result<(), CommonError> {
        let process = self.processes.write().await.remove(config_hash);
        if let Some(process) = process {
            process.stop().await?;
        }
        Ok(())
    }

    /// Invoked on broker shutdown ("terminates subprocesses").
    pub async fn stop_all(&self) -> Result<(), CommonError> {
        let processes: Vec<_> = self.processes.write().await.drain().map(|(_, p)| p).collect();
        for process in processes {
            if let Err(e) = process.stop().await {
                warn!(server_id = %process.server_id, error = %e, "error stopping subprocess");
            }
        }
        Ok(())
    }

    pub async fn get(&self, config_hash: &str) -> Option<Arc<ManagedProcess>> {
        self.processes.read().await.get(config_hash).cloned()
    }
}

/// Builds the spawn environment for a subprocess server: `process.env ⊕ serverDef.env`
///, with the project path as its working directory.
pub fn spawn_spec(
    cmd: String,
    args: Vec<String>,
    server_env: &HashMap<String, String>,
    cwd_override: Option<&str>,
    project_path: &Path,
) -> SpawnSpec {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    env.extend(server_env.clone());

    let cwd = cwd_override
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| project_path.to_path_buf());

    SpawnSpec { cmd, args, env, cwd }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capa_store::connection::establish_in_memory_connection;
    use capa_store::repository::Repository;

    async fn supervisor() -> Supervisor<Repository> {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        Supervisor::new(Arc::new(Repository::new(conn)))
    }

    fn spec() -> SpawnSpec {
        SpawnSpec {
            cmd: "sleep".to_string(),
            args: vec!["5".to_string()],
            env: HashMap::new(),
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn reuses_an_already_running_process_for_the_same_config_hash() {
        let sup = supervisor().await;
        let a = sup
            .get_or_create_subprocess("p1", "fs", "hash-a", spec())
            .await
            .unwrap();
        let mut rx = a.watch();
        while *rx.borrow() != ProcessStatus::Running {
            rx.changed().await.unwrap();
        }

        let b = sup
            .get_or_create_subprocess("p1", "fs", "hash-a", spec())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        sup.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn prune_orphans_removes_dead_pids() {
        let sup = supervisor().await;
        sup.store
            .upsert_subprocess(&SubprocessRecord {
                project_id: "p1".into(),
                server_id: "fs".into(),
                config_hash: "stale".into(),
                pid: Some(i32::MAX as i64),
                status: SubprocessStatus::Running,
                started_at: Utc::now(),
                last_health_check: None,
        })
            .await
            .unwrap();

        sup.prune_orphans_on_startup().await.unwrap();
        assert!(sup.store.get_subprocess("p1", "stale").await.unwrap().is_none());
    }

    fn crashing_spec() -> SpawnSpec {
        SpawnSpec {
            cmd: "false".to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn a_crashed_process_is_reused_not_respawned_until_reset() {
        let sup = supervisor().await;
        let a = sup
            .get_or_create_subprocess("p1", "fs", "hash-crash", crashing_spec())
            .await
            .unwrap();
        let mut rx = a.watch();
        while *rx.borrow() != ProcessStatus::Crashed {
            rx.changed().await.unwrap();
        }

        let b = sup
            .get_or_create_subprocess("p1", "fs", "hash-crash", crashing_spec())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // The watcher task persists asynchronously; give it a moment to catch up
        // with the `Crashed` transition this test already observed directly.
        let mut record = sup.store.get_subprocess("p1", "hash-crash").await.unwrap();
        for _ in 0..50 {
            if matches!(record, Some(ref r) if r.status == SubprocessStatus::Crashed) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            record = sup.store.get_subprocess("p1", "hash-crash").await.unwrap();
        }
        assert_eq!(record.unwrap().status, SubprocessStatus::Crashed);

        sup.reset_subprocess("p1", "fs").await.unwrap();
        assert!(sup.store.get_subprocess("p1", "hash-crash").await.unwrap().is_none());

        let c = sup
            .get_or_create_subprocess("p1", "fs", "hash-crash", crashing_spec())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &c));

        sup.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn a_clean_exit_deletes_the_persisted_record() {
        let sup = supervisor().await;
        let process = sup
            .get_or_create_subprocess(
                "p1",
                "fs",
                "hash-clean",
                SpawnSpec {
                    cmd: "true".to_string(),
                    args: vec![],
                    env: HashMap::new(),
                    cwd: std::env::temp_dir(),
            },
            )
            .await
            .unwrap();

        let mut rx = process.watch();
        while *rx.borrow() != ProcessStatus::Stopped {
            rx.changed().await.unwrap();
        }

        // The watcher task persists asynchronously; give it a moment to run.
        for _ in 0..50 {
            if sup.store.get_subprocess("p1", "hash-clean").await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(sup.store.get_subprocess("p1", "hash-clean").await.unwrap().is_none());
    }
}
