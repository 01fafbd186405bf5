use async_trait::async_trait;
use capa_shared::error::CommonError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::Repository;
use super::projects::parse_rfc3339;

/// Mirrors the supervisor's process state machine: `starting -> running ->
/// (stopped | crashed)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubprocessStatus {
    Starting,
    Running,
    Stopped,
    Crashed,
}

impl SubprocessStatus {
    fn as_str(&self) -> &'static str {
        match self {
            SubprocessStatus::Starting => "starting",
            SubprocessStatus::Running => "running",
            SubprocessStatus::Stopped => "stopped",
            SubprocessStatus::Crashed => "crashed",
        }
    }

    fn parse(raw: &str) -> Result<Self, CommonError> {
        match raw {
            "starting" => Ok(SubprocessStatus::Starting),
            "running" => Ok(SubprocessStatus::Running),
            "stopped" => Ok(SubprocessStatus::Stopped),
            "crashed" => Ok(SubprocessStatus::Crashed),
            other => Err(CommonError::Repository {
                    msg: format!("unknown subprocess status in store: {other}"),
                    source: None,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubprocessRecord {
    pub project_id: String,
    pub server_id: String,
    pub config_hash: String,
    pub pid: Option<i64>,
    pub status: SubprocessStatus,
    pub started_at: DateTime<Utc>,
    pub last_health_check: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait SubprocessRepositoryLike: Send + Sync {
    /// Keyed on `(project_id, config_hash)`: a changed server definition is a
    /// different row, not an update of the old one.
    async fn upsert_subprocess(&self, record: &SubprocessRecord) -> Result<(), CommonError>;

    async fn get_subprocess(
        &self,
        project_id: &str,
        config_hash: &str,
    ) -> Result<Option<SubprocessRecord>, CommonError>;

    async fn list_subprocesses_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<SubprocessRecord>, CommonError>;

    /// All rows across all projects, used at startup to prune orphans left behind
    /// by a previous broker process (Non-goals discussion / ambient detail).
    async fn list_all_subprocesses(&self) -> Result<Vec<SubprocessRecord>, CommonError>;

    async fn delete_subprocess(&self, project_id: &str, config_hash: &str) -> Result<(), CommonError>;
}

#[async_trait]
impl SubprocessRepositoryLike for Repository {
    async fn upsert_subprocess(&self, record: &SubprocessRecord) -> Result<(), CommonError> {
        self.conn
            .execute(
            "INSERT INTO mcp_subprocesses
            (project_id, server_id, config_hash, pid, status, started_at, last_health_check)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(project_id, config_hash) DO UPDATE SET
            server_id = excluded.server_id,
            pid = excluded.pid,
            status = excluded.status,
            started_at = excluded.started_at,
            last_health_check = excluded.last_health_check",
            libsql::params![
                record.project_id.clone(),
                record.server_id.clone(),
                record.config_hash.clone(),
                record.pid,
                record.status.as_str(),
                record.started_at.to_rfc3339(),
                record.last_health_check.map(|t| t.to_rfc3339()),
            ],
        )
            .await?;
        Ok(())
    }

    async fn get_subprocess(
        &self,
        project_id: &str,
        config_hash: &str,
    ) -> Result<Option<SubprocessRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, server_id, config_hash, pid, status, started_at, last_health_check
            FROM mcp_subprocesses WHERE project_id = ?1 AND config_hash = ?2",
            libsql::params![project_id, config_hash],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_subprocess(row)?)),
            None => Ok(None),
        }
    }

    async fn list_subprocesses_for_project(
        &self,
        project_id: &str,
    ) -> Result<Vec<SubprocessRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, server_id, config_hash, pid, status, started_at, last_health_check
            FROM mcp_subprocesses WHERE project_id = ?1",
            libsql::params![project_id],
        )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_subprocess(row)?);
        }
        Ok(records)
    }

    async fn list_all_subprocesses(&self) -> Result<Vec<SubprocessRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, server_id, config_hash, pid, status, started_at, last_health_check
            FROM mcp_subprocesses",
            (),
        )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_subprocess(row)?);
        }
        Ok(records)
    }

    async fn delete_subprocess(&self, project_id: &str, config_hash: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "DELETE FROM mcp_subprocesses WHERE project_id = ?1 AND config_hash = ?2",
            libsql::params![project_id, config_hash],
        )
            .await?;
        Ok(())
    }
}

fn row_to_subprocess(row: libsql::Row) -> Result<SubprocessRecord, CommonError> {
    let last_health_check: Option<String> = row.get(6)?;
    Ok(SubprocessRecord {
            project_id: row.get(0)?,
            server_id: row.get(1)?,
            config_hash: row.get(2)?,
            pid: row.get(3)?,
            status: SubprocessStatus::parse(&row.get::<String>(4)?)?,
            started_at: parse_rfc3339(row.get::<String>(5)?)?,
            last_health_check: last_health_check.map(parse_rfc3339).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::establish_in_memory_connection;

    fn sample(project_id: &str, config_hash: &str) -> SubprocessRecord {
        SubprocessRecord {
            project_id: project_id.into(),
            server_id: "fs".into(),
            config_hash: config_hash.into(),
            pid: Some(1234),
            status: SubprocessStatus::Running,
            started_at: Utc::now(),
            last_health_check: None,
        }
    }

    #[tokio::test]
    async fn upserts_and_fetches_by_config_hash() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        let record = sample("p1", "hash-a");
        repo.upsert_subprocess(&record).await.unwrap();

        let fetched = repo.get_subprocess("p1", "hash-a").await.unwrap().unwrap();
        assert_eq!(fetched.pid, Some(1234));
        assert_eq!(fetched.status, SubprocessStatus::Running);
    }

    #[tokio::test]
    async fn a_changed_config_hash_is_a_distinct_row() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.upsert_subprocess(&sample("p1", "hash-a")).await.unwrap();
        repo.upsert_subprocess(&sample("p1", "hash-b")).await.unwrap();

        assert_eq!(repo.list_subprocesses_for_project("p1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deletes_and_lists_across_projects() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.upsert_subprocess(&sample("p1", "hash-a")).await.unwrap();
        repo.upsert_subprocess(&sample("p2", "hash-a")).await.unwrap();
        assert_eq!(repo.list_all_subprocesses().await.unwrap().len(), 2);

        repo.delete_subprocess("p1", "hash-a").await.unwrap();
        assert_eq!(repo.list_all_subprocesses().await.unwrap().len(), 1);
    }
}
