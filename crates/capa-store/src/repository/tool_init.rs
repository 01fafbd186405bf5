use async_trait::async_trait;
use capa_shared::error::CommonError;
use chrono::Utc;

use super::Repository;

#[derive(Debug, Clone)]
pub struct ToolInitState {
    pub project_id: String,
    pub tool_id: String,
    pub initialized: bool,
    pub error: Option<String>,
}

#[async_trait]
pub trait ToolInitRepositoryLike: Send + Sync {
    async fn get_tool_init_state(
        &self,
        project_id: &str,
        tool_id: &str,
    ) -> Result<Option<ToolInitState>, CommonError>;

    /// Records the outcome of the one-shot `def.init` run: re-run only
    /// happens after an explicit reset via [`ToolInitRepositoryLike::reset_tool_init_state`].
    async fn record_tool_init(
        &self,
        project_id: &str,
        tool_id: &str,
        initialized: bool,
        error: Option<&str>,
    ) -> Result<(), CommonError>;

    async fn reset_tool_init_state(&self, project_id: &str, tool_id: &str) -> Result<(), CommonError>;
}

#[async_trait]
impl ToolInitRepositoryLike for Repository {
    async fn get_tool_init_state(
        &self,
        project_id: &str,
        tool_id: &str,
    ) -> Result<Option<ToolInitState>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, tool_id, initialized, error
            FROM tool_init_state WHERE project_id = ?1 AND tool_id = ?2",
            libsql::params![project_id, tool_id],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(ToolInitState {
                        project_id: row.get(0)?,
                        tool_id: row.get(1)?,
                        initialized: row.get::<i64>(2)? != 0,
                        error: row.get(3)?,
            })),
            None => Ok(None),
        }
    }

    async fn record_tool_init(
        &self,
        project_id: &str,
        tool_id: &str,
        initialized: bool,
        error: Option<&str>,
    ) -> Result<(), CommonError> {
        self.conn
            .execute(
            "INSERT INTO tool_init_state (project_id, tool_id, initialized, error, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(project_id, tool_id) DO UPDATE SET
            initialized = excluded.initialized,
            error = excluded.error,
            updated_at = excluded.updated_at",
            libsql::params![
                project_id,
                tool_id,
                initialized as i64,
                error,
                Utc::now().to_rfc3339(),
            ],
        )
            .await?;
        Ok(())
    }

    async fn reset_tool_init_state(&self, project_id: &str, tool_id: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "DELETE FROM tool_init_state WHERE project_id = ?1 AND tool_id = ?2",
            libsql::params![project_id, tool_id],
        )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::establish_in_memory_connection;

    #[tokio::test]
    async fn records_and_resets_init_state() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        assert!(repo.get_tool_init_state("p1", "t1").await.unwrap().is_none());

        repo.record_tool_init("p1", "t1", true, None).await.unwrap();
        let state = repo.get_tool_init_state("p1", "t1").await.unwrap().unwrap();
        assert!(state.initialized);
        assert!(state.error.is_none());

        repo.record_tool_init("p1", "t1", false, Some("boom"))
            .await
            .unwrap();
        let state = repo.get_tool_init_state("p1", "t1").await.unwrap().unwrap();
        assert!(!state.initialized);
        assert_eq!(state.error.as_deref(), Some("boom"));

        repo.reset_tool_init_state("p1", "t1").await.unwrap();
        assert!(repo.get_tool_init_state("p1", "t1").await.unwrap().is_none());
    }
}
