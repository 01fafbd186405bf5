use std::collections::HashMap;

use async_trait::async_trait;
use capa_shared::error::CommonError;

use super::Repository;

#[async_trait]
pub trait VariableRepositoryLike: Send + Sync {
    async fn get_variable(&self, project_id: &str, key: &str) -> Result<Option<String>, CommonError>;

    async fn list_variables(&self, project_id: &str) -> Result<HashMap<String, String>, CommonError>;

    /// Upserts `(project_id, key)` (unique per pair).
    async fn set_variable(&self, project_id: &str, key: &str, value: &str) -> Result<(), CommonError>;

    async fn delete_variable(&self, project_id: &str, key: &str) -> Result<(), CommonError>;
}

#[async_trait]
impl VariableRepositoryLike for Repository {
    async fn get_variable(&self, project_id: &str, key: &str) -> Result<Option<String>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT value FROM variables WHERE project_id = ?1 AND key = ?2",
            libsql::params![project_id, key],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    async fn list_variables(&self, project_id: &str) -> Result<HashMap<String, String>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT key, value FROM variables WHERE project_id = ?1",
            libsql::params![project_id],
        )
            .await?;

        let mut vars = HashMap::new();
        while let Some(row) = rows.next().await? {
            vars.insert(row.get::<String>(0)?, row.get::<String>(1)?);
        }
        Ok(vars)
    }

    async fn set_variable(&self, project_id: &str, key: &str, value: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "INSERT INTO variables (project_id, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(project_id, key) DO UPDATE SET value = excluded.value",
            libsql::params![project_id, key, value],
        )
            .await?;
        Ok(())
    }

    async fn delete_variable(&self, project_id: &str, key: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "DELETE FROM variables WHERE project_id = ?1 AND key = ?2",
            libsql::params![project_id, key],
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
    async fn upserts_and_lists_variables() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.set_variable("p1", "TOKEN", "abc").await.unwrap();
        repo.set_variable("p1", "TOKEN", "def").await.unwrap();

        assert_eq!(
            repo.get_variable("p1", "TOKEN").await.unwrap(),
            Some("def".to_string())
        );
        assert_eq!(repo.list_variables("p1").await.unwrap().len(), 1);

        repo.delete_variable("p1", "TOKEN").await.unwrap();
        assert_eq!(repo.get_variable("p1", "TOKEN").await.unwrap(), None);
    }
}
