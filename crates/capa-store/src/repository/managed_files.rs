use async_trait::async_trait;
use capa_shared::error::CommonError;

use super::Repository;

#[async_trait]
pub trait ManagedFileRepositoryLike: Send + Sync {
    async fn add_managed_file(&self, project_id: &str, file_path: &str) -> Result<(), CommonError>;

    async fn list_managed_files(&self, project_id: &str) -> Result<Vec<String>, CommonError>;

    async fn remove_managed_file(&self, project_id: &str, file_path: &str) -> Result<(), CommonError>;
}

#[async_trait]
impl ManagedFileRepositoryLike for Repository {
    async fn add_managed_file(&self, project_id: &str, file_path: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
                "INSERT INTO managed_files (project_id, file_path) VALUES (?1, ?2)
                 ON CONFLICT(project_id, file_path) DO NOTHING",
                libsql::params![project_id, file_path],
            )
            .await?;
        Ok(())
    }

    async fn list_managed_files(&self, project_id: &str) -> Result<Vec<String>, CommonError> {
        let mut rows = self
            .conn
            .query(
                "SELECT file_path FROM managed_files WHERE project_id = ?1 ORDER BY file_path",
                libsql::params![project_id],
            )
            .await?;

        let mut files = Vec::new();
        while let Some(row) = rows.next().await? {
            files.push(row.get::<String>(0)?);
        }
        Ok(files)
    }

    async fn remove_managed_file(&self, project_id: &str, file_path: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
                "DELETE FROM managed_files WHERE project_id = ?1 AND file_path = ?2",
                libsql::params![project_id, file_path],
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
    async fn adds_lists_and_removes_managed_files() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.add_managed_file("p1", "/tmp/p1/.mcp.json").await.unwrap();
        repo.add_managed_file("p1", "/tmp/p1/.mcp.json").await.unwrap();
        assert_eq!(repo.list_managed_files("p1").await.unwrap().len(), 1);

        repo.remove_managed_file("p1", "/tmp/p1/.mcp.json").await.unwrap();
        assert!(repo.list_managed_files("p1").await.unwrap().is_empty());
    }
}
