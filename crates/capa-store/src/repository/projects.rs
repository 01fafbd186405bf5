use async_trait::async_trait;
use capa_shared::error::CommonError;
use capa_shared::types::Capabilities;
use chrono::{DateTime, Utc};

use super::Repository;

#[derive(Debug, Clone)]
pub struct Project {
    pub id: String,
    pub path: String,
    pub capabilities: Option<Capabilities>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ProjectRepositoryLike: Send + Sync {
    /// Creates the project row if absent (matched by `path`); otherwise returns the
    /// existing row untouched. A project is "created on first configure" and
    /// never deleted by the core.
    async fn get_or_create_project(&self, id: &str, path: &str) -> Result<Project, CommonError>;

    async fn get_project(&self, id: &str) -> Result<Option<Project>, CommonError>;

    async fn list_projects(&self) -> Result<Vec<Project>, CommonError>;

    /// Replaces the stored `Capabilities` wholesale ("never partially mutated").
    async fn set_capabilities(
        &self,
        project_id: &str,
        capabilities: &Capabilities,
    ) -> Result<(), CommonError>;
}

#[async_trait]
impl ProjectRepositoryLike for Repository {
    async fn get_or_create_project(&self, id: &str, path: &str) -> Result<Project, CommonError> {
        if let Some(existing) = self.get_project(id).await? {
            return Ok(existing);
        }

        let now = Utc::now();
        self.conn
            .execute(
            "INSERT INTO projects (id, path, capabilities_json, created_at, updated_at)
            VALUES (?1, ?2, NULL, ?3, ?4)
            ON CONFLICT(path) DO NOTHING",
            libsql::params![id, path, now.to_rfc3339(), now.to_rfc3339()],
        )
            .await?;

        self.get_project(id)
            .await?
            .ok_or_else(|| CommonError::Repository {
                msg: format!("failed to create project {id}"),
                source: None,
        })
    }

    async fn get_project(&self, id: &str) -> Result<Option<Project>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT id, path, capabilities_json, created_at, updated_at FROM projects WHERE id = ?1",
            libsql::params![id],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_project(row)?)),
            None => Ok(None),
        }
    }

    async fn list_projects(&self) -> Result<Vec<Project>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT id, path, capabilities_json, created_at, updated_at FROM projects ORDER BY created_at",
            (),
        )
            .await?;

        let mut projects = Vec::new();
        while let Some(row) = rows.next().await? {
            projects.push(row_to_project(row)?);
        }
        Ok(projects)
    }

    async fn set_capabilities(
        &self,
        project_id: &str,
        capabilities: &Capabilities,
    ) -> Result<(), CommonError> {
        let json = serde_json::to_string(capabilities)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
            "UPDATE projects SET capabilities_json = ?1, updated_at = ?2 WHERE id = ?3",
            libsql::params![json, now, project_id],
        )
            .await?;
        Ok(())
    }
}

fn row_to_project(row: libsql::Row) -> Result<Project, CommonError> {
    let capabilities_json: Option<String> = row.get(2)?;
    let capabilities = capabilities_json
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(Project {
            id: row.get(0)?,
            path: row.get(1)?,
            capabilities,
            created_at: parse_rfc3339(row.get::<String>(3)?)?,
            updated_at: parse_rfc3339(row.get::<String>(4)?)?,
    })
}

pub(crate) fn parse_rfc3339(raw: String) -> Result<DateTime<Utc>, CommonError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CommonError::Repository {
            msg: format!("invalid timestamp in store: {raw}"),
            source: Some(e.into()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::establish_in_memory_connection;

    #[tokio::test]
    async fn creates_project_once_and_is_idempotent() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        let a = repo.get_or_create_project("p1", "/tmp/p1").await.unwrap();
        let b = repo.get_or_create_project("p1", "/tmp/p1").await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(repo.list_projects().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stores_and_reloads_capabilities() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);
        repo.get_or_create_project("p1", "/tmp/p1").await.unwrap();

        let caps = Capabilities::default();
        repo.set_capabilities("p1", &caps).await.unwrap();

        let project = repo.get_project("p1").await.unwrap().unwrap();
        assert!(project.capabilities.is_some());
    }
}
