use async_trait::async_trait;
use capa_shared::error::CommonError;
use capa_shared::types::Capabilities;
use chrono::{DateTime, Utc};

use super::Repository;
use super::projects::parse_rfc3339;

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_id: String,
    /// Frozen at `initialize` time (resolved Open Question): never refreshed
    /// from the live project record mid-session.
    pub capabilities: Capabilities,
    pub active_skills: Vec<String>,
    pub available_tools: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

#[async_trait]
pub trait SessionRepositoryLike: Send + Sync {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), CommonError>;

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CommonError>;

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), CommonError>;

    async fn update_session_tools(
        &self,
        session_id: &str,
        active_skills: &[String],
        available_tools: &[String],
    ) -> Result<(), CommonError>;

    /// Sessions whose `last_activity` is older than `idle_cutoff` (60s sweeper).
    async fn list_idle_sessions(
        &self,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CommonError>;

    async fn delete_session(&self, session_id: &str) -> Result<(), CommonError>;
}

#[async_trait]
impl SessionRepositoryLike for Repository {
    async fn create_session(&self, session: &SessionRecord) -> Result<(), CommonError> {
        let capabilities_json = serde_json::to_string(&session.capabilities)?;
        let active_skills_json = serde_json::to_string(&session.active_skills)?;
        let available_tools_json = serde_json::to_string(&session.available_tools)?;

        self.conn
            .execute(
            "INSERT INTO sessions
            (session_id, project_id, capabilities_json, active_skills_json,
                available_tools_json, created_at, last_activity)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            libsql::params![
                session.session_id.clone(),
                session.project_id.clone(),
                capabilities_json,
                active_skills_json,
                available_tools_json,
                session.created_at.to_rfc3339(),
                session.last_activity.to_rfc3339(),
            ],
        )
            .await?;
        Ok(())
    }

    async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT session_id, project_id, capabilities_json, active_skills_json,
            available_tools_json, created_at, last_activity
            FROM sessions WHERE session_id = ?1",
            libsql::params![session_id],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_session(row)?)),
            None => Ok(None),
        }
    }

    async fn touch_session(&self, session_id: &str, at: DateTime<Utc>) -> Result<(), CommonError> {
        self.conn
            .execute(
            "UPDATE sessions SET last_activity = ?1 WHERE session_id = ?2",
            libsql::params![at.to_rfc3339(), session_id],
        )
            .await?;
        Ok(())
    }

    async fn update_session_tools(
        &self,
        session_id: &str,
        active_skills: &[String],
        available_tools: &[String],
    ) -> Result<(), CommonError> {
        let active_skills_json = serde_json::to_string(active_skills)?;
        let available_tools_json = serde_json::to_string(available_tools)?;
        self.conn
            .execute(
            "UPDATE sessions SET active_skills_json = ?1, available_tools_json = ?2
            WHERE session_id = ?3",
            libsql::params![active_skills_json, available_tools_json, session_id],
        )
            .await?;
        Ok(())
    }

    async fn list_idle_sessions(
        &self,
        idle_cutoff: DateTime<Utc>,
    ) -> Result<Vec<SessionRecord>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT session_id, project_id, capabilities_json, active_skills_json,
            available_tools_json, created_at, last_activity
            FROM sessions WHERE last_activity < ?1",
            libsql::params![idle_cutoff.to_rfc3339()],
        )
            .await?;

        let mut sessions = Vec::new();
        while let Some(row) = rows.next().await? {
            sessions.push(row_to_session(row)?);
        }
        Ok(sessions)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "DELETE FROM sessions WHERE session_id = ?1",
            libsql::params![session_id],
        )
            .await?;
        Ok(())
    }
}

fn row_to_session(row: libsql::Row) -> Result<SessionRecord, CommonError> {
    let capabilities_json: String = row.get(2)?;
    let active_skills_json: String = row.get(3)?;
    let available_tools_json: String = row.get(4)?;

    Ok(SessionRecord {
            session_id: row.get(0)?,
            project_id: row.get(1)?,
            capabilities: serde_json::from_str(&capabilities_json)?,
            active_skills: serde_json::from_str(&active_skills_json)?,
            available_tools: serde_json::from_str(&available_tools_json)?,
            created_at: parse_rfc3339(row.get::<String>(5)?)?,
            last_activity: parse_rfc3339(row.get::<String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::establish_in_memory_connection;

    fn sample(session_id: &str, last_activity: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: session_id.into(),
            project_id: "p1".into(),
            capabilities: Capabilities::default(),
            active_skills: vec![],
            available_tools: vec![],
            created_at: Utc::now(),
            last_activity,
        }
    }

    #[tokio::test]
    async fn creates_and_fetches_session() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.create_session(&sample("s1", Utc::now())).await.unwrap();
        let fetched = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.project_id, "p1");
    }

    #[tokio::test]
    async fn updates_tools_and_touches_activity() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);
        repo.create_session(&sample("s1", Utc::now() - chrono::Duration::hours(1)))
            .await
            .unwrap();

        repo.update_session_tools("s1", &["skill-a".to_string()], &["tool-a".to_string()])
            .await
            .unwrap();
        let now = Utc::now();
        repo.touch_session("s1", now).await.unwrap();

        let fetched = repo.get_session("s1").await.unwrap().unwrap();
        assert_eq!(fetched.active_skills, vec!["skill-a".to_string()]);
        assert_eq!(fetched.available_tools, vec!["tool-a".to_string()]);
    }

    #[tokio::test]
    async fn lists_only_idle_sessions() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        repo.create_session(&sample("idle", Utc::now() - chrono::Duration::minutes(90)))
            .await
            .unwrap();
        repo.create_session(&sample("fresh", Utc::now())).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(60);
        let idle = repo.list_idle_sessions(cutoff).await.unwrap();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].session_id, "idle");
    }
}
