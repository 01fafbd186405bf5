use std::sync::Arc;

use capa_shared::error::CommonError;
use capa_store::repository::{ProjectRepositoryLike, SessionRecord, SessionRepositoryLike};
use chrono::Utc;
use dashmap::DashMap;

/// Owns session state: an in-memory map backed by the durable store, the map
/// being authoritative whenever an entry is present. Capabilities are snapshotted into
/// the session at `createSession` time and never re-read from the live project record
/// afterwards (resolved open question) — a `configure` call only affects the next
/// session, never one already in flight.
pub struct SessionManager<R> {
    store: Arc<R>,
    sessions: DashMap<String, SessionRecord>,
}

impl<R> SessionManager<R>
where
    R: SessionRepositoryLike + ProjectRepositoryLike + Send + Sync + 'static,
{
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            sessions: DashMap::new(),
        }
    }

    /// Creates a session bound to `project_id`, freezing that project's current
    /// `Capabilities` into the session record. Fails if the project doesn't exist.
    pub async fn create_session(&self, project_id: &str) -> Result<SessionRecord, CommonError> {
        let project = self
            .store
            .get_project(project_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: format!("project '{project_id}' not found"),
                lookup_id: project_id.to_string(),
                source: None,
        })?;

        let now = Utc::now();
        let session = SessionRecord {
            session_id: uuid::Uuid::now_v7().to_string(),
            project_id: project_id.to_string(),
            capabilities: project.capabilities.unwrap_or_default(),
            active_skills: Vec::new(),
            available_tools: Vec::new(),
            created_at: now,
            last_activity: now,
        };

        self.store.create_session(&session).await?;
        self.sessions.insert(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Hydrates from the durable store on a cache miss: the in-memory map wins
    /// when present, so a broker restart only costs one extra read per resumed session.
    pub async fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>, CommonError> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(Some(session.clone()));
        }

        let Some(session) = self.store.get_session(session_id).await? else {
            return Ok(None);
        };
        self.sessions.insert(session_id.to_string(), session.clone());
        Ok(Some(session))
    }

    pub async fn update_activity(&self, session_id: &str) -> Result<(), CommonError> {
        let now = Utc::now();
        self.store.touch_session(session_id, now).await?;
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.last_activity = now;
        }
        Ok(())
    }

    /// `setupTools`: validates every requested skill exists in the session's
    /// frozen capabilities, then activates the union of their `requires` plus every
    /// plugin-originated (`mcp`-type) tool.
    pub async fn setup_tools(
        &self,
        session_id: &str,
        skill_ids: &[String],
    ) -> Result<Vec<String>, CommonError> {
        let mut session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: format!("session '{session_id}' not found"),
                lookup_id: session_id.to_string(),
                source: None,
        })?;

        for skill_id in skill_ids {
            if session.capabilities.skill(skill_id).is_none() {
                let available: Vec<&str> = session
                    .capabilities
                    .skills
                    .iter()
                    .map(|s| s.id.as_str())
                    .collect();
                return Err(CommonError::InvalidRequest {
                        msg: format!(
                            "Skill not found: {skill_id}. Available skills: {}",
                            available.join(", ")
                        ),
                        source: None,
                });
            }
        }

        let mut required: std::collections::HashSet<String> = skill_ids
            .iter()
            .filter_map(|id| session.capabilities.skill(id))
            .flat_map(|skill| skill.requires.iter().cloned())
            .collect();
        required.extend(session.capabilities.plugin_tool_ids());

        let mut required: Vec<String> = required.into_iter().collect();
        required.sort();

        self.store
            .update_session_tools(session_id, skill_ids, &required)
            .await?;

        session.active_skills = skill_ids.to_vec();
        session.available_tools = required.clone();
        self.sessions.insert(session_id.to_string(), session);

        Ok(required)
    }

    /// `getAllRequiredToolsForProject`: used by `expose-all` mode, recomputed
    /// from the session's frozen capabilities snapshot rather than the live project.
    pub async fn all_required_tools(&self, session_id: &str) -> Result<Vec<String>, CommonError> {
        let session = self
            .get_session(session_id)
            .await?
            .ok_or_else(|| CommonError::NotFound {
                msg: format!("session '{session_id}' not found"),
                lookup_id: session_id.to_string(),
                source: None,
        })?;

        let mut required: Vec<String> = session.capabilities.all_required_tool_ids().into_iter().collect();
        required.sort();
        Ok(required)
    }

    /// Removes idle sessions (last activity older than `idle_cutoff`) from both the
    /// in-memory map and the store (60s sweeper).
    pub async fn sweep_idle(&self, idle_cutoff: chrono::DateTime<Utc>) -> Result<usize, CommonError> {
        let idle = self.store.list_idle_sessions(idle_cutoff).await?;
        for session in &idle {
            self.store.delete_session(&session.session_id).await?;
            self.sessions.remove(&session.session_id);
        }
        Ok(idle.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capa_shared::types::{Capabilities, Skill};
    use capa_store::connection::establish_in_memory_connection;
    use capa_store::repository::Repository;
    use std::collections::HashSet;

    async fn manager_with_project(capabilities: Capabilities) -> (SessionManager<Repository>, String) {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Arc::new(Repository::new(conn));
        let project = repo.get_or_create_project("p1", "/tmp/p1").await.unwrap();
        repo.set_capabilities(&project.id, &capabilities).await.unwrap();
        (SessionManager::new(repo), project.id)
    }

    fn capabilities_with_skill() -> Capabilities {
        let mut requires = HashSet::new();
        requires.insert("t1".to_string());
        Capabilities {
            skills: vec![Skill {
                    id: "s1".to_string(),
                    requires,
                    extra: serde_json::Map::new(),
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_session_freezes_capabilities() {
        let (manager, project_id) = manager_with_project(capabilities_with_skill()).await;
        let session = manager.create_session(&project_id).await.unwrap();
        assert_eq!(session.capabilities.skills.len(), 1);
        assert!(session.available_tools.is_empty());
    }

    #[tokio::test]
    async fn setup_tools_activates_required_tools() {
        let (manager, project_id) = manager_with_project(capabilities_with_skill()).await;
        let session = manager.create_session(&project_id).await.unwrap();

        let tools = manager
            .setup_tools(&session.session_id, &["s1".to_string()])
            .await
            .unwrap();
        assert_eq!(tools, vec!["t1".to_string()]);

        let fetched = manager.get_session(&session.session_id).await.unwrap().unwrap();
        assert_eq!(fetched.active_skills, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn setup_tools_rejects_unknown_skill() {
        let (manager, project_id) = manager_with_project(capabilities_with_skill()).await;
        let session = manager.create_session(&project_id).await.unwrap();

        let err = manager
            .setup_tools(&session.session_id, &["nope".to_string()])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid request"));
    }

    #[tokio::test]
    async fn sweep_idle_removes_stale_sessions() {
        let (manager, project_id) = manager_with_project(Capabilities::default()).await;
        let session = manager.create_session(&project_id).await.unwrap();
        manager
            .store
            .touch_session(&session.session_id, Utc::now() - chrono::Duration::minutes(90))
            .await
            .unwrap();

        let removed = manager
            .sweep_idle(Utc::now() - chrono::Duration::minutes(60))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(manager.get_session(&session.session_id).await.unwrap().is_none());
    }
}
