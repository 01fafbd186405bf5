use async_trait::async_trait;
use capa_shared::error::CommonError;
use chrono::{DateTime, Utc};

use super::Repository;
use super::projects::parse_rfc3339;

#[derive(Debug, Clone)]
pub struct OAuth2Token {
    pub project_id: String,
    pub server_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuth2FlowState {
    pub state: String,
    pub project_id: String,
    pub server_id: String,
    pub code_verifier: String,
    pub redirect_uri: String,
    pub client_id: String,
    pub created_at: DateTime<Utc>,
}

/// GC horizon for stale flow states ("entries older than 10 min are GC'd").
pub const FLOW_STATE_TTL_SECONDS: i64 = 600;

#[async_trait]
pub trait OAuth2TokenRepositoryLike: Send + Sync {
    async fn get_token(&self, project_id: &str, server_id: &str) -> Result<Option<OAuth2Token>, CommonError>;

    async fn list_tokens_expiring_within(
        &self,
        seconds: i64,
    ) -> Result<Vec<OAuth2Token>, CommonError>;

    async fn upsert_token(&self, token: &OAuth2Token) -> Result<(), CommonError>;

    async fn delete_token(&self, project_id: &str, server_id: &str) -> Result<(), CommonError>;
}

#[async_trait]
pub trait OAuth2FlowStateRepositoryLike: Send + Sync {
    async fn create_flow_state(&self, flow: &OAuth2FlowState) -> Result<(), CommonError>;

    /// Consumes (looks up then deletes) a flow state by its opaque `state` value —
    /// callback handling is single-use.
    async fn take_flow_state(&self, state: &str) -> Result<Option<OAuth2FlowState>, CommonError>;

    /// Looks up a flow state without consuming it, so a caller can resolve which
    /// server a callback belongs to before the single-use `take_flow_state` call.
    async fn peek_flow_state(&self, state: &str) -> Result<Option<OAuth2FlowState>, CommonError>;

    /// Deletes flow states older than [`FLOW_STATE_TTL_SECONDS`].
    async fn gc_expired_flow_states(&self) -> Result<u64, CommonError>;
}

#[async_trait]
impl OAuth2TokenRepositoryLike for Repository {
    async fn get_token(&self, project_id: &str, server_id: &str) -> Result<Option<OAuth2Token>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, server_id, access_token, refresh_token, token_type, expires_at, scope
            FROM oauth2_tokens WHERE project_id = ?1 AND server_id = ?2",
            libsql::params![project_id, server_id],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_token(row)?)),
            None => Ok(None),
        }
    }

    async fn list_tokens_expiring_within(
        &self,
        seconds: i64,
    ) -> Result<Vec<OAuth2Token>, CommonError> {
        let horizon = (Utc::now() + chrono::Duration::seconds(seconds)).to_rfc3339();
        let mut rows = self
            .conn
            .query(
            "SELECT project_id, server_id, access_token, refresh_token, token_type, expires_at, scope
            FROM oauth2_tokens
            WHERE refresh_token IS NOT NULL AND expires_at IS NOT NULL AND expires_at < ?1",
            libsql::params![horizon],
        )
            .await?;

        let mut tokens = Vec::new();
        while let Some(row) = rows.next().await? {
            tokens.push(row_to_token(row)?);
        }
        Ok(tokens)
    }

    async fn upsert_token(&self, token: &OAuth2Token) -> Result<(), CommonError> {
        self.conn
            .execute(
            "INSERT INTO oauth2_tokens
            (project_id, server_id, access_token, refresh_token, token_type, expires_at, scope)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(project_id, server_id) DO UPDATE SET
            access_token = excluded.access_token,
            refresh_token = excluded.refresh_token,
            token_type = excluded.token_type,
            expires_at = excluded.expires_at,
            scope = excluded.scope",
            libsql::params![
                token.project_id.clone(),
                token.server_id.clone(),
                token.access_token.clone(),
                token.refresh_token.clone(),
                token.token_type.clone(),
                token.expires_at.map(|t| t.to_rfc3339()),
                token.scope.clone(),
            ],
        )
            .await?;
        Ok(())
    }

    async fn delete_token(&self, project_id: &str, server_id: &str) -> Result<(), CommonError> {
        self.conn
            .execute(
            "DELETE FROM oauth2_tokens WHERE project_id = ?1 AND server_id = ?2",
            libsql::params![project_id, server_id],
        )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl OAuth2FlowStateRepositoryLike for Repository {
    async fn create_flow_state(&self, flow: &OAuth2FlowState) -> Result<(), CommonError> {
        self.conn
            .execute(
            "INSERT INTO oauth2_flow_states
            (state, project_id, server_id, code_verifier, redirect_uri, client_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            libsql::params![
                flow.state.clone(),
                flow.project_id.clone(),
                flow.server_id.clone(),
                flow.code_verifier.clone(),
                flow.redirect_uri.clone(),
                flow.client_id.clone(),
                flow.created_at.to_rfc3339(),
            ],
        )
            .await?;
        Ok(())
    }

    async fn take_flow_state(&self, state: &str) -> Result<Option<OAuth2FlowState>, CommonError> {
        let flow = self.peek_flow_state(state).await?;

        if flow.is_some() {
            self.conn
                .execute(
                "DELETE FROM oauth2_flow_states WHERE state = ?1",
                libsql::params![state],
            )
                .await?;
        }

        Ok(flow)
    }

    async fn peek_flow_state(&self, state: &str) -> Result<Option<OAuth2FlowState>, CommonError> {
        let mut rows = self
            .conn
            .query(
            "SELECT state, project_id, server_id, code_verifier, redirect_uri, client_id, created_at
            FROM oauth2_flow_states WHERE state = ?1",
            libsql::params![state],
        )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row_to_flow_state(row)?)),
            None => Ok(None),
        }
    }

    async fn gc_expired_flow_states(&self) -> Result<u64, CommonError> {
        let horizon =
        (Utc::now() - chrono::Duration::seconds(FLOW_STATE_TTL_SECONDS)).to_rfc3339();
        let deleted = self
            .conn
            .execute(
            "DELETE FROM oauth2_flow_states WHERE created_at < ?1",
            libsql::params![horizon],
        )
            .await?;
        Ok(deleted)
    }
}

fn row_to_token(row: libsql::Row) -> Result<OAuth2Token, CommonError> {
    let expires_at: Option<String> = row.get(5)?;
    Ok(OAuth2Token {
            project_id: row.get(0)?,
            server_id: row.get(1)?,
            access_token: row.get(2)?,
            refresh_token: row.get(3)?,
            token_type: row.get(4)?,
            expires_at: expires_at.map(parse_rfc3339).transpose()?,
            scope: row.get(6)?,
    })
}

fn row_to_flow_state(row: libsql::Row) -> Result<OAuth2FlowState, CommonError> {
    Ok(OAuth2FlowState {
            state: row.get(0)?,
            project_id: row.get(1)?,
            server_id: row.get(2)?,
            code_verifier: row.get(3)?,
            redirect_uri: row.get(4)?,
            client_id: row.get(5)?,
            created_at: parse_rfc3339(row.get::<String>(6)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::establish_in_memory_connection;

    #[tokio::test]
    async fn upserts_and_fetches_token() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        let token = OAuth2Token {
            project_id: "p1".into(),
            server_id: "s1".into(),
            access_token: "a1".into(),
            refresh_token: Some("r1".into()),
            token_type: "Bearer".into(),
            expires_at: Some(Utc::now()),
            scope: None,
        };
        repo.upsert_token(&token).await.unwrap();

        let fetched = repo.get_token("p1", "s1").await.unwrap().unwrap();
        assert_eq!(fetched.access_token, "a1");

        repo.delete_token("p1", "s1").await.unwrap();
        assert!(repo.get_token("p1", "s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flow_state_is_single_use() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        let flow = OAuth2FlowState {
            state: "st1".into(),
            project_id: "p1".into(),
            server_id: "s1".into(),
            code_verifier: "v1".into(),
            redirect_uri: "http://localhost/callback".into(),
            client_id: "capa".into(),
            created_at: Utc::now(),
        };
        repo.create_flow_state(&flow).await.unwrap();

        let taken = repo.take_flow_state("st1").await.unwrap();
        assert!(taken.is_some());
        assert!(repo.take_flow_state("st1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lists_tokens_expiring_soon() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let repo = Repository::new(conn);

        let soon = OAuth2Token {
            project_id: "p1".into(),
            server_id: "soon".into(),
            access_token: "a".into(),
            refresh_token: Some("r".into()),
            token_type: "Bearer".into(),
            expires_at: Some(Utc::now() + chrono::Duration::minutes(5)),
            scope: None,
        };
        let later = OAuth2Token {
            server_id: "later".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(2)),
            ..soon.clone()
        };
        repo.upsert_token(&soon).await.unwrap();
        repo.upsert_token(&later).await.unwrap();

        let expiring = repo.list_tokens_expiring_within(600).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].server_id, "soon");
    }
}
