use capa_shared::error::CommonError;
use capa_shared::types::OAuth2ServerConfig;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;
use url::Url;

#[derive(Debug, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
    #[serde(default)]
    scopes_supported: Option<Vec<String>>,
    #[serde(default)]
    grant_types_supported: Option<Vec<String>>,
    #[serde(default)]
    response_types_supported: Option<Vec<String>>,
}

impl AuthorizationServerMetadata {
    fn supports_authorization_code(&self) -> bool {
        let grant_ok = self
            .grant_types_supported
            .as_ref()
            .map(|grants| grants.iter().any(|g| g == "authorization_code"))
            .unwrap_or(true);
        let response_ok = self
            .response_types_supported
            .as_ref()
            .map(|responses| responses.iter().any(|r| r == "code"))
            .unwrap_or(true);
        grant_ok && response_ok
    }
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

/// `detectOAuth2Requirement`: probes `server_url` unauthenticated and, on a 401,
/// walks RFC 8414 / RFC 9728 discovery to build an [`OAuth2ServerConfig`]. Returns
/// `None` if the server doesn't require OAuth2 or its metadata can't be resolved —
/// discovery failures are not fatal ("Discovery errors").
pub async fn detect_oauth2_requirement(
    http: &reqwest::Client,
    server_url: &str,
) -> Result<Option<OAuth2ServerConfig>, CommonError> {
    let probe = http
        .post(server_url)
        .header("content-type", "application/json")
        .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "id": 0,
                "method": "initialize",
                "params": {},
    }))
        .send()
        .await;

    let response = match probe {
        Ok(response) => response,
        Err(e) => {
            debug!(server_url, error = %e, "oauth2 discovery probe failed");
            return Ok(None);
        }
    };

    if response.status().as_u16() != 401 {
        return Ok(None);
    }

    let www_authenticate = response
        .headers()
        .get("www-authenticate")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let base_url = base_url_of(server_url)?;

    let metadata = if let Some(header) = www_authenticate.as_deref() {
        if let Some(resource_metadata_url) = extract_resource_metadata_url(header) {
            match fetch_protected_resource_metadata(http, &resource_metadata_url).await {
                Ok(Some(resource_metadata)) => {
                    let mut resolved = None;
                    for server in &resource_metadata.authorization_servers {
                        if let Ok(Some(m)) = fetch_authorization_server_metadata(http, server).await {
                            resolved = Some(m);
                            break;
                        }
                    }
                    resolved
                }
                _ => fetch_authorization_server_metadata(http, &base_url).await.ok().flatten(),
            }
        } else {
            fetch_authorization_server_metadata(http, &base_url).await.ok().flatten()
        }
    } else {
        fetch_authorization_server_metadata(http, &base_url).await.ok().flatten()
    };

    let Some(metadata) = metadata else {
        return Ok(None);
    };

    if !metadata.supports_authorization_code() {
        return Ok(None);
    }

    Ok(Some(OAuth2ServerConfig {
                authorization_endpoint: metadata.authorization_endpoint,
                token_endpoint: metadata.token_endpoint,
                resource_server: server_url.to_string(),
                registration_endpoint: metadata.registration_endpoint,
                scope: metadata.scopes_supported.map(|scopes| scopes.join(" ")),
                client_id: None,
    }))
}

fn base_url_of(server_url: &str) -> Result<String, CommonError> {
    let parsed = Url::parse(server_url)?;
    Ok(format!(
            "{}://{}{}",
            parsed.scheme(),
            parsed.host_str().unwrap_or_default(),
            parsed
                .port()
                .map(|p| format!(":{p}"))
                .unwrap_or_default(),
    ))
}

/// Extracts `resource_metadata="..."` from a `WWW-Authenticate` header value (RFC 9728).
fn extract_resource_metadata_url(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
            let part = part.trim();
            part.strip_prefix("resource_metadata=\"")
                .and_then(|rest| rest.strip_suffix('"'))
                .map(str::to_string)
    })
}

async fn fetch_authorization_server_metadata(
    http: &reqwest::Client,
    base_url: &str,
) -> Result<Option<AuthorizationServerMetadata>, CommonError> {
    let url = format!(
        "{}/.well-known/oauth-authorization-server",
        base_url.trim_end_matches('/')
    );
    let response = match http.get(&url).send().await {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };
    if !response.status().is_success() {
        return Ok(None);
    }
    match response.json::<AuthorizationServerMetadata>().await {
        Ok(metadata) => Ok(Some(metadata)),
        Err(_) => Ok(None),
    }
}

async fn fetch_protected_resource_metadata(
    http: &reqwest::Client,
    resource_metadata_url: &str,
) -> Result<Option<ProtectedResourceMetadata>, CommonError> {
    let response = match http.get(resource_metadata_url).send().await {
        Ok(r) => r,
        Err(_) => return Ok(None),
    };
    if !response.status().is_success() {
        return Ok(None);
    }
    match response.json::<Value>().await {
        Ok(value) => Ok(serde_json::from_value(value).ok()),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_resource_metadata_url_from_header() {
        let header = r#"Bearer resource_metadata="https://example.com/.well-known/oauth-protected-resource""#;
        assert_eq!(
            extract_resource_metadata_url(header),
            Some("https://example.com/.well-known/oauth-protected-resource".to_string())
        );
    }

    #[test]
    fn returns_none_without_resource_metadata() {
        assert_eq!(extract_resource_metadata_url("Bearer realm=\"mcp\""), None);
    }

    #[test]
    fn metadata_requires_authorization_code_support() {
        let metadata = AuthorizationServerMetadata {
            authorization_endpoint: "https://example.com/authorize".into(),
            token_endpoint: "https://example.com/token".into(),
            registration_endpoint: None,
            scopes_supported: None,
            grant_types_supported: Some(vec!["client_credentials".to_string()]),
            response_types_supported: None,
        };
        assert!(!metadata.supports_authorization_code());
    }
}
