use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::error::{PipelineError, Result};
use super::ports::{RefreshedToken, TokenRefresher};
use super::providers::ConnectorDef;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth application registered with a connector's provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

/// Refreshes rotating connector tokens with the `refresh_token` grant.
pub struct OAuthRefresher {
    client: reqwest::Client,
    clients: BTreeMap<String, OAuthClient>,
}

impl OAuthRefresher {
    pub fn new(clients: BTreeMap<String, OAuthClient>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::Refresh(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self { client, clients })
    }
}

fn parse_token_response(body: &str, now: i64) -> Result<RefreshedToken> {
    let token: TokenResponse = serde_json::from_str(body)
        .map_err(|e| PipelineError::Refresh(format!("Failed to parse token response: {}", e)))?;

    if let Some(error) = token.error {
        let desc = token.error_description.unwrap_or_default();
        return Err(PipelineError::Refresh(format!("OAuth error: {} - {}", error, desc)));
    }

    let access_token = token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| PipelineError::Refresh("No access_token in response".to_string()))?;
    Ok(RefreshedToken {
        access_token,
        refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        expires_at: token.expires_in.map(|secs| now + secs),
    })
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, connector: &ConnectorDef, refresh_token: &str) -> Result<RefreshedToken> {
        let token_url = connector.token_url.as_deref().ok_or_else(|| {
            PipelineError::Refresh(format!("Connector '{}' does not rotate tokens", connector.id))
        })?;
        let app = self.clients.get(&connector.id).ok_or_else(|| {
            PipelineError::Refresh(format!(
                "No OAuth client configured for connector '{}'",
                connector.id
            ))
        })?;

        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.as_str()),
        ];

        let response = self
            .client
            .post(token_url)
            .header("Accept", "application/json")
            .form(&params)
            .send()
            .await
            .map_err(|e| PipelineError::Refresh(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PipelineError::Refresh(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(PipelineError::Refresh(format!(
                "Token refresh for '{}' failed (HTTP {})",
                connector.id, status
            )));
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let refreshed = parse_token_response(&body, now)?;
        debug!(
            connector = %connector.id,
            rotated = refreshed.refresh_token.is_some(),
            "Token endpoint returned a new access token"
        );
        Ok(refreshed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_expiry_and_rotation() {
        let token = parse_token_response(
            r#"{"access_token":"gho_new","refresh_token":"ghr_next","expires_in":3600}"#,
            1_000,
        )
        .unwrap();
        assert_eq!(token.access_token, "gho_new");
        assert_eq!(token.refresh_token.as_deref(), Some("ghr_next"));
        assert_eq!(token.expires_at, Some(4_600));
    }

    #[test]
    fn oauth_error_bodies_are_refresh_errors() {
        let err = parse_token_response(
            r#"{"error":"bad_refresh_token","error_description":"expired"}"#,
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("bad_refresh_token"));
        assert!(parse_token_response(r#"{"token_type":"bearer"}"#, 0).is_err());
    }

    #[tokio::test]
    async fn unconfigured_connector_fails_without_network() {
        let refresher = OAuthRefresher::new(BTreeMap::new(), Duration::from_secs(1)).unwrap();
        let connector = ConnectorDef {
            id: "github".into(),
            secrets: BTreeMap::new(),
            token_url: Some("https://github.com/login/oauth/access_token".into()),
        };
        let err = refresher.refresh(&connector, "r").await.unwrap_err();
        assert!(err.to_string().contains("No OAuth client configured"));

        let static_connector = ConnectorDef {
            token_url: None,
            ..connector
        };
        let err = refresher.refresh(&static_connector, "r").await.unwrap_err();
        assert!(err.to_string().contains("does not rotate"));
    }
}
