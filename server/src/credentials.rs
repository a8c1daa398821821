//! Document-suite OAuth: authorization-code sign-in and refresh-token grants.
//!
//! Access tokens are never cached with an expiry; every call path that has
//! no interactive session refreshes on demand and writes the new token back
//! for the interactive paths to reuse.

use std::time::Duration;

use serde::Deserialize;

use crate::config::GoogleConfig;
use crate::error::TokenError;
use crate::store::ConversationStore;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GoogleGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleIdentity {
    pub email: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone)]
pub struct DocumentOAuth {
    http: reqwest::Client,
    config: GoogleConfig,
}

impl DocumentOAuth {
    pub fn new(config: GoogleConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self { http, config })
    }

    fn configured(&self) -> Result<(), TokenError> {
        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            return Err(TokenError::NotConfigured);
        }
        Ok(())
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<String, TokenError> {
        self.configured()?;
        let grant = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("client_id", &self.config.client_id),
                ("client_secret", &self.config.client_secret),
                ("refresh_token", refresh_token),
            ])
            .await?;
        Ok(grant.access_token)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<GoogleGrant, TokenError> {
        self.configured()?;
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("client_id", &self.config.client_id),
            ("client_secret", &self.config.client_secret),
            ("redirect_uri", &self.config.redirect_uri),
            ("code", code),
        ])
        .await
    }

    pub async fn identity(&self, access_token: &str) -> Result<GoogleIdentity, TokenError> {
        let response = self
            .http
            .get(&self.config.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TokenError::RefreshFailed(format!(
                "userinfo returned {}",
                response.status()
            )));
        }
        Ok(response.json::<GoogleIdentity>().await?)
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<GoogleGrant, TokenError> {
        let response = self
            .http
            .post(&self.config.token_url)
            .form(params)
            .send()
            .await?;
        let status = response.status();
        let payload = response.json::<TokenResponse>().await?;
        if !status.is_success() || payload.error.is_some() {
            let code = payload.error.unwrap_or_else(|| format!("http_{}", status.as_u16()));
            let detail = match payload.error_description {
                Some(description) => format!("{code}: {description}"),
                None => code,
            };
            return Err(TokenError::RefreshFailed(detail));
        }
        let access_token = payload
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| TokenError::RefreshFailed("response missing access_token".to_string()))?;
        Ok(GoogleGrant {
            access_token,
            refresh_token: payload.refresh_token,
        })
    }
}

/// Exchanges the user's stored refresh token for a new access token and
/// persists it.
pub async fn fresh_access_token(
    store: &dyn ConversationStore,
    oauth: &DocumentOAuth,
    user_id: &str,
) -> Result<String, TokenError> {
    let user = store
        .get_user(user_id)
        .await?
        .ok_or(TokenError::NoRefreshToken)?;
    let refresh_token = user
        .google_refresh_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(TokenError::NoRefreshToken)?;

    let access_token = oauth.refresh(refresh_token).await?;
    store
        .store_google_tokens(user_id, &access_token, None)
        .await?;
    tracing::debug!(user_id, "refreshed document access token");
    Ok(access_token)
}

#[cfg(test)]
mod tests {
    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn oauth_for(server: &MockServer) -> DocumentOAuth {
        DocumentOAuth::new(GoogleConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "http://localhost/auth/google/callback".to_string(),
            token_url: server.url("/token"),
            userinfo_url: server.url("/userinfo"),
            drive_base: server.url("/drive/v3"),
        })
        .expect("oauth client")
    }

    #[tokio::test]
    async fn refresh_persists_new_access_token() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body_includes("grant_type=refresh_token")
                .body_includes("refresh_token=rt-1");
            then.status(200)
                .json_body(json!({"access_token": "at-2", "expires_in": 3599}));
        });
        let store = MemoryStore::new();
        let user = store
            .upsert_user_by_email("owner@example.com", "Owner")
            .await
            .expect("user");
        store
            .store_google_tokens(&user.id, "at-1", Some("rt-1"))
            .await
            .expect("tokens");

        let oauth = oauth_for(&server);
        let fresh = fresh_access_token(&store, &oauth, &user.id)
            .await
            .expect("refresh");
        assert_eq!(fresh, "at-2");
        token.assert_calls(1);

        let stored = store.get_user(&user.id).await.expect("get").expect("user");
        assert_eq!(stored.google_access_token.as_deref(), Some("at-2"));
        assert_eq!(stored.google_refresh_token.as_deref(), Some("rt-1"));

        fresh_access_token(&store, &oauth, &user.id)
            .await
            .expect("second refresh");
        token.assert_calls(2);
    }

    #[tokio::test]
    async fn missing_refresh_token_is_reported_without_calling_provider() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(200).json_body(json!({"access_token": "unused"}));
        });
        let store = MemoryStore::new();
        let user = store
            .upsert_user_by_email("owner@example.com", "Owner")
            .await
            .expect("user");

        let err = fresh_access_token(&store, &oauth_for(&server), &user.id)
            .await
            .expect_err("no refresh token");
        assert!(matches!(err, TokenError::NoRefreshToken));
        token.assert_calls(0);
    }

    #[tokio::test]
    async fn revoked_grant_surfaces_provider_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).json_body(json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            }));
        });
        let store = MemoryStore::new();
        let user = store
            .upsert_user_by_email("owner@example.com", "Owner")
            .await
            .expect("user");
        store
            .store_google_tokens(&user.id, "at-1", Some("rt-revoked"))
            .await
            .expect("tokens");

        let err = fresh_access_token(&store, &oauth_for(&server), &user.id)
            .await
            .expect_err("revoked");
        match err {
            TokenError::RefreshFailed(detail) => assert!(detail.starts_with("invalid_grant")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
