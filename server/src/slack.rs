//! Slack Web API client.
//!
//! Each call carries the acting user's bot token; the client itself only owns
//! the HTTP connection pool and base URL. Error codes are decoded into
//! [`SlackError`] right after the response is read. There is no retry loop:
//! callers decide whether a failure matters.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SlackError;

#[derive(Debug, Clone, Deserialize)]
struct SlackEnvelope {
    ok: bool,
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackChannel {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChannelResponse {
    channel: Option<SlackChannel>,
}

#[derive(Debug, Clone, Deserialize)]
struct PostMessageResponse {
    ts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserInfoResponse {
    user: Option<UserInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct UserInfo {
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: UserProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct UserProfile {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SlackUserProfile {
    pub email: Option<String>,
    pub real_name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthAccessResponse {
    access_token: Option<String>,
    team: Option<OAuthTeam>,
    authed_user: Option<OAuthAuthedUser>,
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTeam {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthAuthedUser {
    id: String,
}

/// Result of the `oauth.v2.access` code exchange.
#[derive(Debug, Clone)]
pub struct SlackOAuthGrant {
    pub bot_token: String,
    pub team_id: String,
    pub user_id: String,
}

#[derive(Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
}

impl SlackApiClient {
    pub fn new(api_base: &str) -> Result<Self, reqwest::Error> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("esme-slack-sync"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn create_private_channel(
        &self,
        token: &str,
        name: &str,
    ) -> Result<SlackChannel, SlackError> {
        let response: ChannelResponse = self
            .call(
                "conversations.create",
                token,
                json!({ "name": name, "is_private": true }),
            )
            .await?;
        response.channel.ok_or_else(|| SlackError::Decode {
            operation: "conversations.create".to_string(),
            detail: "missing channel".to_string(),
        })
    }

    pub async fn set_topic(&self, token: &str, channel: &str, topic: &str) -> Result<(), SlackError> {
        self.call::<Value>(
            "conversations.setTopic",
            token,
            json!({ "channel": channel, "topic": topic }),
        )
        .await
        .map(|_| ())
    }

    pub async fn invite_user(&self, token: &str, channel: &str, user: &str) -> Result<(), SlackError> {
        self.call::<Value>(
            "conversations.invite",
            token,
            json!({ "channel": channel, "users": user }),
        )
        .await
        .map(|_| ())
    }

    pub async fn rename_channel(
        &self,
        token: &str,
        channel: &str,
        name: &str,
    ) -> Result<SlackChannel, SlackError> {
        let response: ChannelResponse = self
            .call(
                "conversations.rename",
                token,
                json!({ "channel": channel, "name": name }),
            )
            .await?;
        Ok(response.channel.unwrap_or_else(|| SlackChannel {
            id: channel.to_string(),
            name: name.to_string(),
        }))
    }

    pub async fn archive_channel(&self, token: &str, channel: &str) -> Result<(), SlackError> {
        self.call::<Value>("conversations.archive", token, json!({ "channel": channel }))
            .await
            .map(|_| ())
    }

    /// Posts `text` and returns the platform-assigned message ts.
    pub async fn post_message(
        &self,
        token: &str,
        channel: &str,
        text: &str,
        thread_ts: Option<&str>,
        blocks: Option<Value>,
    ) -> Result<String, SlackError> {
        let mut payload = json!({
            "channel": channel,
            "text": text,
            "unfurl_links": false,
            "unfurl_media": false,
        });
        if let Some(thread_ts) = thread_ts.map(str::trim).filter(|value| !value.is_empty()) {
            payload["thread_ts"] = Value::String(thread_ts.to_string());
        }
        if let Some(blocks) = blocks {
            payload["blocks"] = blocks;
        }
        let response: PostMessageResponse = self.call("chat.postMessage", token, payload).await?;
        response
            .ts
            .filter(|ts| !ts.trim().is_empty())
            .ok_or_else(|| SlackError::Decode {
                operation: "chat.postMessage".to_string(),
                detail: "missing ts".to_string(),
            })
    }

    pub async fn user_profile(
        &self,
        token: &str,
        user: &str,
    ) -> Result<SlackUserProfile, SlackError> {
        const OPERATION: &str = "users.info";
        let response = self
            .http
            .get(format!("{}/{OPERATION}", self.api_base))
            .bearer_auth(token)
            .query(&[("user", user)])
            .send()
            .await
            .map_err(|source| transport(OPERATION, source))?;
        let info: UserInfoResponse = decode(OPERATION, response).await?;
        let user = info.user.ok_or_else(|| SlackError::Decode {
            operation: OPERATION.to_string(),
            detail: "missing user".to_string(),
        })?;
        Ok(SlackUserProfile {
            email: user.profile.email.filter(|email| !email.trim().is_empty()),
            real_name: user
                .profile
                .real_name
                .or(user.real_name)
                .unwrap_or_default(),
        })
    }

    pub async fn oauth_access(
        &self,
        client_id: &str,
        client_secret: &str,
        code: &str,
        redirect_uri: &str,
    ) -> Result<SlackOAuthGrant, SlackError> {
        const OPERATION: &str = "oauth.v2.access";
        let mut form = vec![
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
        ];
        if !redirect_uri.is_empty() {
            form.push(("redirect_uri", redirect_uri));
        }
        let response = self
            .http
            .post(format!("{}/{OPERATION}", self.api_base))
            .form(&form)
            .send()
            .await
            .map_err(|source| transport(OPERATION, source))?;
        let grant: OAuthAccessResponse = decode(OPERATION, response).await?;
        let missing = |field: &str| SlackError::Decode {
            operation: OPERATION.to_string(),
            detail: format!("missing {field}"),
        };
        Ok(SlackOAuthGrant {
            bot_token: grant.access_token.ok_or_else(|| missing("access_token"))?,
            team_id: grant.team.map(|team| team.id).ok_or_else(|| missing("team"))?,
            user_id: grant
                .authed_user
                .map(|user| user.id)
                .ok_or_else(|| missing("authed_user"))?,
        })
    }

    /// Delivers a delayed slash-command reply to the `response_url` Slack handed us.
    pub async fn respond(&self, response_url: &str, payload: &Value) -> Result<(), SlackError> {
        const OPERATION: &str = "response_url";
        let response = self
            .http
            .post(response_url)
            .json(payload)
            .send()
            .await
            .map_err(|source| transport(OPERATION, source))?;
        if !response.status().is_success() {
            return Err(SlackError::Api {
                operation: OPERATION.to_string(),
                code: format!("http_{}", response.status().as_u16()),
            });
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        token: &str,
        payload: Value,
    ) -> Result<T, SlackError> {
        let response = self
            .http
            .post(format!("{}/{operation}", self.api_base))
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|source| transport(operation, source))?;
        decode(operation, response).await
    }
}

fn transport(operation: &str, source: reqwest::Error) -> SlackError {
    SlackError::Transport {
        operation: operation.to_string(),
        source,
    }
}

async fn decode<T: DeserializeOwned>(
    operation: &str,
    response: reqwest::Response,
) -> Result<T, SlackError> {
    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .map_err(|source| transport(operation, source))?;
    let envelope: SlackEnvelope =
        serde_json::from_value(body.clone()).map_err(|err| SlackError::Decode {
            operation: operation.to_string(),
            detail: format!("status {status}: {err}"),
        })?;
    if !envelope.ok {
        let code = envelope.error.unwrap_or_else(|| "unknown_error".to_string());
        return Err(SlackError::from_code(operation, &code));
    }
    serde_json::from_value(body).map_err(|err| SlackError::Decode {
        operation: operation.to_string(),
        detail: err.to_string(),
    })
}
