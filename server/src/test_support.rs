use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use httpmock::MockServer;

use crate::answer::{CompletionClient, DocumentFetcher};
use crate::app::AppState;
use crate::config::AppConfig;
use crate::error::CompletionError;
use crate::store::{MemoryStore, NewDocument};
use crate::types::{Conversation, DocumentRef, SlackIdentity, User};

pub const SIGNING_SECRET: &str = "test-signing-secret";

/// Completion stub that records every prompt it receives.
#[derive(Default)]
pub struct RecordingCompletion {
    answer: Option<String>,
    prompts: Mutex<Vec<String>>,
}

impl RecordingCompletion {
    pub fn answering(answer: &str) -> Arc<Self> {
        Arc::new(Self {
            answer: Some(answer.to_string()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }
}

#[async_trait]
impl CompletionClient for RecordingCompletion {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        self.answer
            .clone()
            .ok_or_else(|| CompletionError::Service("stub outage".to_string()))
    }
}

/// Serves canned document text keyed by document id.
#[derive(Default)]
pub struct StaticFetcher {
    texts: HashMap<String, Result<String, String>>,
}

impl StaticFetcher {
    pub fn with(mut self, document_id: &str, text: Result<&str, &str>) -> Self {
        self.texts.insert(
            document_id.to_string(),
            text.map(str::to_string).map_err(str::to_string),
        );
        self
    }
}

#[async_trait]
impl DocumentFetcher for StaticFetcher {
    async fn fetch_text(
        &self,
        _access_token: &str,
        document: &DocumentRef,
    ) -> Result<String, String> {
        self.texts
            .get(&document.document_id)
            .cloned()
            .unwrap_or_else(|| Err("not found".to_string()))
    }
}

pub fn test_config(server: &MockServer) -> AppConfig {
    let mut config = AppConfig::default();
    config.slack.signing_secret = SIGNING_SECRET.to_string();
    config.slack.client_id = "slack-client".to_string();
    config.slack.client_secret = "slack-secret".to_string();
    config.slack.api_base = server.base_url();
    config.google.client_id = "google-client".to_string();
    config.google.client_secret = "google-secret".to_string();
    config.google.token_url = server.url("/token");
    config.google.userinfo_url = server.url("/userinfo");
    config.google.drive_base = server.url("/drive/v3");
    config
}

pub fn test_state_with(
    server: &MockServer,
    completion: Arc<dyn CompletionClient>,
    fetcher: Arc<dyn DocumentFetcher>,
) -> Arc<AppState> {
    Arc::new(
        AppState::new(
            test_config(server),
            Arc::new(MemoryStore::new()),
            completion,
            fetcher,
        )
        .expect("state"),
    )
}

pub fn test_state(server: &MockServer) -> Arc<AppState> {
    test_state_with(
        server,
        RecordingCompletion::answering("stub answer"),
        Arc::new(StaticFetcher::default()),
    )
}

/// A user with a linked Slack identity and, optionally, a stored refresh token.
pub async fn seed_owner(state: &AppState, slack_user_id: &str, refresh_token: Option<&str>) -> User {
    let email = format!("{}@example.com", slack_user_id.to_ascii_lowercase());
    let user = state
        .store
        .upsert_user_by_email(&email, slack_user_id)
        .await
        .expect("user");
    state
        .store
        .link_slack_identity(
            &user.id,
            &SlackIdentity {
                user_id: slack_user_id.to_string(),
                team_id: "T1".to_string(),
                bot_token: format!("xoxb-{}", slack_user_id.to_ascii_lowercase()),
            },
        )
        .await
        .expect("link");
    if let Some(refresh_token) = refresh_token {
        state
            .store
            .store_google_tokens(&user.id, "stale-access", Some(refresh_token))
            .await
            .expect("tokens");
    }
    state
        .store
        .get_user(&user.id)
        .await
        .expect("get")
        .expect("user")
}

pub async fn seed_conversation(state: &AppState, owner: &User, name: &str) -> Conversation {
    state
        .store
        .create_conversation(&owner.id, name, None)
        .await
        .expect("conversation")
}

pub async fn attach(state: &AppState, conversation: &Conversation, document_id: &str, name: &str) {
    state
        .store
        .attach_document(
            &conversation.id,
            &NewDocument {
                document_id: document_id.to_string(),
                name: name.to_string(),
                mime_type: "application/vnd.google-apps.spreadsheet".to_string(),
            },
        )
        .await
        .expect("attach");
}
