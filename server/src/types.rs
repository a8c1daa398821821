use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub slack: Option<SlackIdentity>,
    #[serde(skip)]
    pub google_access_token: Option<String>,
    #[serde(skip)]
    pub google_refresh_token: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl User {
    pub fn slack_bot_token(&self) -> Option<&str> {
        self.slack
            .as_ref()
            .map(|identity| identity.bot_token.trim())
            .filter(|token| !token.is_empty())
    }
}

/// Messaging-platform identity linked to a user through the OAuth install flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlackIdentity {
    pub user_id: String,
    pub team_id: String,
    #[serde(skip_serializing)]
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub channel_id: String,
    pub channel_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    pub system_prompt: Option<String>,
    pub files_locked: bool,
    pub channel: Option<ChannelBinding>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    Human,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::Human => "human",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "human" => Some(MessageRole::Human),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External-message metadata carried by a message once it exists in the channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SlackMessageRef {
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
    pub synced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub role: MessageRole,
    pub text: String,
    pub user_id: Option<String>,
    #[serde(default)]
    pub slack: SlackMessageRef,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub chat_id: String,
    pub role: MessageRole,
    pub text: String,
    pub user_id: Option<String>,
    pub slack: SlackMessageRef,
}

impl NewMessage {
    pub fn human(chat_id: &str, user_id: &str, text: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            role: MessageRole::Human,
            text: text.to_string(),
            user_id: Some(user_id.to_string()),
            slack: SlackMessageRef::default(),
        }
    }

    pub fn assistant(chat_id: &str, text: &str) -> Self {
        Self {
            chat_id: chat_id.to_string(),
            role: MessageRole::Assistant,
            text: text.to_string(),
            user_id: None,
            slack: SlackMessageRef::default(),
        }
    }

    pub fn synced_from(mut self, ts: &str, thread_ts: Option<&str>) -> Self {
        self.slack = SlackMessageRef {
            ts: Some(ts.to_string()),
            thread_ts: thread_ts.map(str::to_string),
            synced: true,
        };
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRef {
    pub id: String,
    pub chat_id: String,
    pub document_id: String,
    pub name: String,
    pub mime_type: String,
    pub created_at: String,
}

impl DocumentRef {
    pub fn kind_label(&self) -> &'static str {
        match self.mime_type.as_str() {
            "application/vnd.google-apps.document" => "document",
            "application/vnd.google-apps.spreadsheet" => "spreadsheet",
            "application/vnd.google-apps.presentation" => "slide deck",
            _ => "file",
        }
    }
}
