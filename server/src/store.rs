//! Conversation, message and credential persistence.
//!
//! Handlers never touch a database directly; they receive an
//! `Arc<dyn ConversationStore>` through `AppState`. Both implementations
//! enforce the same uniqueness rules: one conversation per channel id and one
//! message per (conversation, external ts).

mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::types::{
    ChannelBinding, ChatMessage, Conversation, DocumentRef, NewMessage, SlackIdentity, User,
};

pub use postgres::PgStore;

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub document_id: String,
    pub name: String,
    pub mime_type: String,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates the user on first sign-in, otherwise refreshes the display name.
    async fn upsert_user_by_email(&self, email: &str, name: &str) -> Result<User, StoreError>;
    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn find_user_by_slack_id(&self, slack_user_id: &str)
        -> Result<Option<User>, StoreError>;
    async fn link_slack_identity(
        &self,
        user_id: &str,
        identity: &SlackIdentity,
    ) -> Result<(), StoreError>;
    async fn clear_slack_identity(&self, user_id: &str) -> Result<(), StoreError>;
    /// Stores a fresh grant. A `None` refresh token keeps the previously stored one.
    async fn store_google_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn create_conversation(
        &self,
        owner_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError>;
    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn find_conversation_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<Conversation>, StoreError>;
    async fn update_conversation(
        &self,
        chat_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError>;
    async fn set_files_locked(&self, chat_id: &str, locked: bool) -> Result<(), StoreError>;
    async fn delete_conversation(&self, chat_id: &str) -> Result<(), StoreError>;

    /// Stores `binding` only if the conversation has none yet and returns the
    /// binding that is stored afterwards, which may belong to another writer.
    async fn bind_channel(
        &self,
        chat_id: &str,
        binding: &ChannelBinding,
    ) -> Result<ChannelBinding, StoreError>;
    async fn set_channel_name(&self, chat_id: &str, channel_name: &str)
        -> Result<(), StoreError>;
    async fn clear_channel_binding(&self, chat_id: &str) -> Result<(), StoreError>;

    async fn list_documents(&self, chat_id: &str) -> Result<Vec<DocumentRef>, StoreError>;
    async fn attach_document(
        &self,
        chat_id: &str,
        document: &NewDocument,
    ) -> Result<DocumentRef, StoreError>;

    /// Fails with `StoreError::Conflict` when the external ts is already recorded
    /// in the conversation.
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;
    async fn find_message_by_slack_ts(
        &self,
        chat_id: &str,
        ts: &str,
    ) -> Result<Option<ChatMessage>, StoreError>;
    async fn mark_message_synced(
        &self,
        message_id: &str,
        ts: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), StoreError>;
    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    conversations: HashMap<String, Conversation>,
    documents: Vec<DocumentRef>,
    messages: Vec<ChatMessage>,
}

/// Process-local store used when no database is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(kind: &str, id: &str) -> StoreError {
    StoreError::NotFound(format!("{kind} {id}"))
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn upsert_user_by_email(&self, email: &str, name: &str) -> Result<User, StoreError> {
        let email = normalize_email(email);
        let mut state = self.state.write().await;
        if let Some(user) = state.users.values_mut().find(|user| user.email == email) {
            if !name.trim().is_empty() {
                user.name = name.trim().to_string();
            }
            user.updated_at = now_iso();
            return Ok(user.clone());
        }
        let now = now_iso();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email,
            name: name.trim().to_string(),
            slack: None,
            google_access_token: None,
            google_refresh_token: None,
            created_at: now.clone(),
            updated_at: now,
        };
        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let email = normalize_email(email);
        let state = self.state.read().await;
        Ok(state.users.values().find(|user| user.email == email).cloned())
    }

    async fn find_user_by_slack_id(
        &self,
        slack_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .users
            .values()
            .find(|user| {
                user.slack
                    .as_ref()
                    .is_some_and(|identity| identity.user_id == slack_user_id)
            })
            .cloned())
    }

    async fn link_slack_identity(
        &self,
        user_id: &str,
        identity: &SlackIdentity,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let taken = state.users.values().any(|user| {
            user.id != user_id
                && user
                    .slack
                    .as_ref()
                    .is_some_and(|linked| linked.user_id == identity.user_id)
        });
        if taken {
            return Err(StoreError::Conflict(format!(
                "slack user {} is linked to another account",
                identity.user_id
            )));
        }
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| missing("user", user_id))?;
        user.slack = Some(identity.clone());
        user.updated_at = now_iso();
        Ok(())
    }

    async fn clear_slack_identity(&self, user_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| missing("user", user_id))?;
        user.slack = None;
        user.updated_at = now_iso();
        Ok(())
    }

    async fn store_google_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(user_id)
            .ok_or_else(|| missing("user", user_id))?;
        user.google_access_token = Some(access_token.to_string());
        if let Some(refresh_token) = refresh_token {
            user.google_refresh_token = Some(refresh_token.to_string());
        }
        user.updated_at = now_iso();
        Ok(())
    }

    async fn create_conversation(
        &self,
        owner_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(owner_id) {
            return Err(missing("user", owner_id));
        }
        let now = now_iso();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: name.to_string(),
            system_prompt: system_prompt.map(str::to_string),
            files_locked: false,
            channel: None,
            created_at: now.clone(),
            updated_at: now,
        };
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.state.read().await.conversations.get(chat_id).cloned())
    }

    async fn find_conversation_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .conversations
            .values()
            .find(|conversation| {
                conversation
                    .channel
                    .as_ref()
                    .is_some_and(|binding| binding.channel_id == channel_id)
            })
            .cloned())
    }

    async fn update_conversation(
        &self,
        chat_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(chat_id)
            .ok_or_else(|| missing("conversation", chat_id))?;
        conversation.name = name.to_string();
        conversation.system_prompt = system_prompt.map(str::to_string);
        conversation.updated_at = now_iso();
        Ok(conversation.clone())
    }

    async fn set_files_locked(&self, chat_id: &str, locked: bool) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(chat_id)
            .ok_or_else(|| missing("conversation", chat_id))?;
        conversation.files_locked = locked;
        Ok(())
    }

    async fn delete_conversation(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if state.conversations.remove(chat_id).is_none() {
            return Err(missing("conversation", chat_id));
        }
        state.messages.retain(|message| message.chat_id != chat_id);
        state.documents.retain(|document| document.chat_id != chat_id);
        Ok(())
    }

    async fn bind_channel(
        &self,
        chat_id: &str,
        binding: &ChannelBinding,
    ) -> Result<ChannelBinding, StoreError> {
        let mut state = self.state.write().await;
        let claimed_elsewhere = state.conversations.values().any(|conversation| {
            conversation.id != chat_id
                && conversation
                    .channel
                    .as_ref()
                    .is_some_and(|existing| existing.channel_id == binding.channel_id)
        });
        if claimed_elsewhere {
            return Err(StoreError::Conflict(format!(
                "channel {} is bound to another conversation",
                binding.channel_id
            )));
        }
        let conversation = state
            .conversations
            .get_mut(chat_id)
            .ok_or_else(|| missing("conversation", chat_id))?;
        match &conversation.channel {
            Some(existing) => Ok(existing.clone()),
            None => {
                conversation.channel = Some(binding.clone());
                conversation.updated_at = now_iso();
                Ok(binding.clone())
            }
        }
    }

    async fn set_channel_name(
        &self,
        chat_id: &str,
        channel_name: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(chat_id)
            .ok_or_else(|| missing("conversation", chat_id))?;
        if let Some(binding) = conversation.channel.as_mut() {
            binding.channel_name = channel_name.to_string();
        }
        Ok(())
    }

    async fn clear_channel_binding(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let conversation = state
            .conversations
            .get_mut(chat_id)
            .ok_or_else(|| missing("conversation", chat_id))?;
        conversation.channel = None;
        Ok(())
    }

    async fn list_documents(&self, chat_id: &str) -> Result<Vec<DocumentRef>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .documents
            .iter()
            .filter(|document| document.chat_id == chat_id)
            .cloned()
            .collect())
    }

    async fn attach_document(
        &self,
        chat_id: &str,
        document: &NewDocument,
    ) -> Result<DocumentRef, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(chat_id) {
            return Err(missing("conversation", chat_id));
        }
        let record = DocumentRef {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.to_string(),
            document_id: document.document_id.clone(),
            name: document.name.clone(),
            mime_type: document.mime_type.clone(),
            created_at: now_iso(),
        };
        state.documents.push(record.clone());
        Ok(record)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut state = self.state.write().await;
        if !state.conversations.contains_key(&message.chat_id) {
            return Err(missing("conversation", &message.chat_id));
        }
        if let Some(ts) = message.slack.ts.as_deref() {
            let duplicate = state.messages.iter().any(|existing| {
                existing.chat_id == message.chat_id && existing.slack.ts.as_deref() == Some(ts)
            });
            if duplicate {
                return Err(StoreError::Conflict(format!("slack message {ts}")));
            }
        }
        let record = ChatMessage {
            id: Uuid::new_v4().to_string(),
            chat_id: message.chat_id,
            role: message.role,
            text: message.text,
            user_id: message.user_id,
            slack: message.slack,
            created_at: now_iso(),
        };
        state.messages.push(record.clone());
        Ok(record)
    }

    async fn find_message_by_slack_ts(
        &self,
        chat_id: &str,
        ts: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .find(|message| message.chat_id == chat_id && message.slack.ts.as_deref() == Some(ts))
            .cloned())
    }

    async fn mark_message_synced(
        &self,
        message_id: &str,
        ts: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let chat_id = state
            .messages
            .iter()
            .find(|message| message.id == message_id)
            .map(|message| message.chat_id.clone())
            .ok_or_else(|| missing("message", message_id))?;
        let duplicate = state.messages.iter().any(|message| {
            message.id != message_id
                && message.chat_id == chat_id
                && message.slack.ts.as_deref() == Some(ts)
        });
        if duplicate {
            return Err(StoreError::Conflict(format!("slack message {ts}")));
        }
        if let Some(message) = state
            .messages
            .iter_mut()
            .find(|message| message.id == message_id)
        {
            message.slack.ts = Some(ts.to_string());
            message.slack.thread_ts = thread_ts.map(str::to_string);
            message.slack.synced = true;
        }
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect())
    }
}
