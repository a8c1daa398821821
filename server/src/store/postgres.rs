use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Row};
use uuid::Uuid;

use super::{missing, normalize_email, now_iso, ConversationStore, NewDocument};
use crate::error::StoreError;
use crate::types::{
    ChannelBinding, ChatMessage, Conversation, DocumentRef, MessageRole, NewMessage,
    SlackIdentity, SlackMessageRef, User,
};

const USER_COLUMNS: &str = "id, email, name, slack_user_id, slack_team_id, slack_bot_token, \
     google_access_token, google_refresh_token, created_at, updated_at";
const CHAT_COLUMNS: &str = "id, owner_id, name, system_prompt, files_locked, slack_channel_id, \
     slack_channel_name, created_at, updated_at";
const MESSAGE_COLUMNS: &str =
    "id, chat_id, role, text, user_id, slack_ts, slack_thread_ts, synced, created_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn classify(err: sqlx::Error, what: &str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::Conflict(what.to_string())
        }
        _ => StoreError::Database(err),
    }
}

fn parse_user_row(row: PgRow) -> User {
    let slack_user_id = row.get::<Option<String>, _>("slack_user_id");
    let slack = slack_user_id.map(|user_id| SlackIdentity {
        user_id,
        team_id: row
            .get::<Option<String>, _>("slack_team_id")
            .unwrap_or_default(),
        bot_token: row
            .get::<Option<String>, _>("slack_bot_token")
            .unwrap_or_default(),
    });
    User {
        id: row.get("id"),
        email: row.get("email"),
        name: row.get("name"),
        slack,
        google_access_token: row.get("google_access_token"),
        google_refresh_token: row.get("google_refresh_token"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_chat_row(row: PgRow) -> Conversation {
    let channel_id = row.get::<Option<String>, _>("slack_channel_id");
    let channel = channel_id.map(|channel_id| ChannelBinding {
        channel_id,
        channel_name: row
            .get::<Option<String>, _>("slack_channel_name")
            .unwrap_or_default(),
    });
    Conversation {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        system_prompt: row.get("system_prompt"),
        files_locked: row.get("files_locked"),
        channel,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_message_row(row: PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        role: MessageRole::parse(&row.get::<String, _>("role")).unwrap_or(MessageRole::Human),
        text: row.get("text"),
        user_id: row.get("user_id"),
        slack: SlackMessageRef {
            ts: row.get("slack_ts"),
            thread_ts: row.get("slack_thread_ts"),
            synced: row.get("synced"),
        },
        created_at: row.get("created_at"),
    }
}

fn parse_document_row(row: PgRow) -> DocumentRef {
    DocumentRef {
        id: row.get("id"),
        chat_id: row.get("chat_id"),
        document_id: row.get("document_id"),
        name: row.get("name"),
        mime_type: row.get("mime_type"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl ConversationStore for PgStore {
    async fn upsert_user_by_email(&self, email: &str, name: &str) -> Result<User, StoreError> {
        let now = now_iso();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO users (id, email, name, created_at, updated_at)
            VALUES ($1,$2,$3,$4,$4)
            ON CONFLICT (email) DO UPDATE SET
                name = CASE WHEN EXCLUDED.name <> '' THEN EXCLUDED.name ELSE users.name END,
                updated_at = EXCLUDED.updated_at
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(normalize_email(email))
        .bind(name.trim())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_user_row(row))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(parse_user_row))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1"))
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(parse_user_row))
    }

    async fn find_user_by_slack_id(
        &self,
        slack_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE slack_user_id = $1"
        ))
        .bind(slack_user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_user_row))
    }

    async fn link_slack_identity(
        &self,
        user_id: &str,
        identity: &SlackIdentity,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET slack_user_id = $2, slack_team_id = $3, slack_bot_token = $4, updated_at = $5 WHERE id = $1",
        )
        .bind(user_id)
        .bind(&identity.user_id)
        .bind(&identity.team_id)
        .bind(&identity.bot_token)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            classify(
                err,
                &format!("slack user {} is linked to another account", identity.user_id),
            )
        })?;
        if result.rows_affected() == 0 {
            return Err(missing("user", user_id));
        }
        Ok(())
    }

    async fn clear_slack_identity(&self, user_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET slack_user_id = NULL, slack_team_id = NULL, slack_bot_token = NULL, updated_at = $2 WHERE id = $1",
        )
        .bind(user_id)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(missing("user", user_id));
        }
        Ok(())
    }

    async fn store_google_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE users SET google_access_token = $2, google_refresh_token = COALESCE($3, google_refresh_token), updated_at = $4 WHERE id = $1",
        )
        .bind(user_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(now_iso())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(missing("user", user_id));
        }
        Ok(())
    }

    async fn create_conversation(
        &self,
        owner_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let now = now_iso();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO chats (id, owner_id, name, system_prompt, files_locked, created_at, updated_at)
            VALUES ($1,$2,$3,$4,FALSE,$5,$5)
            RETURNING {CHAT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(owner_id)
        .bind(name)
        .bind(system_prompt)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_chat_row(row))
    }

    async fn get_conversation(&self, chat_id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1"))
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(parse_chat_row))
    }

    async fn find_conversation_by_channel(
        &self,
        channel_id: &str,
    ) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE slack_channel_id = $1"
        ))
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_chat_row))
    }

    async fn update_conversation(
        &self,
        chat_id: &str,
        name: &str,
        system_prompt: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE chats SET name = $2, system_prompt = $3, updated_at = $4 WHERE id = $1 RETURNING {CHAT_COLUMNS}"
        ))
        .bind(chat_id)
        .bind(name)
        .bind(system_prompt)
        .bind(now_iso())
        .fetch_optional(&self.pool)
        .await?;
        row.map(parse_chat_row)
            .ok_or_else(|| missing("conversation", chat_id))
    }

    async fn set_files_locked(&self, chat_id: &str, locked: bool) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE chats SET files_locked = $2 WHERE id = $1")
            .bind(chat_id)
            .bind(locked)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(missing("conversation", chat_id));
        }
        Ok(())
    }

    async fn delete_conversation(&self, chat_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM chats WHERE id = $1")
            .bind(chat_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(missing("conversation", chat_id));
        }
        Ok(())
    }

    async fn bind_channel(
        &self,
        chat_id: &str,
        binding: &ChannelBinding,
    ) -> Result<ChannelBinding, StoreError> {
        sqlx::query(
            "UPDATE chats SET slack_channel_id = $2, slack_channel_name = $3, updated_at = $4 \
             WHERE id = $1 AND slack_channel_id IS NULL",
        )
        .bind(chat_id)
        .bind(&binding.channel_id)
        .bind(&binding.channel_name)
        .bind(now_iso())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            classify(
                err,
                &format!("channel {} is bound to another conversation", binding.channel_id),
            )
        })?;

        let row = sqlx::query("SELECT slack_channel_id, slack_channel_name FROM chats WHERE id = $1")
            .bind(chat_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| missing("conversation", chat_id))?;
        let channel_id = row
            .get::<Option<String>, _>("slack_channel_id")
            .ok_or_else(|| StoreError::Conflict(format!("binding for {chat_id} was cleared")))?;
        Ok(ChannelBinding {
            channel_id,
            channel_name: row
                .get::<Option<String>, _>("slack_channel_name")
                .unwrap_or_default(),
        })
    }

    async fn set_channel_name(
        &self,
        chat_id: &str,
        channel_name: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE chats SET slack_channel_name = $2 WHERE id = $1 AND slack_channel_id IS NOT NULL",
        )
        .bind(chat_id)
        .bind(channel_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_channel_binding(&self, chat_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE chats SET slack_channel_id = NULL, slack_channel_name = NULL WHERE id = $1",
        )
        .bind(chat_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_documents(&self, chat_id: &str) -> Result<Vec<DocumentRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, chat_id, document_id, name, mime_type, created_at FROM chat_documents WHERE chat_id = $1 ORDER BY created_at ASC",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_document_row).collect())
    }

    async fn attach_document(
        &self,
        chat_id: &str,
        document: &NewDocument,
    ) -> Result<DocumentRef, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO chat_documents (id, chat_id, document_id, name, mime_type, created_at)
            VALUES ($1,$2,$3,$4,$5,$6)
            RETURNING id, chat_id, document_id, name, mime_type, created_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(chat_id)
        .bind(&document.document_id)
        .bind(&document.name)
        .bind(&document.mime_type)
        .bind(now_iso())
        .fetch_one(&self.pool)
        .await?;
        Ok(parse_document_row(row))
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let duplicate = message
            .slack
            .ts
            .as_deref()
            .map(|ts| format!("slack message {ts}"))
            .unwrap_or_else(|| "message".to_string());
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO chat_messages (id, chat_id, role, text, user_id, slack_ts, slack_thread_ts, synced, created_at)
            VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
            RETURNING {MESSAGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&message.chat_id)
        .bind(message.role.as_str())
        .bind(&message.text)
        .bind(&message.user_id)
        .bind(&message.slack.ts)
        .bind(&message.slack.thread_ts)
        .bind(message.slack.synced)
        .bind(now_iso())
        .fetch_one(&self.pool)
        .await
        .map_err(|err| classify(err, &duplicate))?;
        Ok(parse_message_row(row))
    }

    async fn find_message_by_slack_ts(
        &self,
        chat_id: &str,
        ts: &str,
    ) -> Result<Option<ChatMessage>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = $1 AND slack_ts = $2"
        ))
        .bind(chat_id)
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(parse_message_row))
    }

    async fn mark_message_synced(
        &self,
        message_id: &str,
        ts: &str,
        thread_ts: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE chat_messages SET slack_ts = $2, slack_thread_ts = $3, synced = TRUE WHERE id = $1",
        )
        .bind(message_id)
        .bind(ts)
        .bind(thread_ts)
        .execute(&self.pool)
        .await
        .map_err(|err| classify(err, &format!("slack message {ts}")))?;
        if result.rows_affected() == 0 {
            return Err(missing("message", message_id));
        }
        Ok(())
    }

    async fn list_messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE chat_id = $1 ORDER BY seq ASC"
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(parse_message_row).collect())
    }
}
