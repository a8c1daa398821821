//! Hooks run by the conversation rename and delete routes. Channel failures
//! are logged here and never reach the caller.

use crate::app::AppState;
use crate::channels::{self, ArchiveResult, RenameResult};
use crate::error::SyncError;
use crate::types::Conversation;

pub async fn on_conversation_renamed(
    state: &AppState,
    before: &Conversation,
    after: &Conversation,
) -> Option<RenameResult> {
    if before.name == after.name || after.channel.is_none() {
        return None;
    }
    match channels::rename(state, after).await {
        Ok(result) => {
            if result.changed {
                tracing::info!(
                    chat_id = %after.id,
                    channel_name = ?result.final_name,
                    "channel renamed"
                );
            }
            Some(result)
        }
        Err(err) => {
            log_mirror_failure(&after.id, "rename", &err);
            None
        }
    }
}

/// Must run before the conversation row is deleted so the binding is still readable.
pub async fn before_conversation_deleted(
    state: &AppState,
    conversation: &Conversation,
) -> Option<ArchiveResult> {
    conversation.channel.as_ref()?;
    match channels::archive(state, conversation).await {
        Ok(result) => Some(result),
        Err(err) => {
            log_mirror_failure(&conversation.id, "archive", &err);
            None
        }
    }
}

fn log_mirror_failure(chat_id: &str, operation: &str, err: &SyncError) {
    match err {
        SyncError::NoCredential(kind) => {
            tracing::info!(chat_id, operation, %kind, "owner has no credential, channel left as is")
        }
        other => tracing::warn!(chat_id, operation, error = %other, "channel mirror failed"),
    }
}
