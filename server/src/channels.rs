//! Channel Directory: one private Slack channel per conversation.
//!
//! The conversation row is the source of truth. Slack failures surface as
//! [`SyncError`] values that callers log and drop.

use crate::app::AppState;
use crate::error::{CredentialKind, SlackError, StoreError, SyncError};
use crate::types::{ChannelBinding, Conversation, User};

/// Slack's channel name limit.
pub const MAX_CHANNEL_NAME_LEN: usize = 80;
const ID_SUFFIX_LEN: usize = 8;
const MAX_TOPIC_LEN: usize = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameResult {
    pub changed: bool,
    pub final_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveResult {
    pub archived: bool,
}

fn sanitize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.to_lowercase().chars() {
        let mapped = if ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' {
            ch
        } else {
            '-'
        };
        if mapped == '-' && out.ends_with('-') {
            continue;
        }
        out.push(mapped);
    }
    out.trim_matches('-').to_string()
}

fn id_suffix(conversation_id: &str) -> String {
    let chars = conversation_id
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_lowercase())
        .collect::<Vec<_>>();
    chars[chars.len().saturating_sub(ID_SUFFIX_LEN)..]
        .iter()
        .collect()
}

/// `<prefix>-<sanitized name>-<last 8 of id>`, cut to Slack's limit without
/// touching the id suffix.
pub fn channel_name(prefix: &str, conversation_name: &str, conversation_id: &str) -> String {
    let prefix = sanitize(prefix);
    let suffix = id_suffix(conversation_id);
    let body = sanitize(conversation_name);

    let fixed = prefix.len() + suffix.len() + 2;
    let budget = MAX_CHANNEL_NAME_LEN.saturating_sub(fixed);
    // sanitize() leaves only ASCII, so byte slicing is safe.
    let body = body[..body.len().min(budget)].trim_end_matches('-');

    [prefix.as_str(), body, suffix.as_str()]
        .iter()
        .filter(|part| !part.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("-")
}

fn fallback_channel_name(prefix: &str, conversation: &Conversation) -> String {
    channel_name(prefix, &format!("{}-1", conversation.name), &conversation.id)
}

/// Loads the owner and their bot token, or `NoCredential`.
pub(crate) async fn owner_with_token(
    state: &AppState,
    conversation: &Conversation,
) -> Result<(User, String), SyncError> {
    let owner = state
        .store
        .get_user(&conversation.owner_id)
        .await?
        .ok_or(SyncError::NoCredential(CredentialKind::Slack))?;
    let token = owner
        .slack_bot_token()
        .map(str::to_string)
        .ok_or(SyncError::NoCredential(CredentialKind::Slack))?;
    Ok((owner, token))
}

/// Returns the bound channel id, creating and binding a channel first if the
/// conversation has none.
pub async fn ensure_channel(
    state: &AppState,
    conversation: &Conversation,
) -> Result<String, SyncError> {
    if let Some(binding) = &conversation.channel {
        return Ok(binding.channel_id.clone());
    }
    if let Some(binding) = state
        .store
        .get_conversation(&conversation.id)
        .await?
        .and_then(|current| current.channel)
    {
        return Ok(binding.channel_id);
    }

    let (owner, token) = owner_with_token(state, conversation).await?;
    let name = channel_name(&state.config.channel_prefix, &conversation.name, &conversation.id);
    let created = state.slack.create_private_channel(&token, &name).await?;

    let binding = ChannelBinding {
        channel_id: created.id.clone(),
        channel_name: created.name.clone(),
    };
    let bound = match state.store.bind_channel(&conversation.id, &binding).await {
        Ok(bound) => bound,
        Err(err) => {
            archive_orphan(state, &token, conversation, &created.id).await;
            return Err(err.into());
        }
    };
    if bound.channel_id != created.id {
        tracing::info!(
            chat_id = %conversation.id,
            winner = %bound.channel_id,
            orphan = %created.id,
            "lost channel bind race, archiving duplicate"
        );
        archive_orphan(state, &token, conversation, &created.id).await;
        return Ok(bound.channel_id);
    }

    if let Some(identity) = &owner.slack {
        match state
            .slack
            .invite_user(&token, &created.id, &identity.user_id)
            .await
        {
            Ok(()) | Err(SlackError::AlreadyInChannel) => {}
            Err(err) => {
                tracing::warn!(chat_id = %conversation.id, error = %err, "failed to invite owner")
            }
        }
    }

    let topic = truncate_chars(
        &format!("Esme conversation: {}", conversation.name.trim()),
        MAX_TOPIC_LEN,
    );
    if let Err(err) = state.slack.set_topic(&token, &created.id, &topic).await {
        tracing::warn!(chat_id = %conversation.id, error = %err, "failed to set channel topic");
    }

    match intro_message(state, conversation).await {
        Ok(intro) => {
            if let Err(err) = state
                .slack
                .post_message(&token, &created.id, &intro, None, None)
                .await
            {
                tracing::warn!(chat_id = %conversation.id, error = %err, "failed to post channel intro");
            }
        }
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "failed to build channel intro")
        }
    }

    tracing::info!(
        chat_id = %conversation.id,
        channel_id = %created.id,
        channel_name = %created.name,
        "channel bound"
    );
    Ok(created.id)
}

async fn archive_orphan(state: &AppState, token: &str, conversation: &Conversation, channel_id: &str) {
    if let Err(err) = state.slack.archive_channel(token, channel_id).await {
        tracing::warn!(chat_id = %conversation.id, %channel_id, error = %err, "failed to archive orphan channel");
    }
}

async fn intro_message(state: &AppState, conversation: &Conversation) -> Result<String, StoreError> {
    let documents = state.store.list_documents(&conversation.id).await?;
    let mut text = format!(
        "This channel mirrors the Esme conversation *{}*. Ask a question here and I'll answer from its documents.",
        conversation.name.trim()
    );
    if documents.is_empty() {
        text.push_str("\nNo documents are attached yet.");
    } else {
        text.push_str("\nAttached documents:");
        for document in &documents {
            text.push_str(&format!("\n• {} ({})", document.name, document.kind_label()));
        }
    }
    Ok(text)
}

fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}

/// Mirrors the conversation's current name onto its channel.
pub async fn rename(state: &AppState, conversation: &Conversation) -> Result<RenameResult, SyncError> {
    let Some(binding) = &conversation.channel else {
        return Ok(RenameResult {
            changed: false,
            final_name: None,
        });
    };
    let prefix = &state.config.channel_prefix;
    let desired = channel_name(prefix, &conversation.name, &conversation.id);
    if desired == binding.channel_name {
        return Ok(RenameResult {
            changed: false,
            final_name: Some(desired),
        });
    }

    let (_, token) = owner_with_token(state, conversation).await?;
    let renamed = match state
        .slack
        .rename_channel(&token, &binding.channel_id, &desired)
        .await
    {
        Ok(channel) => channel,
        Err(SlackError::NameTaken) => {
            let fallback = fallback_channel_name(prefix, conversation);
            tracing::debug!(chat_id = %conversation.id, %desired, %fallback, "channel name taken, retrying");
            match state
                .slack
                .rename_channel(&token, &binding.channel_id, &fallback)
                .await
            {
                Ok(channel) => channel,
                Err(SlackError::NameTaken) => return Err(SyncError::ChannelNameCollision(desired)),
                Err(err) => return Err(err.into()),
            }
        }
        Err(err) => return Err(err.into()),
    };

    state
        .store
        .set_channel_name(&conversation.id, &renamed.name)
        .await?;
    Ok(RenameResult {
        changed: true,
        final_name: Some(renamed.name),
    })
}

/// Archives the bound channel and clears the binding.
pub async fn archive(state: &AppState, conversation: &Conversation) -> Result<ArchiveResult, SyncError> {
    let Some(binding) = &conversation.channel else {
        return Ok(ArchiveResult { archived: false });
    };
    let (_, token) = owner_with_token(state, conversation).await?;
    match state.slack.archive_channel(&token, &binding.channel_id).await {
        Ok(()) | Err(SlackError::AlreadyArchived) | Err(SlackError::ChannelNotFound) => {}
        Err(err) => return Err(err.into()),
    }
    state.store.clear_channel_binding(&conversation.id).await?;
    Ok(ArchiveResult { archived: true })
}
