//! Message Synchronizer.
//!
//! Push: internal messages are posted to the bound channel and stamped with
//! the returned ts. Pull: a human message posted in a bound channel is
//! recorded, answered and mirrored back. Both directions are best-effort with
//! respect to the interactive chat, which never waits on Slack.

use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::channels::{ensure_channel, owner_with_token};
use crate::credentials::fresh_access_token;
use crate::error::{StoreError, SyncError, TokenError};
use crate::types::{ChatMessage, Conversation, MessageRole, NewMessage};

#[cfg(test)]
mod tests;

/// `action_id` of the "Try again" button attached to failure notices.
pub const RETRY_ACTION_ID: &str = "esme_retry";

/// The fields of a Slack `message` event that the pull path looks at.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageEvent {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub channel: Option<String>,
    pub channel_type: Option<String>,
    pub user: Option<String>,
    pub text: Option<String>,
    pub ts: Option<String>,
    pub thread_ts: Option<String>,
    pub bot_id: Option<String>,
    pub subtype: Option<String>,
}

/// A message event that passed the shape filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub channel_id: String,
    pub sender_id: String,
    pub text: String,
    pub ts: String,
}

impl MessageEvent {
    /// Keeps un-threaded human messages in channels; the error names the
    /// reason an event was skipped.
    pub fn accept(&self) -> Result<InboundMessage, &'static str> {
        if self.kind != "message" {
            return Err("not a message event");
        }
        if self.bot_id.is_some() {
            return Err("bot message");
        }
        if self.subtype.is_some() {
            return Err("message subtype");
        }
        if !matches!(self.channel_type.as_deref(), None | Some("channel" | "group")) {
            return Err("not a channel message");
        }
        let (Some(channel_id), Some(sender_id), Some(ts)) =
            (self.channel.as_deref(), self.user.as_deref(), self.ts.as_deref())
        else {
            return Err("missing channel, user or ts");
        };
        if self
            .thread_ts
            .as_deref()
            .is_some_and(|thread_ts| thread_ts != ts)
        {
            return Err("thread reply");
        }
        let text = strip_mentions(self.text.as_deref().unwrap_or_default());
        if text.is_empty() {
            return Err("empty text");
        }
        Ok(InboundMessage {
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            text,
            ts: ts.to_string(),
        })
    }
}

fn strip_mentions(text: &str) -> String {
    let Ok(re) = Regex::new(r"<@[A-Z0-9]+(?:\|[^>]*)?>") else {
        return text.trim().to_string();
    };
    re.replace_all(text, "").trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Answered {
        human_message_id: String,
        assistant_message_id: String,
        reply_ts: String,
    },
    Duplicate,
    UnmappedChannel,
    UnmappedSender,
    /// A retry pointed at a message that is not a recorded question, or at
    /// one already answered in the channel.
    Ignored,
    Failed {
        notice_posted: bool,
    },
}

pub async fn push_to_channel(
    state: &AppState,
    channel_id: &str,
    text: &str,
    token: &str,
    thread_ts: Option<&str>,
) -> Result<String, SyncError> {
    Ok(state
        .slack
        .post_message(token, channel_id, text, thread_ts, None)
        .await?)
}

/// Posts a stored message and records the returned ts on it.
pub async fn push_message(
    state: &AppState,
    token: &str,
    channel_id: &str,
    message: &ChatMessage,
    thread_ts: Option<&str>,
) -> Result<String, SyncError> {
    let ts = push_to_channel(state, channel_id, &message.text, token, thread_ts).await?;
    state
        .store
        .mark_message_synced(&message.id, &ts, thread_ts)
        .await?;
    Ok(ts)
}

pub(crate) async fn lock_files(state: &AppState, conversation: &Conversation) {
    if conversation.files_locked {
        return;
    }
    if let Err(err) = state.store.set_files_locked(&conversation.id, true).await {
        tracing::warn!(chat_id = %conversation.id, error = %err, "failed to lock documents");
    }
}

/// Mirrors an interactive question and its answer into the conversation's
/// channel, creating the channel on first use. Failures are logged only.
pub async fn mirror_exchange(
    state: &AppState,
    conversation: &Conversation,
    asker_name: &str,
    human: &ChatMessage,
    assistant: &ChatMessage,
) {
    let channel_id = match ensure_channel(state, conversation).await {
        Ok(channel_id) => channel_id,
        Err(SyncError::NoCredential(kind)) => {
            tracing::debug!(chat_id = %conversation.id, %kind, "owner has no credential, skipping mirror");
            return;
        }
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "channel unavailable, skipping mirror");
            return;
        }
    };
    let token = match owner_with_token(state, conversation).await {
        Ok((_, token)) => token,
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "skipping mirror");
            return;
        }
    };

    let asker = if asker_name.trim().is_empty() {
        "Someone"
    } else {
        asker_name.trim()
    };
    let question = format!("*{asker}* asked: {}", human.text);
    let parent_ts = match push_to_channel(state, &channel_id, &question, &token, None).await {
        Ok(ts) => ts,
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "failed to mirror question");
            return;
        }
    };
    if let Err(err) = state
        .store
        .mark_message_synced(&human.id, &parent_ts, None)
        .await
    {
        tracing::warn!(chat_id = %conversation.id, error = %err, "failed to stamp mirrored question");
    }

    let thread_ts = state.config.reply_in_thread.then_some(parent_ts.as_str());
    if let Err(err) = push_message(state, &token, &channel_id, assistant, thread_ts).await {
        tracing::warn!(chat_id = %conversation.id, error = %err, "failed to mirror answer");
    }
}

/// Records the question unless it was seen before. `Ok(None)` marks a redelivery.
async fn record_inbound(
    state: &AppState,
    message: &InboundMessage,
) -> Result<Option<(Conversation, ChatMessage)>, SyncError> {
    let conversation = state
        .store
        .find_conversation_by_channel(&message.channel_id)
        .await?
        .ok_or_else(|| SyncError::UnmappedChannel(message.channel_id.clone()))?;
    let sender = state
        .store
        .find_user_by_slack_id(&message.sender_id)
        .await?
        .ok_or_else(|| SyncError::UnmappedSender(message.sender_id.clone()))?;

    if state
        .store
        .find_message_by_slack_ts(&conversation.id, &message.ts)
        .await?
        .is_some()
    {
        return Ok(None);
    }
    let human = NewMessage::human(&conversation.id, &sender.id, &message.text)
        .synced_from(&message.ts, None);
    match state.store.insert_message(human).await {
        Ok(stored) => Ok(Some((conversation, stored))),
        Err(StoreError::Conflict(_)) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Pull path for one accepted message event. Runs after the webhook has
/// already been acknowledged.
pub async fn process_inbound_message(state: &AppState, message: &InboundMessage) -> InboundOutcome {
    let (conversation, human) = match record_inbound(state, message).await {
        Ok(Some(recorded)) => recorded,
        Ok(None) => {
            tracing::debug!(channel_id = %message.channel_id, ts = %message.ts, "duplicate delivery");
            return InboundOutcome::Duplicate;
        }
        Err(SyncError::UnmappedChannel(channel_id)) => {
            tracing::debug!(%channel_id, "message in unmapped channel");
            return InboundOutcome::UnmappedChannel;
        }
        Err(SyncError::UnmappedSender(sender_id)) => {
            tracing::info!(channel_id = %message.channel_id, %sender_id, "message from unlinked slack user");
            return InboundOutcome::UnmappedSender;
        }
        Err(err) => {
            tracing::error!(channel_id = %message.channel_id, error = %err, "failed to record inbound message");
            return InboundOutcome::Failed {
                notice_posted: false,
            };
        }
    };
    lock_files(state, &conversation).await;
    answer_in_channel(state, &conversation, &human, None, &message.channel_id, &message.ts).await
}

/// What a retry click resolves to.
enum RetryTarget {
    /// The question has no answer yet.
    Regenerate(ChatMessage),
    /// An answer was stored but never reached the channel.
    Repush {
        question: ChatMessage,
        reply: ChatMessage,
    },
    AlreadyAnswered,
    NotAQuestion,
}

/// Handles the retry button on a failure notice for the question recorded
/// under `ts`. A stored answer is pushed again rather than regenerated.
pub async fn retry_generation(
    state: &AppState,
    channel_id: &str,
    clicked_by: &str,
    ts: &str,
) -> InboundOutcome {
    match find_retry_question(state, channel_id, clicked_by, ts).await {
        Ok((conversation, RetryTarget::Regenerate(question))) => {
            answer_in_channel(state, &conversation, &question, None, channel_id, ts).await
        }
        Ok((conversation, RetryTarget::Repush { question, reply })) => {
            answer_in_channel(state, &conversation, &question, Some(&reply), channel_id, ts).await
        }
        Ok((_, RetryTarget::AlreadyAnswered)) => {
            tracing::debug!(%channel_id, %ts, "retry for a question already answered in channel");
            InboundOutcome::Ignored
        }
        Ok((_, RetryTarget::NotAQuestion)) => InboundOutcome::Ignored,
        Err(SyncError::UnmappedChannel(_)) => InboundOutcome::UnmappedChannel,
        Err(SyncError::UnmappedSender(_)) => InboundOutcome::UnmappedSender,
        Err(err) => {
            tracing::error!(%channel_id, error = %err, "retry lookup failed");
            InboundOutcome::Failed {
                notice_posted: false,
            }
        }
    }
}

async fn find_retry_question(
    state: &AppState,
    channel_id: &str,
    clicked_by: &str,
    ts: &str,
) -> Result<(Conversation, RetryTarget), SyncError> {
    let conversation = state
        .store
        .find_conversation_by_channel(channel_id)
        .await?
        .ok_or_else(|| SyncError::UnmappedChannel(channel_id.to_string()))?;
    if state.store.find_user_by_slack_id(clicked_by).await?.is_none() {
        return Err(SyncError::UnmappedSender(clicked_by.to_string()));
    }
    let Some(question) = state
        .store
        .find_message_by_slack_ts(&conversation.id, ts)
        .await?
        .filter(|message| message.role == MessageRole::Human)
    else {
        return Ok((conversation, RetryTarget::NotAQuestion));
    };

    // The answer, if any, is the first assistant message before the next question.
    let messages = state.store.list_messages(&conversation.id).await?;
    let reply = messages
        .iter()
        .skip_while(|message| message.id != question.id)
        .skip(1)
        .take_while(|message| message.role != MessageRole::Human)
        .find(|message| message.role == MessageRole::Assistant)
        .cloned();
    let target = match reply {
        None => RetryTarget::Regenerate(question),
        Some(reply) if reply.slack.synced => RetryTarget::AlreadyAnswered,
        Some(reply) => RetryTarget::Repush { question, reply },
    };
    Ok((conversation, target))
}

async fn answer_in_channel(
    state: &AppState,
    conversation: &Conversation,
    question: &ChatMessage,
    stored_reply: Option<&ChatMessage>,
    channel_id: &str,
    thread_parent: &str,
) -> InboundOutcome {
    let token = match owner_with_token(state, conversation).await {
        Ok((_, token)) => token,
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "cannot answer in channel");
            return InboundOutcome::Failed {
                notice_posted: false,
            };
        }
    };
    let thread_ts = state.config.reply_in_thread.then_some(thread_parent);

    let result = match stored_reply {
        Some(reply) => push_message(state, &token, channel_id, reply, thread_ts)
            .await
            .map(|reply_ts| (reply.id.clone(), reply_ts)),
        None => generate_reply(state, conversation, question, &token, channel_id, thread_ts).await,
    };
    match result {
        Ok((assistant_message_id, reply_ts)) => InboundOutcome::Answered {
            human_message_id: question.id.clone(),
            assistant_message_id,
            reply_ts,
        },
        Err(err) => {
            tracing::warn!(chat_id = %conversation.id, error = %err, "channel answer failed");
            let notice_posted =
                post_failure_notice(state, &token, channel_id, thread_parent, &err).await;
            InboundOutcome::Failed { notice_posted }
        }
    }
}

async fn generate_reply(
    state: &AppState,
    conversation: &Conversation,
    question: &ChatMessage,
    token: &str,
    channel_id: &str,
    thread_ts: Option<&str>,
) -> Result<(String, String), SyncError> {
    let access_token = fresh_access_token(
        state.store.as_ref(),
        &state.documents_oauth,
        &conversation.owner_id,
    )
    .await?;
    let answer = state
        .answers
        .answer(
            state.store.as_ref(),
            conversation,
            &question.text,
            Some(&question.id),
            &access_token,
        )
        .await?;
    let assistant = state
        .store
        .insert_message(NewMessage::assistant(&conversation.id, &answer))
        .await?;
    let reply_ts = push_message(state, token, channel_id, &assistant, thread_ts).await?;
    Ok((assistant.id, reply_ts))
}

pub(crate) fn failure_text(err: &SyncError) -> String {
    let reason = match err {
        SyncError::TokenRefreshFailed(TokenError::NoRefreshToken) => {
            "The conversation owner needs to reconnect Google Drive so I can read the documents."
        }
        SyncError::TokenRefreshFailed(_) => {
            "I couldn't refresh access to the documents. The conversation owner may need to reconnect Google Drive."
        }
        SyncError::Completion(_) => "The answer service is unavailable right now.",
        SyncError::UnmappedChannel(_) => "This channel isn't linked to an Esme conversation.",
        SyncError::UnmappedSender(_) => "Connect your Slack account to Esme before asking questions.",
        _ => "Something went wrong while answering.",
    };
    format!("Sorry, I couldn't answer that. {reason}")
}

fn failure_blocks(text: &str, question_ts: &str) -> Value {
    json!([
        { "type": "section", "text": { "type": "mrkdwn", "text": text } },
        {
            "type": "actions",
            "elements": [{
                "type": "button",
                "action_id": RETRY_ACTION_ID,
                "text": { "type": "plain_text", "text": "Try again" },
                "value": question_ts
            }]
        }
    ])
}

async fn post_failure_notice(
    state: &AppState,
    token: &str,
    channel_id: &str,
    question_ts: &str,
    err: &SyncError,
) -> bool {
    let text = failure_text(err);
    let thread_ts = state.config.reply_in_thread.then_some(question_ts);
    match state
        .slack
        .post_message(
            token,
            channel_id,
            &text,
            thread_ts,
            Some(failure_blocks(&text, question_ts)),
        )
        .await
    {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(%channel_id, error = %err, "failed to post failure notice");
            false
        }
    }
}

/// A `/esme` invocation, already verified and parsed.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
    pub response_url: String,
}

/// Answers a slash command through its `response_url`. The question and
/// answer are recorded like any other exchange.
pub async fn answer_command(state: &AppState, command: &SlashCommand) {
    let payload = match command_reply(state, command).await {
        Ok(text) => json!({ "response_type": "in_channel", "text": text }),
        Err(err) => {
            tracing::warn!(channel_id = %command.channel_id, error = %err, "slash command failed");
            json!({ "response_type": "ephemeral", "text": failure_text(&err) })
        }
    };
    if let Err(err) = state.slack.respond(&command.response_url, &payload).await {
        tracing::warn!(channel_id = %command.channel_id, error = %err, "failed to deliver command reply");
    }
}

async fn command_reply(state: &AppState, command: &SlashCommand) -> Result<String, SyncError> {
    let conversation = state
        .store
        .find_conversation_by_channel(&command.channel_id)
        .await?
        .ok_or_else(|| SyncError::UnmappedChannel(command.channel_id.clone()))?;
    let asker = state
        .store
        .find_user_by_slack_id(&command.user_id)
        .await?
        .ok_or_else(|| SyncError::UnmappedSender(command.user_id.clone()))?;
    let question = command.text.trim();

    let human = state
        .store
        .insert_message(NewMessage::human(&conversation.id, &asker.id, question))
        .await?;
    lock_files(state, &conversation).await;

    let access_token = fresh_access_token(
        state.store.as_ref(),
        &state.documents_oauth,
        &conversation.owner_id,
    )
    .await?;
    let answer = state
        .answers
        .answer(
            state.store.as_ref(),
            &conversation,
            question,
            Some(&human.id),
            &access_token,
        )
        .await?;
    state
        .store
        .insert_message(NewMessage::assistant(&conversation.id, &answer))
        .await?;
    Ok(format!("> {question}\n{answer}"))
}
