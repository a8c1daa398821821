//! Answer generation shared by the interactive route and the Slack pull path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::{json, Value};

use crate::config::OpenAiConfig;
use crate::error::{CompletionError, SyncError};
use crate::prompting::{render_answer_prompt, AnswerPromptContext, PromptDocument, PromptTurn};
use crate::store::ConversationStore;
use crate::types::{Conversation, DocumentRef};

const MAX_DOCUMENT_CHARS: usize = 60_000;

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    /// Returns the document's extracted plain text.
    async fn fetch_text(&self, access_token: &str, document: &DocumentRef)
        -> Result<String, String>;
}

pub struct OpenAiCompletionClient {
    http: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiCompletionClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self { http, config })
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompletionClient {
    async fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        if self.config.api_key.trim().is_empty() {
            return Err(CompletionError::NotConfigured);
        }
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": [{ "role": "user", "content": prompt }],
                "temperature": 0.2
            }))
            .send()
            .await
            .map_err(|err| CompletionError::Service(format!("request failed: {err}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CompletionError::Service(format!("returned {status}: {body}")));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| CompletionError::Malformed(err.to_string()))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(CompletionError::Malformed("empty content".to_string()));
        }
        Ok(text)
    }
}

/// Reads attached files through the Drive v3 API, exporting native
/// Google formats to text.
pub struct DriveDocumentFetcher {
    http: reqwest::Client,
    drive_base: String,
}

impl DriveDocumentFetcher {
    pub fn new(drive_base: &str) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            drive_base: drive_base.trim_end_matches('/').to_string(),
        })
    }
}

fn export_mime_type(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "application/vnd.google-apps.document" => Some("text/plain"),
        "application/vnd.google-apps.spreadsheet" => Some("text/csv"),
        "application/vnd.google-apps.presentation" => Some("text/plain"),
        _ => None,
    }
}

#[async_trait]
impl DocumentFetcher for DriveDocumentFetcher {
    async fn fetch_text(
        &self,
        access_token: &str,
        document: &DocumentRef,
    ) -> Result<String, String> {
        let request = match export_mime_type(&document.mime_type) {
            Some(export) => self
                .http
                .get(format!(
                    "{}/files/{}/export",
                    self.drive_base, document.document_id
                ))
                .query(&[("mimeType", export)]),
            None => self
                .http
                .get(format!("{}/files/{}", self.drive_base, document.document_id))
                .query(&[("alt", "media")]),
        };
        let response = request
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| format!("request failed: {err}"))?;
        if !response.status().is_success() {
            return Err(format!("drive returned {}", response.status()));
        }
        response
            .text()
            .await
            .map_err(|err| format!("unreadable body: {err}"))
    }
}

fn clamp_document(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_DOCUMENT_CHARS) {
        Some((cut, _)) => format!("{}\n[truncated]", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

#[derive(Clone)]
pub struct AnswerPipeline {
    completion: Arc<dyn CompletionClient>,
    fetcher: Arc<dyn DocumentFetcher>,
    history_limit: usize,
}

impl AnswerPipeline {
    pub fn new(
        completion: Arc<dyn CompletionClient>,
        fetcher: Arc<dyn DocumentFetcher>,
        history_limit: usize,
    ) -> Self {
        Self {
            completion,
            fetcher,
            history_limit,
        }
    }

    /// Builds the prompt from the conversation's documents and history and asks
    /// the completion service. `question_message_id` is the already-stored
    /// question, kept out of the history block.
    pub async fn answer(
        &self,
        store: &dyn ConversationStore,
        conversation: &Conversation,
        question: &str,
        question_message_id: Option<&str>,
        access_token: &str,
    ) -> Result<String, SyncError> {
        let documents = store.list_documents(&conversation.id).await?;
        let fetched = join_all(documents.iter().map(|document| async move {
            let body = match self.fetcher.fetch_text(access_token, document).await {
                Ok(text) => clamp_document(&text),
                Err(err) => {
                    tracing::warn!(
                        chat_id = %document.chat_id,
                        document_id = %document.document_id,
                        error = %err,
                        "document fetch failed"
                    );
                    format!("[Could not read {}: {}]", document.name, err)
                }
            };
            PromptDocument {
                name: document.name.clone(),
                kind: document.kind_label().to_string(),
                body,
            }
        }))
        .await;

        let messages = store.list_messages(&conversation.id).await?;
        let prior = messages
            .iter()
            .filter(|message| Some(message.id.as_str()) != question_message_id)
            .collect::<Vec<_>>();
        let start = prior.len().saturating_sub(self.history_limit);
        let history = prior[start..]
            .iter()
            .map(|message| PromptTurn {
                role: message.role.to_string(),
                text: message.text.clone(),
            })
            .collect::<Vec<_>>();

        let prompt = render_answer_prompt(&AnswerPromptContext {
            conversation_name: &conversation.name,
            system_prompt: conversation.system_prompt.as_deref(),
            documents: &fetched,
            history: &history,
            question,
        });
        Ok(self.completion.complete(&prompt).await?)
    }
}
