use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::answer::{
    AnswerPipeline, CompletionClient, DocumentFetcher, DriveDocumentFetcher,
    OpenAiCompletionClient,
};
use crate::channels;
use crate::config::AppConfig;
use crate::credentials::{fresh_access_token, DocumentOAuth};
use crate::error::{ApiError, SyncError};
use crate::lifecycle;
use crate::slack::SlackApiClient;
use crate::store::{now_iso, ConversationStore, MemoryStore, NewDocument, PgStore};
use crate::sync::{lock_files, mirror_exchange};
use crate::types::{Conversation, NewMessage, SlackIdentity, User};
use crate::webhooks;

/// Caller identity forwarded by the session proxy in front of this service.
pub const AUTH_EMAIL_HEADER: &str = "x-authenticated-email";
/// Optional document-suite token from the caller's interactive session.
pub const DOCUMENT_TOKEN_HEADER: &str = "x-document-access-token";

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn ConversationStore>,
    pub slack: SlackApiClient,
    pub documents_oauth: DocumentOAuth,
    pub answers: AnswerPipeline,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn ConversationStore>,
        completion: Arc<dyn CompletionClient>,
        fetcher: Arc<dyn DocumentFetcher>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            slack: SlackApiClient::new(&config.slack.api_base)?,
            documents_oauth: DocumentOAuth::new(config.google.clone())?,
            answers: AnswerPipeline::new(completion, fetcher, config.history_limit),
            store,
            config,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChatRequest {
    name: String,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateChatRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    system_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachDocumentRequest {
    document_id: String,
    name: String,
    mime_type: String,
}

#[derive(Debug, Deserialize)]
struct AskRequest {
    text: String,
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

async fn auth_user_from_headers(state: &AppState, headers: &HeaderMap) -> Result<User, ApiError> {
    let email = header_text(headers, AUTH_EMAIL_HEADER).ok_or(ApiError::Unauthorized)?;
    if let Some(user) = state.store.find_user_by_email(email).await? {
        return Ok(user);
    }
    Ok(state.store.upsert_user_by_email(email, "").await?)
}

async fn owned_conversation(
    state: &AppState,
    user: &User,
    chat_id: &str,
) -> Result<Conversation, ApiError> {
    let conversation = state
        .store
        .get_conversation(chat_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("conversation not found".to_string()))?;
    if conversation.owner_id != user.id {
        return Err(ApiError::Forbidden(
            "conversation belongs to another user".to_string(),
        ));
    }
    Ok(conversation)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let name = body.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("name is required".to_string()));
    }
    let conversation = state
        .store
        .create_conversation(&user.id, name, body.system_prompt.as_deref())
        .await?;
    tracing::info!(chat_id = %conversation.id, owner_id = %user.id, "conversation created");
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn get_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let mut conversation = owned_conversation(&state, &user, &chat_id).await?;

    if conversation.channel.is_none() && user.slack_bot_token().is_some() {
        match channels::ensure_channel(&state, &conversation).await {
            Ok(_) => {
                if let Some(refreshed) = state.store.get_conversation(&chat_id).await? {
                    conversation = refreshed;
                }
            }
            Err(err) => {
                tracing::warn!(%chat_id, error = %err, "could not ensure channel on read")
            }
        }
    }

    let documents = state.store.list_documents(&chat_id).await?;
    let messages = state.store.list_messages(&chat_id).await?;
    Ok(Json(json!({
        "conversation": conversation,
        "documents": documents,
        "messages": messages,
    })))
}

async fn update_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let before = owned_conversation(&state, &user, &chat_id).await?;

    let name = match body.name.as_deref().map(str::trim) {
        Some("") => return Err(ApiError::BadRequest("name cannot be empty".to_string())),
        Some(name) => name.to_string(),
        None => before.name.clone(),
    };
    let system_prompt = match body.system_prompt {
        Some(prompt) if prompt.trim().is_empty() => None,
        Some(prompt) => Some(prompt),
        None => before.system_prompt.clone(),
    };
    let after = state
        .store
        .update_conversation(&chat_id, &name, system_prompt.as_deref())
        .await?;

    let channel = lifecycle::on_conversation_renamed(&state, &before, &after).await;
    let conversation = match channel {
        Some(result) if result.changed => state
            .store
            .get_conversation(&chat_id)
            .await?
            .unwrap_or(after),
        _ => after,
    };
    Ok(Json(conversation))
}

async fn delete_chat(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let conversation = owned_conversation(&state, &user, &chat_id).await?;
    lifecycle::before_conversation_deleted(&state, &conversation).await;
    state.store.delete_conversation(&chat_id).await?;
    tracing::info!(%chat_id, "conversation deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn attach_document(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AttachDocumentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let conversation = owned_conversation(&state, &user, &chat_id).await?;
    if conversation.files_locked {
        return Err(ApiError::Conflict(
            "documents are locked once the first question is asked".to_string(),
        ));
    }
    if body.document_id.trim().is_empty() {
        return Err(ApiError::BadRequest("documentId is required".to_string()));
    }
    let document = state
        .store
        .attach_document(
            &chat_id,
            &NewDocument {
                document_id: body.document_id.trim().to_string(),
                name: body.name.trim().to_string(),
                mime_type: body.mime_type.trim().to_string(),
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn post_message(
    Path(chat_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    let conversation = owned_conversation(&state, &user, &chat_id).await?;
    let question = body.text.trim();
    if question.is_empty() {
        return Err(ApiError::BadRequest("text is required".to_string()));
    }

    let human = state
        .store
        .insert_message(NewMessage::human(&chat_id, &user.id, question))
        .await?;
    lock_files(&state, &conversation).await;

    let access_token = match header_text(&headers, DOCUMENT_TOKEN_HEADER) {
        Some(token) => token.to_string(),
        None => fresh_access_token(state.store.as_ref(), &state.documents_oauth, &user.id)
            .await
            .map_err(SyncError::from)?,
    };
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
    let assistant = state
        .store
        .insert_message(NewMessage::assistant(&chat_id, &answer))
        .await?;

    let mirror_state = state.clone();
    let (mirror_human, mirror_assistant) = (human.clone(), assistant.clone());
    let asker = if user.name.is_empty() {
        user.email.clone()
    } else {
        user.name.clone()
    };
    tokio::spawn(async move {
        mirror_exchange(
            &mirror_state,
            &conversation,
            &asker,
            &mirror_human,
            &mirror_assistant,
        )
        .await;
    });

    Ok(Json(json!({ "human": human, "assistant": assistant })))
}

async fn slack_oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(error) = query.error {
        return Err(ApiError::BadRequest(format!("slack authorization denied: {error}")));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("missing code".to_string()))?;
    let slack = &state.config.slack;
    let grant = state
        .slack
        .oauth_access(&slack.client_id, &slack.client_secret, &code, &slack.redirect_uri)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    let profile = state
        .slack
        .user_profile(&grant.bot_token, &grant.user_id)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    let email = profile.email.ok_or_else(|| {
        ApiError::BadRequest("slack profile has no email; grant users:read.email".to_string())
    })?;

    let user = state.store.upsert_user_by_email(&email, &profile.real_name).await?;
    state
        .store
        .link_slack_identity(
            &user.id,
            &SlackIdentity {
                user_id: grant.user_id,
                team_id: grant.team_id,
                bot_token: grant.bot_token,
            },
        )
        .await?;
    tracing::info!(user_id = %user.id, "slack connected");
    let user = state.store.get_user(&user.id).await?.unwrap_or(user);
    Ok(Json(json!({ "connected": true, "user": user })))
}

async fn slack_disconnect(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = auth_user_from_headers(&state, &headers).await?;
    state.store.clear_slack_identity(&user.id).await?;
    tracing::info!(user_id = %user.id, "slack disconnected");
    Ok(StatusCode::NO_CONTENT)
}

async fn google_oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(error) = query.error {
        return Err(ApiError::BadRequest(format!("google authorization denied: {error}")));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::BadRequest("missing code".to_string()))?;
    let grant = state
        .documents_oauth
        .exchange_code(&code)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    let identity = state
        .documents_oauth
        .identity(&grant.access_token)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    let user = state
        .store
        .upsert_user_by_email(&identity.email, &identity.name)
        .await?;
    state
        .store
        .store_google_tokens(&user.id, &grant.access_token, grant.refresh_token.as_deref())
        .await?;
    if grant.refresh_token.is_none() {
        tracing::warn!(user_id = %user.id, "google grant carried no refresh token; channel answers will fail");
    }
    let user = state.store.get_user(&user.id).await?.unwrap_or(user);
    Ok(Json(json!({ "connected": true, "user": user })))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/chats", post(create_chat))
        .route(
            "/api/chats/{chat_id}",
            get(get_chat).patch(update_chat).delete(delete_chat),
        )
        .route("/api/chats/{chat_id}/documents", post(attach_document))
        .route("/api/chats/{chat_id}/messages", post(post_message))
        .route("/api/slack/disconnect", post(slack_disconnect))
        .route("/auth/slack/callback", get(slack_oauth_callback))
        .route("/auth/google/callback", get(google_oauth_callback))
        .route("/slack/events", post(webhooks::slack_events))
        .route("/slack/commands", post(webhooks::slack_commands))
        .route("/slack/interactions", post(webhooks::slack_interactions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn ConversationStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&db).await?;
    Ok(Arc::new(PgStore::new(db)))
}

pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env();
    tracing::info!(
        slack = ?config.slack,
        google = ?config.google,
        openai = ?config.openai,
        database = config.database_url.is_some(),
        "starting"
    );

    let store = build_store(&config).await?;
    let completion = Arc::new(OpenAiCompletionClient::new(config.openai.clone())?);
    let fetcher = Arc::new(DriveDocumentFetcher::new(&config.google.drive_base)?);
    let port = config.port;
    let state = Arc::new(AppState::new(config, store, completion, fetcher)?);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
