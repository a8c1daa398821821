use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("uniqueness conflict: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Messaging-platform failures, decoded from the `error` code of a Web API reply.
#[derive(Debug, Error)]
pub enum SlackError {
    #[error("user is already in channel")]
    AlreadyInChannel,

    #[error("channel name is already taken")]
    NameTaken,

    #[error("channel is already archived")]
    AlreadyArchived,

    #[error("channel not found")]
    ChannelNotFound,

    #[error("slack api {operation} failed: {code}")]
    Api { operation: String, code: String },

    #[error("slack api {operation} request failed: {source}")]
    Transport {
        operation: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("slack api {operation} returned an unexpected payload: {detail}")]
    Decode { operation: String, detail: String },
}

impl SlackError {
    pub fn from_code(operation: &str, code: &str) -> Self {
        match code {
            "already_in_channel" => SlackError::AlreadyInChannel,
            "name_taken" => SlackError::NameTaken,
            "already_archived" => SlackError::AlreadyArchived,
            "channel_not_found" => SlackError::ChannelNotFound,
            other => SlackError::Api {
                operation: operation.to_string(),
                code: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("no document refresh token stored; the owner must reconnect with offline access")]
    NoRefreshToken,

    #[error("document token refresh rejected: {0}")]
    RefreshFailed(String),

    #[error("document oauth client is not configured")]
    NotConfigured,

    #[error("document token endpoint unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion service is not configured")]
    NotConfigured,

    #[error("completion service error: {0}")]
    Service(String),

    #[error("completion service returned a malformed response: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    Slack,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialKind::Slack => f.write_str("slack"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("owner has no {0} credential")]
    NoCredential(CredentialKind),

    #[error("channel name `{0}` is taken and the fallback name collided too")]
    ChannelNameCollision(String),

    #[error("no conversation is mapped to channel {0}")]
    UnmappedChannel(String),

    #[error("slack user {0} has not linked an account")]
    UnmappedSender(String),

    #[error("token refresh failed: {0}")]
    TokenRefreshFailed(#[source] TokenError),

    #[error(transparent)]
    Slack(#[from] SlackError),

    #[error(transparent)]
    Completion(#[from] CompletionError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<TokenError> for SyncError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Store(store) => SyncError::Store(store),
            other => SyncError::TokenRefreshFailed(other),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StoreError::Conflict(what) => ApiError::Conflict(what),
            StoreError::Database(db) => ApiError::Internal(db.to_string()),
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Store(store) => store.into(),
            SyncError::NoCredential(_) | SyncError::TokenRefreshFailed(_) => {
                ApiError::Forbidden(err.to_string())
            }
            other => ApiError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}
