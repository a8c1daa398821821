//! Inbound Slack webhooks: Events API, slash commands and interactive
//! components. Every handler verifies the raw body, answers Slack right away
//! and leaves the slow work to a spawned task.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app::AppState;
use crate::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::sync::{
    answer_command, process_inbound_message, retry_generation, MessageEvent, SlashCommand,
    RETRY_ACTION_ID,
};

const COMMAND_HELP: &str = "Ask a question about this conversation's documents: `/esme What's the budget?`\nAnswers are posted to the channel and saved in the conversation.";

#[derive(Debug, Deserialize)]
struct EventEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<Value>,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn authenticate(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let secret = &state.config.slack.signing_secret;
    if secret.is_empty() {
        tracing::warn!("signing secret not configured, rejecting webhook");
        return Err(StatusCode::UNAUTHORIZED.into_response());
    }
    signature::verify(
        body,
        header(headers, SIGNATURE_HEADER),
        header(headers, TIMESTAMP_HEADER),
        secret,
        Utc::now().timestamp(),
    )
    .map_err(|err| {
        tracing::warn!(error = %err, "rejected webhook");
        StatusCode::UNAUTHORIZED.into_response()
    })
}

fn form_fields(body: &[u8]) -> HashMap<String, String> {
    form_urlencoded::parse(body).into_owned().collect()
}

pub async fn slack_events(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let envelope = match serde_json::from_slice::<EventEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::debug!(error = %err, "unparseable event body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if envelope.kind == "url_verification" {
        return Json(json!({ "challenge": envelope.challenge.unwrap_or_default() }))
            .into_response();
    }

    if let Err(rejection) = authenticate(&state, &headers, &body) {
        return rejection;
    }
    if envelope.kind != "event_callback" {
        return StatusCode::OK.into_response();
    }

    let Some(event) = envelope
        .event
        .and_then(|event| serde_json::from_value::<MessageEvent>(event).ok())
    else {
        return StatusCode::OK.into_response();
    };
    match event.accept() {
        Ok(message) => {
            let state = state.clone();
            tokio::spawn(async move {
                let outcome = process_inbound_message(&state, &message).await;
                tracing::debug!(
                    channel_id = %message.channel_id,
                    ts = %message.ts,
                    ?outcome,
                    "inbound message processed"
                );
            });
        }
        Err(reason) => tracing::debug!(kind = %event.kind, reason, "event skipped"),
    }
    StatusCode::OK.into_response()
}

pub async fn slack_commands(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers, &body) {
        return rejection;
    }
    let fields = form_fields(&body);
    let field = |name: &str| fields.get(name).map(String::as_str).unwrap_or_default();

    let text = field("text").trim();
    if text.is_empty() || text.eq_ignore_ascii_case("help") {
        return Json(json!({ "response_type": "ephemeral", "text": COMMAND_HELP }))
            .into_response();
    }
    if field("response_url").is_empty() || field("channel_id").is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let command = SlashCommand {
        channel_id: field("channel_id").to_string(),
        user_id: field("user_id").to_string(),
        text: text.to_string(),
        response_url: field("response_url").to_string(),
    };
    let state = state.clone();
    tokio::spawn(async move { answer_command(&state, &command).await });

    Json(json!({
        "response_type": "ephemeral",
        "text": "Looking through the documents…"
    }))
    .into_response()
}

pub async fn slack_interactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authenticate(&state, &headers, &body) {
        return rejection;
    }
    let fields = form_fields(&body);
    let Some(payload) = fields
        .get("payload")
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if payload["type"] != "block_actions" {
        return StatusCode::OK.into_response();
    }

    let channel_id = payload["channel"]["id"].as_str().unwrap_or_default().to_string();
    let user_id = payload["user"]["id"].as_str().unwrap_or_default().to_string();
    let retries = payload["actions"]
        .as_array()
        .map(|actions| {
            actions
                .iter()
                .filter(|action| action["action_id"] == RETRY_ACTION_ID)
                .filter_map(|action| action["value"].as_str().map(str::to_string))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if channel_id.is_empty() {
        return StatusCode::OK.into_response();
    }
    for ts in retries {
        let state = state.clone();
        let channel_id = channel_id.clone();
        let user_id = user_id.clone();
        tokio::spawn(async move {
            let outcome = retry_generation(&state, &channel_id, &user_id, &ts).await;
            tracing::debug!(%channel_id, %ts, ?outcome, "retry processed");
        });
    }
    StatusCode::OK.into_response()
}
