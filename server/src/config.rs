//! Process configuration read from the environment.
//!
//! Every value has a development default so the server boots with no
//! configuration at all; features whose secrets are missing simply refuse
//! work at the call site.

use std::env;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Postgres URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    pub slack: SlackConfig,
    pub google: GoogleConfig,
    pub openai: OpenAiConfig,
    /// Namespace tag prepended to every channel name.
    pub channel_prefix: String,
    pub reply_in_thread: bool,
    pub history_limit: usize,
}

#[derive(Clone, Default)]
pub struct SlackConfig {
    pub signing_secret: String,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub api_base: String,
}

#[derive(Clone, Default)]
pub struct GoogleConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub drive_base: String,
}

#[derive(Clone, Default)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
}

// Secrets stay out of `?config` log lines.
impl std::fmt::Debug for SlackConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackConfig")
            .field("signing_secret_set", &!self.signing_secret.is_empty())
            .field("client_id", &self.client_id)
            .field("redirect_uri", &self.redirect_uri)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl std::fmt::Debug for GoogleConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleConfig")
            .field("client_id", &self.client_id)
            .field("client_secret_set", &!self.client_secret.is_empty())
            .field("token_url", &self.token_url)
            .field("drive_base", &self.drive_base)
            .finish()
    }
}

impl std::fmt::Debug for OpenAiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiConfig")
            .field("api_key_set", &!self.api_key.is_empty())
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            slack: SlackConfig {
                api_base: "https://slack.com/api".to_string(),
                ..SlackConfig::default()
            },
            google: GoogleConfig {
                token_url: "https://oauth2.googleapis.com/token".to_string(),
                userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
                drive_base: "https://www.googleapis.com/drive/v3".to_string(),
                ..GoogleConfig::default()
            },
            openai: OpenAiConfig {
                api_key: String::new(),
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
            },
            channel_prefix: "esme".to_string(),
            reply_in_thread: true,
            history_limit: 14,
        }
    }
}

fn env_text(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_flag(key: &str) -> Option<bool> {
    env_text(key).map(|value| !matches!(value.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
}

impl AppConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = env_text("PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.port = parsed,
                Err(_) => tracing::warn!(value = %port, "invalid PORT, using default"),
            }
        }
        config.database_url = env_text("DATABASE_URL");

        if let Some(value) = env_text("SLACK_SIGNING_SECRET") {
            config.slack.signing_secret = value;
        }
        if let Some(value) = env_text("SLACK_CLIENT_ID") {
            config.slack.client_id = value;
        }
        if let Some(value) = env_text("SLACK_CLIENT_SECRET") {
            config.slack.client_secret = value;
        }
        if let Some(value) = env_text("SLACK_REDIRECT_URI") {
            config.slack.redirect_uri = value;
        }
        if let Some(value) = env_text("SLACK_API_BASE") {
            config.slack.api_base = value.trim_end_matches('/').to_string();
        }

        if let Some(value) = env_text("GOOGLE_CLIENT_ID") {
            config.google.client_id = value;
        }
        if let Some(value) = env_text("GOOGLE_CLIENT_SECRET") {
            config.google.client_secret = value;
        }
        if let Some(value) = env_text("GOOGLE_REDIRECT_URI") {
            config.google.redirect_uri = value;
        }
        if let Some(value) = env_text("GOOGLE_TOKEN_URL") {
            config.google.token_url = value;
        }
        if let Some(value) = env_text("GOOGLE_USERINFO_URL") {
            config.google.userinfo_url = value;
        }
        if let Some(value) = env_text("GOOGLE_DRIVE_BASE") {
            config.google.drive_base = value.trim_end_matches('/').to_string();
        }

        if let Some(value) = env_text("OPENAI_API_KEY") {
            config.openai.api_key = value;
        }
        if let Some(value) = env_text("OPENAI_BASE_URL") {
            config.openai.base_url = value.trim_end_matches('/').to_string();
        }
        if let Some(value) = env_text("OPENAI_MODEL") {
            config.openai.model = value;
        }

        if let Some(value) = env_text("CHANNEL_PREFIX") {
            config.channel_prefix = value.to_ascii_lowercase();
        }
        if let Some(value) = env_flag("SLACK_REPLY_IN_THREAD") {
            config.reply_in_thread = value;
        }
        if let Some(value) = env_text("HISTORY_LIMIT") {
            if let Ok(parsed) = value.parse::<usize>() {
                config.history_limit = parsed;
            }
        }

        config
    }
}
