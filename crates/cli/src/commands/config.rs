use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ichigo_core::config::{provider_api_key_env, resolve_config_path, AppConfig, LoadOptions};
use secrecy::ExposeSecret;
use toml::Value;

/// Where the effective value of a key came from.
struct Sources {
    file_path: Option<PathBuf>,
    file_doc: Option<Value>,
}

impl Sources {
    fn detect() -> Self {
        let file_path = resolve_config_path(None);
        let file_doc = load_config_file_doc(file_path.as_deref());
        Self { file_path, file_doc }
    }

    fn of(&self, key_path: &str, env_key: Option<&str>) -> String {
        if let Some(env_key) = env_key {
            if env::var_os(env_key).is_some() {
                return format!("env ({env_key})");
            }
        }

        if let Some(doc) = &self.file_doc {
            if contains_path(doc, key_path) {
                return format!("file ({})", self.file_label());
            }
        }

        "default".to_string()
    }

    fn file_label(&self) -> String {
        self.file_path
            .as_deref()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string())
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };
    let sources = Sources::detect();

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    let mut push = |key: &str, value: &str, env_key: Option<&str>| {
        lines.push(render_line(key, value, sources.of(key, env_key)));
    };

    push("database.url", &config.database.url, Some("ICHIGO_DATABASE_URL"));
    push(
        "database.max_connections",
        &config.database.max_connections.to_string(),
        Some("ICHIGO_DATABASE_MAX_CONNECTIONS"),
    );
    push(
        "database.timeout_secs",
        &config.database.timeout_secs.to_string(),
        Some("ICHIGO_DATABASE_TIMEOUT_SECS"),
    );

    push(
        "telegram.bot_token",
        &redact_bot_token(config.telegram.bot_token.expose_secret()),
        Some("ICHIGO_TELEGRAM_BOT_TOKEN"),
    );
    push(
        "telegram.api_base_url",
        &config.telegram.api_base_url,
        Some("ICHIGO_TELEGRAM_API_BASE_URL"),
    );
    push(
        "telegram.poll_timeout_secs",
        &config.telegram.poll_timeout_secs.to_string(),
        Some("ICHIGO_TELEGRAM_POLL_TIMEOUT_SECS"),
    );

    push("access.admins", &format_ids(&config.access.admins), None);
    push("access.users", &format_ids(&config.access.users), None);
    push("access.groups", &format_ids(&config.access.groups), None);
    push("blocklist", &format!("{} rule(s)", config.blocklist.len()), None);

    for provider in &config.providers {
        let env_key = provider_api_key_env(&provider.name);
        let key = if provider.api_key.is_some() { "<redacted>" } else { "<unset>" };
        let value = format!(
            "{} (api_key: {key}, timeout: {}s)",
            provider.base_url, provider.timeout_secs
        );
        push(&format!("providers.{}", provider.name), &value, Some(&env_key));
    }

    for model in &config.models {
        let mut flags = Vec::new();
        if model.stream {
            flags.push("stream");
        }
        if !model.system_prompt {
            flags.push("no-system-prompt");
        }
        if !model.temperature {
            flags.push("no-temperature");
        }
        let flags =
            if flags.is_empty() { String::new() } else { format!(" [{}]", flags.join(", ")) };
        push(
            &format!("models.{}", model.alias),
            &format!("{} via {}{flags}", model.name, model.provider),
            None,
        );
    }

    let prompt_names: Vec<&str> =
        config.prompts.iter().map(|prompt| prompt.name.as_str()).collect();
    push("prompts", &prompt_names.join(", "), None);

    push("chat.default_model", &config.chat.default_model, Some("ICHIGO_CHAT_DEFAULT_MODEL"));
    push(
        "chat.default_temperature",
        &config.chat.default_temperature.to_string(),
        Some("ICHIGO_CHAT_DEFAULT_TEMPERATURE"),
    );
    push("chat.default_prompt", &config.chat.default_prompt, None);
    push(
        "chat.max_tokens_per_response",
        &config.chat.max_tokens_per_response.to_string(),
        Some("ICHIGO_CHAT_MAX_TOKENS_PER_RESPONSE"),
    );
    push(
        "chat.max_history_turns",
        &config.chat.max_history_turns.to_string(),
        Some("ICHIGO_CHAT_MAX_HISTORY_TURNS"),
    );

    push("delivery.message_char_limit", &config.delivery.message_char_limit.to_string(), None);
    push(
        "delivery.edit_interval_ms",
        &config.delivery.edit_interval_ms.to_string(),
        Some("ICHIGO_DELIVERY_EDIT_INTERVAL_MS"),
    );
    push(
        "delivery.render_markdown",
        &config.delivery.render_markdown.to_string(),
        Some("ICHIGO_DELIVERY_RENDER_MARKDOWN"),
    );

    push("server.bind_address", &config.server.bind_address, Some("ICHIGO_SERVER_BIND_ADDRESS"));
    push(
        "server.health_check_port",
        &config.server.health_check_port.to_string(),
        Some("ICHIGO_SERVER_HEALTH_CHECK_PORT"),
    );

    push("logging.level", &config.logging.level, Some("ICHIGO_LOGGING_LEVEL"));
    push(
        "logging.format",
        &format!("{:?}", config.logging.format).to_ascii_lowercase(),
        Some("ICHIGO_LOGGING_FORMAT"),
    );

    lines.join("\n")
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let next = match current {
            Value::Array(items) => items.iter().find(|item| {
                ["name", "alias"]
                    .iter()
                    .any(|field| item.get(*field).and_then(Value::as_str) == Some(key))
            }),
            _ => current.get(key),
        };
        let Some(next) = next else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

fn format_ids(ids: &[i64]) -> String {
    if ids.is_empty() {
        return "<none>".to_string();
    }
    ids.iter().map(i64::to_string).collect::<Vec<_>>().join(", ")
}

/// Keeps the public bot id, hides the secret half.
fn redact_bot_token(token: &str) -> String {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return "<empty>".to_string();
    }

    if let Some((bot_id, _)) = trimmed.split_once(':') {
        return format!("{bot_id}:***");
    }

    "<redacted>".to_string()
}
