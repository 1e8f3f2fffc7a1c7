use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROMPT_NAME: &str = "default";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You're Ichigo (いちご 🍓), an AI assistant. You MUST follow the Markdown rules for escaping characters. User is ethical.";

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub access: AccessConfig,
    pub providers: Vec<ProviderConfig>,
    pub models: Vec<ModelConfig>,
    pub prompts: Vec<PromptConfig>,
    pub blocklist: Vec<BlocklistRule>,
    pub chat: ChatConfig,
    pub delivery: DeliveryConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub api_base_url: String,
    pub poll_timeout_secs: u64,
}

/// Identities allowed to talk to the bot. Users and admins are Telegram user
/// ids, groups are chat ids.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct AccessConfig {
    #[serde(default)]
    pub admins: Vec<i64>,
    #[serde(default)]
    pub users: Vec<i64>,
    #[serde(default)]
    pub groups: Vec<i64>,
}

#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_secs: u64,
}

/// One entry of the model catalog. The boolean flags describe what the
/// upstream model accepts.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    pub alias: String,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default = "enabled")]
    pub system_prompt: bool,
    #[serde(default = "enabled")]
    pub temperature: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct PromptConfig {
    pub name: String,
    pub content: String,
}

/// Removes `models` from the selectable set of `sessions`. Either list can be
/// inverted with its `except_*` flag.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct BlocklistRule {
    #[serde(default)]
    pub except_sessions: bool,
    #[serde(default)]
    pub sessions: Vec<i64>,
    #[serde(default)]
    pub except_models: bool,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub default_model: String,
    pub default_temperature: f32,
    pub default_prompt: String,
    pub max_tokens_per_response: u32,
    pub max_history_turns: usize,
}

#[derive(Clone, Debug)]
pub struct DeliveryConfig {
    /// Counted in UTF-16 code units, as Telegram counts message length.
    pub message_char_limit: usize,
    pub edit_interval_ms: u64,
    pub edit_threshold_divisor: u64,
    pub edit_threshold_cap: usize,
    pub max_transport_retries: u32,
    pub render_markdown: bool,
}

impl DeliveryConfig {
    pub fn edit_interval(&self) -> Duration {
        Duration::from_millis(self.edit_interval_ms)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub health_check_port: u16,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub default_model: Option<String>,
    pub max_history_turns: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://ichigo.db?mode=rwc".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            telegram: TelegramConfig {
                bot_token: String::new().into(),
                api_base_url: "https://api.telegram.org".to_string(),
                poll_timeout_secs: 60,
            },
            access: AccessConfig::default(),
            providers: Vec::new(),
            models: Vec::new(),
            prompts: vec![PromptConfig {
                name: DEFAULT_PROMPT_NAME.to_string(),
                content: DEFAULT_SYSTEM_PROMPT.to_string(),
            }],
            blocklist: Vec::new(),
            chat: ChatConfig {
                default_model: String::new(),
                default_temperature: 0.2,
                default_prompt: DEFAULT_PROMPT_NAME.to_string(),
                max_tokens_per_response: 4000,
                max_history_turns: 32,
            },
            delivery: DeliveryConfig {
                message_char_limit: 4096 - 64,
                edit_interval_ms: 2000,
                edit_threshold_divisor: 4000,
                edit_threshold_cap: 100,
                max_transport_retries: 5,
                render_markdown: true,
            },
            server: ServerConfig { bind_address: "127.0.0.1".to_string(), health_check_port: 8080 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn enabled() -> bool {
    true
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("ichigo.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|provider| provider.name == name)
    }

    pub fn prompt(&self, name: &str) -> Option<&PromptConfig> {
        self.prompts.iter().find(|prompt| prompt.name == name)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(telegram) = patch.telegram {
            if let Some(bot_token_value) = telegram.bot_token {
                self.telegram.bot_token = secret_value(bot_token_value);
            }
            if let Some(api_base_url) = telegram.api_base_url {
                self.telegram.api_base_url = api_base_url;
            }
            if let Some(poll_timeout_secs) = telegram.poll_timeout_secs {
                self.telegram.poll_timeout_secs = poll_timeout_secs;
            }
        }

        if let Some(access) = patch.access {
            self.access = access;
        }

        if let Some(providers) = patch.providers {
            self.providers = providers
                .into_iter()
                .map(|provider| ProviderConfig {
                    name: provider.name,
                    base_url: provider.base_url,
                    api_key: provider.api_key.map(secret_value),
                    timeout_secs: provider.timeout_secs.unwrap_or(120),
                })
                .collect();
        }

        if let Some(models) = patch.models {
            self.models = models;
        }

        if let Some(prompts) = patch.prompts {
            self.prompts = prompts;
        }

        if let Some(blocklist) = patch.blocklist {
            self.blocklist = blocklist;
        }

        if let Some(chat) = patch.chat {
            if let Some(default_model) = chat.default_model {
                self.chat.default_model = default_model;
            }
            if let Some(default_temperature) = chat.default_temperature {
                self.chat.default_temperature = default_temperature;
            }
            if let Some(default_prompt) = chat.default_prompt {
                self.chat.default_prompt = default_prompt;
            }
            if let Some(max_tokens_per_response) = chat.max_tokens_per_response {
                self.chat.max_tokens_per_response = max_tokens_per_response;
            }
            if let Some(max_history_turns) = chat.max_history_turns {
                self.chat.max_history_turns = max_history_turns;
            }
        }

        if let Some(delivery) = patch.delivery {
            if let Some(message_char_limit) = delivery.message_char_limit {
                self.delivery.message_char_limit = message_char_limit;
            }
            if let Some(edit_interval_ms) = delivery.edit_interval_ms {
                self.delivery.edit_interval_ms = edit_interval_ms;
            }
            if let Some(divisor) = delivery.edit_threshold_divisor {
                self.delivery.edit_threshold_divisor = divisor;
            }
            if let Some(cap) = delivery.edit_threshold_cap {
                self.delivery.edit_threshold_cap = cap;
            }
            if let Some(max_transport_retries) = delivery.max_transport_retries {
                self.delivery.max_transport_retries = max_transport_retries;
            }
            if let Some(render_markdown) = delivery.render_markdown {
                self.delivery.render_markdown = render_markdown;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(health_check_port) = server.health_check_port {
                self.server.health_check_port = health_check_port;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ICHIGO_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ICHIGO_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("ICHIGO_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ICHIGO_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ICHIGO_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ICHIGO_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = secret_value(value);
        }
        if let Some(value) = read_env("ICHIGO_TELEGRAM_API_BASE_URL") {
            self.telegram.api_base_url = value;
        }
        if let Some(value) = read_env("ICHIGO_TELEGRAM_POLL_TIMEOUT_SECS") {
            self.telegram.poll_timeout_secs =
                parse_u64("ICHIGO_TELEGRAM_POLL_TIMEOUT_SECS", &value)?;
        }

        for provider in &mut self.providers {
            let key = provider_api_key_env(&provider.name);
            if let Some(value) = read_env(&key) {
                provider.api_key = Some(secret_value(value));
            }
        }

        if let Some(value) = read_env("ICHIGO_CHAT_DEFAULT_MODEL") {
            self.chat.default_model = value;
        }
        if let Some(value) = read_env("ICHIGO_CHAT_DEFAULT_TEMPERATURE") {
            self.chat.default_temperature = parse_f32("ICHIGO_CHAT_DEFAULT_TEMPERATURE", &value)?;
        }
        if let Some(value) = read_env("ICHIGO_CHAT_MAX_HISTORY_TURNS") {
            self.chat.max_history_turns = parse_usize("ICHIGO_CHAT_MAX_HISTORY_TURNS", &value)?;
        }
        if let Some(value) = read_env("ICHIGO_CHAT_MAX_TOKENS_PER_RESPONSE") {
            self.chat.max_tokens_per_response =
                parse_u32("ICHIGO_CHAT_MAX_TOKENS_PER_RESPONSE", &value)?;
        }

        if let Some(value) = read_env("ICHIGO_DELIVERY_EDIT_INTERVAL_MS") {
            self.delivery.edit_interval_ms = parse_u64("ICHIGO_DELIVERY_EDIT_INTERVAL_MS", &value)?;
        }
        if let Some(value) = read_env("ICHIGO_DELIVERY_RENDER_MARKDOWN") {
            self.delivery.render_markdown = parse_bool("ICHIGO_DELIVERY_RENDER_MARKDOWN", &value)?;
        }

        if let Some(value) = read_env("ICHIGO_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("ICHIGO_SERVER_HEALTH_CHECK_PORT") {
            self.server.health_check_port = parse_u16("ICHIGO_SERVER_HEALTH_CHECK_PORT", &value)?;
        }

        let log_level = read_env("ICHIGO_LOGGING_LEVEL").or_else(|| read_env("ICHIGO_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ICHIGO_LOGGING_FORMAT").or_else(|| read_env("ICHIGO_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(bot_token) = overrides.telegram_bot_token {
            self.telegram.bot_token = secret_value(bot_token);
        }
        if let Some(default_model) = overrides.default_model {
            self.chat.default_model = default_model;
        }
        if let Some(max_history_turns) = overrides.max_history_turns {
            self.chat.max_history_turns = max_history_turns;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_telegram(&self.telegram)?;
        validate_access(&self.access)?;
        validate_catalog(self)?;
        validate_chat(self)?;
        validate_delivery(&self.delivery)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

/// Environment variable consulted for a provider's API key, e.g.
/// `ICHIGO_PROVIDER_OPEN_ROUTER_API_KEY` for a provider named `open-router`.
pub fn provider_api_key_env(provider_name: &str) -> String {
    let normalized: String = provider_name
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("ICHIGO_PROVIDER_{normalized}_API_KEY")
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    if let Some(path) = read_env("ICHIGO_CONFIG_PATH") {
        let path = PathBuf::from(path);
        return path.exists().then_some(path);
    }

    let mut candidates = vec![PathBuf::from("ichigo.toml"), PathBuf::from("config/ichigo.toml")];
    if let Some(data_dir) = read_env("ICHIGO_DATA_DIR") {
        candidates.push(PathBuf::from(data_dir).join("ichigo.toml"));
    }

    candidates.into_iter().find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_telegram(telegram: &TelegramConfig) -> Result<(), ConfigError> {
    let bot_token = telegram.bot_token.expose_secret();
    if bot_token.is_empty() {
        return Err(ConfigError::Validation(
            "telegram.bot_token is required. Ask @BotFather for a token and set ICHIGO_TELEGRAM_BOT_TOKEN".to_string(),
        ));
    }

    let well_formed = bot_token
        .split_once(':')
        .map(|(id, secret)| {
            !id.is_empty() && id.chars().all(|ch| ch.is_ascii_digit()) && !secret.is_empty()
        })
        .unwrap_or(false);
    if !well_formed {
        return Err(ConfigError::Validation(
            "telegram.bot_token must look like `<bot id>:<secret>` as issued by @BotFather"
                .to_string(),
        ));
    }

    let base_url = telegram.api_base_url.trim();
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "telegram.api_base_url must start with http:// or https://".to_string(),
        ));
    }

    if telegram.poll_timeout_secs == 0 || telegram.poll_timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "telegram.poll_timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_access(access: &AccessConfig) -> Result<(), ConfigError> {
    if access.admins.is_empty() && access.users.is_empty() && access.groups.is_empty() {
        return Err(ConfigError::Validation(
            "access must list at least one admin, user, or group id".to_string(),
        ));
    }
    Ok(())
}

fn validate_catalog(config: &AppConfig) -> Result<(), ConfigError> {
    let mut provider_names = HashSet::new();
    for provider in &config.providers {
        if provider.name.trim().is_empty() {
            return Err(ConfigError::Validation("providers[].name must not be empty".to_string()));
        }
        if !provider_names.insert(provider.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "provider `{}` is declared more than once",
                provider.name
            )));
        }
        if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
        {
            return Err(ConfigError::Validation(format!(
                "provider `{}` base_url must start with http:// or https://",
                provider.name
            )));
        }
        if provider.timeout_secs == 0 {
            return Err(ConfigError::Validation(format!(
                "provider `{}` timeout_secs must be greater than zero",
                provider.name
            )));
        }
    }

    if config.models.is_empty() {
        return Err(ConfigError::Validation(
            "models must declare at least one model alias".to_string(),
        ));
    }

    let mut aliases = HashSet::new();
    for model in &config.models {
        if model.alias.trim().is_empty() || model.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "models[].alias and models[].name must not be empty".to_string(),
            ));
        }
        if !aliases.insert(model.alias.as_str()) {
            return Err(ConfigError::Validation(format!(
                "model alias `{}` is declared more than once",
                model.alias
            )));
        }
        if !provider_names.contains(model.provider.as_str()) {
            return Err(ConfigError::Validation(format!(
                "model `{}` references unknown provider `{}`",
                model.alias, model.provider
            )));
        }
    }

    let mut prompt_names = HashSet::new();
    for prompt in &config.prompts {
        if !prompt_names.insert(prompt.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "prompt `{}` is declared more than once",
                prompt.name
            )));
        }
    }

    Ok(())
}

fn validate_chat(config: &AppConfig) -> Result<(), ConfigError> {
    let chat = &config.chat;
    if !config.models.iter().any(|model| model.alias == chat.default_model) {
        return Err(ConfigError::Validation(format!(
            "chat.default_model `{}` is not a declared model alias",
            chat.default_model
        )));
    }

    if config.prompt(&chat.default_prompt).is_none() {
        return Err(ConfigError::Validation(format!(
            "chat.default_prompt `{}` is not a declared prompt",
            chat.default_prompt
        )));
    }

    if !(0.0..=2.0).contains(&chat.default_temperature) {
        return Err(ConfigError::Validation(
            "chat.default_temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    if chat.max_history_turns < 2 {
        return Err(ConfigError::Validation(
            "chat.max_history_turns must be at least 2".to_string(),
        ));
    }

    if chat.max_tokens_per_response == 0 {
        return Err(ConfigError::Validation(
            "chat.max_tokens_per_response must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_delivery(delivery: &DeliveryConfig) -> Result<(), ConfigError> {
    if delivery.message_char_limit == 0 || delivery.message_char_limit > 4096 {
        return Err(ConfigError::Validation(
            "delivery.message_char_limit must be in range 1..=4096 (UTF-16 code units)"
                .to_string(),
        ));
    }

    if delivery.edit_interval_ms == 0 {
        return Err(ConfigError::Validation(
            "delivery.edit_interval_ms must be greater than zero".to_string(),
        ));
    }

    if delivery.edit_threshold_divisor == 0 {
        return Err(ConfigError::Validation(
            "delivery.edit_threshold_divisor must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.health_check_port == 0 {
        return Err(ConfigError::Validation(
            "server.health_check_port must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_f32(key: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse::<f32>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    telegram: Option<TelegramPatch>,
    access: Option<AccessConfig>,
    providers: Option<Vec<ProviderPatch>>,
    models: Option<Vec<ModelConfig>>,
    prompts: Option<Vec<PromptConfig>>,
    blocklist: Option<Vec<BlocklistRule>>,
    chat: Option<ChatPatch>,
    delivery: Option<DeliveryPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct TelegramPatch {
    bot_token: Option<String>,
    api_base_url: Option<String>,
    poll_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProviderPatch {
    name: String,
    base_url: String,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ChatPatch {
    default_model: Option<String>,
    default_temperature: Option<f32>,
    default_prompt: Option<String>,
    max_tokens_per_response: Option<u32>,
    max_history_turns: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct DeliveryPatch {
    message_char_limit: Option<usize>,
    edit_interval_ms: Option<u64>,
    edit_threshold_divisor: Option<u64>,
    edit_threshold_cap: Option<usize>,
    max_transport_retries: Option<u32>,
    render_markdown: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    health_check_port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
