use std::sync::Arc;

use ichigo_agent::{
    default_settings, DeliveryContext, ProviderError, ProviderRegistry, SessionLimits,
    SessionManager, SessionSetup,
};
use ichigo_core::config::{AppConfig, ConfigError, LoadOptions};
use ichigo_core::{
    AccessPolicy, Catalog, DeliveryPolicy, PlainRenderer, Renderer, Throttler, TransportError,
};
use ichigo_db::{connect_with_config, migrations, DbPool, SqlConversationStore};
use ichigo_telegram::{MarkdownV2Renderer, TelegramClient};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

use crate::dispatch::Dispatcher;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub telegram: Arc<TelegramClient>,
    pub access: Arc<AccessPolicy>,
    pub dispatcher: Dispatcher,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("telegram client setup failed: {0}")]
    Transport(#[source] TransportError),
    #[error("provider client setup failed: {0}")]
    Provider(#[source] ProviderError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool =
        connect_with_config(&config.database).await.map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let catalog = Arc::new(Catalog::from_config(&config));
    let access = Arc::new(AccessPolicy::new(&config.access, &config.blocklist, &catalog));
    let providers = ProviderRegistry::from_config(&config).map_err(BootstrapError::Provider)?;
    let telegram =
        Arc::new(TelegramClient::new(&config.telegram).map_err(BootstrapError::Transport)?);

    let renderer: Arc<dyn Renderer> = if config.delivery.render_markdown {
        Arc::new(MarkdownV2Renderer)
    } else {
        Arc::new(PlainRenderer)
    };
    let delivery = DeliveryContext {
        transport: telegram.clone(),
        renderer,
        throttler: Arc::new(Throttler::new(config.delivery.edit_interval())),
        policy: DeliveryPolicy::from(&config.delivery),
    };

    let (finished_tx, finished_rx) = mpsc::unbounded_channel();
    let sessions = SessionManager::start(
        SessionSetup {
            catalog,
            access: access.clone(),
            providers,
            delivery,
            store: Arc::new(SqlConversationStore::new(db_pool.clone())),
            defaults: default_settings(&config.chat),
            limits: SessionLimits::from(&config.chat),
        },
        finished_tx,
    )
    .await;
    let dispatcher = Dispatcher::new(sessions, telegram.clone(), finished_rx);

    info!(
        event_name = "system.bootstrap.ready",
        conversations = access.conversation_ids().len(),
        providers = config.providers.len(),
        models = config.models.len(),
        "application bootstrap complete"
    );

    Ok(Application { config, db_pool, telegram, access, dispatcher })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use ichigo_core::config::{ConfigOverrides, LoadOptions};
    use ichigo_core::ConversationId;
    use tempfile::TempDir;

    use crate::bootstrap::{bootstrap, BootstrapError};

    const CONFIG: &str = r#"
[telegram]
bot_token = "123456:bootstrap-secret"

[access]
admins = [1001]
users = [1002]
groups = [-2001]

[[providers]]
name = "openai"
base_url = "https://api.openai.com/v1"
api_key = "sk-test"

[[models]]
alias = "mini"
name = "gpt-4o-mini"
provider = "openai"
stream = true

[chat]
default_model = "mini"
"#;

    fn write_config(dir: &TempDir) -> PathBuf {
        let path = dir.path().join("ichigo.toml");
        fs::write(&path, CONFIG).expect("write config");
        path
    }

    fn options(dir: &TempDir, overrides: ConfigOverrides) -> LoadOptions {
        LoadOptions { config_path: Some(write_config(dir)), require_file: true, overrides }
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_malformed_bot_token() {
        let dir = TempDir::new().expect("temp dir");
        let result = bootstrap(options(
            &dir,
            ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                telegram_bot_token: Some("invalid-token".to_string()),
                ..ConfigOverrides::default()
            },
        ))
        .await;

        let Err(error) = result else {
            panic!("bootstrap should reject the token");
        };
        assert!(matches!(error, BootstrapError::Config(_)));
        assert!(error.to_string().contains("telegram.bot_token"));
    }

    #[tokio::test]
    async fn bootstrap_migrates_and_seeds_allow_listed_conversations() {
        let dir = TempDir::new().expect("temp dir");
        let database_url = format!("sqlite://{}?mode=rwc", dir.path().join("ichigo.db").display());
        let app = bootstrap(options(
            &dir,
            ConfigOverrides { database_url: Some(database_url), ..ConfigOverrides::default() },
        ))
        .await
        .expect("bootstrap should succeed");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' AND name IN ('conversations', 'conversation_turns')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 2);

        let (stored,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM conversations")
            .fetch_one(&app.db_pool)
            .await
            .expect("count query");
        assert_eq!(stored, 3, "defaults are written for every allow-listed identity");

        assert!(app.access.is_allowed(ConversationId(-2001)));
        let record = app.dispatcher.sessions().conversation(ConversationId(1002));
        assert_eq!(record.map(|record| record.model()), Some("mini"));
    }
}
