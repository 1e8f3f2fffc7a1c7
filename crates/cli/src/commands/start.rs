use ichigo_core::{AccessPolicy, Catalog};

use crate::commands::{run_with_database, CommandResult};

/// Checks that `ichigod` would get past bootstrap: the config validates and
/// the database accepts connections. Makes no changes.
pub fn run() -> CommandResult {
    let summary = run_with_database("start", |config, pool| async move {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;

        let catalog = Catalog::from_config(&config);
        let access = AccessPolicy::new(&config.access, &config.blocklist, &catalog);
        Ok(format!(
            "preflight passed: {} conversations, {} models, {} providers; \
             run `ichigod` to start relaying",
            access.conversation_ids().len(),
            catalog.aliases().count(),
            config.providers.len()
        ))
    });

    match summary {
        Ok(message) => CommandResult::success("start", message),
        Err(failure) => failure,
    }
}
