use ichigo_core::{AccessPolicy, Catalog};
use ichigo_db::{migrations, ConversationStore, SqlConversationStore};

use crate::commands::{run_with_database, CommandResult};

/// Same reconciliation as the `/tidy` bot command, run offline against the
/// configured database.
pub fn run() -> CommandResult {
    let removed = run_with_database("tidy", |config, pool| async move {
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;

        let catalog = Catalog::from_config(&config);
        let access = AccessPolicy::new(&config.access, &config.blocklist, &catalog);
        SqlConversationStore::new(pool)
            .delete_conversations_not_in(&access.conversation_ids())
            .await
            .map_err(|error| ("store", error.to_string(), 6u8))
    });

    match removed {
        Ok(removed) => {
            CommandResult::success("tidy", format!("removed {removed} stale conversation(s)"))
        }
        Err(failure) => failure,
    }
}
