use crate::commands::{run_with_database, CommandResult};
use ichigo_db::migrations;

pub fn run() -> CommandResult {
    let applied = run_with_database("migrate", |_config, pool| async move {
        migrations::run_pending(&pool)
            .await
            .map_err(|error| ("migration", error.to_string(), 5u8))?;
        Ok(migrations::MIGRATOR
            .iter()
            .filter(|migration| migration.migration_type.is_up_migration())
            .count())
    });

    match applied {
        Ok(count) => {
            CommandResult::success("migrate", format!("schema is current ({count} migrations)"))
        }
        Err(failure) => failure,
    }
}
