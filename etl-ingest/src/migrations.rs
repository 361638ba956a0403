use etl_config::shared::{PgConnectionConfig, SessionRole};
use sqlx::migrate::Migrator;
use sqlx::{Connection, Executor, PgConnection};
use tracing::info;

static LEDGER_MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Creates the `etl` schema and applies the ledger migrations inside it.
///
/// sqlx keeps its `_sqlx_migrations` bookkeeping next to `etl.cdc_processed_files`.
pub async fn apply_ingest_migrations(config: &PgConnectionConfig) -> Result<(), sqlx::Error> {
    let mut connection =
        PgConnection::connect_with(&config.connect_options(SessionRole::Migrations)).await?;

    connection
        .execute("create schema if not exists etl; set search_path = 'etl';")
        .await?;

    info!(
        migrations = LEDGER_MIGRATOR.iter().count(),
        "applying ledger migrations"
    );
    LEDGER_MIGRATOR.run(&mut connection).await?;
    info!("ledger migrations applied");

    connection.close().await
}
