//! `openrating-migrate` — applies `migrations/*.sql` in lexical order inside
//! a transaction per file, recording progress in `__openrating_migrations`.
//! Forward-only: applies once, records, never rolls back. Connects with the
//! same retry-with-backoff helper the worker uses.

use openrating_core::config::Settings;
use openrating_core::store::postgres::PostgresStore;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let settings = Settings::load();
    settings.install_tracing();

    let store = PostgresStore::connect_with_retry(&settings.database_url, 10, Duration::from_millis(500), Duration::from_secs(30))
        .await
        .expect("failed to connect to postgres");
    let client = store.client();

    client
        .batch_execute(
            "CREATE TABLE IF NOT EXISTS __openrating_migrations (name TEXT PRIMARY KEY, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())"
        )
        .await
        .expect("failed to create migrations table");

    let mut entries: Vec<_> = std::fs::read_dir("migrations")
        .expect("migrations directory must exist")
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("sql"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().to_string();
        let already_applied = client
            .query_opt("SELECT 1 FROM __openrating_migrations WHERE name = $1", &[&name])
            .await
            .expect("failed to check migration status")
            .is_some();
        if already_applied {
            tracing::info!(migration = %name, "already applied, skipping");
            continue;
        }

        let sql = std::fs::read_to_string(entry.path()).expect("failed to read migration file");
        tracing::info!(migration = %name, "applying");

        client.batch_execute("BEGIN").await.expect("failed to begin transaction");
        if let Err(e) = client.batch_execute(&sql).await {
            client.batch_execute("ROLLBACK").await.ok();
            panic!("migration {name} failed: {e}");
        }
        client
            .execute("INSERT INTO __openrating_migrations (name) VALUES ($1)", &[&name])
            .await
            .expect("failed to record migration");
        client.batch_execute("COMMIT").await.expect("failed to commit transaction");

        tracing::info!(migration = %name, "applied");
    }
}
