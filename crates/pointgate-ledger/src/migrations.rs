use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

// Timestamps are RFC 3339 text in UTC so they sort lexicographically.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_accumulation_records",
        sql: r#"
CREATE TABLE IF NOT EXISTS accumulation_records (
    id TEXT PRIMARY KEY,
    member_id TEXT NOT NULL,
    partner_id TEXT NOT NULL,
    partner_class TEXT NOT NULL,
    amount BIGINT NOT NULL,
    points BIGINT NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    error_message TEXT,
    transaction_time TEXT NOT NULL,
    last_retry_time TEXT,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0002_retry_lookup",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_accumulation_records_status_retry
    ON accumulation_records(status, retry_count);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

pub fn applied_versions(connection: &Connection) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement =
        connection.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let rows = statement.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}
