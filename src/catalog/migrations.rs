// Catalog schema migrations
//
// A schema_version table records which migrations have been applied; every
// open() replays whatever is missing. DDL differs slightly per driver
// (auto-increment keys), so each migration carries one statement list per
// backend.

use anyhow::{Context, Result};
use sqlx::{AnyPool, Row};

use super::{fmt_ts, now, Driver};

struct Migration {
    version: i64,
    sqlite: &'static [&'static str],
    postgres: &'static [&'static str],
}

const MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sqlite: &[
        "CREATE TABLE streams (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            display_name TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL
        )",
        "CREATE TABLE chunks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            timestamp TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            stream_id BIGINT NOT NULL REFERENCES streams(id)
        )",
        "CREATE INDEX idx_chunks_stream_id ON chunks(stream_id)",
        "CREATE TABLE transmissions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            timestamp TEXT NOT NULL,
            length_ns BIGINT NOT NULL,
            sha256 TEXT NOT NULL,
            chunk_id BIGINT NOT NULL REFERENCES chunks(id)
        )",
        "CREATE INDEX idx_transmissions_chunk_id ON transmissions(chunk_id)",
        "CREATE TABLE transcriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            content TEXT NOT NULL,
            transmission_id BIGINT NOT NULL REFERENCES transmissions(id)
        )",
        "CREATE UNIQUE INDEX idx_transcriptions_transmission_id
            ON transcriptions(transmission_id)",
    ],
    postgres: &[
        "CREATE TABLE streams (
            id BIGSERIAL PRIMARY KEY,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            display_name TEXT NOT NULL UNIQUE,
            url TEXT NOT NULL
        )",
        "CREATE TABLE chunks (
            id BIGSERIAL PRIMARY KEY,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            timestamp TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            stream_id BIGINT NOT NULL REFERENCES streams(id)
        )",
        "CREATE INDEX idx_chunks_stream_id ON chunks(stream_id)",
        "CREATE TABLE transmissions (
            id BIGSERIAL PRIMARY KEY,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            timestamp TEXT NOT NULL,
            length_ns BIGINT NOT NULL,
            sha256 TEXT NOT NULL,
            chunk_id BIGINT NOT NULL REFERENCES chunks(id)
        )",
        "CREATE INDEX idx_transmissions_chunk_id ON transmissions(chunk_id)",
        "CREATE TABLE transcriptions (
            id BIGSERIAL PRIMARY KEY,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            content TEXT NOT NULL,
            transmission_id BIGINT NOT NULL REFERENCES transmissions(id)
        )",
        "CREATE UNIQUE INDEX idx_transcriptions_transmission_id
            ON transcriptions(transmission_id)",
    ],
}];

/// Bring the schema up to date.
pub(crate) async fn run(pool: &AnyPool, driver: Driver) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version BIGINT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("unable to create the schema_version table")?;

    let current = current_version(pool).await?;

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        log::info!("running catalog migration v{}", migration.version);

        let statements = match driver {
            Driver::Sqlite => migration.sqlite,
            Driver::Postgres => migration.postgres,
        };

        let mut tx = pool.begin().await?;
        for statement in statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration v{} failed", migration.version))?;
        }
        sqlx::query("INSERT INTO schema_version (version, applied_at) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(fmt_ts(now()))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}

async fn current_version(pool: &AnyPool) -> Result<i64> {
    let row = sqlx::query("SELECT MAX(version) AS version FROM schema_version")
        .fetch_one(pool)
        .await?;
    let version: Option<i64> = row.try_get("version")?;
    Ok(version.unwrap_or(0))
}
