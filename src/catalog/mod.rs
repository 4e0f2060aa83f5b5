// Relational catalog
//
// Durable record of streams, the chunks downloaded from them, the
// transmissions split out of those chunks, and their transcriptions.
// Backed by sqlx's Any driver so the same query layer runs against either
// an embedded sqlite3 file or a postgres server; the driver is picked by a
// short name plus a connection string, and migrations run at open.

mod chunks;
mod migrations;
mod models;
mod streams;
mod transcriptions;
mod transmissions;

use std::sync::Once;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::AnyPoolOptions;
use sqlx::AnyPool;
use thiserror::Error;

pub use chunks::{ChunkFilter, NewChunk};
pub use models::{Chunk, Stream, Transcription, Transmission};
pub use streams::NewStream;
pub use transcriptions::NewTranscription;
pub use transmissions::{NewTransmission, TransmissionFilter};

use crate::ids::Entity;

/// Drivers the catalog can be opened with.
const DRIVERS: &[&str] = &["sqlite3", "postgres"];

#[derive(Debug, Error)]
#[error("unknown database driver {driver:?}, expected one of {}", DRIVERS.join(", "))]
pub struct UnknownDriver {
    driver: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Driver {
    Sqlite,
    Postgres,
}

/// One page of a keyset-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub has_next_page: bool,
    /// Opaque cursor addressing the last item on this page.
    pub end_cursor: Option<String>,
}

impl<T: Entity> Page<T> {
    fn new(items: Vec<T>, limit: i64) -> Page<T> {
        let has_next_page = items.len() as i64 >= limit;
        let end_cursor = items.last().map(|item| crate::ids::encode(item));
        Page {
            items,
            has_next_page,
            end_cursor,
        }
    }
}

/// A handle to the catalog. Cheap to clone; clones share one pool.
#[derive(Clone, Debug)]
pub struct Catalog {
    pool: AnyPool,
    driver: Driver,
}

impl Catalog {
    /// Open (and migrate) a catalog.
    ///
    /// `driver` is `"sqlite3"` with a database file path, or `"postgres"`
    /// with a `postgres://` connection URL.
    pub async fn open(driver: &str, conn: &str) -> Result<Catalog> {
        static INSTALL_DRIVERS: Once = Once::new();
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let (driver, url) = match driver {
            "sqlite3" => {
                let url = if conn.starts_with("sqlite:") {
                    conn.to_string()
                } else {
                    format!("sqlite://{conn}?mode=rwc")
                };
                (Driver::Sqlite, url)
            }
            "postgres" => (Driver::Postgres, conn.to_string()),
            other => {
                return Err(UnknownDriver {
                    driver: other.to_string(),
                }
                .into())
            }
        };

        // sqlite only ever has a single writer; a one-connection pool keeps
        // concurrent inserts from tripping over the file lock.
        let max_connections = match driver {
            Driver::Sqlite => 1,
            Driver::Postgres => 5,
        };

        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await
            .context("unable to open the database")?;

        log::debug!("applying migrations");
        migrations::run(&pool, driver)
            .await
            .context("unable to run database migrations")?;

        Ok(Catalog { pool, driver })
    }

    pub(crate) fn pool(&self) -> &AnyPool {
        &self.pool
    }

    #[allow(dead_code)]
    pub(crate) fn driver(&self) -> Driver {
        self.driver
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so that string
/// comparison is chronological on both backends.
pub(crate) fn fmt_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("{raw:?} isn't a valid timestamp"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Clamp a timestamp to the precision the catalog stores, so values read
/// back from the database compare equal to the ones that were written.
pub(crate) fn trunc_micros(t: DateTime<Utc>) -> DateTime<Utc> {
    t - chrono::Duration::nanoseconds(i64::from(t.timestamp_subsec_nanos() % 1_000))
}

/// The current time, at stored precision.
pub(crate) fn now() -> DateTime<Utc> {
    trunc_micros(Utc::now())
}
