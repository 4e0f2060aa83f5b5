// Stream records
//
// Streams are registered administratively; everything else in the catalog
// hangs off them.

use anyhow::{Context, Result};
use sqlx::Row;

use super::models::{stream_from_row, Stream};
use super::{fmt_ts, now, Catalog, Page};

/// Fields needed to register a new stream.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStream {
    pub display_name: String,
    pub url: String,
}

const STREAM_COLUMNS: &str =
    "id, created_at, updated_at, deleted_at, display_name, url";

impl Catalog {
    pub async fn insert_stream(&self, new: &NewStream) -> Result<Stream> {
        let ts = now();

        let row = sqlx::query(
            "INSERT INTO streams (created_at, updated_at, display_name, url)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(fmt_ts(ts))
        .bind(fmt_ts(ts))
        .bind(&new.display_name)
        .bind(&new.url)
        .fetch_one(self.pool())
        .await
        .with_context(|| format!("unable to save the stream {:?}", new.display_name))?;

        Ok(Stream {
            id: row.try_get("id")?,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
            display_name: new.display_name.clone(),
            url: new.url.clone(),
        })
    }

    pub async fn get_stream(&self, id: i64) -> Result<Option<Stream>> {
        let row = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams
             WHERE id = $1 AND deleted_at IS NULL",
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(stream_from_row).transpose()
    }

    pub async fn get_stream_by_name(&self, display_name: &str) -> Result<Option<Stream>> {
        let row = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams
             WHERE display_name = $1 AND deleted_at IS NULL",
        ))
        .bind(display_name)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(stream_from_row).transpose()
    }

    /// List streams by ascending id, starting after the given id.
    pub async fn list_streams(&self, after: Option<i64>, limit: i64) -> Result<Page<Stream>> {
        let rows = sqlx::query(&format!(
            "SELECT {STREAM_COLUMNS} FROM streams
             WHERE deleted_at IS NULL AND streams.id > $1
             ORDER BY streams.id ASC
             LIMIT $2",
        ))
        .bind(after.unwrap_or(0))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let items = rows.iter().map(stream_from_row).collect::<Result<_>>()?;
        Ok(Page::new(items, limit))
    }

    /// Mark a stream as deleted without touching its history.
    pub async fn soft_delete_stream(&self, id: i64) -> Result<()> {
        let ts = fmt_ts(now());
        sqlx::query(
            "UPDATE streams SET deleted_at = $1, updated_at = $2
             WHERE id = $3 AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id)
        .execute(self.pool())
        .await
        .context("unable to delete the stream")?;
        Ok(())
    }

    /// Permanently remove a stream and everything derived from it.
    pub async fn hard_delete_stream(&self, id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM transcriptions WHERE transmission_id IN (
                SELECT transmissions.id FROM transmissions
                JOIN chunks ON chunks.id = transmissions.chunk_id
                WHERE chunks.stream_id = $1
            )",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM transmissions WHERE chunk_id IN (
                SELECT id FROM chunks WHERE stream_id = $1
            )",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE stream_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM streams WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("unable to delete the stream")
    }
}
