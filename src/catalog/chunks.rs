// Chunk records
//
// One row per 60-second clip the preprocessor wrote, keyed into blob
// storage by the clip's sha256.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::{chunk_from_row, Chunk};
use super::{fmt_ts, now, trunc_micros, Catalog, Page};

#[derive(Debug, Clone, PartialEq)]
pub struct NewChunk {
    pub timestamp: DateTime<Utc>,
    pub sha256: String,
    pub stream_id: i64,
}

/// Equality filter for chunk listings.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ChunkFilter {
    pub stream_id: Option<i64>,
}

const CHUNK_COLUMNS: &str =
    "chunks.id, chunks.created_at, chunks.updated_at, chunks.deleted_at,
     chunks.timestamp, chunks.sha256, chunks.stream_id";

impl Catalog {
    pub async fn insert_chunk(&self, new: &NewChunk) -> Result<Chunk> {
        let ts = now();
        let timestamp = trunc_micros(new.timestamp);

        let row = sqlx::query(
            "INSERT INTO chunks (created_at, updated_at, timestamp, sha256, stream_id)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id",
        )
        .bind(fmt_ts(ts))
        .bind(fmt_ts(ts))
        .bind(fmt_ts(timestamp))
        .bind(&new.sha256)
        .bind(new.stream_id)
        .fetch_one(self.pool())
        .await
        .with_context(|| format!("unable to save the chunk {}", new.sha256))?;

        Ok(Chunk {
            id: row.try_get("id")?,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
            timestamp,
            sha256: new.sha256.clone(),
            stream_id: new.stream_id,
        })
    }

    pub async fn get_chunk(&self, id: i64) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE id = $1 AND deleted_at IS NULL",
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    pub async fn list_chunks(
        &self,
        filter: ChunkFilter,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Page<Chunk>> {
        let mut sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE chunks.deleted_at IS NULL AND chunks.id > $1",
        );
        if filter.stream_id.is_some() {
            sql.push_str(" AND chunks.stream_id = $2");
        }
        sql.push_str(&format!(
            " ORDER BY chunks.id ASC LIMIT ${}",
            if filter.stream_id.is_some() { 3 } else { 2 },
        ));

        let mut query = sqlx::query(&sql).bind(after.unwrap_or(0));
        if let Some(stream_id) = filter.stream_id {
            query = query.bind(stream_id);
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;

        let items = rows.iter().map(chunk_from_row).collect::<Result<_>>()?;
        Ok(Page::new(items, limit))
    }

    /// Chunks created after the given instant, oldest first. This is the
    /// polling query behind chunk subscriptions.
    pub async fn chunks_created_after(
        &self,
        since: DateTime<Utc>,
        filter: ChunkFilter,
    ) -> Result<Vec<Chunk>> {
        let mut sql = format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks
             WHERE chunks.deleted_at IS NULL AND chunks.created_at > $1",
        );
        if filter.stream_id.is_some() {
            sql.push_str(" AND chunks.stream_id = $2");
        }
        sql.push_str(" ORDER BY chunks.id ASC");

        let mut query = sqlx::query(&sql).bind(fmt_ts(since));
        if let Some(stream_id) = filter.stream_id {
            query = query.bind(stream_id);
        }
        let rows = query.fetch_all(self.pool()).await?;

        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn soft_delete_chunk(&self, id: i64) -> Result<()> {
        let ts = fmt_ts(now());
        sqlx::query(
            "UPDATE chunks SET deleted_at = $1, updated_at = $2
             WHERE id = $3 AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id)
        .execute(self.pool())
        .await
        .context("unable to delete the chunk")?;
        Ok(())
    }

    /// Permanently remove a chunk, its transmissions, and their
    /// transcriptions.
    pub async fn hard_delete_chunk(&self, id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "DELETE FROM transcriptions WHERE transmission_id IN (
                SELECT id FROM transmissions WHERE chunk_id = $1
            )",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM transmissions WHERE chunk_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM chunks WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("unable to delete the chunk")
    }
}
