// Transmission records
//
// One row per contiguous non-silent span split out of a chunk. The
// transcription loop drains the ones that don't have a transcription yet.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::models::{transmission_from_row, Transmission};
use super::{fmt_ts, now, trunc_micros, Catalog, Page};

#[derive(Debug, Clone, PartialEq)]
pub struct NewTransmission {
    pub timestamp: DateTime<Utc>,
    pub length: Duration,
    pub sha256: String,
    pub chunk_id: i64,
}

/// Equality filter for transmission listings. Filtering by stream joins
/// through the chunk table.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransmissionFilter {
    pub chunk_id: Option<i64>,
    pub stream_id: Option<i64>,
}

const TRANSMISSION_COLUMNS: &str =
    "transmissions.id, transmissions.created_at, transmissions.updated_at,
     transmissions.deleted_at, transmissions.timestamp, transmissions.length_ns,
     transmissions.sha256, transmissions.chunk_id";

impl Catalog {
    pub async fn insert_transmission(&self, new: &NewTransmission) -> Result<Transmission> {
        let ts = now();
        let timestamp = trunc_micros(new.timestamp);
        let length_ns = i64::try_from(new.length.as_nanos()).unwrap_or(i64::MAX);

        let row = sqlx::query(
            "INSERT INTO transmissions (created_at, updated_at, timestamp, length_ns, sha256, chunk_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(fmt_ts(ts))
        .bind(fmt_ts(ts))
        .bind(fmt_ts(timestamp))
        .bind(length_ns)
        .bind(&new.sha256)
        .bind(new.chunk_id)
        .fetch_one(self.pool())
        .await
        .context("unable to save the transmission")?;

        Ok(Transmission {
            id: row.try_get("id")?,
            created_at: ts,
            updated_at: ts,
            deleted_at: None,
            timestamp,
            length: Duration::from_nanos(length_ns.max(0) as u64),
            sha256: new.sha256.clone(),
            chunk_id: new.chunk_id,
        })
    }

    pub async fn get_transmission(&self, id: i64) -> Result<Option<Transmission>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSMISSION_COLUMNS} FROM transmissions
             WHERE id = $1 AND deleted_at IS NULL",
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(transmission_from_row).transpose()
    }

    pub async fn list_transmissions(
        &self,
        filter: TransmissionFilter,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Page<Transmission>> {
        let mut sql = format!("SELECT {TRANSMISSION_COLUMNS} FROM transmissions");
        if filter.stream_id.is_some() {
            sql.push_str(" JOIN chunks ON chunks.id = transmissions.chunk_id");
        }
        sql.push_str(
            " WHERE transmissions.deleted_at IS NULL AND transmissions.id > $1",
        );

        let mut placeholder = 1;
        if filter.chunk_id.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND transmissions.chunk_id = ${placeholder}"));
        }
        if filter.stream_id.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND chunks.stream_id = ${placeholder}"));
        }
        sql.push_str(&format!(
            " ORDER BY transmissions.id ASC LIMIT ${}",
            placeholder + 1,
        ));

        let mut query = sqlx::query(&sql).bind(after.unwrap_or(0));
        if let Some(chunk_id) = filter.chunk_id {
            query = query.bind(chunk_id);
        }
        if let Some(stream_id) = filter.stream_id {
            query = query.bind(stream_id);
        }
        let rows = query.bind(limit).fetch_all(self.pool()).await?;

        let items = rows
            .iter()
            .map(transmission_from_row)
            .collect::<Result<_>>()?;
        Ok(Page::new(items, limit))
    }

    /// The next batch of transmissions that still need speech-to-text, in
    /// ascending id order.
    pub async fn untranscribed_transmissions(&self, limit: i64) -> Result<Vec<Transmission>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSMISSION_COLUMNS} FROM transmissions
             LEFT JOIN transcriptions
               ON transcriptions.transmission_id = transmissions.id
               AND transcriptions.deleted_at IS NULL
             WHERE transcriptions.id IS NULL
               AND transmissions.deleted_at IS NULL
             ORDER BY transmissions.id ASC
             LIMIT $1",
        ))
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .context("failed to query untranscribed transmissions")?;

        rows.iter().map(transmission_from_row).collect()
    }

    /// Transmissions created after the given instant, oldest first. The
    /// stream filter joins through chunks.
    pub async fn transmissions_created_after(
        &self,
        since: DateTime<Utc>,
        filter: TransmissionFilter,
    ) -> Result<Vec<Transmission>> {
        let mut sql = format!("SELECT {TRANSMISSION_COLUMNS} FROM transmissions");
        if filter.stream_id.is_some() {
            sql.push_str(" JOIN chunks ON chunks.id = transmissions.chunk_id");
        }
        sql.push_str(
            " WHERE transmissions.deleted_at IS NULL AND transmissions.created_at > $1",
        );

        let mut placeholder = 1;
        if filter.chunk_id.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND transmissions.chunk_id = ${placeholder}"));
        }
        if filter.stream_id.is_some() {
            placeholder += 1;
            sql.push_str(&format!(" AND chunks.stream_id = ${placeholder}"));
        }
        sql.push_str(" ORDER BY transmissions.id ASC");

        let mut query = sqlx::query(&sql).bind(fmt_ts(since));
        if let Some(chunk_id) = filter.chunk_id {
            query = query.bind(chunk_id);
        }
        if let Some(stream_id) = filter.stream_id {
            query = query.bind(stream_id);
        }
        let rows = query.fetch_all(self.pool()).await?;

        rows.iter().map(transmission_from_row).collect()
    }

    pub async fn soft_delete_transmission(&self, id: i64) -> Result<()> {
        let ts = fmt_ts(now());
        sqlx::query(
            "UPDATE transmissions SET deleted_at = $1, updated_at = $2
             WHERE id = $3 AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id)
        .execute(self.pool())
        .await
        .context("unable to delete the transmission")?;
        Ok(())
    }

    /// Permanently remove a transmission and its transcription.
    pub async fn hard_delete_transmission(&self, id: i64) -> Result<()> {
        let mut tx = self.pool().begin().await?;

        sqlx::query("DELETE FROM transcriptions WHERE transmission_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM transmissions WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("unable to delete the transmission")
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_utils::test_catalog;
    use super::super::{NewChunk, NewStream, NewTranscription};
    use super::*;

    async fn seeded_chunk(catalog: &Catalog) -> (i64, i64) {
        let stream = catalog
            .insert_stream(&NewStream {
                display_name: "Test".to_string(),
                url: "...".to_string(),
            })
            .await
            .unwrap();
        let chunk = catalog
            .insert_chunk(&NewChunk {
                timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
                sha256: "00".repeat(32),
                stream_id: stream.id,
            })
            .await
            .unwrap();
        (stream.id, chunk.id)
    }

    fn transmission_at(chunk_id: i64, secs: i64) -> NewTransmission {
        NewTransmission {
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            length: Duration::from_secs(5),
            sha256: format!("{:064x}", secs),
            chunk_id,
        }
    }

    #[tokio::test]
    async fn untranscribed_only_returns_transmissions_without_a_transcription() {
        let (_dir, catalog) = test_catalog().await;
        let (_stream_id, chunk_id) = seeded_chunk(&catalog).await;

        let first = catalog
            .insert_transmission(&transmission_at(chunk_id, 0))
            .await
            .unwrap();
        let second = catalog
            .insert_transmission(&transmission_at(chunk_id, 10))
            .await
            .unwrap();

        let pending = catalog.untranscribed_transmissions(1000).await.unwrap();
        assert_eq!(pending, vec![first.clone(), second.clone()]);

        catalog
            .insert_transcriptions(&[NewTranscription {
                content: "copy that".to_string(),
                transmission_id: first.id,
            }])
            .await
            .unwrap();

        let pending = catalog.untranscribed_transmissions(1000).await.unwrap();
        assert_eq!(pending, vec![second]);
    }

    #[tokio::test]
    async fn stream_filter_joins_through_chunks() {
        let (_dir, catalog) = test_catalog().await;
        let (stream_id, chunk_id) = seeded_chunk(&catalog).await;

        let other_stream = catalog
            .insert_stream(&NewStream {
                display_name: "Other".to_string(),
                url: "...".to_string(),
            })
            .await
            .unwrap();
        let other_chunk = catalog
            .insert_chunk(&NewChunk {
                timestamp: DateTime::from_timestamp(1_700_000_060, 0).unwrap(),
                sha256: "11".repeat(32),
                stream_id: other_stream.id,
            })
            .await
            .unwrap();

        let mine = catalog
            .insert_transmission(&transmission_at(chunk_id, 0))
            .await
            .unwrap();
        catalog
            .insert_transmission(&transmission_at(other_chunk.id, 60))
            .await
            .unwrap();

        let page = catalog
            .list_transmissions(
                TransmissionFilter {
                    stream_id: Some(stream_id),
                    ..Default::default()
                },
                None,
                10,
            )
            .await
            .unwrap();
        assert_eq!(page.items, vec![mine.clone()]);

        let since = mine.created_at - chrono::Duration::seconds(1);
        let recent = catalog
            .transmissions_created_after(
                since,
                TransmissionFilter {
                    stream_id: Some(stream_id),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(recent, vec![mine]);
    }

    #[tokio::test]
    async fn lengths_survive_the_round_trip() {
        let (_dir, catalog) = test_catalog().await;
        let (_stream_id, chunk_id) = seeded_chunk(&catalog).await;

        let length = Duration::from_micros(8_028_800);
        let inserted = catalog
            .insert_transmission(&NewTransmission {
                length,
                ..transmission_at(chunk_id, 0)
            })
            .await
            .unwrap();

        let fetched = catalog
            .get_transmission(inserted.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.length, length);
        assert_eq!(fetched, inserted);
    }
}
