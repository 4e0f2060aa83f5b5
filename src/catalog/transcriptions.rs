// Transcription records

use anyhow::{Context, Result};
use sqlx::Row;

use super::models::{transcription_from_row, Transcription};
use super::{fmt_ts, now, Catalog};

#[derive(Debug, Clone, PartialEq)]
pub struct NewTranscription {
    pub content: String,
    pub transmission_id: i64,
}

const TRANSCRIPTION_COLUMNS: &str =
    "id, created_at, updated_at, deleted_at, content, transmission_id";

impl Catalog {
    /// Save a batch of transcriptions in one transaction.
    ///
    /// A transmission can only ever have one transcription; inserting a
    /// second is an error.
    pub async fn insert_transcriptions(
        &self,
        batch: &[NewTranscription],
    ) -> Result<Vec<Transcription>> {
        let ts = now();
        let mut saved = Vec::with_capacity(batch.len());

        let mut tx = self.pool().begin().await?;
        for new in batch {
            let row = sqlx::query(
                "INSERT INTO transcriptions (created_at, updated_at, content, transmission_id)
                 VALUES ($1, $2, $3, $4)
                 RETURNING id",
            )
            .bind(fmt_ts(ts))
            .bind(fmt_ts(ts))
            .bind(&new.content)
            .bind(new.transmission_id)
            .fetch_one(&mut *tx)
            .await
            .context("unable to save the new transcriptions")?;

            saved.push(Transcription {
                id: row.try_get("id")?,
                created_at: ts,
                updated_at: ts,
                deleted_at: None,
                content: new.content.clone(),
                transmission_id: new.transmission_id,
            });
        }
        tx.commit().await?;

        Ok(saved)
    }

    pub async fn get_transcription(&self, id: i64) -> Result<Option<Transcription>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSCRIPTION_COLUMNS} FROM transcriptions
             WHERE id = $1 AND deleted_at IS NULL",
        ))
        .bind(id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(transcription_from_row).transpose()
    }

    pub async fn transcription_for_transmission(
        &self,
        transmission_id: i64,
    ) -> Result<Option<Transcription>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSCRIPTION_COLUMNS} FROM transcriptions
             WHERE transmission_id = $1 AND deleted_at IS NULL",
        ))
        .bind(transmission_id)
        .fetch_optional(self.pool())
        .await?;

        row.as_ref().map(transcription_from_row).transpose()
    }

    /// List transcriptions by ascending id, starting after the given id.
    pub async fn list_transcriptions(
        &self,
        after: Option<i64>,
        limit: i64,
    ) -> Result<super::Page<Transcription>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSCRIPTION_COLUMNS} FROM transcriptions
             WHERE deleted_at IS NULL AND transcriptions.id > $1
             ORDER BY transcriptions.id ASC
             LIMIT $2",
        ))
        .bind(after.unwrap_or(0))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        let items = rows
            .iter()
            .map(transcription_from_row)
            .collect::<Result<_>>()?;
        Ok(super::Page::new(items, limit))
    }

    pub async fn soft_delete_transcription(&self, id: i64) -> Result<()> {
        let ts = fmt_ts(now());
        sqlx::query(
            "UPDATE transcriptions SET deleted_at = $1, updated_at = $2
             WHERE id = $3 AND deleted_at IS NULL",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(id)
        .execute(self.pool())
        .await
        .context("unable to delete the transcription")?;
        Ok(())
    }
}
