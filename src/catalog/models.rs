// Catalog models
//
// Every entity carries created/updated/deleted timestamps; deleted_at is
// the soft-delete marker and rows with it set are invisible to normal
// queries.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::Row;

use super::parse_ts;
use crate::ids::Entity;

/// An audio stream downloaded from the internet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// The human-friendly name for this stream.
    pub display_name: String,
    /// A URL that can be passed to the decoder to download the stream.
    pub url: String,
}

/// A raw chunk of audio downloaded from a particular stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// When the audio was produced.
    pub timestamp: DateTime<Utc>,
    /// Hex-encoded blob key of the audio clip.
    pub sha256: String,
    pub stream_id: i64,
}

/// A single radio transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmission {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    /// When the transmission was made.
    pub timestamp: DateTime<Utc>,
    /// How long the transmission goes for.
    pub length: Duration,
    /// Hex-encoded blob key of the audio clip.
    pub sha256: String,
    pub chunk_id: i64,
}

/// The result of running speech-to-text on a transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub content: String,
    pub transmission_id: i64,
}

impl Entity for Stream {
    const TYPE_NAME: &'static str = "Stream";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for Chunk {
    const TYPE_NAME: &'static str = "Chunk";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for Transmission {
    const TYPE_NAME: &'static str = "Transmission";

    fn id(&self) -> i64 {
        self.id
    }
}

impl Entity for Transcription {
    const TYPE_NAME: &'static str = "Transcription";

    fn id(&self) -> i64 {
        self.id
    }
}

fn timestamps(row: &AnyRow) -> Result<(DateTime<Utc>, DateTime<Utc>, Option<DateTime<Utc>>)> {
    let created_at = parse_ts(&row.try_get::<String, _>("created_at")?)?;
    let updated_at = parse_ts(&row.try_get::<String, _>("updated_at")?)?;
    let deleted_at = match row.try_get::<Option<String>, _>("deleted_at")? {
        Some(raw) => Some(parse_ts(&raw)?),
        None => None,
    };
    Ok((created_at, updated_at, deleted_at))
}

pub(crate) fn stream_from_row(row: &AnyRow) -> Result<Stream> {
    let (created_at, updated_at, deleted_at) = timestamps(row)?;
    Ok(Stream {
        id: row.try_get("id")?,
        created_at,
        updated_at,
        deleted_at,
        display_name: row.try_get("display_name")?,
        url: row.try_get("url")?,
    })
}

pub(crate) fn chunk_from_row(row: &AnyRow) -> Result<Chunk> {
    let (created_at, updated_at, deleted_at) = timestamps(row)?;
    Ok(Chunk {
        id: row.try_get("id")?,
        created_at,
        updated_at,
        deleted_at,
        timestamp: parse_ts(&row.try_get::<String, _>("timestamp")?)?,
        sha256: row.try_get("sha256")?,
        stream_id: row.try_get("stream_id")?,
    })
}

pub(crate) fn transmission_from_row(row: &AnyRow) -> Result<Transmission> {
    let (created_at, updated_at, deleted_at) = timestamps(row)?;
    let length_ns: i64 = row.try_get("length_ns")?;
    Ok(Transmission {
        id: row.try_get("id")?,
        created_at,
        updated_at,
        deleted_at,
        timestamp: parse_ts(&row.try_get::<String, _>("timestamp")?)?,
        length: Duration::from_nanos(length_ns.max(0) as u64),
        sha256: row.try_get("sha256")?,
        chunk_id: row.try_get("chunk_id")?,
    })
}

pub(crate) fn transcription_from_row(row: &AnyRow) -> Result<Transcription> {
    let (created_at, updated_at, deleted_at) = timestamps(row)?;
    Ok(Transcription {
        id: row.try_get("id")?,
        created_at,
        updated_at,
        deleted_at,
        content: row.try_get("content")?,
        transmission_id: row.try_get("transmission_id")?,
    })
}
