// Per-stream processing
//
// Wires the preprocessor, the archiver, and the archive executor together
// for a single stream. Chunk files live in a per-session temp directory
// that is removed when the session ends, whichever way it ends.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::archiver::{run_archiver, Archiver};
use super::executor::{run_executor, ArchiveState};
use super::preprocessor::preprocess;
use crate::blob::Storage;
use crate::catalog::{Catalog, Stream};

/// The executor applies one operation at a time; a single-slot channel
/// means the archiver blocks rather than racing ahead of it.
const OPERATION_BUFFER: usize = 1;

const EVENT_BUFFER: usize = 16;

/// Ingest a stream until it ends, fails, or the token fires.
///
/// Any task failing takes the whole session down; cancellation is a clean
/// exit.
pub async fn process_stream(
    token: CancellationToken,
    stream: Stream,
    storage: Arc<dyn Storage>,
    catalog: Catalog,
) -> Result<()> {
    let temp = tempfile::Builder::new()
        .prefix("radiowatch-")
        .tempdir()
        .context("unable to create a temporary directory")?;

    log::debug!(
        "saving clips for stream {} ({}) to {}",
        stream.id,
        stream.display_name,
        temp.path().display(),
    );

    let (ops_tx, ops_rx) = mpsc::channel(OPERATION_BUFFER);
    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

    let archiver = Archiver::new(ops_tx, token.clone(), Utc::now);
    let url = stream.url.clone();
    let state = ArchiveState {
        storage,
        catalog,
        stream,
    };

    // The preprocessor owns the event sender and the archiver owns the
    // operation sender, so each stage ending closes the next one's input.
    tokio::try_join!(
        preprocess(token.clone(), &url, temp.path(), events_tx),
        async {
            run_archiver(events_rx, archiver).await;
            Ok::<(), anyhow::Error>(())
        },
        run_executor(ops_rx, token.clone(), state),
    )?;

    Ok(())
}
