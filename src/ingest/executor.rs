// The archive executor
//
// Drains archive operations from a channel and applies them: chunk files
// get read into blob storage and recorded in the catalog, and split pieces
// are cut out of the chunk with a second decoder invocation, one task per
// piece.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::archiver::{ArchiveOperation, AudioSpan};
use super::preprocessor::DECODER_COMMAND;
use crate::blob::Storage;
use crate::catalog::{Catalog, Chunk, NewChunk, NewTransmission, Stream};
use crate::subprocess::{run_command, CommandOutcome};

/// Padding applied around split pieces so clips don't sound cut off.
const SPLIT_PADDING: Duration = Duration::from_millis(100);

/// Everything an archive operation needs to run.
#[derive(Clone)]
pub struct ArchiveState {
    pub storage: Arc<dyn Storage>,
    pub catalog: Catalog,
    pub stream: Stream,
}

/// A chunk whose file is still on disk because a SplitAudio for it may be
/// right behind its SaveChunk.
struct SavedChunk {
    path: PathBuf,
    chunk: Chunk,
}

/// Apply operations until the channel closes or the token fires.
pub(crate) async fn run_executor(
    mut ops: mpsc::Receiver<ArchiveOperation>,
    token: CancellationToken,
    state: ArchiveState,
) -> Result<()> {
    let mut pending: Option<SavedChunk> = None;

    loop {
        tokio::select! {
            // Checked first so nothing is applied once cancellation wins.
            biased;
            _ = token.cancelled() => return Ok(()),
            op = ops.recv() => match op {
                None => break,
                Some(op) => {
                    log::debug!("executing {op:?}");
                    apply(op, &mut pending, &token, &state).await?;
                }
            }
        }
    }

    if let Some(finished) = pending.take() {
        remove_chunk_file(&finished.path)?;
    }

    Ok(())
}

async fn apply(
    op: ArchiveOperation,
    pending: &mut Option<SavedChunk>,
    token: &CancellationToken,
    state: &ArchiveState,
) -> Result<()> {
    match op {
        ArchiveOperation::SaveChunk { path, timestamp } => {
            // The previous chunk can't receive a split any more.
            if let Some(finished) = pending.take() {
                remove_chunk_file(&finished.path)?;
            }

            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("unable to read {}", path.display()))?;

            let key = state
                .storage
                .store(&data)
                .await
                .with_context(|| format!("unable to save {} to blob storage", path.display()))?;

            let chunk = state
                .catalog
                .insert_chunk(&NewChunk {
                    timestamp,
                    sha256: key.to_string(),
                    stream_id: state.stream.id,
                })
                .await
                .with_context(|| {
                    format!("unable to save the chunk for {} ({key})", path.display())
                })?;

            log::info!(
                "Saved chunk {} ({} bytes) as {key}",
                path.display(),
                data.len(),
            );

            *pending = Some(SavedChunk { path, chunk });
        }
        ArchiveOperation::SplitAudio { path, pieces, .. } => {
            let chunk = match pending {
                Some(saved) if saved.path == path => saved.chunk.clone(),
                _ => bail!(
                    "asked to split {}, but that chunk was never saved",
                    path.display(),
                ),
            };

            split_chunk(state, &path, chunk, pieces, token).await?;
        }
    }

    Ok(())
}

fn remove_chunk_file(path: &Path) -> Result<()> {
    log::debug!("deleting original chunk file {}", path.display());
    std::fs::remove_file(path)
        .with_context(|| format!("unable to delete {}", path.display()))
}

/// Cut every piece out of the chunk, one task per piece. The first failure
/// cancels the remaining tasks.
async fn split_chunk(
    state: &ArchiveState,
    path: &Path,
    chunk: Chunk,
    pieces: Vec<AudioSpan>,
    token: &CancellationToken,
) -> Result<()> {
    log::debug!("splitting {} into {} snippet(s)", path.display(), pieces.len());

    let group = token.child_token();
    let mut tasks = JoinSet::new();

    for piece in pieces {
        let state = state.clone();
        let path = path.to_path_buf();
        let chunk = chunk.clone();
        let group = group.clone();
        tasks.spawn(async move { split_audio(&state, &path, piece, &chunk, &group).await });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.unwrap_or_else(|join_error| {
            bail!("a splitter task died: {join_error}")
        });
        if let Err(error) = result {
            if first_error.is_none() {
                group.cancel();
                first_error = Some(error);
            }
        }
    }

    match first_error {
        Some(error) => Err(error.context("unable to split audio")),
        None => Ok(()),
    }
}

/// The actual segment handed to the decoder: padded so the clip doesn't
/// start mid-syllable, and rounded to whole milliseconds.
fn padded_segment(piece: AudioSpan) -> (Duration, Duration) {
    let mut start = piece.start;
    let mut duration = piece.duration();

    if start > SPLIT_PADDING {
        start -= SPLIT_PADDING;
        duration += 2 * SPLIT_PADDING;
    }

    (round_to_millis(start), round_to_millis(duration))
}

fn round_to_millis(duration: Duration) -> Duration {
    let millis = (duration.as_nanos() + 500_000) / 1_000_000;
    Duration::from_millis(millis as u64)
}

fn format_seconds(duration: Duration) -> String {
    format!("{}", duration.as_secs_f64())
}

async fn split_audio(
    state: &ArchiveState,
    path: &Path,
    piece: AudioSpan,
    chunk: &Chunk,
    token: &CancellationToken,
) -> Result<()> {
    let tmp = std::env::temp_dir().join(format!("radiowatch-split-{}.mp3", Uuid::new_v4()));
    let _cleanup = RemoveOnDrop(tmp.clone());

    let (start, duration) = padded_segment(piece);

    let mut cmd = Command::new(DECODER_COMMAND);
    cmd.arg("-i")
        .arg(path)
        .args(["-ss", &format_seconds(start)])
        .args(["-t", &format_seconds(duration)])
        .args(["-acodec", "copy"])
        .args(["-hide_banner", "-nostdin", "-nostats"])
        .arg(&tmp);

    log::debug!("splitting {piece} out of {} with the decoder", path.display());

    match run_command(cmd, token).await? {
        // The pipeline is shutting down; dropping this piece is fine.
        CommandOutcome::Cancelled => return Ok(()),
        CommandOutcome::Completed(output) if !output.status.success() => {
            log::warn!(
                "the decoder errored out (code {:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr),
            );
            bail!("unable to extract {piece} from {}", path.display());
        }
        CommandOutcome::Completed(_) => {}
    }

    let data = tokio::fs::read(&tmp)
        .await
        .with_context(|| format!("unable to read the split from {}", tmp.display()))?;

    let key = state
        .storage
        .store(&data)
        .await
        .with_context(|| format!("unable to store {piece} from {}", path.display()))?;

    let transmission = state
        .catalog
        .insert_transmission(&NewTransmission {
            timestamp: chunk.timestamp + chrono::Duration::nanoseconds(piece.start.as_nanos() as i64),
            length: piece.duration(),
            sha256: key.to_string(),
            chunk_id: chunk.id,
        })
        .await
        .context("unable to save the transmission")?;

    log::info!(
        "Saved transmission {} ({} bytes, {piece})",
        transmission.id,
        data.len(),
    );

    Ok(())
}

/// Deletes a temporary file on every exit path; missing files are fine
/// (the decoder may have failed before creating it).
struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        if let Err(error) = std::fs::remove_file(&self.0) {
            if error.kind() != std::io::ErrorKind::NotFound {
                log::warn!(
                    "unable to delete the temporary file {}: {error}",
                    self.0.display(),
                );
            }
        }
    }
}
