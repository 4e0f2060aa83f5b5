// The archiver state machine
//
// Folds the preprocessing event stream into archive operations. It tracks
// which chunk file the decoder is writing, when the recording started, and
// the non-silent spans seen so far, and emits one SaveChunk (plus a
// SplitAudio when there's anything worth splitting) per completed chunk.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::PreprocessEvent;
use crate::CHUNK_LENGTH;

/// Spans shorter than this are noise, not transmissions.
const MIN_SPAN: Duration = Duration::from_millis(10);

/// A piece of audio within a chunk, measured from the chunk's start.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AudioSpan {
    pub start: Duration,
    pub end: Duration,
}

impl AudioSpan {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

impl fmt::Debug for AudioSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for AudioSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.3}s..{:.3}s",
            self.start.as_secs_f64(),
            self.end.as_secs_f64(),
        )
    }
}

/// Work for the archive executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ArchiveOperation {
    /// Persist a completed chunk file into blob storage and the catalog.
    SaveChunk {
        path: PathBuf,
        /// When the chunk's audio started.
        timestamp: DateTime<Utc>,
    },
    /// Split the named chunk into one clip per piece.
    SplitAudio {
        path: PathBuf,
        /// When the chunk's audio started.
        timestamp: DateTime<Utc>,
        pieces: Vec<AudioSpan>,
    },
}

pub(crate) struct Archiver {
    ops: mpsc::Sender<ArchiveOperation>,
    token: CancellationToken,
    now: fn() -> DateTime<Utc>,

    recording_started: DateTime<Utc>,
    file_index: u32,
    current_file: Option<PathBuf>,
    in_silence: bool,
    audio_started: Duration,
    spans: Vec<AudioSpan>,
}

impl Archiver {
    pub(crate) fn new(
        ops: mpsc::Sender<ArchiveOperation>,
        token: CancellationToken,
        now: fn() -> DateTime<Utc>,
    ) -> Archiver {
        Archiver {
            ops,
            token,
            now,
            recording_started: DateTime::UNIX_EPOCH,
            file_index: 0,
            current_file: None,
            in_silence: false,
            audio_started: Duration::ZERO,
            spans: Vec::new(),
        }
    }

    pub(crate) async fn handle(&mut self, event: PreprocessEvent) {
        match event {
            PreprocessEvent::DownloadStarted => {
                self.recording_started = (self.now)();
            }
            PreprocessEvent::StartWriting { path } => {
                if self.current_file.is_some() {
                    self.complete_file(true).await;
                    self.file_index += 1;
                }
                self.current_file = Some(path);
            }
            PreprocessEvent::SilenceStart { at } => {
                let offset = self.chunk_offset();
                let span = AudioSpan {
                    start: self.audio_started.saturating_sub(offset),
                    end: at.saturating_sub(offset),
                };
                // Ignore tiny blips of audio.
                if span.duration() > MIN_SPAN {
                    self.spans.push(span);
                }
                self.in_silence = true;
            }
            PreprocessEvent::SilenceEnd { at, .. } => {
                self.audio_started = at;
                self.in_silence = false;
            }
            PreprocessEvent::Finished => {
                if self.current_file.is_some() {
                    // Make sure the last chunk gets persisted, too.
                    self.complete_file(false).await;
                }
            }
            PreprocessEvent::UnknownMessage(msg) => {
                log::debug!("unknown decoder message: [{}] {}", msg.component, msg.payload);
            }
            PreprocessEvent::UninterpretedStderr { line } => {
                log::debug!("decoder stderr: {line}");
            }
        }
    }

    fn chunk_offset(&self) -> Duration {
        CHUNK_LENGTH * self.file_index
    }

    async fn complete_file(&mut self, audio_may_continue: bool) {
        let Some(path) = self.current_file.clone() else {
            return;
        };

        let offset = self.chunk_offset();
        let clip_start =
            self.recording_started + chrono::Duration::nanoseconds(offset.as_nanos() as i64);

        self.emit(ArchiveOperation::SaveChunk {
            path: path.clone(),
            timestamp: clip_start,
        })
        .await;

        if !self.in_silence && audio_may_continue {
            // Audio is still running at the boundary: split out what we
            // have up to the end of this chunk, and pick the rest up from
            // the boundary in the next one.
            let span = AudioSpan {
                start: self.audio_started.saturating_sub(offset),
                end: CHUNK_LENGTH,
            };
            // The silence filter can report an end slightly past the
            // boundary, which would make a degenerate span; skip those.
            if span.start < span.end {
                self.spans.push(span);
            }
            self.audio_started = offset + CHUNK_LENGTH;
        }

        if !self.spans.is_empty() {
            let pieces = std::mem::take(&mut self.spans);
            self.emit(ArchiveOperation::SplitAudio {
                path,
                timestamp: clip_start,
                pieces,
            })
            .await;
        }
    }

    async fn emit(&self, op: ArchiveOperation) {
        tokio::select! {
            result = self.ops.send(op) => {
                // The receiver disappearing means the pipeline is shutting
                // down; there's nothing useful to do with the operation.
                let _ = result;
            }
            _ = self.token.cancelled() => {}
        }
    }
}

/// Fold preprocessing events into archive operations until the event
/// stream ends.
pub(crate) async fn run_archiver(
    mut events: mpsc::Receiver<PreprocessEvent>,
    mut archiver: Archiver,
) {
    while let Some(event) = events.recv().await {
        archiver.handle(event).await;
    }
}
