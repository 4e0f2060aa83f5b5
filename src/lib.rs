// radiowatch - continuously archive internet radio streams and transcribe
// the transmissions found in them.
//
// The pipeline per stream looks like this:
//
//   ffmpeg stderr -> event parser -> archiver -> archive ops -> executor
//                                                                  |
//                                                     (blob store, catalog)
//
// The transcription loop runs independently, polling the catalog for
// transmissions that still need speech-to-text.

use std::time::Duration;

pub mod blob;
pub mod broadcast;
pub mod catalog;
pub mod config;
pub mod ids;
pub mod ingest;
pub mod notify;
pub mod transcribe;

mod subprocess;

/// Length of a single archived audio chunk.
pub const CHUNK_LENGTH: Duration = Duration::from_secs(60);

/// How long a subprocess gets to shut down after an interrupt before it is
/// forcefully killed.
pub const DEFAULT_GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(10);

/// Upper bound on the number of transmissions handed to speech-to-text in a
/// single drain, no matter what the back-end claims to support.
pub const MAX_STT_BATCH_SIZE: usize = 50;
