// Whisper CLI back-end
//
// Shells out to a whisper-family binary, one clip at a time. Remote links
// get downloaded to a temp file first; file:// links are opened in place.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::SpeechToText;
use crate::subprocess::{run_command, CommandOutcome};

/// The external speech-to-text program.
pub const WHISPER_COMMAND: &str = "whisper";

pub const DEFAULT_WHISPER_MODEL: &str = "large-v2";

pub struct WhisperTranscriber {
    model: String,
    client: reqwest::Client,
}

impl WhisperTranscriber {
    pub fn new() -> WhisperTranscriber {
        WhisperTranscriber::with_model(DEFAULT_WHISPER_MODEL)
    }

    pub fn with_model(model: impl Into<String>) -> WhisperTranscriber {
        WhisperTranscriber {
            model: model.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn transcribe_one(&self, token: &CancellationToken, url: &Url) -> Result<String> {
        let started = Instant::now();

        let audio = self
            .materialize(url)
            .await
            .with_context(|| format!("unable to download {url}"))?;

        // Whisper writes its outputs as siblings named after the input, so
        // give it a scratch directory of its own.
        let out_dir = tempfile::Builder::new()
            .prefix("radiowatch-whisper-")
            .tempdir()
            .context("unable to create a temp directory")?;

        let mut cmd = Command::new(WHISPER_COMMAND);
        cmd.args(["--model", &self.model, "--language", "en"])
            .arg("--output_dir")
            .arg(out_dir.path())
            .args(["--output_format", "all"])
            .arg(audio.path());

        log::debug!("running whisper on {url}");
        let whisper_started = Instant::now();

        let output = match run_command(cmd, token).await? {
            CommandOutcome::Cancelled => bail!("transcription was cancelled"),
            CommandOutcome::Completed(output) => output,
        };

        if !output.status.success() {
            log::warn!(
                "whisper failed (code {:?}): {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr),
            );
            bail!("transcription with whisper failed");
        }

        let transcript = transcript_path(out_dir.path(), audio.path())?;
        let content = tokio::fs::read_to_string(&transcript)
            .await
            .with_context(|| format!("unable to read {}", transcript.display()))?;

        log::debug!(
            "finished transcribing {url} (total {:?}, whisper {:?})",
            started.elapsed(),
            whisper_started.elapsed(),
        );

        Ok(content)
    }

    /// Get the clip onto the local filesystem.
    async fn materialize(&self, url: &Url) -> Result<LocalAudio> {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|_| anyhow!("{url} isn't a usable file URL"))?;
            return Ok(LocalAudio::Existing(path));
        }

        log::debug!("downloading {url}");
        let response = self
            .client
            .get(url.clone())
            .send()
            .await?
            .error_for_status()?;
        let body = response.bytes().await?;

        let tmp = tempfile::Builder::new()
            .prefix("radiowatch-download-")
            .suffix(".mp3")
            .tempfile()
            .context("unable to create a temp file")?;
        tokio::fs::write(tmp.path(), &body)
            .await
            .with_context(|| format!("unable to spool {url} to disk"))?;

        log::debug!("downloaded {} bytes to {}", body.len(), tmp.path().display());
        Ok(LocalAudio::Downloaded(tmp))
    }
}

impl Default for WhisperTranscriber {
    fn default() -> Self {
        WhisperTranscriber::new()
    }
}

#[async_trait]
impl SpeechToText for WhisperTranscriber {
    async fn transcribe(&self, token: &CancellationToken, urls: &[Url]) -> Result<Vec<String>> {
        let mut results = Vec::with_capacity(urls.len());
        for url in urls {
            results.push(self.transcribe_one(token, url).await?);
        }
        Ok(results)
    }

    fn max_batch_size(&self) -> usize {
        1
    }
}

/// A clip on the local filesystem; downloads clean themselves up on drop.
enum LocalAudio {
    Existing(PathBuf),
    Downloaded(NamedTempFile),
}

impl LocalAudio {
    fn path(&self) -> &Path {
        match self {
            LocalAudio::Existing(path) => path,
            LocalAudio::Downloaded(tmp) => tmp.path(),
        }
    }
}

/// Transcribing path/to/whatever.mp3 leaves the text at <dir>/whatever.txt.
fn transcript_path(output_dir: &Path, audio: &Path) -> Result<PathBuf> {
    let stem = audio
        .file_stem()
        .with_context(|| format!("{} has no file name", audio.display()))?;
    Ok(output_dir.join(stem).with_extension("txt"))
}
