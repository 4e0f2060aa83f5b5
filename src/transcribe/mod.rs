// Transcription
//
// A single polling worker drains transmissions that don't have a
// transcription yet, hands retrieval links to a speech-to-text back-end,
// and writes the results back. Draining synchronously before sleeping is
// what gives us backpressure when the back-end is slow.

mod whisper;

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::blob::{Key, Storage};
use crate::catalog::{Catalog, NewTranscription};
use crate::{CHUNK_LENGTH, MAX_STT_BATCH_SIZE};

pub use whisper::{WhisperTranscriber, DEFAULT_WHISPER_MODEL, WHISPER_COMMAND};

/// How long retrieval links handed to the back-end stay valid.
const LINK_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// A speech-to-text back-end.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe the audio files at the provided URLs into english, one
    /// string per URL.
    async fn transcribe(&self, token: &CancellationToken, urls: &[Url]) -> Result<Vec<String>>;

    /// How many audio files can be transcribed in a single batch. Callers
    /// may pass more; implementations are free to chunk internally.
    fn max_batch_size(&self) -> usize;
}

/// Continuously poll the catalog for new transmissions and run
/// speech-to-text on them. Cancellation is a clean exit.
pub async fn run_transcriber(
    token: CancellationToken,
    catalog: Catalog,
    storage: &dyn Storage,
    stt: &dyn SpeechToText,
) -> Result<()> {
    loop {
        // Clear out the backlog before sleeping.
        loop {
            if token.is_cancelled() {
                return Ok(());
            }

            match transcribe_once(&token, &catalog, storage, stt).await {
                // Caught up.
                Ok(0) => break,
                Ok(_) => {}
                Err(_) if token.is_cancelled() => return Ok(()),
                Err(error) => return Err(error),
            }
        }

        // There's no point polling more rapidly than chunks are produced.
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = tokio::time::sleep(CHUNK_LENGTH) => {}
        }
    }
}

/// Transcribe one batch, returning how many transmissions were handled.
pub(crate) async fn transcribe_once(
    token: &CancellationToken,
    catalog: &Catalog,
    storage: &dyn Storage,
    stt: &dyn SpeechToText,
) -> Result<usize> {
    let batch_size = stt.max_batch_size().clamp(1, MAX_STT_BATCH_SIZE);
    let transmissions = catalog
        .untranscribed_transmissions(batch_size as i64)
        .await?;

    if transmissions.is_empty() {
        return Ok(0);
    }

    log::debug!("transcribing {} transmission(s)", transmissions.len());

    let mut urls = Vec::with_capacity(transmissions.len());
    for transmission in &transmissions {
        let key: Key = transmission
            .sha256
            .parse()
            .with_context(|| format!("unable to parse {:?} as a blob key", transmission.sha256))?;
        let url = storage
            .link(key, LINK_VALIDITY)
            .await
            .with_context(|| format!("unable to get a link to {key}"))?;
        urls.push(url);
    }

    let texts = stt
        .transcribe(token, &urls)
        .await
        .context("transcription failed")?;
    ensure!(
        texts.len() == urls.len(),
        "the transcriber returned {} strings, but expected {}",
        texts.len(),
        urls.len(),
    );

    let batch: Vec<_> = transmissions
        .iter()
        .zip(texts)
        .map(|(transmission, content)| NewTranscription {
            content,
            transmission_id: transmission.id,
        })
        .collect();

    let saved = catalog.insert_transcriptions(&batch).await?;
    log::info!("Saved {} transcription(s)", saved.len());

    Ok(saved.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::DiskStorage;
    use crate::catalog::{NewChunk, NewStream, NewTransmission};
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A back-end that "transcribes" by numbering its inputs.
    struct StubSpeechToText {
        batch_size: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SpeechToText for StubSpeechToText {
        async fn transcribe(
            &self,
            _token: &CancellationToken,
            urls: &[Url],
        ) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(urls.len() <= self.batch_size);
            Ok((0..urls.len()).map(|i| format!("txt-{i}")).collect())
        }

        fn max_batch_size(&self) -> usize {
            self.batch_size
        }
    }

    async fn seed_transmissions(
        catalog: &Catalog,
        storage: &DiskStorage,
        count: usize,
    ) -> Vec<i64> {
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

        let mut ids = Vec::new();
        for i in 0..count {
            let key = storage
                .store(format!("audio clip {i}").as_bytes())
                .await
                .unwrap();
            let transmission = catalog
                .insert_transmission(&NewTransmission {
                    timestamp: chunk.timestamp + chrono::Duration::seconds(i as i64),
                    length: Duration::from_secs(2),
                    sha256: key.to_string(),
                    chunk_id: chunk.id,
                })
                .await
                .unwrap();
            ids.push(transmission.id);
        }
        ids
    }

    #[tokio::test]
    async fn drains_the_backlog_in_batches() {
        let scratch = tempfile::tempdir().unwrap();
        let (_dir, catalog) = crate::catalog::test_utils::test_catalog().await;
        let storage = DiskStorage::new(scratch.path());
        let transmissions = seed_transmissions(&catalog, &storage, 5).await;

        let stt = StubSpeechToText {
            batch_size: 2,
            calls: AtomicUsize::new(0),
        };
        let token = CancellationToken::new();

        let mut total = 0;
        loop {
            let n = transcribe_once(&token, &catalog, &storage, &stt)
                .await
                .unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }

        assert_eq!(total, 5);
        // 5 transmissions in batches of <= 2 takes three calls.
        assert_eq!(stt.calls.load(Ordering::SeqCst), 3);

        for id in transmissions {
            let transcription = catalog
                .transcription_for_transmission(id)
                .await
                .unwrap()
                .expect("every transmission should have a transcription");
            assert!(transcription.content.starts_with("txt-"));
        }

        assert!(catalog
            .untranscribed_transmissions(100)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn cancellation_is_a_clean_exit() {
        let scratch = tempfile::tempdir().unwrap();
        let (_dir, catalog) = crate::catalog::test_utils::test_catalog().await;
        let storage = DiskStorage::new(scratch.path());

        let stt = StubSpeechToText {
            batch_size: 1,
            calls: AtomicUsize::new(0),
        };
        let token = CancellationToken::new();
        token.cancel();

        run_transcriber(token, catalog, &storage, &stt)
            .await
            .unwrap();
        assert_eq!(stt.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_short_transcription_batch_is_an_error() {
        struct Shortchanger;

        #[async_trait]
        impl SpeechToText for Shortchanger {
            async fn transcribe(
                &self,
                _token: &CancellationToken,
                _urls: &[Url],
            ) -> Result<Vec<String>> {
                Ok(Vec::new())
            }

            fn max_batch_size(&self) -> usize {
                10
            }
        }

        let scratch = tempfile::tempdir().unwrap();
        let (_dir, catalog) = crate::catalog::test_utils::test_catalog().await;
        let storage = DiskStorage::new(scratch.path());
        seed_transmissions(&catalog, &storage, 1).await;

        let err = transcribe_once(
            &CancellationToken::new(),
            &catalog,
            &storage,
            &Shortchanger,
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("expected 1"), "{err:#}");
    }
}
