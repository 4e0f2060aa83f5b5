// Decoder stderr parsing
//
// The decoder narrates everything we need on stderr: which chunk file it
// is writing, and where the silencedetect filter found silent periods.
// This module scans that output line by line and turns it into
// PreprocessEvents, in file order.

use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;

use super::events::{ComponentMessage, PreprocessEvent};

// Matches a line like "[silencedetect @ 0x600000c583c0] ...".
static MESSAGE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\[(\S+) @ (?:0x)?[0-9a-fA-F]+\]\s*(.*)$").unwrap());

// Matches a payload like "Opening '/path/to/file.mp3' for writing".
static OPENING_FILE_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Opening '([^']+)' for writing$").unwrap());

static SILENCE_START_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"silence_start: (\d+(?:\.\d+)?)").unwrap());
static SILENCE_END_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"silence_end: (\d+(?:\.\d+)?) \| silence_duration: (\d+(?:\.\d+)?)").unwrap()
});

/// Scan decoder stderr and deliver events on `events`.
///
/// A `Finished` event is always delivered exactly once, even when reading
/// fails. Returns the scanner's I/O error, if any.
pub(crate) async fn parse_stderr<R>(
    stderr: R,
    events: &mpsc::Sender<PreprocessEvent>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let result = scan_lines(stderr, events).await;
    let _ = events.send(PreprocessEvent::Finished).await;
    result
}

async fn scan_lines<R>(
    stderr: R,
    events: &mpsc::Sender<PreprocessEvent>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut running = false;
    let mut lines = BufReader::new(stderr).lines();

    while let Some(line) = lines.next_line().await? {
        for event in interpret_line(&mut running, &line) {
            if events.send(event).await.is_err() {
                // Nobody is listening any more; drain quietly.
                return Ok(());
            }
        }
    }

    Ok(())
}

/// Interpret one stderr line. `running` tracks whether we've already seen
/// the first chunk open, which is what marks the download as started.
fn interpret_line(running: &mut bool, line: &str) -> Vec<PreprocessEvent> {
    let Some(captures) = MESSAGE_PATTERN.captures(line) else {
        return vec![PreprocessEvent::UninterpretedStderr {
            line: line.to_string(),
        }];
    };

    let msg = ComponentMessage {
        component: captures[1].to_string(),
        payload: captures[2].to_string(),
    };

    match msg.component.as_str() {
        "segment" => {
            if let Some(captures) = OPENING_FILE_PATTERN.captures(&msg.payload) {
                let path = PathBuf::from(&captures[1]);
                let mut out = Vec::with_capacity(2);
                if !*running {
                    out.push(PreprocessEvent::DownloadStarted);
                    *running = true;
                }
                out.push(PreprocessEvent::StartWriting { path });
                return out;
            }
        }
        "silencedetect" => {
            if let Some(captures) = SILENCE_START_PATTERN.captures(&msg.payload) {
                match parse_seconds(&captures[1]) {
                    Some(at) => return vec![PreprocessEvent::SilenceStart { at }],
                    None => {
                        log::warn!("unable to parse silence start time in {line:?}");
                        return Vec::new();
                    }
                }
            }
            if let Some(captures) = SILENCE_END_PATTERN.captures(&msg.payload) {
                match (parse_seconds(&captures[1]), parse_seconds(&captures[2])) {
                    (Some(at), Some(duration)) => {
                        return vec![PreprocessEvent::SilenceEnd { at, duration }]
                    }
                    _ => {
                        log::warn!("unable to parse silence end in {line:?}");
                        return Vec::new();
                    }
                }
            }
        }
        // End of output; nothing to do.
        "out#0/segment" => return Vec::new(),
        _ => {}
    }

    vec![PreprocessEvent::UnknownMessage(msg)]
}

/// Parse decimal seconds into a duration with whole-nanosecond precision.
///
/// The multiply-then-truncate matches how the timestamps in the silence
/// filter's output have always been interpreted, so recorded sessions keep
/// replaying to identical span boundaries.
fn parse_seconds(raw: &str) -> Option<Duration> {
    let seconds: f64 = raw.parse().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_nanos((seconds * 1e9) as u64))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const STDERR_FIXTURE: &str = include_str!("testdata/stderr.txt");

    /// Run the parser over a transcript and collect every event.
    pub(crate) async fn replay(input: &str) -> Vec<PreprocessEvent> {
        let (tx, mut rx) = mpsc::channel(256);
        parse_stderr(input.as_bytes(), &tx).await.unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn nanos(n: u64) -> Duration {
        Duration::from_nanos(n)
    }

    #[tokio::test]
    async fn replaying_a_recorded_session() {
        let events = replay(STDERR_FIXTURE).await;

        assert!(events.contains(&PreprocessEvent::DownloadStarted));

        let writing: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PreprocessEvent::StartWriting { path } => Some(path.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(
            writing,
            vec![
                PathBuf::from("output000.mp3"),
                PathBuf::from("output001.mp3"),
                PathBuf::from("output002.mp3"),
            ],
        );

        let silence_starts: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PreprocessEvent::SilenceStart { at } => Some(*at),
                _ => None,
            })
            .collect();
        assert_eq!(
            silence_starts,
            vec![
                nanos(0),
                nanos(24_462_600_000),
                nanos(36_254_100_000),
                nanos(65_108_099_999),
                nanos(100_403_000_000),
                nanos(110_320_000_000),
                nanos(118_398_000_000),
            ],
        );

        let silence_ends: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PreprocessEvent::SilenceEnd { at, duration } => Some((*at, *duration)),
                _ => None,
            })
            .collect();
        assert_eq!(
            silence_ends,
            vec![
                (nanos(19_029_900_000), nanos(19_029_900_000)),
                (nanos(31_306_100_000), nanos(6_843_500_000)),
                (nanos(60_418_600_000), nanos(24_164_500_000)),
                (nanos(96_096_400_000), nanos(30_988_300_000)),
                (nanos(102_443_000_000), nanos(2_040_620_000)),
                (nanos(112_502_000_000), nanos(2_181_379_999)),
                (nanos(120_913_000_000), nanos(2_515_120_000)),
            ],
        );

        assert!(!events
            .iter()
            .any(|e| matches!(e, PreprocessEvent::UnknownMessage(_))));
        assert_eq!(events.last(), Some(&PreprocessEvent::Finished));
    }

    #[tokio::test]
    async fn finished_is_always_delivered() {
        let events = replay("").await;
        assert_eq!(events, vec![PreprocessEvent::Finished]);
    }

    #[tokio::test]
    async fn unrecognised_lines_are_passed_through() {
        let events = replay("Press [q] to stop\n").await;
        assert_eq!(
            events,
            vec![
                PreprocessEvent::UninterpretedStderr {
                    line: "Press [q] to stop".to_string(),
                },
                PreprocessEvent::Finished,
            ],
        );
    }

    #[tokio::test]
    async fn unknown_component_messages_are_soft() {
        let events = replay("[mp3float @ 0x55e] Header missing\n").await;
        assert_eq!(
            events,
            vec![
                PreprocessEvent::UnknownMessage(ComponentMessage {
                    component: "mp3float".to_string(),
                    payload: "Header missing".to_string(),
                }),
                PreprocessEvent::Finished,
            ],
        );
    }

    #[test]
    fn seconds_truncate_to_whole_nanoseconds() {
        assert_eq!(parse_seconds("0"), Some(nanos(0)));
        assert_eq!(parse_seconds("19.0299"), Some(nanos(19_029_900_000)));
        assert_eq!(parse_seconds("65.1081"), Some(nanos(65_108_099_999)));
        assert_eq!(parse_seconds("2.18138"), Some(nanos(2_181_379_999)));
        assert_eq!(parse_seconds("not a number"), None);
        assert_eq!(parse_seconds("-1"), None);
    }
}
