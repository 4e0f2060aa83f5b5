// The preprocessor supervisor
//
// Runs the external decoder over a stream, splitting it into fixed-length
// chunk files and narrating chunk boundaries and silent periods on stderr.
// The supervisor owns the child process for its whole life: it wires
// stderr into the event parser, interrupts the child on cancellation, and
// doesn't return until parsing has finished, so no events trail behind it.

use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::events::PreprocessEvent;
use super::parser::parse_stderr;
use crate::subprocess::wait_with_graceful_shutdown;
use crate::CHUNK_LENGTH;

/// The external audio decoder.
pub const DECODER_COMMAND: &str = "ffmpeg";

/// The silencedetect filter: anything below -30 dB for at least a second
/// counts as silence.
const SILENCE_FILTER: &str = "silencedetect=noise=-30dB:d=1";

/// Download `input` (a URL or a file path) into 60-second chunks inside
/// `output_dir`, delivering preprocessing events as they happen.
///
/// Once this returns, no further events will be delivered. On
/// cancellation the decoder gets an interrupt and a grace period to flush
/// its buffers; its conventional exit code 255 for that case is treated as
/// success.
pub async fn preprocess(
    token: CancellationToken,
    input: &str,
    output_dir: &Path,
    events: mpsc::Sender<PreprocessEvent>,
) -> Result<()> {
    let mut cmd = Command::new(DECODER_COMMAND);
    cmd.arg("-i")
        .arg(input)
        // Use a filter to detect silence and print its timestamps.
        .args(["-af", SILENCE_FILTER])
        // Split into fixed-length chunks.
        .args(["-f", "segment", "-segment_time"])
        .arg(CHUNK_LENGTH.as_secs().to_string())
        // Clean up stderr so it's easier to parse.
        .args(["-hide_banner", "-nostdin", "-nostats"])
        .arg(output_dir.join("chunk_%d.mp3"));

    supervise(cmd, token, events).await
}

/// Run a decoder command and feed its stderr through the event parser.
pub(crate) async fn supervise(
    mut cmd: Command,
    token: CancellationToken,
    events: mpsc::Sender<PreprocessEvent>,
) -> Result<()> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("unable to start {:?}", cmd.as_std().get_program()))?;

    let stderr = child.stderr.take().context("decoder stderr wasn't piped")?;
    log::debug!("decoder started (pid {:?})", child.id());

    let parser = tokio::spawn(async move { parse_stderr(stderr, &events).await });

    let status = wait_with_graceful_shutdown(&mut child, &token).await?;
    log::debug!("decoder exited ({status})");

    // An interrupted decoder reports 255 after cleanly finalizing its
    // output; that's the shutdown we asked for, not a failure.
    let decoder_result = if status.success() || (token.is_cancelled() && status.code() == Some(255))
    {
        Ok(())
    } else {
        Err(status)
    };

    // Wait for parsing to finish so no callbacks land after we return.
    let parser_result = parser.await.context("the stderr parser panicked")?;

    // The decoder failing is almost always more actionable than a parse
    // error, so report that one first.
    if let Err(status) = decoder_result {
        bail!("the decoder exited unsuccessfully ({status})");
    }
    parser_result.context("unable to read decoder stderr")?;

    Ok(())
}
