// The radiowatch daemon
//
// Loads the config, opens the catalog and blob store, starts one
// processing session per configured stream plus the transcription loop,
// and shuts everything down cleanly on ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use radiowatch::blob::{DiskStorage, Storage};
use radiowatch::catalog::{Catalog, NewStream};
use radiowatch::config::Config;
use radiowatch::ingest::process_stream;
use radiowatch::transcribe::{run_transcriber, SpeechToText, WhisperTranscriber};

#[derive(Parser, Debug)]
#[command(name = "radiowatch", version, about = "Archive and transcribe internet radio streams")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH", default_value = "radiowatch.toml")]
    config: PathBuf,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = Config::load(&cli.config)?;
    if config.streams.is_empty() && !config.transcriber.enabled {
        log::warn!("nothing to do: no streams configured and the transcriber is disabled");
        return Ok(());
    }

    let catalog = Catalog::open(&config.database.driver, &config.database.conn).await?;

    let storage: Arc<dyn Storage> = if config.storage.serve {
        Arc::new(DiskStorage::serve(&config.storage.root).await?)
    } else {
        std::fs::create_dir_all(&config.storage.root)
            .context("unable to create the blob directory")?;
        Arc::new(DiskStorage::new(&config.storage.root))
    };

    let token = CancellationToken::new();
    {
        let token = token.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("shutting down");
                token.cancel();
            }
        });
    }

    let mut tasks = JoinSet::new();

    for entry in &config.streams {
        let stream = match catalog.get_stream_by_name(&entry.display_name).await? {
            Some(existing) => existing,
            None => {
                log::info!("registering stream {:?}", entry.display_name);
                catalog
                    .insert_stream(&NewStream {
                        display_name: entry.display_name.clone(),
                        url: entry.url.clone(),
                    })
                    .await?
            }
        };

        log::info!("ingesting {:?} from {}", stream.display_name, stream.url);
        tasks.spawn(process_stream(
            token.clone(),
            stream,
            Arc::clone(&storage),
            catalog.clone(),
        ));
    }

    if config.transcriber.enabled {
        let catalog = catalog.clone();
        let storage = Arc::clone(&storage);
        let token = token.clone();
        let model = config.transcriber.model.clone();
        tasks.spawn(async move {
            let whisper: Arc<dyn SpeechToText> =
                Arc::new(WhisperTranscriber::with_model(model));
            run_transcriber(token, catalog, storage.as_ref(), whisper.as_ref()).await
        });
    }

    // One stream failing shouldn't silently take the rest down; cancel
    // everything and report the first error.
    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let result = joined.context("a worker task panicked").and_then(|r| r);
        if let Err(error) = result {
            log::error!("worker failed: {error:#}");
            token.cancel();
            if outcome.is_ok() {
                outcome = Err(error);
            }
        }
    }

    // Closing the blob store is best-effort cleanup; don't let it mask a
    // pipeline error.
    match storage.close().await {
        Ok(()) => {}
        Err(close_error) if outcome.is_ok() => {
            outcome = Err(close_error).context("unable to close blob storage")
        }
        Err(close_error) => log::warn!("unable to close blob storage: {close_error}"),
    }

    outcome
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}
