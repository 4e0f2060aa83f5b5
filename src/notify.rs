// Change notifications
//
// Subscriptions are driven by polling: every interval we ask the catalog
// for records created since the last check and fan them out through a
// broadcast channel. A future version may swap the poller for
// listen/notify without touching subscribers.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{broadcast_channel, BroadcastChannel};
use crate::catalog::{Catalog, Chunk, ChunkFilter, Transmission, TransmissionFilter};
use crate::CHUNK_LENGTH;

/// Fan out chunks as they are archived.
pub fn watch_chunks(
    token: CancellationToken,
    catalog: Catalog,
    filter: ChunkFilter,
    interval: Option<Duration>,
) -> BroadcastChannel<Chunk> {
    watch(token, interval, move |since| {
        let catalog = catalog.clone();
        async move { catalog.chunks_created_after(since, filter).await }
    })
}

/// Fan out transmissions as they are split out of chunks.
pub fn watch_transmissions(
    token: CancellationToken,
    catalog: Catalog,
    filter: TransmissionFilter,
    interval: Option<Duration>,
) -> BroadcastChannel<Transmission> {
    watch(token, interval, move |since| {
        let catalog = catalog.clone();
        async move { catalog.transmissions_created_after(since, filter).await }
    })
}

trait CreatedAt {
    fn created_at(&self) -> DateTime<Utc>;
}

impl CreatedAt for Chunk {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

impl CreatedAt for Transmission {
    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn watch<T, F, Fut>(
    token: CancellationToken,
    interval: Option<Duration>,
    mut poll: F,
) -> BroadcastChannel<T>
where
    T: CreatedAt + Clone + Send + 'static,
    F: FnMut(DateTime<Utc>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send,
{
    // There's no point polling faster than new records are produced.
    let interval = interval.unwrap_or(CHUNK_LENGTH);
    let (tx, rx) = mpsc::channel(1);

    // Backdated a touch so a record created in the same instant the watch
    // starts can't slip between the cursor and the first poll.
    let mut last_check = Utc::now() - chrono::Duration::milliseconds(1);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let items = match poll(last_check).await {
                Ok(items) => items,
                Err(error) => {
                    log::error!("unable to fetch recently created records: {error:#}");
                    return;
                }
            };

            for item in items {
                let created_at = item.created_at();
                tokio::select! {
                    _ = token.cancelled() => return,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            return;
                        }
                        last_check = created_at;
                    }
                }
            }
        }
    });

    broadcast_channel(rx)
}
