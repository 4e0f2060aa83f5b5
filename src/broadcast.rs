// One-producer, many-subscriber fan-out
//
// Catalog change notifications are produced once and fanned out to every
// subscribed reader. Subscribers get a buffer of a single message; a
// subscriber that stops reading loses messages instead of stalling the
// producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

/// Per-subscriber buffer size. Slow subscribers drop anything beyond this.
const SUBSCRIBER_CAPACITY: usize = 1;

/// Fan-out for messages received on a source channel.
///
/// The forwarder task runs until the source channel closes, at which point
/// every subscriber's reader is closed too. Failing to close the source
/// leaks the forwarder task.
pub struct BroadcastChannel<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    listeners: Mutex<ListenerState<T>>,
    next_id: AtomicU64,
}

struct ListenerState<T> {
    senders: Vec<(u64, mpsc::Sender<T>)>,
    closed: bool,
}

/// Removes a subscriber registered with [`BroadcastChannel::subscribe`] and
/// closes its reader.
pub struct CancelSubscription<T> {
    shared: Arc<Shared<T>>,
    id: u64,
}

impl<T> CancelSubscription<T> {
    pub fn cancel(self) {
        let mut state = self.shared.listeners.lock().unwrap();
        if let Some(i) = state.senders.iter().position(|(id, _)| *id == self.id) {
            // Swap-remove so cancelling doesn't shuffle every other listener.
            state.senders.swap_remove(i);
        }
    }
}

/// Start broadcasting messages from `source` to any number of subscribers.
pub fn broadcast_channel<T: Clone + Send + 'static>(
    mut source: mpsc::Receiver<T>,
) -> BroadcastChannel<T> {
    let shared = Arc::new(Shared {
        listeners: Mutex::new(ListenerState {
            senders: Vec::new(),
            closed: false,
        }),
        next_id: AtomicU64::new(0),
    });

    let forward = Arc::clone(&shared);
    tokio::spawn(async move {
        while let Some(msg) = source.recv().await {
            // try_send never blocks, so holding the lock here is fine. A
            // listener whose buffer is full simply misses this message.
            let state = forward.listeners.lock().unwrap();
            for (_, listener) in &state.senders {
                let _ = listener.try_send(msg.clone());
            }
        }

        let mut state = forward.listeners.lock().unwrap();
        state.closed = true;
        // Dropping the senders closes every subscriber's reader.
        state.senders.clear();
    });

    BroadcastChannel { shared }
}

impl<T: Send + 'static> BroadcastChannel<T> {
    /// Register a new subscriber.
    ///
    /// Returns the reader and a handle that removes the subscription. Once
    /// the source channel has closed, the returned reader is already closed.
    pub fn subscribe(&self) -> (mpsc::Receiver<T>, CancelSubscription<T>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let mut state = self.shared.listeners.lock().unwrap();
        if !state.closed {
            state.senders.push((id, tx));
        }
        drop(state);

        let cancel = CancelSubscription {
            shared: Arc::clone(&self.shared),
            id,
        };

        (rx, cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let (src, src_rx) = mpsc::channel(1);
        let bcast = broadcast_channel(src_rx);

        let (mut sub1, cancel1) = bcast.subscribe();
        let (mut sub2, cancel2) = bcast.subscribe();

        src.send(1).await.unwrap();
        drop(src);

        assert_eq!(sub1.recv().await, Some(1));
        assert_eq!(sub2.recv().await, Some(1));

        cancel1.cancel();
        cancel2.cancel();
    }

    #[tokio::test]
    async fn closing_the_source_closes_subscribers() {
        let (src, src_rx) = mpsc::channel::<i32>(1);
        let bcast = broadcast_channel(src_rx);

        let (mut sub, _cancel) = bcast.subscribe();
        drop(src);

        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn cancelling_closes_the_reader() {
        let (_src, src_rx) = mpsc::channel::<i32>(1);
        let bcast = broadcast_channel(src_rx);

        let (mut sub, cancel) = bcast.subscribe();
        cancel.cancel();

        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn prompt_subscribers_see_every_message() {
        let (src, src_rx) = mpsc::channel(1);
        let bcast = broadcast_channel(src_rx);

        let (mut sub, _cancel) = bcast.subscribe();

        // Draining between sends means the buffer is never full, so nothing
        // gets dropped.
        for i in 0..10 {
            src.send(i).await.unwrap();
            assert_eq!(sub.recv().await, Some(i));
        }

        drop(src);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn lagging_subscribers_drop_messages_without_blocking() {
        let (src, src_rx) = mpsc::channel(1);
        let bcast = broadcast_channel(src_rx);

        let (mut prompt, _c1) = bcast.subscribe();
        let (mut lazy, _c2) = bcast.subscribe();

        // The prompt subscriber paces the test: by the time it has seen
        // message i, the forwarder has already offered message i to the lazy
        // subscriber as well.
        for i in 0..5 {
            src.send(i).await.unwrap();
            assert_eq!(prompt.recv().await, Some(i));
        }
        drop(src);
        assert_eq!(prompt.recv().await, None);

        // The lazy subscriber only ever buffered the first message.
        assert_eq!(lazy.recv().await, Some(0));
        assert_eq!(lazy.recv().await, None);
    }

    #[tokio::test]
    async fn subscribing_after_close_returns_a_closed_reader() {
        let (src, src_rx) = mpsc::channel::<i32>(1);
        let bcast = broadcast_channel(src_rx);

        drop(src);
        // Let the forwarder observe the closed source.
        let (mut first, _c) = bcast.subscribe();
        assert_eq!(first.recv().await, None);

        let (mut late, _c2) = bcast.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn concurrent_subscribe_and_cancel() {
        let (src, src_rx) = mpsc::channel(16);
        let bcast = Arc::new(broadcast_channel(src_rx));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let bcast = Arc::clone(&bcast);
            handles.push(tokio::spawn(async move {
                let (_rx, cancel) = bcast.subscribe();
                tokio::task::yield_now().await;
                cancel.cancel();
            }));
        }

        for i in 0..32 {
            src.send(i).await.unwrap();
        }
        drop(src);

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
