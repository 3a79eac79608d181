use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

/// Events a slow subscriber may fall behind by before it sees `Lagged`.
const FEED_CAPACITY: usize = 256;

/// Change feed of committed events, one broadcast channel per specialist.
///
/// Channels are created by the first subscriber and dropped again by the
/// first send that finds no one listening.
#[derive(Default)]
pub struct NotifyHub {
    feeds: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow everything committed for `specialist_id` from now on.
    pub fn subscribe(&self, specialist_id: Ulid) -> broadcast::Receiver<Event> {
        self.feeds
            .entry(specialist_id)
            .or_insert_with(|| broadcast::channel(FEED_CAPACITY).0)
            .subscribe()
    }

    pub fn subscriber_count(&self, specialist_id: &Ulid) -> usize {
        self.feeds
            .get(specialist_id)
            .map_or(0, |feed| feed.receiver_count())
    }

    pub(crate) fn send(&self, specialist_id: Ulid, event: &Event) {
        let delivered = match self.feeds.get(&specialist_id) {
            Some(feed) => feed.send(event.clone()).is_ok(),
            None => return,
        };
        if !delivered {
            // A subscribe may have raced in since the failed send.
            self.feeds
                .remove_if(&specialist_id, |_, feed| feed.receiver_count() == 0);
        }
    }
}
