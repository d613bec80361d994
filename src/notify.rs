use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// A user-facing notification produced when waitlisted capacity frees
/// up. Delivery (mail, push) is a downstream concern; the hub only
/// hands the payload to whoever is listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub lot_id: Ulid,
    pub user: String,
    pub message: String,
}

/// Broadcast hub: one event channel per lot, plus a single channel for
/// outbound notices. Sends are fire-and-forget.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    notices: broadcast::Sender<Notice>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            notices: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to ledger events for one lot. Creates the channel if needed.
    pub fn subscribe(&self, lot_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(lot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a lot event. No-op if nobody is listening.
    pub fn send(&self, lot_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&lot_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Remove a lot's channel (when the lot is deleted).
    pub fn remove(&self, lot_id: &Ulid) {
        self.channels.remove(lot_id);
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Queue a notice for downstream delivery. A failed send only means
    /// no delivery worker is attached; the booking path never rolls back.
    pub fn push_notice(&self, notice: Notice) {
        metrics::counter!(crate::observability::WAITLIST_NOTICES_TOTAL).increment(1);
        tracing::info!(
            target: "notice",
            lot = %notice.lot_id,
            user = %notice.user,
            "{}",
            notice.message
        );
        let _ = self.notices.send(notice);
    }
}
