//! Outbound snapshot/notification fan-out (`network.data.message`,
//! `schedules.update`, `devices.list`, `forecast.data`,
//! `security.state.update`, `notification.message`).
//!
//! Built on `tokio::sync::broadcast` the way `web_daemon.py`'s
//! `channel_layer.group_send(...)` fans a message out to every connected
//! front-end: one producer (the supervisor's tasks), many consumers (one per
//! connected control-socket client), lagging consumers simply miss old
//! messages rather than stalling the producer.

use hg_api_types::{DeviceRow, Message};
use tokio::sync::broadcast;

/// Channel capacity: a burst of quota/schedule activity in one tick produces
/// at most a handful of messages; 256 gives slow consumers headroom without
/// unbounded memory growth.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Message>,
}

impl Broadcaster {
    pub fn new() -> Broadcaster {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Broadcaster { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.tx.subscribe()
    }

    /// Sends a message to every currently-subscribed receiver. Matches
    /// `group_send`'s fire-and-forget semantics: a message is dropped
    /// silently if nobody is listening (`send` errors only when there are
    /// zero receivers, which is the expected idle state with no front-end
    /// connected).
    pub fn send(&self, message: Message) {
        let _ = self.tx.send(message);
    }

    pub fn send_network_data(&self, devices: Vec<DeviceRow>, total_rx_bps: f64, total_tx_bps: f64) {
        self.send(Message::NetworkDataMessage { devices, total_rx_bps, total_tx_bps });
    }

    pub fn notify_error(&self, text: impl Into<String>) {
        self.send(Message::NotificationMessage { text: text.into(), is_error: true });
    }

    pub fn notify_info(&self, text: impl Into<String>) {
        self.send(Message::NotificationMessage { text: text.into(), is_error: false });
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Broadcaster::new()
    }
}
