use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use huddle_types::models::MessageRecord;

/// Quiet period after which a burst of arrivals yields one read receipt.
pub const READ_DEBOUNCE: Duration = Duration::from_millis(400);

/// How long an unread own message must sit before it is shown as delivered.
pub const DELIVERY_SETTLE: Duration = Duration::from_millis(500);

/// Client-side label for the sender's own latest message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryHint {
    /// Optimistic entry, not yet confirmed by the server.
    Sending,
    /// Confirmed, still inside the settle window.
    Sent,
    /// Best-effort guess: settled with nobody else having read it.
    Delivered,
    /// Read by this many other members.
    Read(usize),
}

/// `confirmed_at` is when this client learned the message was persisted.
pub fn delivery_hint(message: &MessageRecord, confirmed_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DeliveryHint {
    let readers = message.reader_ids().count();
    if readers > 0 {
        return DeliveryHint::Read(readers);
    }
    let Some(confirmed_at) = confirmed_at else {
        return DeliveryHint::Sending;
    };
    let settled = (now - confirmed_at)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= DELIVERY_SETTLE);
    if settled {
        DeliveryHint::Delivered
    } else {
        DeliveryHint::Sent
    }
}

/// Wait for a value, then keep replacing it with newer ones until `window`
/// passes without a new arrival. Returns `None` once the channel is closed
/// and drained.
pub async fn debounce_latest<T>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) -> Option<T> {
    let mut latest = rx.recv().await?;
    loop {
        match tokio::time::timeout(window, rx.recv()).await {
            Ok(Some(newer)) => latest = newer,
            Ok(None) | Err(_) => return Some(latest),
        }
    }
}
