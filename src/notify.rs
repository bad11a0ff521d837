use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

const CHANNEL_CAPACITY: usize = 256;

/// Who a notification is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    Tourist(Ulid),
    /// A driver or guide, addressed by resource id.
    Staff(Ulid),
    BookingOfficers,
    CrewManagers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: Recipient,
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn new(recipient: Recipient, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipient,
            title: title.into(),
            body: body.into(),
        }
    }
}

#[derive(Debug)]
pub struct NotifyError(pub String);

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "notification delivery failed: {}", self.0)
    }
}

impl std::error::Error for NotifyError {}

/// Outbound side channel (in-app notifications, email). Fire-and-forget:
/// the engine logs a failed delivery and keeps the committed transition.
/// Delivery is at-least-once, so receivers must tolerate repeats.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError>;
}

/// Broadcast hub with one channel per recipient.
pub struct NotifyHub {
    channels: DashMap<Recipient, broadcast::Sender<Notification>>,
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
        }
    }

    /// Subscribe to notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Recipient) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: &Notification) {
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification.clone());
        }
    }

    pub fn remove(&self, recipient: &Recipient) {
        self.channels.remove(recipient);
    }
}

impl Notifier for NotifyHub {
    fn notify(&self, notification: Notification) -> Result<(), NotifyError> {
        self.send(&notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let tourist = Recipient::Tourist(Ulid::new());
        let mut rx = hub.subscribe(tourist);

        let n = Notification::new(tourist, "Payment Reminder", "expires soon");
        hub.notify(n.clone()).unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, n);
    }

    #[tokio::test]
    async fn recipients_are_isolated() {
        let hub = NotifyHub::new();
        let mut crew = hub.subscribe(Recipient::CrewManagers);
        let _officers = hub.subscribe(Recipient::BookingOfficers);

        hub.send(&Notification::new(Recipient::BookingOfficers, "New Booking Request", ""));
        assert!(matches!(
            crew.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        // No subscriber, should not panic
        hub.send(&Notification::new(Recipient::CrewManagers, "x", "y"));
        hub.remove(&Recipient::CrewManagers);
    }
}
