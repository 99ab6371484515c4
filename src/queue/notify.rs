//! Notification bus for waking idle fetchers.
//!
//! - tokio::sync::broadcast for pub-sub notifications
//! - A notification only says "look again"; fetchers still claim through
//!   the database, so a lost or spurious wake-up costs one poll at most

use tokio::sync::broadcast::{self, error::RecvError, Receiver, Sender};

/// Notification sent when a job was enqueued on a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueuedNotification {
    /// The queue that received a job
    pub queue: String,
}

/// Notification bus shared by the enqueuers and fetchers of one storage.
///
/// Only reaches fetchers in this process; fetchers elsewhere fall back to
/// polling.
#[derive(Clone, Debug)]
pub struct NotificationBus {
    sender: Sender<EnqueuedNotification>,
}

impl NotificationBus {
    /// Create a new notification bus with the given capacity.
    ///
    /// Older notifications are dropped if receivers fall behind; a lagging
    /// receiver treats that as a wake-up.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to notifications sent from now on.
    pub fn subscribe(&self) -> Receiver<EnqueuedNotification> {
        self.sender.subscribe()
    }

    /// Tell fetchers that `queue` may have a job.
    ///
    /// Returns the number of receivers that got the notification.
    pub fn notify(&self, queue: &str) -> usize {
        // send() errors when nobody listens, which is fine
        self.sender
            .send(EnqueuedNotification {
                queue: queue.to_string(),
            })
            .unwrap_or(0)
    }

    /// Get the number of active receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Resolve once a notification for one of `queues` arrives.
///
/// Never resolves if the bus is closed; callers race it against a poll timer.
pub async fn wait_for_queues(receiver: &mut Receiver<EnqueuedNotification>, queues: &[String]) {
    loop {
        match receiver.recv().await {
            Ok(notification) if queues.contains(&notification.queue) => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => return,
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
