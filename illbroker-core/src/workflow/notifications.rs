use illbroker_model::{IllTransactionId, SupplierStatus};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 256;

/// Emitted every time a status was relayed to the requester.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequesterNotified {
    pub transaction_id: IllTransactionId,
    pub status: Option<SupplierStatus>,
    /// Rota members other than the supplier that produced the status.
    pub participants: Vec<String>,
}

/// In-process fan-out of workflow observations. Nothing is persisted;
/// observers that are not subscribed simply miss them.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<RequesterNotified>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(DEFAULT_NOTIFICATION_CAPACITY)
    }
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequesterNotified> {
        self.sender.subscribe()
    }

    /// Returns how many observers received the notification.
    pub fn publish(&self, notification: RequesterNotified) -> usize {
        let transaction_id = notification.transaction_id;
        match self.sender.send(notification) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(transaction_id = %transaction_id, "no observers for requester notification");
                0
            }
        }
    }
}

/// Log each notification until `cancel` fires or the hub goes away.
/// Returns the number of notifications seen.
pub async fn log_notifications(
    mut receiver: broadcast::Receiver<RequesterNotified>,
    cancel: CancellationToken,
) -> u64 {
    let mut seen = 0;
    loop {
        let received = tokio::select! {
            biased;
            received = receiver.recv() => received,
            _ = cancel.cancelled() => break,
        };
        match received {
            Ok(notified) => {
                seen += 1;
                info!(
                    target: "illbroker::notifications",
                    transaction_id = %notified.transaction_id,
                    status = ?notified.status,
                    participants = ?notified.participants,
                    "rota participants notified"
                );
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification log fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notified(status: SupplierStatus) -> RequesterNotified {
        RequesterNotified {
            transaction_id: IllTransactionId::new(),
            status: Some(status),
            participants: vec!["ISIL:A".into()],
        }
    }

    #[tokio::test]
    async fn publish_reports_observers() {
        let hub = NotificationHub::new(4);
        assert_eq!(hub.publish(notified(SupplierStatus::Loaned)), 0);

        let _receiver = hub.subscribe();
        assert_eq!(hub.publish(notified(SupplierStatus::Loaned)), 1);
    }

    #[tokio::test]
    async fn log_drains_until_the_hub_closes() {
        let hub = NotificationHub::new(4);
        let receiver = hub.subscribe();
        hub.publish(notified(SupplierStatus::WillSupply));
        hub.publish(notified(SupplierStatus::Unfilled));
        drop(hub);

        assert_eq!(log_notifications(receiver, CancellationToken::new()).await, 2);
    }

    #[tokio::test]
    async fn log_stops_on_cancel() {
        let hub = NotificationHub::new(4);
        let cancel = CancellationToken::new();
        let logger = tokio::spawn(log_notifications(hub.subscribe(), cancel.clone()));

        hub.publish(notified(SupplierStatus::Loaned));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(logger.await.unwrap(), 1);
    }
}
