//! Sequential fan-out of one message to every registered user.
//!
//! A failed delivery (blocked bot, deactivated account) is tallied and never
//! aborts the rest of the batch. A fixed delay between sends keeps the bot
//! under the platform's throughput limits.

use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub sent: u32,
    pub failed: u32,
}

pub async fn deliver_all<F, Fut>(
    recipients: &[u64],
    delay: Duration,
    mut send: F,
) -> BroadcastReport
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut report = BroadcastReport { sent: 0, failed: 0 };
    for (i, &user_id) in recipients.iter().enumerate() {
        if i > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if send(user_id).await {
            report.sent += 1;
        } else {
            report.failed += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failures_are_tallied_without_aborting() {
        let recipients = vec![1, 2, 3];
        let report = deliver_all(&recipients, Duration::ZERO, |uid| async move { uid != 2 }).await;
        assert_eq!(report, BroadcastReport { sent: 2, failed: 1 });
    }

    #[tokio::test]
    async fn empty_registry_reports_zero() {
        let report = deliver_all(&[], Duration::ZERO, |_| async { true }).await;
        assert_eq!(report, BroadcastReport { sent: 0, failed: 0 });
    }

    #[tokio::test]
    async fn every_recipient_is_attempted_in_order() {
        let recipients = vec![5, 6, 7];
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let report = deliver_all(&recipients, Duration::ZERO, move |uid| {
            let seen = seen2.clone();
            async move {
                seen.lock().unwrap().push(uid);
                false
            }
        })
        .await;
        assert_eq!(report, BroadcastReport { sent: 0, failed: 3 });
        assert_eq!(*seen.lock().unwrap(), vec![5, 6, 7]);
    }
}
