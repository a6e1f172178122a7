//! Outbox writer and drain loop.
//!
//! One subscriber task turns bus events into outbox rows; one sender task
//! drains pending rows through the `MessageSender`. Exactly one sender
//! loop runs at a time, which keeps delivery serialized and inside the
//! 30 msg/s chat envelope.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn};

use super::{format, AlertData, AlertEvent, AlertPriority, MessageSender, SendResult, SystemAlert};
use crate::alerts::bus::AlertBus;
use crate::models::{now_ts, Config};
use crate::storage::Database;

/// Spacing between consecutive sends; 40 ms stays under 30 msg/s.
const SEND_SPACING: Duration = Duration::from_millis(40);

const DRAIN_BATCH: usize = 50;

const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// Route an event to its destination chat: operational alerts go to the
/// admin chat, market alerts to the group chat when one is configured.
fn chat_for(event: &AlertEvent, config: &Config) -> i64 {
    match event.data {
        AlertData::SystemAlert(_) => config.telegram_chat_id,
        _ => config.alert_chat_id(),
    }
}

/// Subscriber: renders events and enqueues outbox rows. A fingerprint
/// collision means another publish already queued the message.
pub fn spawn_alert_subscriber(
    db: Database,
    mut rx: broadcast::Receiver<AlertEvent>,
    config: Config,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        let text = format::render(&event);
                        let chat_id = chat_for(&event, &config);
                        if let Err(e) =
                            db.enqueue_outbox(event.timestamp, chat_id, &text, &event.fingerprint())
                        {
                            error!(error = %e, "failed to enqueue outbox row");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "alert subscriber lagged; events dropped from channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("alert subscriber stopped");
    })
}

/// Drain one batch of pending rows. Returns how many rows were delivered.
async fn drain_once(db: &Database, sender: &dyn MessageSender, bus: &AlertBus) -> usize {
    let pending = match db.pending_outbox(DRAIN_BATCH) {
        Ok(rows) => rows,
        Err(e) => {
            error!(error = %e, "failed to read outbox");
            return 0;
        }
    };

    let mut delivered = 0usize;
    for row in pending {
        match sender.send(row.chat_id, &row.text, None).await {
            SendResult::Sent => {
                if let Err(e) = db.mark_outbox_sent(row.outbox_id, now_ts()) {
                    error!(error = %e, outbox_id = row.outbox_id, "failed to mark row sent");
                }
                delivered += 1;
            }
            SendResult::Transient(reason) => {
                // Leave the row for the next pass; stop the batch so a
                // rate-limited upstream is not hammered.
                warn!(outbox_id = row.outbox_id, reason, "transient send failure");
                break;
            }
            SendResult::Permanent(reason) => {
                warn!(outbox_id = row.outbox_id, reason, "permanent send failure");
                if let Err(e) = db.mark_outbox_failed(row.outbox_id) {
                    error!(error = %e, outbox_id = row.outbox_id, "failed to mark row failed");
                }
                let event = AlertEvent::new(
                    now_ts(),
                    AlertData::SystemAlert(SystemAlert {
                        message: format!(
                            "Outbox delivery permanently failed for chat {}: {}",
                            row.chat_id, reason
                        ),
                        dedup_key: format!("outbox_failed:{}", row.outbox_id),
                        priority: AlertPriority::High,
                    }),
                );
                if let Err(e) = bus.publish(&event) {
                    error!(error = %e, "failed to publish delivery-failure alert");
                }
            }
        }
        sleep(SEND_SPACING).await;
    }
    delivered
}

/// Sender loop: periodic drain, with a bounded final drain on shutdown.
pub fn spawn_outbox_sender(
    db: Database,
    sender: Arc<dyn MessageSender>,
    bus: Arc<AlertBus>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    drain_once(&db, sender.as_ref(), &bus).await;
                }
                _ = shutdown.changed() => {
                    info!("outbox sender draining before shutdown");
                    let deadline = Instant::now() + SHUTDOWN_DRAIN_BUDGET;
                    loop {
                        let delivered = drain_once(&db, sender.as_ref(), &bus).await;
                        let pending = db.outbox_counts().map(|(p, _, _)| p).unwrap_or(0);
                        if pending == 0 || Instant::now() >= deadline {
                            break;
                        }
                        if delivered == 0 {
                            sleep(Duration::from_secs(2)).await;
                        }
                    }
                    break;
                }
            }
        }
        info!("outbox sender stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedSender {
        outcomes: Mutex<Vec<SendResult>>,
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl ScriptedSender {
        fn new(outcomes: Vec<SendResult>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MessageSender for ScriptedSender {
        async fn send(&self, chat_id: i64, text: &str, _parse_mode: Option<&str>) -> SendResult {
            self.sent.lock().push((chat_id, text.to_string()));
            let mut outcomes = self.outcomes.lock();
            if outcomes.is_empty() {
                SendResult::Sent
            } else {
                outcomes.remove(0)
            }
        }
    }

    #[tokio::test]
    async fn drain_marks_sent_rows() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db.clone());
        db.enqueue_outbox(100, 7, "first", "fp-1").unwrap();
        db.enqueue_outbox(200, 7, "second", "fp-2").unwrap();

        let sender = ScriptedSender::new(vec![]);
        let delivered = drain_once(&db, &sender, &bus).await;
        assert_eq!(delivered, 2);

        let (pending, sent, failed) = db.outbox_counts().unwrap();
        assert_eq!((pending, sent, failed), (0, 2, 0));
        assert_eq!(sender.sent.lock()[0].1, "first");
    }

    #[tokio::test]
    async fn transient_failure_leaves_row_and_stops_batch() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db.clone());
        db.enqueue_outbox(100, 7, "first", "fp-1").unwrap();
        db.enqueue_outbox(200, 7, "second", "fp-2").unwrap();

        let sender = ScriptedSender::new(vec![SendResult::Transient("429".to_string())]);
        let delivered = drain_once(&db, &sender, &bus).await;
        assert_eq!(delivered, 0);

        // Both rows still pending; only the first was attempted.
        let (pending, _, _) = db.outbox_counts().unwrap();
        assert_eq!(pending, 2);
        assert_eq!(sender.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn permanent_failure_marks_row_and_raises_system_alert() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db.clone());
        db.enqueue_outbox(100, 7, "first", "fp-1").unwrap();

        let sender = ScriptedSender::new(vec![SendResult::Permanent("chat not found".to_string())]);
        drain_once(&db, &sender, &bus).await;

        let (pending, sent, failed) = db.outbox_counts().unwrap();
        assert_eq!((pending, sent, failed), (0, 0, 1));

        let history = db.recent_alerts(10).unwrap();
        assert!(history.iter().any(|row| row.kind == "system"));
    }
}
