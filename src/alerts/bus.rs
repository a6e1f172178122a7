//! In-process alert bus.
//!
//! Evaluators publish; subscribers fan out to the outbox writer. History
//! is written at emission time, independently of delivery, keyed by the
//! event fingerprint so a double publish leaves exactly one audit row.

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tracing::debug;

use super::AlertEvent;
use crate::storage::Database;

/// Bounded introspection ring; memory-only.
const RING_CAPACITY: usize = 1000;

pub struct AlertBus {
    db: Database,
    tx: broadcast::Sender<AlertEvent>,
    ring: Mutex<VecDeque<AlertEvent>>,
}

impl AlertBus {
    pub fn new(db: Database) -> Self {
        let (tx, _rx) = broadcast::channel(RING_CAPACITY);
        Self {
            db,
            tx,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    /// Record history and broadcast. Returns true when the event was new;
    /// a fingerprint collision still broadcasts (subscribers are
    /// idempotent) but reports false.
    pub fn publish(&self, event: &AlertEvent) -> Result<bool> {
        let payload = serde_json::to_string(&event.data)?;
        let fresh = self.db.record_alert(
            event.coin_id(),
            event.hot_id(),
            event.timestamp,
            event.kind_str(),
            &payload,
            &event.fingerprint(),
        )?;

        {
            let mut ring = self.ring.lock();
            if ring.len() == RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }

        // No receivers is fine (e.g. during early startup).
        let _ = self.tx.send(event.clone());

        debug!(
            fingerprint = %event.fingerprint(),
            fresh,
            priority = ?event.priority,
            "alert published"
        );
        Ok(fresh)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }

    /// Most recent events, newest last.
    pub fn recent(&self, limit: usize) -> Vec<AlertEvent> {
        let ring = self.ring.lock();
        ring.iter()
            .rev()
            .take(limit)
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    pub fn ring_len(&self) -> usize {
        self.ring.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertData, AlertPriority, SystemAlert};

    fn system_event(key: &str) -> AlertEvent {
        AlertEvent::new(
            1_000,
            AlertData::SystemAlert(SystemAlert {
                message: "hello".to_string(),
                dedup_key: key.to_string(),
                priority: AlertPriority::Normal,
            }),
        )
    }

    #[test]
    fn double_publish_records_one_history_row() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db.clone());

        let event = system_event("anchor:1");
        assert!(bus.publish(&event).unwrap());
        assert!(!bus.publish(&event).unwrap());

        assert_eq!(db.recent_alerts(10).unwrap().len(), 1);
        assert_eq!(bus.ring_len(), 2);
    }

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db);
        let mut rx = bus.subscribe();

        bus.publish(&system_event("k1")).unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.fingerprint(), "system:k1");
    }

    #[test]
    fn ring_is_bounded() {
        let db = Database::open_in_memory().unwrap();
        let bus = AlertBus::new(db);
        for i in 0..(RING_CAPACITY + 50) {
            bus.publish(&system_event(&format!("k{}", i))).unwrap();
        }
        assert_eq!(bus.ring_len(), RING_CAPACITY);

        let recent = bus.recent(5);
        assert_eq!(recent.len(), 5);
        assert_eq!(
            recent.last().unwrap().fingerprint(),
            format!("system:k{}", RING_CAPACITY + 49)
        );
    }
}
