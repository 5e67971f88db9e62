//! Publish/subscribe transport for lifecycle events.
//!
//! The bus routes events by type. A publish is recorded before the call
//! returns and is never dropped silently: either it is delivered to every
//! current subscriber of its type, or the caller gets a `TransportError`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::domain::LifecycleEvent;

use super::journal::Journal;

/// Errors raised by an event bus
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("TransportError: {0}")]
    Transport(String),
}

/// Channel a subscriber receives its events through
pub type EventSink = mpsc::UnboundedSender<LifecycleEvent>;

/// Trait for event transports
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Record and route an event
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), BusError>;

    /// Deliver every future event of `event_type` to `sink`.
    ///
    /// Events sharing a correlation id arrive in publish order.
    async fn subscribe(&self, event_type: &str, sink: EventSink) -> Result<(), BusError>;
}

/// A published event as recorded by the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
}

#[derive(Default)]
struct BusState {
    /// In-memory history, kept only by recording buses
    log: Option<Vec<BusRecord>>,
    subscribers: HashMap<String, Vec<EventSink>>,
}

/// In-process bus with an optional durable journal.
///
/// A bus from [`LocalBus::new`] keeps every event in memory for inspection.
/// A bus from [`LocalBus::open`] keeps history only in its journal, so a
/// long-running process does not grow with the events it has seen.
pub struct LocalBus {
    journal: Option<Journal>,
    state: Mutex<BusState>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBus {
    /// Bus that records events in memory only
    pub fn new() -> Self {
        Self {
            journal: None,
            state: Mutex::new(BusState {
                log: Some(Vec::new()),
                subscribers: HashMap::new(),
            }),
        }
    }

    /// Bus that journals every event to `path`.
    ///
    /// Earlier journal entries are neither loaded nor redelivered, and
    /// nothing is kept in memory: `published` stays empty.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, BusError> {
        let journal = Journal::open(path)
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        debug!(path = %journal.path().display(), "Bus journal opened");

        Ok(Self {
            journal: Some(journal),
            state: Mutex::new(BusState::default()),
        })
    }

    /// Journal backing this bus, if any
    pub fn journal(&self) -> Option<&Journal> {
        self.journal.as_ref()
    }

    /// Every event recorded in memory, in publish order
    pub async fn published(&self) -> Vec<LifecycleEvent> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .flatten()
            .map(|r| r.event.clone())
            .collect()
    }

    /// Recorded events of one type
    pub async fn published_of_type(&self, event_type: &str) -> Vec<LifecycleEvent> {
        self.published()
            .await
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Number of events recorded in memory
    pub async fn len(&self) -> usize {
        self.state.lock().await.log.as_ref().map_or(0, Vec::len)
    }

    /// Whether nothing has been recorded
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl EventBus for LocalBus {
    fn name(&self) -> &str {
        "local"
    }

    async fn publish(&self, event: &LifecycleEvent) -> Result<(), BusError> {
        // Held across the journal write so recording and delivery order match
        let mut state = self.state.lock().await;

        let record = BusRecord {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event: event.clone(),
        };

        if let Some(journal) = &self.journal {
            journal
                .append(&record)
                .await
                .map_err(|e| BusError::Transport(e.to_string()))?;
        }
        if let Some(log) = state.log.as_mut() {
            log.push(record);
        }

        if let Some(sinks) = state.subscribers.get_mut(&event.event_type) {
            sinks.retain(|sink| sink.send(event.clone()).is_ok());
            trace!(
                event_type = %event.event_type,
                subscribers = sinks.len(),
                "Event delivered"
            );
        }

        Ok(())
    }

    async fn subscribe(&self, event_type: &str, sink: EventSink) -> Result<(), BusError> {
        self.state
            .lock()
            .await
            .subscribers
            .entry(event_type.to_string())
            .or_default()
            .push(sink);

        debug!(%event_type, "Subscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_routes_by_type() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("onboarding-requested", tx).await.unwrap();

        bus.publish(&LifecycleEvent::new("activation-requested", "t1", "c0"))
            .await
            .unwrap();
        bus.publish(&LifecycleEvent::new("onboarding-requested", "t1", "c1"))
            .await
            .unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.correlation_id, "c1");
        assert!(rx.try_recv().is_err());

        // Unrouted events are still recorded
        assert_eq!(bus.len().await, 2);
    }

    #[tokio::test]
    async fn test_per_correlation_order() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("onboarding-requested", tx.clone()).await.unwrap();
        bus.subscribe("onboarding-succeeded", tx).await.unwrap();

        bus.publish(&LifecycleEvent::new("onboarding-requested", "t1", "c1"))
            .await
            .unwrap();
        bus.publish(&LifecycleEvent::new("onboarding-succeeded", "t1", "c1"))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, "onboarding-requested");
        assert_eq!(rx.recv().await.unwrap().event_type, "onboarding-succeeded");
    }

    #[tokio::test]
    async fn test_closed_subscribers_are_dropped() {
        let bus = LocalBus::new();
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe("onboarding-requested", tx).await.unwrap();
        drop(rx);

        let result = bus
            .publish(&LifecycleEvent::new("onboarding-requested", "t1", "c1"))
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_journal_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bus/events.jsonl");

        {
            let bus = LocalBus::open(&path).await.unwrap();
            bus.publish(
                &LifecycleEvent::new("onboarding-requested", "t1", "c1").with_field("tier", "basic"),
            )
            .await
            .unwrap();
        }

        let bus = LocalBus::open(&path).await.unwrap();
        bus.publish(&LifecycleEvent::new("onboarding-succeeded", "t1", "c1"))
            .await
            .unwrap();

        let records: Vec<BusRecord> = bus.journal().unwrap().replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.payload.get("tier").map(String::as_str), Some("basic"));
        assert_eq!(records[1].event.event_type, "onboarding-succeeded");
    }

    #[tokio::test]
    async fn test_journaled_bus_keeps_no_history_in_memory() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");

        {
            let bus = LocalBus::open(&path).await.unwrap();
            for i in 0..3 {
                bus.publish(&LifecycleEvent::new("onboarding-requested", "t1", format!("c{}", i)))
                    .await
                    .unwrap();
            }
            assert!(bus.is_empty().await);
        }

        // Reopening does not load earlier events back
        let bus = LocalBus::open(&path).await.unwrap();
        assert!(bus.published().await.is_empty());

        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe("onboarding-requested", tx).await.unwrap();
        bus.publish(&LifecycleEvent::new("onboarding-requested", "t2", "c9"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().tenant_id, "t2");
        assert!(rx.try_recv().is_err());
    }
}
