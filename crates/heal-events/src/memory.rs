//! In-memory event bus
//!
//! Broadcast fan-out with retained history:
//! - `tokio::sync::broadcast` delivers every event to every live subscriber
//! - a per-correlation history serves late joiners, kept in a moka cache
//!   bounded by id count and age
//! - a bounded recent-events log backs dashboards and the demo timeline

use crate::bus::{EventBus, EventFilter, Subscription};
use crate::error::BusError;
use crate::event::{CorrelationId, Event};
use async_trait::async_trait;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// In-memory bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Broadcast channel capacity per subscriber
    pub channel_capacity: usize,
    /// Number of most recent events kept for inspection
    pub recent_capacity: usize,
    /// Events retained per correlation id
    pub history_capacity: usize,
    /// Correlation ids with retained history
    pub history_max_correlations: u64,
    /// Seconds a correlation's history lives after its first event
    pub history_ttl_secs: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            recent_capacity: 1000,
            history_capacity: 256,
            history_max_correlations: 10_000,
            history_ttl_secs: 3600,
        }
    }
}

impl BusConfig {
    /// With channel capacity
    #[inline]
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// With recent-events capacity
    #[inline]
    #[must_use]
    pub fn with_recent_capacity(mut self, capacity: usize) -> Self {
        self.recent_capacity = capacity;
        self
    }

    /// With per-correlation history bounds
    #[inline]
    #[must_use]
    pub fn with_history(mut self, max_correlations: u64, ttl: Duration) -> Self {
        self.history_max_correlations = max_correlations;
        self.history_ttl_secs = ttl.as_secs();
        self
    }

    /// History time-to-live
    #[inline]
    #[must_use]
    pub fn history_ttl(&self) -> Duration {
        Duration::from_secs(self.history_ttl_secs.max(1))
    }
}

/// Bus statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Total events published
    pub published: u64,
    /// Live subscribers
    pub subscribers: usize,
    /// Correlation ids with retained history
    pub tracked_correlations: u64,
}

/// Broadcast-backed event bus
#[derive(Debug)]
pub struct InMemoryEventBus {
    config: BusConfig,
    /// `None` once closed
    sender: RwLock<Option<broadcast::Sender<Event>>>,
    history: Cache<CorrelationId, Arc<Mutex<VecDeque<Event>>>>,
    recent: Mutex<VecDeque<Event>>,
    published: AtomicU64,
}

impl InMemoryEventBus {
    /// Create new bus
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        let (sender, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            recent: Mutex::new(VecDeque::with_capacity(config.recent_capacity.min(4096))),
            history: Cache::builder()
                .max_capacity(config.history_max_correlations)
                .time_to_live(config.history_ttl())
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            config,
            sender: RwLock::new(Some(sender)),
            published: AtomicU64::new(0),
        }
    }

    /// Close the bus
    ///
    /// Subscriptions end after draining what they already received; further
    /// publishes fail with [`BusError::Closed`].
    pub fn close(&self) {
        if self.sender.write().take().is_some() {
            tracing::debug!("event bus closed");
        }
    }

    /// Check if the bus was closed
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    /// Most recent events, oldest first
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<Event> {
        let recent = self.recent.lock();
        let skip = recent.len().saturating_sub(limit);
        recent.iter().skip(skip).cloned().collect()
    }

    /// Number of live subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender
            .read()
            .as_ref()
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Get bus statistics
    ///
    /// Pending history evictions are applied first.
    pub async fn stats(&self) -> BusStats {
        self.history.run_pending_tasks().await;
        BusStats {
            published: self.published.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            tracked_correlations: self.history.entry_count(),
        }
    }

    async fn record(&self, event: &Event) {
        if let Some(id) = event.correlation_id() {
            let log = self
                .history
                .get_with(id.clone(), async { Arc::new(Mutex::new(VecDeque::new())) })
                .await;
            let mut events = log.lock();
            if events.len() >= self.config.history_capacity.max(1) {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        if self.config.recent_capacity > 0 {
            let mut recent = self.recent.lock();
            if recent.len() >= self.config.recent_capacity {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: Event) -> Result<(), BusError> {
        let sender = self.sender.read().clone().ok_or(BusError::Closed)?;

        self.record(&event).await;
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            event_type = %event.event_type,
            key = %event.key,
            "event published"
        );

        // No subscribers is not an error
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, filter: EventFilter) -> Subscription {
        match self.sender.read().as_ref() {
            Some(sender) => Subscription::from_broadcast(sender.subscribe(), filter),
            None => Subscription::new(Box::pin(futures::stream::empty())),
        }
    }

    async fn history(&self, correlation_id: &CorrelationId) -> Vec<Event> {
        self.history
            .get(correlation_id)
            .await
            .map(|events| events.lock().iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn event(event_type: EventType, id: &str) -> Event {
        Event::for_correlation(event_type, id, json!({ "id": id }))
    }

    #[tokio::test]
    async fn subscribers_receive_matching_events_in_order() {
        let bus = InMemoryEventBus::default();
        let mut failures = bus.subscribe(EventFilter::failures());
        let mut everything = bus.subscribe(EventFilter::all());

        bus.publish(event(EventType::SchemaMismatch, "t1")).await.unwrap();
        bus.publish(event(EventType::HealStarted, "t1")).await.unwrap();
        bus.publish(event(EventType::ReturnApiFailure, "t2")).await.unwrap();

        assert_eq!(failures.recv().await.unwrap().key, "t1");
        assert_eq!(failures.recv().await.unwrap().key, "t2");

        let types: Vec<_> = [
            everything.recv().await.unwrap().event_type,
            everything.recv().await.unwrap().event_type,
            everything.recv().await.unwrap().event_type,
        ]
        .into();
        assert_eq!(
            types,
            vec![
                EventType::SchemaMismatch,
                EventType::HealStarted,
                EventType::ReturnApiFailure
            ]
        );
    }

    #[tokio::test]
    async fn history_is_grouped_by_correlation_id() {
        let bus = InMemoryEventBus::default();
        bus.publish(event(EventType::SchemaMismatch, "t1")).await.unwrap();
        bus.publish(event(EventType::SchemaMismatch, "t2")).await.unwrap();
        bus.publish(event(EventType::DiagnosisReady, "t1")).await.unwrap();
        bus.publish(Event::new(EventType::PatchLog, "no-id", json!({})))
            .await
            .unwrap();

        let t1 = bus.history(&"t1".into()).await;
        let types: Vec<_> = t1.iter().map(|e| e.event_type).collect();
        assert_eq!(types, vec![EventType::SchemaMismatch, EventType::DiagnosisReady]);
        assert!(bus.history(&"missing".into()).await.is_empty());
        let stats = bus.stats().await;
        assert_eq!(stats.tracked_correlations, 2);
        assert_eq!(stats.published, 4);
    }

    #[tokio::test]
    async fn history_and_recent_are_bounded() {
        let bus = InMemoryEventBus::new(BusConfig {
            channel_capacity: 8,
            recent_capacity: 3,
            history_capacity: 2,
            ..BusConfig::default()
        });
        for _ in 0..5 {
            bus.publish(event(EventType::HealProgress, "t1")).await.unwrap();
        }

        assert_eq!(bus.history(&"t1".into()).await.len(), 2);
        assert_eq!(bus.recent(10).len(), 3);
        assert_eq!(bus.recent(1).len(), 1);
    }

    #[tokio::test]
    async fn history_forgets_old_correlations() {
        let bus = InMemoryEventBus::new(
            BusConfig::default()
                .with_recent_capacity(0)
                .with_history(100, Duration::from_secs(3600)),
        );
        for n in 0..2_000 {
            let id = format!("t{n}");
            bus.publish(event(EventType::SchemaMismatch, &id)).await.unwrap();
        }

        let stats = bus.stats().await;
        assert_eq!(stats.published, 2_000);
        assert!(stats.tracked_correlations <= 100, "{stats:?}");
        assert_eq!(bus.history(&"t1999".into()).await.len(), 1);
    }

    #[tokio::test]
    async fn lagged_subscriber_recovers_from_history() {
        let bus = InMemoryEventBus::new(BusConfig::default().with_channel_capacity(2));
        let mut sub = bus.subscribe(EventFilter::all());
        for _ in 0..5 {
            bus.publish(event(EventType::HealProgress, "t1")).await.unwrap();
        }
        bus.close();

        let mut delivered = 0;
        while sub.recv().await.is_some() {
            delivered += 1;
        }
        assert_eq!(delivered, 2);
        assert_eq!(bus.history(&"t1".into()).await.len(), 5);
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = InMemoryEventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(event(EventType::HealCompleted, "t1")).await.unwrap();
        assert_eq!(bus.recent(10).len(), 1);
    }

    #[tokio::test]
    async fn closed_bus_rejects_publish_and_ends_subscriptions() {
        let bus = InMemoryEventBus::default();
        let mut sub = bus.subscribe(EventFilter::all());
        bus.publish(event(EventType::HealStarted, "t1")).await.unwrap();

        bus.close();
        assert!(bus.is_closed());

        let err = bus.publish(event(EventType::HealStarted, "t2")).await.unwrap_err();
        assert_eq!(err, BusError::Closed);

        assert_eq!(sub.recv().await.unwrap().key, "t1");
        assert!(sub.recv().await.is_none());

        let mut late = bus.subscribe(EventFilter::all());
        assert!(late.recv().await.is_none());
    }
}
