//! Event bus contract
//!
//! Publish / subscribe-by-type with per-correlation history:
//! - [`EventFilter`] selects which events a subscriber sees
//! - [`Subscription`] is an ordered stream of matching events
//! - [`EventBus`] is implemented by every transport

use crate::error::BusError;
use crate::event::{CorrelationId, Event, EventType};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;

/// Subscriber-side event selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Accepted event types (`None` accepts every type)
    pub types: Option<Vec<EventType>>,
    /// Accepted correlation id (`None` accepts every id)
    pub correlation_id: Option<CorrelationId>,
}

impl EventFilter {
    /// Accept every event
    #[inline]
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Accept only the given types
    #[must_use]
    pub fn types(types: impl IntoIterator<Item = EventType>) -> Self {
        Self {
            types: Some(types.into_iter().collect()),
            correlation_id: None,
        }
    }

    /// Accept failure-class events only
    #[inline]
    #[must_use]
    pub fn failures() -> Self {
        Self::types(EventType::FAILURES)
    }

    /// Restrict to one correlation id
    #[inline]
    #[must_use]
    pub fn for_correlation(mut self, correlation_id: impl Into<CorrelationId>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Check whether an event passes this filter
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        let type_ok = self
            .types
            .as_ref()
            .map_or(true, |types| types.contains(&event.event_type));
        let id_ok = self
            .correlation_id
            .as_ref()
            .map_or(true, |wanted| event.correlation_id() == Some(wanted));
        type_ok && id_ok
    }
}

/// Ordered stream of events accepted by a filter
///
/// Ends when the bus is closed. A subscriber that falls behind the channel
/// capacity skips the overwritten events and keeps going.
pub struct Subscription {
    inner: BoxStream<'static, Event>,
}

impl Subscription {
    /// Wrap an arbitrary event stream
    #[must_use]
    pub fn new(inner: BoxStream<'static, Event>) -> Self {
        Self { inner }
    }

    /// Build a filtered subscription over a broadcast receiver
    #[must_use]
    pub fn from_broadcast(receiver: broadcast::Receiver<Event>, filter: EventFilter) -> Self {
        let stream = futures::stream::unfold((receiver, filter), |(mut receiver, filter)| async move {
            loop {
                match receiver.recv().await {
                    Ok(event) if filter.matches(&event) => return Some((event, (receiver, filter))),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event subscriber lagged; events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Self::new(stream.boxed())
    }

    /// Wait for the next matching event (`None` once the bus is closed)
    pub async fn recv(&mut self) -> Option<Event> {
        self.inner.next().await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

/// Event bus
///
/// Delivery is best-effort and ordered per publisher: a subscriber that falls
/// more than the channel capacity behind loses the oldest events. The
/// per-correlation history lets late joiners and lagged subscribers
/// recover context.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every matching subscriber
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Subscribe to events accepted by `filter`
    fn subscribe(&self, filter: EventFilter) -> Subscription;

    /// Every retained event for a correlation id, oldest first
    async fn history(&self, correlation_id: &CorrelationId) -> Vec<Event>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_by_type_and_correlation() {
        let failure = Event::for_correlation(EventType::SchemaMismatch, "t1", json!({}));
        let ready = Event::for_correlation(EventType::DiagnosisReady, "t2", json!({}));

        assert!(EventFilter::all().matches(&failure));
        assert!(EventFilter::failures().matches(&failure));
        assert!(!EventFilter::failures().matches(&ready));

        let only_t2 = EventFilter::all().for_correlation("t2");
        assert!(only_t2.matches(&ready));
        assert!(!only_t2.matches(&failure));
    }

    #[test]
    fn correlation_filter_rejects_uncorrelated_events() {
        let uncorrelated = Event::new(EventType::SchemaMismatch, "order_1", json!({}));
        assert!(!EventFilter::failures().for_correlation("t1").matches(&uncorrelated));
        assert!(EventFilter::failures().matches(&uncorrelated));
    }

    #[tokio::test]
    async fn subscription_skips_filtered_events_and_ends_on_close() {
        let (tx, rx) = broadcast::channel(8);
        let mut sub = Subscription::from_broadcast(rx, EventFilter::types([EventType::HealCompleted]));

        tx.send(Event::for_correlation(EventType::HealProgress, "t1", json!({})))
            .unwrap();
        tx.send(Event::for_correlation(EventType::HealCompleted, "t1", json!({})))
            .unwrap();
        drop(tx);

        let first = sub.recv().await.unwrap();
        assert_eq!(first.event_type, EventType::HealCompleted);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscription_keeps_receiving() {
        let (tx, rx) = broadcast::channel(2);
        let mut sub = Subscription::from_broadcast(rx, EventFilter::all());

        for i in 0..5 {
            tx.send(Event::for_correlation(EventType::PatchLog, format!("t{i}"), json!({})))
                .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(event) = sub.recv().await {
            seen.push(event.key);
        }
        assert_eq!(seen, vec!["t3".to_string(), "t4".to_string()]);
    }
}
