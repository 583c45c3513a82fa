//! Heal Events - event envelope and bus
//!
//! Every component of the self-heal pipeline talks through this crate:
//! - [`Event`] is the immutable envelope carried on the bus
//! - [`EventBus`] is the publish / subscribe-by-type / history contract
//! - [`InMemoryEventBus`] is the broadcast-backed implementation used by the
//!   demo binary and the tests
//!
//! # Example
//!
//! ```rust,ignore
//! use heal_events::{Event, EventBus, EventFilter, EventType, InMemoryEventBus};
//!
//! # async fn example() -> Result<(), heal_events::BusError> {
//! let bus = InMemoryEventBus::default();
//! let mut failures = bus.subscribe(EventFilter::failures());
//!
//! bus.publish(Event::for_correlation(
//!     EventType::SchemaMismatch,
//!     "t1",
//!     serde_json::json!({ "field": "return_policy" }),
//! ))
//! .await?;
//!
//! let event = failures.recv().await;
//! # Ok(())
//! # }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod bus;
pub mod error;
pub mod event;
pub mod memory;

pub use bus::{EventBus, EventFilter, Subscription};
pub use error::BusError;
pub use event::{CorrelationId, Event, EventId, EventType};
pub use memory::{BusConfig, BusStats, InMemoryEventBus};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
