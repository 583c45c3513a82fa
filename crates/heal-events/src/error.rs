//! Error types for the event bus

/// Event bus errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    /// The bus has been closed and accepts no more events
    #[error("event bus closed")]
    Closed,

    /// The event was rejected before publication
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}

impl BusError {
    /// Check if the bus can never accept events again
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_error_display() {
        assert_eq!(BusError::Closed.to_string(), "event bus closed");
        assert!(BusError::InvalidEvent("empty key".into())
            .to_string()
            .contains("empty key"));
    }

    #[test]
    fn bus_error_closed_classification() {
        assert!(BusError::Closed.is_closed());
        assert!(!BusError::InvalidEvent(String::new()).is_closed());
    }
}
