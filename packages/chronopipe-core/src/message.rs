//! The typed message wrapper delivered across edges.

use crate::envelope::Envelope;

/// A payload paired with its immutable envelope.
///
/// Emitted by the producing component; conceptually owned by each receiver
/// on delivery. A receiver that must retain the payload beyond its `action`
/// call clones it explicitly.
#[derive(Debug, Clone)]
pub struct Message<T> {
    /// The typed payload.
    pub payload: T,
    /// The message's immutable metadata.
    pub envelope: Envelope,
}

impl<T> Message<T> {
    /// Creates a message.
    #[must_use]
    pub const fn new(payload: T, envelope: Envelope) -> Self {
        Self { payload, envelope }
    }

    /// Returns the originating time, the only time relevant to correctness.
    #[must_use]
    pub fn originating_time(&self) -> crate::time::Instant {
        self.envelope.originating_time
    }

    /// Maps the payload, keeping the envelope unchanged. Used by fusion
    /// operators and stream adapters that transform values in place.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Message<U> {
        Message {
            payload: f(self.payload),
            envelope: self.envelope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::Instant;

    #[test]
    fn map_preserves_envelope() {
        let env = Envelope::new(1, 1, Instant::from_ticks(5), Instant::from_ticks(5));
        let msg = Message::new(3, env);
        let mapped = msg.map(|v| v * 2);
        assert_eq!(mapped.payload, 6);
        assert_eq!(mapped.envelope, env);
    }
}
