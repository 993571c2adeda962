//! Immutable per-message metadata.

use crate::time::Instant;

/// Size in bytes of the fixed on-disk envelope layout produced by
/// [`Envelope::to_bytes`].
pub const ENVELOPE_SIZE: usize = 24;

/// Immutable metadata carried by every message on an edge.
///
/// `originating_time` is the logical "when this observation was made" and
/// is the only time used for correctness (ordering, interpolation, replay
/// windowing). `creation_time` is the scheduler's wall-clock stamp when the
/// envelope was minted and carries no correctness weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Envelope {
    /// Id of the emitter that minted this envelope.
    pub source_id: u32,
    /// Monotonically increasing per-emitter sequence number.
    pub sequence_id: u64,
    /// The sole correctness-relevant clock reading.
    pub originating_time: Instant,
    /// Wall-clock stamp at minting time.
    pub creation_time: Instant,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    pub const fn new(
        source_id: u32,
        sequence_id: u64,
        originating_time: Instant,
        creation_time: Instant,
    ) -> Self {
        Self {
            source_id,
            sequence_id,
            originating_time,
            creation_time,
        }
    }

    /// Tie-break ordering key used when multiple receivers in the same
    /// `sync_context` have deliverable messages at the same originating
    /// time: ascending `source_id`, then `sequence_id`.
    #[must_use]
    pub const fn delivery_key(&self) -> (Instant, u32, u64) {
        (self.originating_time, self.source_id, self.sequence_id)
    }

    /// Serializes the envelope to its fixed 24-byte on-disk representation
    /// (`source_id:i32, sequence_id:i32, originating_time:i64, creation_time:i64`
    /// per `SPEC_FULL.md` section 6).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..4].copy_from_slice(&(self.source_id as i32).to_le_bytes());
        buf[4..8].copy_from_slice(&(self.sequence_id as i32).to_le_bytes());
        buf[8..16].copy_from_slice(&self.originating_time.ticks().to_le_bytes());
        buf[16..24].copy_from_slice(&self.creation_time.ticks().to_le_bytes());
        buf
    }

    /// Parses an envelope from its fixed 24-byte on-disk representation.
    #[must_use]
    pub fn from_bytes(buf: &[u8; 24]) -> Self {
        let source_id = i32::from_le_bytes(buf[0..4].try_into().unwrap()) as u32;
        let sequence_id = i32::from_le_bytes(buf[4..8].try_into().unwrap()) as u64;
        let originating_time = Instant::from_ticks(i64::from_le_bytes(buf[8..16].try_into().unwrap()));
        let creation_time = Instant::from_ticks(i64::from_le_bytes(buf[16..24].try_into().unwrap()));
        Self::new(source_id, sequence_id, originating_time, creation_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_through_bytes() {
        let env = Envelope::new(7, 42, Instant::from_ticks(1_000), Instant::from_ticks(1_010));
        let bytes = env.to_bytes();
        let back = Envelope::from_bytes(&bytes);
        assert_eq!(env, back);
    }

    #[test]
    fn delivery_key_orders_by_time_then_source_then_sequence() {
        let a = Envelope::new(1, 5, Instant::from_ticks(10), Instant::from_ticks(10));
        let b = Envelope::new(0, 5, Instant::from_ticks(10), Instant::from_ticks(10));
        assert!(b.delivery_key() < a.delivery_key());
    }
}
