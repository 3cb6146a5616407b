//! JSON wire codec for invalidation events.

use plumb_core::{BusError, BusResult, InvalidationEvent};

pub fn encode_event(event: &InvalidationEvent) -> BusResult<Vec<u8>> {
    serde_json::to_vec(event).map_err(|e| BusError::Codec {
        reason: e.to_string(),
    })
}

/// Decode a payload produced by [`encode_event`] or by a producer using the
/// legacy `ns`/`ts` field names.
pub fn decode_event(payload: &[u8]) -> BusResult<InvalidationEvent> {
    serde_json::from_slice(payload).map_err(|e| BusError::Codec {
        reason: e.to_string(),
    })
}
