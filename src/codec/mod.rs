//! Wire codecs: translate the canonical [`crate::model::CommandEnvelope`] /
//! [`crate::model::ResponseEnvelope`] pair to and from each dialect's byte
//! representation (§4.1).
//!
//! Every dialect must round-trip fields it doesn't recognize (forward
//! compatibility with firmware updates), which is why decoding always
//! yields the full JSON object for status deltas rather than a partially
//! typed struct.

pub mod cc2_mqtt;
pub mod legacy_mqtt;
pub mod method;
pub mod ws_sdcp;

use crate::model::ResponseEnvelope;
use serde_json::{Map, Value};

/// Anything that can arrive on the wire, decoded to its canonical shape.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// A response matching an in-flight `requestId`.
    Response(ResponseEnvelope),
    /// A partial or full status push, carrying its own sequence id.
    StatusEvent { update_id: u64, tree: Map<String, Value> },
    /// A well-formed frame whose method code this codec doesn't recognize.
    /// The session still merges `tree` when present (forward compat) and
    /// logs the code once.
    UnknownMethod { method: i64, tree: Option<Map<String, Value>> },
    /// Could not be parsed as any known shape at all.
    Malformed,
}
