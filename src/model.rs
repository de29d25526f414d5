//! Wire-agnostic data model: command/response envelopes, the status
//! snapshot merge target, and printer metadata records.

use serde_json::{Map, Value};
use std::time::{Instant, SystemTime};

/// A command sent to the printer, in canonical (dialect-independent) form.
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub request_id: u64,
    pub method: i64,
    pub params: Value,
    pub issued_at: SystemTime,
}

/// A response received from the printer, in canonical form.
#[derive(Debug, Clone)]
pub struct ResponseEnvelope {
    pub request_id: u64,
    pub method: i64,
    pub error_code: i64,
    pub result: Value,
}

impl ResponseEnvelope {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

/// Static-per-boot printer metadata, fetched once at session open and again
/// on reconnect.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Attributes {
    pub model: String,
    #[serde(default)]
    pub mainboard_mac: Option<String>,
    #[serde(default)]
    pub wifi_mac: Option<String>,
    pub firmware_version: String,
    #[serde(default)]
    pub max_video_connections: Option<u32>,
    #[serde(default)]
    pub resolution: Option<String>,
    /// Fields the typed struct above doesn't recognize, preserved verbatim
    /// so a round-trip never drops forward-compat data.
    #[serde(flatten)]
    pub extensions: Map<String, Value>,
}

/// Where a print file lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMedium {
    Local,
    Udisk,
    Sdcard,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PrintFileRecord {
    pub filename: String,
    pub storage_medium: StorageMedium,
    pub size: u64,
    pub md5: String,
    #[serde(default)]
    pub thumbnail_bytes: Option<Vec<u8>>,
    #[serde(default)]
    pub total_layers: Option<u32>,
}

/// Coarse machine status; anything not in this table is parsed from the raw
/// `extensions` tree by callers that need it (e.g. exception codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MachineStatus {
    #[default]
    Idle,
    Printing,
    Paused,
    Error,
    Homing,
}

/// The merge target for delta status updates. Mirrors the printer's status
/// tree as a generic JSON object plus a handful of fields callers reach for
/// constantly (continuity tracking, the PRINTING invariant).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    /// The full merged status tree, dialect-neutral.
    pub tree: Map<String, Value>,
    /// The sequence number of the last frame folded into `tree`.
    pub last_update_id: u64,
    /// Set when a transport failure left this snapshot without fresh data.
    #[serde(skip)]
    pub stale: bool,
    /// Set when the PRINTING invariant (non-empty filename/uuid) was violated
    /// and a full refresh has been requested to repair it.
    #[serde(skip)]
    pub tainted: bool,
}

impl StatusSnapshot {
    pub fn machine_status(&self) -> Option<MachineStatus> {
        self.tree
            .get("machineStatus")
            .and_then(|v| v.as_str())
            .and_then(|s| match s {
                "PRINTING" => Some(MachineStatus::Printing),
                "PAUSED" => Some(MachineStatus::Paused),
                "ERROR" => Some(MachineStatus::Error),
                "HOMING" => Some(MachineStatus::Homing),
                "IDLE" => Some(MachineStatus::Idle),
                _ => None,
            })
    }

    fn print_field(&self, key: &str) -> Option<&Value> {
        self.tree.get("print").and_then(|p| p.get(key))
    }

    pub fn print_filename(&self) -> Option<&str> {
        self.print_field("filename").and_then(|v| v.as_str())
    }

    pub fn print_uuid(&self) -> Option<&str> {
        self.print_field("uuid").and_then(|v| v.as_str())
    }

    /// `total_layer` has shipped under both `total_layer` and `TotalLayers`
    /// across firmware revisions (§9 open question (a)); accept either.
    pub fn print_total_layer(&self) -> u64 {
        self.print_field("total_layer")
            .or_else(|| self.print_field("TotalLayers"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Applies the PRINTING invariant from §3: when printing, filename and
    /// uuid must be non-empty. Returns `true` if the invariant was violated
    /// (and `tainted` was set) so the caller can request a full refresh.
    pub fn check_printing_invariant(&mut self) -> bool {
        if self.machine_status() != Some(MachineStatus::Printing) {
            return false;
        }
        let filename_empty = self.print_filename().unwrap_or("").is_empty();
        let uuid_empty = self.print_uuid().unwrap_or("").is_empty();
        if filename_empty || uuid_empty {
            self.tainted = true;
            true
        } else {
            false
        }
    }

    /// Recursive deep merge per §4.4: matching object keys merge
    /// recursively, everything else (scalars, arrays) is replaced wholesale
    /// by the incoming value. Idempotent and empty-delta-safe by construction.
    pub fn merge_delta(&mut self, delta: &Map<String, Value>, update_id: u64) {
        deep_merge(&mut self.tree, delta);
        if update_id > self.last_update_id {
            self.last_update_id = update_id;
        }
        self.stale = false;
    }

    /// Replaces the entire tree, as happens on a full `GET_STATUS` response.
    pub fn replace_full(&mut self, tree: Map<String, Value>, update_id: u64) {
        self.tree = tree;
        self.last_update_id = update_id;
        self.stale = false;
        self.tainted = false;
    }

    /// Folds a `total_layer` value recovered out-of-band (§4.4's total-layer
    /// recovery, via `GET_FILE_DETAIL`) into the current `print` object,
    /// without touching `last_update_id` or any other field.
    pub fn merge_total_layer(&mut self, total_layer: u64) {
        let print = self
            .tree
            .entry("print".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(print_obj) = print {
            print_obj.insert("total_layer".to_string(), Value::from(total_layer));
        }
    }
}

fn deep_merge(target: &mut Map<String, Value>, delta: &Map<String, Value>) {
    for (key, incoming) in delta {
        match (target.get_mut(key), incoming) {
            (Some(Value::Object(existing)), Value::Object(incoming_obj)) => {
                deep_merge(existing, incoming_obj);
            }
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}

/// Tracks delta-sequence continuity for one session, per §4.4's
/// `nonContinuousCount` rule.
#[derive(Debug, Clone)]
pub struct Continuity {
    pub non_continuous_count: u32,
    pub last_full_refresh: Instant,
}

impl Default for Continuity {
    fn default() -> Self {
        Self {
            non_continuous_count: 0,
            last_full_refresh: Instant::now(),
        }
    }
}

/// Threshold at which continuity loss forces a full status refresh.
pub const NON_CONTINUOUS_THRESHOLD: u32 = 5;
/// Safety-refresh interval regardless of continuity.
pub const SAFETY_REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

impl Continuity {
    /// Observes an inbound delta id against the expected next id. Returns
    /// `true` if a full refresh should now be requested.
    pub fn observe(&mut self, incoming_id: u64, previous_last_update_id: u64) -> bool {
        let expected = previous_last_update_id + 1;
        if incoming_id != expected {
            self.non_continuous_count += 1;
        }
        if self.non_continuous_count >= NON_CONTINUOUS_THRESHOLD {
            self.reset();
            return true;
        }
        if self.last_full_refresh.elapsed() >= SAFETY_REFRESH_INTERVAL {
            self.reset();
            return true;
        }
        false
    }

    pub fn reset(&mut self) {
        self.non_continuous_count = 0;
        self.last_full_refresh = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn merge_is_recursive_on_nested_objects() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(
            obj(json!({
                "extruder": {"temp": 200.0, "target": 210.0},
                "machineStatus": "PRINTING",
            })),
            1,
        );
        snapshot.merge_delta(&obj(json!({"extruder": {"temp": 201.5}})), 2);

        assert_eq!(snapshot.tree["extruder"]["temp"], json!(201.5));
        assert_eq!(snapshot.tree["extruder"]["target"], json!(210.0));
        assert_eq!(snapshot.last_update_id, 2);
    }

    #[test]
    fn arrays_are_replaced_wholesale_never_merged() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(
            obj(json!({"canvas_info": {"canvas_list": [1, 2, 3]}})),
            1,
        );
        snapshot.merge_delta(
            &obj(json!({"canvas_info": {"canvas_list": [9]}})),
            2,
        );
        assert_eq!(snapshot.tree["canvas_info"]["canvas_list"], json!([9]));
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = StatusSnapshot::default();
        a.replace_full(obj(json!({"bed": {"temp": 60.0}})), 1);
        let delta = obj(json!({"bed": {"temp": 65.0}, "fan": {"speed": 128}}));

        let mut once = a.clone();
        once.merge_delta(&delta, 2);
        let mut twice = a.clone();
        twice.merge_delta(&delta, 2);
        twice.merge_delta(&delta, 2);

        assert_eq!(once.tree, twice.tree);
    }

    #[test]
    fn empty_delta_is_a_byte_identical_round_trip() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(obj(json!({"bed": {"temp": 60.0}})), 5);
        let before = snapshot.tree.clone();
        snapshot.merge_delta(&Map::new(), 5);
        assert_eq!(snapshot.tree, before);
    }

    #[test]
    fn last_update_id_never_regresses() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(Map::new(), 10);
        snapshot.merge_delta(&Map::new(), 3);
        assert_eq!(snapshot.last_update_id, 10);
    }

    #[test]
    fn printing_with_empty_filename_is_tainted() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(
            obj(json!({"machineStatus": "PRINTING", "print": {"filename": "", "uuid": ""}})),
            1,
        );
        assert!(snapshot.check_printing_invariant());
        assert!(snapshot.tainted);
    }

    #[test]
    fn printing_with_filename_and_uuid_is_not_tainted() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(
            obj(json!({"machineStatus": "PRINTING", "print": {"filename": "a.gcode", "uuid": "u1"}})),
            1,
        );
        assert!(!snapshot.check_printing_invariant());
        assert!(!snapshot.tainted);
    }

    #[test]
    fn total_layer_accepts_either_field_name() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(obj(json!({"print": {"TotalLayers": 42}})), 1);
        assert_eq!(snapshot.print_total_layer(), 42);

        let mut snapshot2 = StatusSnapshot::default();
        snapshot2.replace_full(obj(json!({"print": {"total_layer": 7}})), 1);
        assert_eq!(snapshot2.print_total_layer(), 7);
    }

    #[test]
    fn merge_total_layer_sets_field_without_disturbing_siblings() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.replace_full(obj(json!({"print": {"filename": "a.gcode"}})), 1);
        snapshot.merge_total_layer(42);
        assert_eq!(snapshot.print_total_layer(), 42);
        assert_eq!(snapshot.tree["print"]["filename"], json!("a.gcode"));
        assert_eq!(snapshot.last_update_id, 1);
    }

    #[test]
    fn continuity_resets_after_forced_refresh() {
        let mut continuity = Continuity::default();
        // Five consecutive gaps: expected always trails by one.
        let mut last = 0u64;
        for i in 0..5 {
            let incoming = last + 2; // always a gap of 1
            let refreshed = continuity.observe(incoming, last);
            last = incoming;
            if i < 4 {
                assert!(!refreshed);
            } else {
                assert!(refreshed);
                assert_eq!(continuity.non_continuous_count, 0);
            }
        }
    }
}
