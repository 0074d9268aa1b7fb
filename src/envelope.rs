//! # Event envelope parser
//!
//! Normalizes the two on-the-wire change-event shapes into one canonical
//! [`ChangeRecord`].
//!
//! ## Envelope shapes
//!
//! - **Full envelope**: carries a `source` object with `db` and `table`,
//!   plus `op`, `ts_ms` and `before`/`after` row images. Usually wrapped in
//!   a top-level `payload` object.
//! - **Flat envelope**: a flattening transform was applied upstream; the
//!   row's own fields sit at the top level and metadata travels in
//!   double-underscore keys (`__op`, `__table`, `__source_ts_ms`,
//!   `__deleted`).
//!
//! Shape detection is structural, not version-flagged: the presence of a
//! `source` object (directly or under `payload`) marks a full envelope,
//! anything else is treated as flat.
//!
//! Discarding is silent at this layer. A `None` return is not an error
//! condition; the batch controller never sees discarded events.

use crate::record::{ChangeOp, ChangeRecord};
use serde_json::{Map, Value};
use tracing::trace;

/// Default key under which the source primary key is expected.
pub const DEFAULT_ID_FIELD: &str = "id";

/// A change event envelope, resolved once at parse entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Full envelope: `op`/`ts_ms`/`source`/`before`/`after`
    Full(Map<String, Value>),
    /// Flat envelope: row fields plus `__`-prefixed metadata keys
    Flat(Map<String, Value>),
}

impl Envelope {
    /// Structurally detect the envelope shape of a decoded JSON value.
    ///
    /// Returns `None` for non-object or empty values.
    pub fn detect(value: Value) -> Option<Envelope> {
        let Value::Object(mut obj) = value else {
            return None;
        };

        // A wrapped full envelope puts everything under `payload`.
        match obj.remove("payload") {
            Some(Value::Object(inner))
                if inner.contains_key("source") || inner.contains_key("op") =>
            {
                return Some(Envelope::Full(inner));
            }
            // Not an envelope wrapper; could be a row column named "payload".
            Some(other) => {
                obj.insert("payload".to_string(), other);
            }
            None => {}
        }

        if matches!(obj.get("source"), Some(Value::Object(_))) {
            return Some(Envelope::Full(obj));
        }

        if obj.is_empty() {
            None
        } else {
            Some(Envelope::Flat(obj))
        }
    }
}

/// Parser that normalizes raw envelopes into [`ChangeRecord`]s.
#[derive(Debug, Clone)]
pub struct EnvelopeParser {
    id_field: String,
}

impl Default for EnvelopeParser {
    fn default() -> Self {
        Self::new(DEFAULT_ID_FIELD)
    }
}

impl EnvelopeParser {
    /// Create a parser expecting the given id-field key in row images.
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    /// The configured id-field key.
    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    /// Parse a raw envelope.
    ///
    /// Returns `None` when the bytes are empty or unparseable, the event is
    /// a schema/DDL event, the resolved table name is empty, the payload is
    /// null, or the payload carries no value under the id-field key.
    pub fn parse(&self, raw: &[u8]) -> Option<ChangeRecord> {
        let value: Value = match serde_json::from_slice(raw) {
            Ok(v) => v,
            Err(e) => {
                trace!(error = %e, "discarding unparseable envelope");
                return None;
            }
        };
        self.parse_value(value)
    }

    /// Parse an already-decoded envelope value.
    pub fn parse_value(&self, value: Value) -> Option<ChangeRecord> {
        match Envelope::detect(value)? {
            Envelope::Full(map) => self.parse_full(map),
            Envelope::Flat(map) => self.parse_flat(map),
        }
    }

    fn parse_full(&self, map: Map<String, Value>) -> Option<ChangeRecord> {
        // Schema/DDL-only events never produce a record.
        if map.contains_key("ddl") || map.contains_key("tableChanges") {
            trace!("discarding schema change event");
            return None;
        }

        let before = map.get("before").filter(|v| !v.is_null());
        let after = map.get("after").filter(|v| !v.is_null());
        if before.is_none() && after.is_none() {
            trace!("discarding event without row images");
            return None;
        }

        let op = map
            .get("op")
            .and_then(Value::as_str)
            .and_then(ChangeOp::from_code)
            .unwrap_or(ChangeOp::Create);

        let event_time_ms = map
            .get("ts_ms")
            .and_then(Value::as_i64)
            .unwrap_or_else(now_millis);

        let table = map
            .get("source")
            .and_then(Value::as_object)
            .and_then(|s| s.get("table"))
            .and_then(Value::as_str)
            .map(strip_qualifier)
            .unwrap_or_default();
        if table.is_empty() {
            trace!("discarding event with empty table name");
            return None;
        }

        // Deletes carry the row in the before image, everything else in after.
        let image = if op == ChangeOp::Delete { before } else { after };
        let payload = image.and_then(Value::as_object)?.clone();

        self.finish(table, op, event_time_ms, payload, op == ChangeOp::Delete)
    }

    fn parse_flat(&self, mut map: Map<String, Value>) -> Option<ChangeRecord> {
        let op_code = take_string(&mut map, "__op");
        let table_raw =
            take_string(&mut map, "__table").or_else(|| take_string(&mut map, "__source_table"));
        let ts = take_i64(&mut map, "__source_ts_ms").or_else(|| take_i64(&mut map, "__ts_ms"));
        let deleted = take_bool(&mut map, "__deleted");

        // Drop any remaining synthetic keys; what's left is the row itself.
        map.retain(|k, _| !k.starts_with("__"));

        let table = table_raw.as_deref().map(strip_qualifier).unwrap_or_default();
        if table.is_empty() {
            trace!("discarding flat event with empty table name");
            return None;
        }

        let op = op_code
            .as_deref()
            .and_then(ChangeOp::from_code)
            .unwrap_or(if deleted { ChangeOp::Delete } else { ChangeOp::Create });

        if map.is_empty() {
            trace!(table = %table, "discarding flat event without row fields");
            return None;
        }

        let event_time_ms = ts.unwrap_or_else(now_millis);
        let logically_deleted = deleted || op == ChangeOp::Delete;
        self.finish(table, op, event_time_ms, map, logically_deleted)
    }

    fn finish(
        &self,
        table: String,
        op: ChangeOp,
        event_time_ms: i64,
        payload: Map<String, Value>,
        deleted: bool,
    ) -> Option<ChangeRecord> {
        match payload.get(&self.id_field) {
            Some(id) if !id.is_null() => {
                let id = id.clone();
                Some(
                    ChangeRecord::new(table, op, id, event_time_ms, payload)
                        .with_deleted(deleted),
                )
            }
            _ => {
                trace!(table = %table, id_field = %self.id_field, "discarding event without id");
                None
            }
        }
    }
}

/// Strip a leading `database.` qualifier, keeping the final segment.
fn strip_qualifier(table: &str) -> String {
    table
        .rsplit('.')
        .next()
        .unwrap_or(table)
        .trim()
        .to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key)? {
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

fn take_i64(map: &mut Map<String, Value>, key: &str) -> Option<i64> {
    match map.remove(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn take_bool(map: &mut Map<String, Value>, key: &str) -> bool {
    match map.remove(key) {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parser() -> EnvelopeParser {
        EnvelopeParser::default()
    }

    #[test]
    fn test_detect_wrapped_full() {
        let v = json!({"payload": {"op": "c", "source": {"db": "accounts", "table": "users"}, "after": {"id": 1}}});
        assert!(matches!(Envelope::detect(v), Some(Envelope::Full(_))));
    }

    #[test]
    fn test_detect_unwrapped_full() {
        let v = json!({"op": "c", "source": {"db": "accounts", "table": "users"}, "after": {"id": 1}});
        assert!(matches!(Envelope::detect(v), Some(Envelope::Full(_))));
    }

    #[test]
    fn test_detect_flat() {
        let v = json!({"id": 1, "email": "a@b.c", "__op": "c", "__table": "users"});
        assert!(matches!(Envelope::detect(v), Some(Envelope::Flat(_))));
    }

    #[test]
    fn test_detect_flat_with_payload_column() {
        // A row whose own column happens to be named "payload" is still flat.
        let v = json!({"id": 1, "payload": "blob", "__table": "users"});
        match Envelope::detect(v) {
            Some(Envelope::Flat(map)) => assert!(map.contains_key("payload")),
            other => panic!("expected flat envelope, got {other:?}"),
        }
    }

    #[test]
    fn test_detect_rejects_non_objects() {
        assert_eq!(Envelope::detect(json!(null)), None);
        assert_eq!(Envelope::detect(json!([1, 2])), None);
        assert_eq!(Envelope::detect(json!({})), None);
    }

    #[test]
    fn test_parse_full_create() {
        let raw = br#"{"payload":{"op":"c","ts_ms":1704067200000,"source":{"db":"accounts","table":"users"},"after":{"id":1,"email":"alice@example.com"}}}"#;
        let rec = parser().parse(raw).unwrap();

        assert_eq!(rec.table, "users");
        assert_eq!(rec.op, ChangeOp::Create);
        assert_eq!(rec.id, json!(1));
        assert_eq!(rec.event_time_ms, 1704067200000);
        assert_eq!(rec.payload.get("email"), Some(&json!("alice@example.com")));
        assert!(!rec.deleted);
    }

    #[test]
    fn test_parse_full_delete_uses_before_image() {
        let v = json!({"payload": {
            "op": "d", "ts_ms": 1000,
            "source": {"db": "accounts", "table": "users"},
            "before": {"id": 7, "email": "gone@example.com"},
            "after": null
        }});
        let rec = parser().parse_value(v).unwrap();

        assert_eq!(rec.op, ChangeOp::Delete);
        assert!(rec.deleted);
        assert_eq!(rec.id, json!(7));
        assert_eq!(rec.payload.get("email"), Some(&json!("gone@example.com")));
    }

    #[test]
    fn test_parse_full_snapshot() {
        let v = json!({"payload": {
            "op": "r", "ts_ms": 5,
            "source": {"db": "accounts", "table": "users"},
            "after": {"id": 2}
        }});
        let rec = parser().parse_value(v).unwrap();
        assert_eq!(rec.op, ChangeOp::Snapshot);
    }

    #[test]
    fn test_parse_full_strips_table_qualifier() {
        let v = json!({"payload": {
            "op": "c",
            "source": {"db": "accounts", "table": "accounts.users"},
            "after": {"id": 1}
        }});
        let rec = parser().parse_value(v).unwrap();
        assert_eq!(rec.table, "users");
    }

    #[test]
    fn test_parse_full_missing_op_defaults_to_create() {
        let v = json!({"payload": {
            "source": {"db": "d", "table": "t"},
            "after": {"id": 1}
        }});
        let rec = parser().parse_value(v).unwrap();
        assert_eq!(rec.op, ChangeOp::Create);
    }

    #[test]
    fn test_parse_full_missing_ts_defaults_to_now() {
        let before = now_millis();
        let v = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": "t"},
            "after": {"id": 1}
        }});
        let rec = parser().parse_value(v).unwrap();
        assert!(rec.event_time_ms >= before);
    }

    #[test]
    fn test_schema_events_dropped() {
        let ddl = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": "t"},
            "ddl": "ALTER TABLE t ADD COLUMN x INT",
            "tableChanges": []
        }});
        assert!(parser().parse_value(ddl).is_none());

        let no_images = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": "t"}
        }});
        assert!(parser().parse_value(no_images).is_none());
    }

    #[test]
    fn test_discard_missing_id() {
        let v = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": "t"},
            "after": {"email": "no-id@example.com"}
        }});
        assert!(parser().parse_value(v).is_none());
    }

    #[test]
    fn test_discard_null_payload() {
        let v = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": "t"},
            "after": null,
            "before": {"id": 1}
        }});
        // Create with a null after image has no payload to apply.
        assert!(parser().parse_value(v).is_none());
    }

    #[test]
    fn test_discard_empty_table() {
        let v = json!({"payload": {
            "op": "c",
            "source": {"db": "d", "table": ""},
            "after": {"id": 1}
        }});
        assert!(parser().parse_value(v).is_none());
    }

    #[test]
    fn test_discard_unparseable() {
        assert!(parser().parse(b"").is_none());
        assert!(parser().parse(b"not json").is_none());
    }

    #[test]
    fn test_parse_flat_create() {
        let v = json!({
            "id": 3, "email": "carol@example.com",
            "__op": "c", "__table": "users", "__source_ts_ms": 2000, "__deleted": "false"
        });
        let rec = parser().parse_value(v).unwrap();

        assert_eq!(rec.table, "users");
        assert_eq!(rec.op, ChangeOp::Create);
        assert_eq!(rec.event_time_ms, 2000);
        assert!(!rec.deleted);
        // Synthetic keys do not leak into the payload.
        assert!(rec.payload.keys().all(|k| !k.starts_with("__")));
        assert_eq!(rec.payload.len(), 2);
    }

    #[test]
    fn test_parse_flat_delete_flag_without_op() {
        let v = json!({
            "id": 3,
            "__table": "users", "__deleted": true
        });
        let rec = parser().parse_value(v).unwrap();
        assert_eq!(rec.op, ChangeOp::Delete);
        assert!(rec.deleted);
    }

    #[test]
    fn test_parse_flat_deleted_flag_independent_of_op() {
        let v = json!({
            "id": 3,
            "__op": "u", "__table": "users", "__deleted": "true"
        });
        let rec = parser().parse_value(v).unwrap();
        assert_eq!(rec.op, ChangeOp::Update);
        assert!(rec.deleted);
    }

    #[test]
    fn test_flat_table_normalization_matches_full() {
        let full = json!({"payload": {
            "op": "c",
            "source": {"db": "accounts", "table": "accounts.users"},
            "after": {"id": 1}
        }});
        let flat = json!({"id": 1, "__op": "c", "__table": "users"});

        let a = parser().parse_value(full).unwrap();
        let b = parser().parse_value(flat).unwrap();
        assert_eq!(a.table, "users");
        assert_eq!(a.table, b.table);
    }

    #[test]
    fn test_flat_discard_without_table_or_fields() {
        assert!(parser()
            .parse_value(json!({"id": 1, "__op": "c"}))
            .is_none());
        assert!(parser()
            .parse_value(json!({"__op": "c", "__table": "users"}))
            .is_none());
    }

    #[test]
    fn test_custom_id_field() {
        let p = EnvelopeParser::new("user_id");
        let v = json!({"user_id": 9, "email": "x@y.z", "__table": "users"});
        let rec = p.parse_value(v).unwrap();
        assert_eq!(rec.id, json!(9));

        // Default key absent under the configured one: discard.
        let v = json!({"id": 9, "__table": "users"});
        assert!(p.parse_value(v).is_none());
    }
}
