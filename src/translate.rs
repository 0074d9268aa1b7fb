//! # Temporal write translator
//!
//! Pure mapping from a [`ChangeRecord`] to a target-side write intent.
//! Performs no I/O, which keeps it unit-testable without a live target.
//!
//! - Create / Update / Snapshot become an **upsert intent**: the source id
//!   field is renamed to the target's reserved identity column and the
//!   operation's effective time is set to the record's event time. The
//!   target is schema-less, so a field never previously seen on a table
//!   needs no migration step.
//! - Delete becomes a **temporal close intent**: instead of removing
//!   history, the record's validity interval is bounded to end at the event
//!   time, leaving prior versions queryable under "as of" time travel.

use crate::record::{ChangeOp, ChangeRecord};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

/// The target's reserved identity column.
pub const ID_COLUMN: &str = "_id";

/// Column carrying the valid-from bound in rendered upserts.
pub const VALID_FROM_COLUMN: &str = "_valid_from";

/// A write intent against the temporal target.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteIntent {
    /// Insert or replace the record identified by `_id` in `document`,
    /// effective from `valid_from` (epoch millis).
    Upsert {
        table: String,
        document: Map<String, Value>,
        valid_from: i64,
    },
    /// Bound the record's validity interval to end at `valid_to`
    /// (epoch millis) without removing history.
    TemporalClose {
        table: String,
        id: Value,
        valid_to: i64,
    },
}

impl WriteIntent {
    /// Target table of this intent.
    pub fn table(&self) -> &str {
        match self {
            Self::Upsert { table, .. } | Self::TemporalClose { table, .. } => table,
        }
    }

    /// Render the parameterized temporal SQL form of this intent.
    ///
    /// Returns the statement and its positional parameters. Timestamps are
    /// rendered as RFC 3339 UTC strings.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        match self {
            Self::Upsert {
                table,
                document,
                valid_from,
            } => {
                let mut doc = document.clone();
                doc.insert(
                    VALID_FROM_COLUMN.to_string(),
                    Value::String(millis_to_rfc3339(*valid_from)),
                );
                (
                    format!("INSERT INTO {table} RECORDS $1"),
                    vec![Value::Object(doc)],
                )
            }
            Self::TemporalClose {
                table,
                id,
                valid_to,
            } => (
                format!(
                    "DELETE FROM {table} FOR PORTION OF VALID_TIME FROM $1 TO NULL WHERE {ID_COLUMN} = $2"
                ),
                vec![Value::String(millis_to_rfc3339(*valid_to)), id.clone()],
            ),
        }
    }
}

/// Translator from canonical change records to write intents.
#[derive(Debug, Clone)]
pub struct Translator {
    id_field: String,
}

impl Default for Translator {
    fn default() -> Self {
        Self::new(crate::envelope::DEFAULT_ID_FIELD)
    }
}

impl Translator {
    /// Create a translator that renames the given id field to [`ID_COLUMN`].
    pub fn new(id_field: impl Into<String>) -> Self {
        Self {
            id_field: id_field.into(),
        }
    }

    /// Translate a change record into a write intent.
    ///
    /// A record flagged as logically deleted closes regardless of its op
    /// code; flattened envelopes carry deletion in `__deleted` and may keep
    /// a non-delete op.
    pub fn translate(&self, record: &ChangeRecord) -> WriteIntent {
        if record.deleted {
            return WriteIntent::TemporalClose {
                table: record.table.clone(),
                id: record.id.clone(),
                valid_to: record.event_time_ms,
            };
        }

        match record.op {
            ChangeOp::Create | ChangeOp::Update | ChangeOp::Snapshot => {
                // Identity column first, then every other field unchanged.
                let mut document = Map::new();
                document.insert(ID_COLUMN.to_string(), record.id.clone());
                for (key, value) in &record.payload {
                    if key != &self.id_field {
                        document.insert(key.clone(), value.clone());
                    }
                }
                WriteIntent::Upsert {
                    table: record.table.clone(),
                    document,
                    valid_from: record.event_time_ms,
                }
            }
            ChangeOp::Delete => WriteIntent::TemporalClose {
                table: record.table.clone(),
                id: record.id.clone(),
                valid_to: record.event_time_ms,
            },
        }
    }
}

/// Render epoch milliseconds as an RFC 3339 UTC timestamp.
pub fn millis_to_rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        .unwrap_or_else(|| ms.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(op: ChangeOp) -> ChangeRecord {
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(1));
        payload.insert("email".to_string(), json!("alice@example.com"));
        ChangeRecord::new("users", op, json!(1), 1704067200000, payload)
    }

    #[test]
    fn test_create_becomes_upsert_with_renamed_id() {
        let intent = Translator::default().translate(&record(ChangeOp::Create));

        match intent {
            WriteIntent::Upsert {
                table,
                document,
                valid_from,
            } => {
                assert_eq!(table, "users");
                assert_eq!(valid_from, 1704067200000);
                assert_eq!(document.get(ID_COLUMN), Some(&json!(1)));
                assert!(document.get("id").is_none());
                assert_eq!(document.get("email"), Some(&json!("alice@example.com")));
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_update_and_snapshot_also_upsert() {
        let t = Translator::default();
        assert!(matches!(
            t.translate(&record(ChangeOp::Update)),
            WriteIntent::Upsert { .. }
        ));
        assert!(matches!(
            t.translate(&record(ChangeOp::Snapshot)),
            WriteIntent::Upsert { .. }
        ));
    }

    #[test]
    fn test_delete_becomes_temporal_close() {
        let intent = Translator::default().translate(&record(ChangeOp::Delete));

        match intent {
            WriteIntent::TemporalClose {
                table,
                id,
                valid_to,
            } => {
                assert_eq!(table, "users");
                assert_eq!(id, json!(1));
                assert_eq!(valid_to, 1704067200000);
            }
            other => panic!("expected temporal close, got {other:?}"),
        }
    }

    #[test]
    fn test_deleted_flag_closes_even_with_update_op() {
        let rec = record(ChangeOp::Update).with_deleted(true);
        assert!(matches!(
            Translator::default().translate(&rec),
            WriteIntent::TemporalClose { .. }
        ));
    }

    #[test]
    fn test_unseen_field_carries_through() {
        // Schema-less target: a brand-new field needs no migration.
        let mut payload = Map::new();
        payload.insert("id".to_string(), json!(2));
        payload.insert("nickname".to_string(), json!("brand-new"));
        let rec = ChangeRecord::new("users", ChangeOp::Update, json!(2), 10, payload);

        match Translator::default().translate(&rec) {
            WriteIntent::Upsert { document, .. } => {
                assert_eq!(document.get("nickname"), Some(&json!("brand-new")));
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_custom_id_field_rename() {
        let mut payload = Map::new();
        payload.insert("user_id".to_string(), json!(5));
        payload.insert("name".to_string(), json!("eve"));
        let rec = ChangeRecord::new("users", ChangeOp::Create, json!(5), 0, payload);

        match Translator::new("user_id").translate(&rec) {
            WriteIntent::Upsert { document, .. } => {
                assert_eq!(document.get(ID_COLUMN), Some(&json!(5)));
                assert!(document.get("user_id").is_none());
                assert_eq!(document.get("name"), Some(&json!("eve")));
            }
            other => panic!("expected upsert, got {other:?}"),
        }
    }

    #[test]
    fn test_millis_to_rfc3339() {
        assert_eq!(millis_to_rfc3339(1704067200000), "2024-01-01T00:00:00Z");
        assert_eq!(millis_to_rfc3339(0), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_upsert_sql_rendering() {
        let intent = Translator::default().translate(&record(ChangeOp::Create));
        let (sql, params) = intent.to_sql();

        assert_eq!(sql, "INSERT INTO users RECORDS $1");
        assert_eq!(params.len(), 1);
        let doc = params[0].as_object().unwrap();
        assert_eq!(doc.get(ID_COLUMN), Some(&json!(1)));
        assert_eq!(
            doc.get(VALID_FROM_COLUMN),
            Some(&json!("2024-01-01T00:00:00Z"))
        );
    }

    #[test]
    fn test_temporal_close_sql_rendering() {
        let intent = Translator::default().translate(&record(ChangeOp::Delete));
        let (sql, params) = intent.to_sql();

        assert!(sql.starts_with("DELETE FROM users FOR PORTION OF VALID_TIME"));
        assert!(sql.contains("_id = $2"));
        assert_eq!(params[0], json!("2024-01-01T00:00:00Z"));
        assert_eq!(params[1], json!(1));
    }
}
