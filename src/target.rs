//! # Temporal target seam
//!
//! The target database is an external collaborator reached through the
//! [`TemporalTarget`] trait: one transactional scope at a time, writes
//! expressed as [`WriteIntent`]s.
//!
//! Two implementations ship with the crate:
//!
//! - [`MemoryTarget`]: an in-memory reference target with valid-time
//!   versioning, used by the test suite and as executable documentation of
//!   the temporal semantics the pipeline expects.
//! - `PgWireTarget` (feature `postgres`): drives a real target over the
//!   PostgreSQL wire protocol using the rendered SQL form of each intent.

use crate::error::{PipelineError, Result};
use crate::translate::{WriteIntent, ID_COLUMN};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A write connection to the temporal target database.
///
/// The pipeline never shares a transactional scope across concurrent
/// callers; implementations may assume `begin`..`commit`/`rollback` pairs
/// are sequential.
#[async_trait]
pub trait TemporalTarget: Send + Sync {
    /// Open a transactional scope.
    async fn begin(&self) -> Result<()>;

    /// Execute a write intent inside the open scope.
    async fn execute(&self, intent: &WriteIntent) -> Result<()>;

    /// Commit the open scope.
    async fn commit(&self) -> Result<()>;

    /// Roll back the open scope.
    async fn rollback(&self) -> Result<()>;
}

/// Shared temporal target handle.
pub type SharedTarget = Arc<dyn TemporalTarget>;

/// One version of a row, bounded by its valid-time interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Version {
    /// Row document, identity under [`ID_COLUMN`]
    pub document: Map<String, Value>,
    /// Valid-from bound (epoch millis, inclusive)
    pub valid_from: i64,
    /// Valid-to bound (epoch millis, exclusive); `None` while current
    pub valid_to: Option<i64>,
}

#[derive(Default)]
struct TargetState {
    /// table -> id key -> versions ordered by valid_from
    tables: HashMap<String, HashMap<String, Vec<Version>>>,
    staged: Vec<WriteIntent>,
    in_txn: bool,
    fail_tables: HashSet<String>,
}

/// In-memory reference target with valid-time semantics.
///
/// Upserts close the current version at the new valid-from and open a new
/// one; temporal closes bound the current version without removing history.
/// Writes are staged between `begin` and `commit`, so a rollback leaves the
/// store untouched.
#[derive(Default)]
pub struct MemoryTarget {
    state: Mutex<TargetState>,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write against `table` fail.
    ///
    /// Exercises the rollback paths without a real target.
    pub async fn fail_on(&self, table: &str) {
        let mut state = self.state.lock().await;
        state.fail_tables.insert(table.to_string());
    }

    /// Current row for an id, if any version is still open.
    pub async fn current(&self, table: &str, id: &Value) -> Option<Map<String, Value>> {
        let state = self.state.lock().await;
        versions_of(&state, table, id)?
            .iter()
            .find(|v| v.valid_to.is_none())
            .map(|v| v.document.clone())
    }

    /// Row visible at the given valid-time instant.
    pub async fn as_of(&self, table: &str, id: &Value, ts: i64) -> Option<Map<String, Value>> {
        let state = self.state.lock().await;
        versions_of(&state, table, id)?
            .iter()
            .find(|v| v.valid_from <= ts && v.valid_to.map_or(true, |end| ts < end))
            .map(|v| v.document.clone())
    }

    /// Full version history for an id, ordered by valid-from.
    pub async fn history(&self, table: &str, id: &Value) -> Vec<Version> {
        let state = self.state.lock().await;
        versions_of(&state, table, id)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    }

    /// Number of ids with a currently-open version in a table.
    pub async fn current_count(&self, table: &str) -> usize {
        let state = self.state.lock().await;
        state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|versions| versions.iter().any(|v| v.valid_to.is_none()))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn versions_of<'a>(state: &'a TargetState, table: &str, id: &Value) -> Option<&'a Vec<Version>> {
    state.tables.get(table)?.get(&id_key(id))
}

/// Canonical key for an id value.
fn id_key(id: &Value) -> String {
    id.to_string()
}

fn apply_intent(state: &mut TargetState, intent: &WriteIntent) {
    match intent {
        WriteIntent::Upsert {
            table,
            document,
            valid_from,
        } => {
            let id = document.get(ID_COLUMN).cloned().unwrap_or(Value::Null);
            let versions = state
                .tables
                .entry(table.clone())
                .or_default()
                .entry(id_key(&id))
                .or_default();

            if let Some(open) = versions.iter_mut().find(|v| v.valid_to.is_none()) {
                if open.valid_from == *valid_from {
                    // Same effective time: replace, one current row.
                    open.document = document.clone();
                    return;
                }
                open.valid_to = Some(*valid_from);
            }
            versions.push(Version {
                document: document.clone(),
                valid_from: *valid_from,
                valid_to: None,
            });
        }
        WriteIntent::TemporalClose {
            table,
            id,
            valid_to,
        } => {
            if let Some(versions) = state
                .tables
                .get_mut(table)
                .and_then(|rows| rows.get_mut(&id_key(id)))
            {
                if let Some(open) = versions.iter_mut().find(|v| v.valid_to.is_none()) {
                    open.valid_to = Some(*valid_to);
                }
            }
        }
    }
}

#[async_trait]
impl TemporalTarget for MemoryTarget {
    async fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.in_txn {
            return Err(PipelineError::invalid_state("transaction already open"));
        }
        state.in_txn = true;
        state.staged.clear();
        Ok(())
    }

    async fn execute(&self, intent: &WriteIntent) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_txn {
            return Err(PipelineError::invalid_state("no open transaction"));
        }
        if state.fail_tables.contains(intent.table()) {
            return Err(PipelineError::target(format!(
                "write rejected for table {}",
                intent.table()
            )));
        }
        state.staged.push(intent.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.in_txn {
            return Err(PipelineError::invalid_state("no open transaction"));
        }
        let staged = std::mem::take(&mut state.staged);
        for intent in &staged {
            apply_intent(&mut state, intent);
        }
        state.in_txn = false;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.staged.clear();
        state.in_txn = false;
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgWireTarget;

#[cfg(feature = "postgres")]
mod pg {
    use super::*;
    use crate::config::TargetConfig;
    use tokio_postgres::types::{Json, ToSql};
    use tokio_postgres::NoTls;
    use tracing::{debug, error};

    /// Target driven over the PostgreSQL wire protocol.
    ///
    /// Each write intent is executed in its rendered parameterized SQL form;
    /// transactional scope maps onto `BEGIN`/`COMMIT`/`ROLLBACK`.
    pub struct PgWireTarget {
        client: tokio_postgres::Client,
    }

    impl PgWireTarget {
        /// Connect to the target described by the configuration.
        pub async fn connect(config: &TargetConfig) -> Result<Self> {
            let mut pg_config: tokio_postgres::Config = config
                .url
                .parse()
                .map_err(|e| PipelineError::config(format!("invalid target url: {e}")))?;
            if let Some(user) = &config.user {
                pg_config.user(user);
            }
            if let Some(password) = &config.password {
                pg_config.password(password);
            }

            let (client, connection) = pg_config.connect(NoTls).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!(error = %e, "target connection terminated");
                }
            });
            debug!("connected to temporal target");
            Ok(Self { client })
        }
    }

    #[async_trait]
    impl TemporalTarget for PgWireTarget {
        async fn begin(&self) -> Result<()> {
            self.client.batch_execute("BEGIN").await?;
            Ok(())
        }

        async fn execute(&self, intent: &WriteIntent) -> Result<()> {
            let (sql, params) = intent.to_sql();
            let json_params: Vec<Json<&Value>> = params.iter().map(Json).collect();
            let refs: Vec<&(dyn ToSql + Sync)> = json_params
                .iter()
                .map(|p| p as &(dyn ToSql + Sync))
                .collect();
            self.client.execute(sql.as_str(), &refs).await?;
            Ok(())
        }

        async fn commit(&self) -> Result<()> {
            self.client.batch_execute("COMMIT").await?;
            Ok(())
        }

        async fn rollback(&self) -> Result<()> {
            self.client.batch_execute("ROLLBACK").await?;
            Ok(())
        }
    }
}
