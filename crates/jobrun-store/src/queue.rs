use jobrun_core::now_ms;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::Store;

/// Sentinel returned by `enqueue` when deduplication suppressed the insert.
pub const ENQUEUE_SKIPPED: i64 = -1;

/// Fallback limits for queues with no definition row.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 1;
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

const MS_PER_DAY: i64 = 86_400_000;

/// Which item statuses participate in duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// Duplicates are only live items: {pending, processing}.
    Pending,
    /// Completed work also blocks re-enqueue: {pending, processing, done}.
    All,
}

impl DedupScope {
    fn statuses(self) -> &'static str {
        match self {
            DedupScope::Pending => "('pending', 'processing')",
            DedupScope::All => "('pending', 'processing', 'done')",
        }
    }
}

impl std::fmt::Display for DedupScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DedupScope::Pending => "pending",
            DedupScope::All => "all",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DedupScope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DedupScope::Pending),
            "all" => Ok(DedupScope::All),
            other => Err(format!("unknown dedup scope: {other}")),
        }
    }
}

/// A queue definition row. Immutable after seeding in normal use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueDef {
    pub id: String,
    pub name: String,
    /// Path expression (e.g. `$.threadId`) evaluated against the payload to
    /// derive the dedup key. `None` disables deduplication.
    pub dedup_expr: Option<String>,
    pub dedup_scope: DedupScope,
    pub max_attempts: i64,
    pub retention_days: i64,
}

/// Optional per-item overrides for `enqueue`.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnqueueOptions {
    /// Overrides the queue's max_attempts for this item.
    pub max_attempts: Option<i64>,
    pub priority: i64,
}

/// Accessor for the durable work queue.
pub struct Queue<'a> {
    store: &'a Store,
}

impl<'a> Queue<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Create or replace a queue definition.
    pub fn define(&self, def: &QueueDef) -> Result<()> {
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO queue_defs (id, name, dedup_expr, dedup_scope, max_attempts, retention_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name,
                dedup_expr = excluded.dedup_expr,
                dedup_scope = excluded.dedup_scope,
                max_attempts = excluded.max_attempts,
                retention_days = excluded.retention_days",
            rusqlite::params![
                def.id,
                def.name,
                def.dedup_expr,
                def.dedup_scope.to_string(),
                def.max_attempts,
                def.retention_days,
            ],
        )?;
        info!(queue = %def.id, "queue defined");
        Ok(())
    }

    /// Fetch a queue definition.
    pub fn get_def(&self, queue_id: &str) -> Result<Option<QueueDef>> {
        let conn = self.store.conn();
        match conn.query_row(
            "SELECT id, name, dedup_expr, dedup_scope, max_attempts, retention_days
             FROM queue_defs WHERE id = ?1",
            [queue_id],
            |row| {
                let scope: String = row.get(3)?;
                Ok(QueueDef {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    dedup_expr: row.get(2)?,
                    dedup_scope: scope.parse().map_err(|e: String| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            e.into(),
                        )
                    })?,
                    max_attempts: row.get(4)?,
                    retention_days: row.get(5)?,
                })
            },
        ) {
            Ok(def) => Ok(Some(def)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert a pending item, or return [`ENQUEUE_SKIPPED`] when the queue's
    /// dedup expression finds a live duplicate.
    ///
    /// An undefined queue id is allowed and behaves as max_attempts = 1, no
    /// deduplication, default retention.
    pub fn enqueue(&self, queue_id: &str, payload: &Value, opts: EnqueueOptions) -> Result<i64> {
        let def = self.get_def(queue_id)?;

        let dedup_key = def
            .as_ref()
            .and_then(|d| d.dedup_expr.as_deref())
            .and_then(|expr| dedup_key_for(expr, payload));

        let conn = self.store.conn();

        if let (Some(key), Some(def)) = (&dedup_key, &def) {
            let sql = format!(
                "SELECT COUNT(*) FROM queue_items
                 WHERE queue_id = ?1 AND dedup_key = ?2 AND status IN {}",
                def.dedup_scope.statuses()
            );
            let duplicates: i64 =
                conn.query_row(&sql, rusqlite::params![queue_id, key], |row| row.get(0))?;
            if duplicates > 0 {
                debug!(queue = %queue_id, dedup_key = %key, "enqueue skipped: duplicate");
                return Ok(ENQUEUE_SKIPPED);
            }
        }

        let max_attempts = opts
            .max_attempts
            .or(def.as_ref().map(|d| d.max_attempts))
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        conn.execute(
            "INSERT INTO queue_items
             (queue_id, payload, status, priority, attempts, max_attempts, dedup_key, created_at)
             VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?5, ?6)",
            rusqlite::params![
                queue_id,
                serde_json::to_string(payload)?,
                opts.priority,
                max_attempts,
                dedup_key,
                now_ms(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Claim up to `count` pending items, atomically moving them to
    /// `processing` and incrementing their attempt counter.
    ///
    /// The SELECT and the per-row UPDATEs run under one transaction, so two
    /// concurrent callers never receive overlapping id sets.
    pub fn dequeue(&self, queue_id: &str, count: usize) -> Result<Vec<(i64, Value)>> {
        let mut conn = self.store.conn();
        let now = now_ms();

        let claimed: Vec<(i64, String)> = {
            let tx = conn.transaction()?;
            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT id, payload FROM queue_items
                     WHERE queue_id = ?1 AND status = 'pending'
                     ORDER BY priority DESC, created_at ASC, id ASC
                     LIMIT ?2",
                )?;
                let mapped = stmt
                    .query_map(rusqlite::params![queue_id, count as i64], |row| {
                        Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                mapped
            };
            for (id, _) in &rows {
                tx.execute(
                    "UPDATE queue_items
                     SET status = 'processing', claimed_at = ?1, attempts = attempts + 1
                     WHERE id = ?2",
                    rusqlite::params![now, id],
                )?;
            }
            tx.commit()?;
            rows
        };

        claimed
            .into_iter()
            .map(|(id, payload)| Ok((id, serde_json::from_str(&payload)?)))
            .collect()
    }

    /// Mark an item as successfully processed.
    pub fn done(&self, item_id: i64) -> Result<()> {
        let conn = self.store.conn();
        conn.execute(
            "UPDATE queue_items SET status = 'done', finished_at = ?1 WHERE id = ?2",
            rusqlite::params![now_ms(), item_id],
        )?;
        Ok(())
    }

    /// Record a processing failure: either release the item back to
    /// `pending` for another claim, or dead-letter it once the attempt
    /// budget is spent. A missing item is a no-op.
    pub fn fail(&self, item_id: i64, error: &str) -> Result<()> {
        let conn = self.store.conn();
        let counters: Option<(i64, i64)> = match conn.query_row(
            "SELECT attempts, max_attempts FROM queue_items WHERE id = ?1",
            [item_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(pair) => Some(pair),
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => return Err(e.into()),
        };
        let Some((attempts, max_attempts)) = counters else {
            return Ok(());
        };

        if attempts < max_attempts {
            conn.execute(
                "UPDATE queue_items SET status = 'pending', error = ?1 WHERE id = ?2",
                rusqlite::params![error, item_id],
            )?;
            debug!(item_id, attempts, max_attempts, "queue item released for retry");
        } else {
            conn.execute(
                "UPDATE queue_items SET status = 'failed', finished_at = ?1, error = ?2
                 WHERE id = ?3",
                rusqlite::params![now_ms(), error, item_id],
            )?;
            info!(item_id, attempts, "queue item dead-lettered");
        }
        Ok(())
    }

    /// Current status of an item, if it exists.
    pub fn item_status(&self, item_id: i64) -> Result<Option<String>> {
        let conn = self.store.conn();
        match conn.query_row(
            "SELECT status FROM queue_items WHERE id = ?1",
            [item_id],
            |row| row.get(0),
        ) {
            Ok(status) => Ok(Some(status)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Retention sweep: delete done/failed items whose `finished_at` is
    /// older than the owning queue's retention (or `default_days` for
    /// undefined queues).
    pub fn delete_finished(&self, now: i64, default_days: i64) -> Result<usize> {
        let conn = self.store.conn();
        Ok(conn.execute(
            "DELETE FROM queue_items
             WHERE status IN ('done', 'failed')
               AND finished_at IS NOT NULL
               AND finished_at < ?1 - COALESCE(
                     (SELECT retention_days FROM queue_defs d WHERE d.id = queue_items.queue_id),
                     ?2
                   ) * ?3",
            rusqlite::params![now, default_days, MS_PER_DAY],
        )?)
    }
}

/// Evaluate a dedup path expression against a payload.
///
/// `$.a.b` addresses nested object fields; the matched value is stringified
/// (strings verbatim, everything else as compact JSON). No match yields no
/// dedup key, which disables deduplication for that item.
fn dedup_key_for(expr: &str, payload: &Value) -> Option<String> {
    let mut pointer = String::new();
    for segment in expr
        .trim()
        .trim_start_matches('$')
        .split('.')
        .filter(|s| !s.is_empty())
    {
        pointer.push('/');
        pointer.push_str(segment);
    }
    payload.pointer(&pointer).map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}
