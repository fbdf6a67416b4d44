use jobrun_core::now_ms;

use crate::error::{Result, StoreError};
use crate::store::Store;

const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_HOUR: i64 = 3_600_000;
const MS_PER_DAY: i64 = 86_400_000;

/// Listing order for collection item keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOrder {
    /// Most recently updated first (the default).
    Desc,
    Asc,
}

/// Parse a TTL of the form `<positive integer><d|h|m>` into milliseconds.
pub fn parse_ttl(ttl: &str) -> Result<i64> {
    let (digits, unit) = ttl.split_at(ttl.len().saturating_sub(1));
    let multiplier = match unit {
        "d" => MS_PER_DAY,
        "h" => MS_PER_HOUR,
        "m" => MS_PER_MINUTE,
        _ => return Err(StoreError::InvalidTtl(ttl.to_string())),
    };
    let count: i64 = digits
        .parse()
        .map_err(|_| StoreError::InvalidTtl(ttl.to_string()))?;
    if count <= 0 {
        return Err(StoreError::InvalidTtl(ttl.to_string()));
    }
    Ok(count * multiplier)
}

/// Accessor for the scalar state store and its grouped-items sub-store.
///
/// Scalars are (namespace, key) → optional value with optional absolute
/// expiry. Items hang off a parent state row; the parent is created with a
/// NULL value on first item write.
pub struct State<'a> {
    store: &'a Store,
}

impl<'a> State<'a> {
    pub(crate) fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Return the value iff the row exists and has not expired.
    pub fn get(&self, ns: &str, key: &str) -> Result<Option<String>> {
        let conn = self.store.conn();
        match conn.query_row(
            "SELECT value, expires_at FROM state WHERE ns = ?1 AND key = ?2",
            [ns, key],
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                ))
            },
        ) {
            Ok((value, expires_at)) => {
                if expires_at.is_some_and(|at| at <= now_ms()) {
                    Ok(None)
                } else {
                    Ok(value)
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert a scalar. With a TTL, the absolute expiry is `now + ttl`.
    pub fn set(&self, ns: &str, key: &str, value: Option<&str>, ttl: Option<&str>) -> Result<()> {
        let now = now_ms();
        let expires_at = ttl.map(parse_ttl).transpose()?.map(|ms| now + ms);
        let conn = self.store.conn();
        conn.execute(
            "INSERT INTO state (ns, key, value, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (ns, key) DO UPDATE SET
                value = excluded.value,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at",
            rusqlite::params![ns, key, value, expires_at, now],
        )?;
        Ok(())
    }

    /// Remove a scalar (and, via cascade, its items).
    pub fn delete(&self, ns: &str, key: &str) -> Result<()> {
        let conn = self.store.conn();
        conn.execute("DELETE FROM state WHERE ns = ?1 AND key = ?2", [ns, key])?;
        Ok(())
    }

    /// Expiry sweep: drop rows whose `expires_at` is in the past.
    pub fn delete_expired(&self, now: i64) -> Result<usize> {
        let conn = self.store.conn();
        Ok(conn.execute(
            "DELETE FROM state WHERE expires_at IS NOT NULL AND expires_at < ?1",
            [now],
        )?)
    }

    // --- grouped items ------------------------------------------------------

    pub fn has_item(&self, ns: &str, key: &str, item_key: &str) -> Result<bool> {
        let conn = self.store.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM state_items WHERE ns = ?1 AND key = ?2 AND item_key = ?3",
            [ns, key, item_key],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn get_item(&self, ns: &str, key: &str, item_key: &str) -> Result<Option<String>> {
        let conn = self.store.conn();
        match conn.query_row(
            "SELECT value FROM state_items WHERE ns = ?1 AND key = ?2 AND item_key = ?3",
            [ns, key, item_key],
            |row| row.get::<_, Option<String>>(0),
        ) {
            Ok(value) => Ok(value),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upsert an item, creating the parent state row (value NULL) if needed.
    pub fn set_item(&self, ns: &str, key: &str, item_key: &str, value: Option<&str>) -> Result<()> {
        let now = now_ms();
        let conn = self.store.conn();
        conn.execute(
            "INSERT OR IGNORE INTO state (ns, key, value, expires_at, updated_at)
             VALUES (?1, ?2, NULL, NULL, ?3)",
            rusqlite::params![ns, key, now],
        )?;
        conn.execute(
            "INSERT INTO state_items (ns, key, item_key, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (ns, key, item_key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![ns, key, item_key, value, now],
        )?;
        Ok(())
    }

    pub fn delete_item(&self, ns: &str, key: &str, item_key: &str) -> Result<()> {
        let conn = self.store.conn();
        conn.execute(
            "DELETE FROM state_items WHERE ns = ?1 AND key = ?2 AND item_key = ?3",
            [ns, key, item_key],
        )?;
        Ok(())
    }

    pub fn count_items(&self, ns: &str, key: &str) -> Result<i64> {
        let conn = self.store.conn();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM state_items WHERE ns = ?1 AND key = ?2",
            [ns, key],
            |row| row.get(0),
        )?)
    }

    /// Delete all items for (ns, key) except the `keep` most recently
    /// updated. Returns the number deleted.
    pub fn prune_items(&self, ns: &str, key: &str, keep: usize) -> Result<usize> {
        let conn = self.store.conn();
        Ok(conn.execute(
            "DELETE FROM state_items
             WHERE ns = ?1 AND key = ?2 AND item_key NOT IN (
                 SELECT item_key FROM state_items
                 WHERE ns = ?1 AND key = ?2
                 ORDER BY updated_at DESC, item_key DESC
                 LIMIT ?3
             )",
            rusqlite::params![ns, key, keep as i64],
        )?)
    }

    /// Item keys ordered by `updated_at`; `limit` of `None` returns all.
    pub fn list_item_keys(
        &self,
        ns: &str,
        key: &str,
        limit: Option<usize>,
        order: ItemOrder,
    ) -> Result<Vec<String>> {
        let conn = self.store.conn();
        let sql = match order {
            ItemOrder::Desc => {
                "SELECT item_key FROM state_items WHERE ns = ?1 AND key = ?2
                 ORDER BY updated_at DESC, item_key DESC LIMIT ?3"
            }
            ItemOrder::Asc => {
                "SELECT item_key FROM state_items WHERE ns = ?1 AND key = ?2
                 ORDER BY updated_at ASC, item_key ASC LIMIT ?3"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let limit = limit.map(|n| n as i64).unwrap_or(-1);
        let keys = stmt
            .query_map(rusqlite::params![ns, key, limit], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}
