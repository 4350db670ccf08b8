//! Historical value tracking
//!
//! Append-only: snapshots are written when an account's value changes and
//! are never updated or individually deleted afterwards (they only go away
//! when their account is deleted). The repository records snapshots inside
//! the same transaction as the value change, via [`record_snapshot_tx`].

use crate::{
    models::{ChangeReason, Snapshot},
    security::MasterKey,
    Database, Result,
};
use rusqlite::{params, Transaction};
use uuid::Uuid;

/// Read and append access to account value history
pub struct SnapshotStore<'a> {
    db: &'a Database,
}

impl<'a> SnapshotStore<'a> {
    /// Create snapshot store
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Append a snapshot outside of a repository write.
    ///
    /// The repository's own writes use the transaction-scoped variant so the
    /// snapshot commits or rolls back together with the value change.
    pub fn record_snapshot(
        &self,
        account_id: &str,
        value: f64,
        reason: ChangeReason,
        metadata: Option<&serde_json::Value>,
    ) -> Result<String> {
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;
        let id = record_snapshot_tx(&tx, self.db.master_key(), account_id, value, reason, metadata)?;
        tx.commit()?;
        Ok(id)
    }

    /// Snapshots for an account, ascending by capture time.
    ///
    /// `from`/`to` are inclusive unix-second bounds. Ties on timestamp keep
    /// insertion order, so back-to-back updates read back in write order.
    pub fn get_history(
        &self,
        account_id: &str,
        from: Option<i64>,
        to: Option<i64>,
    ) -> Result<Vec<Snapshot>> {
        let conn = self.db.conn();

        let mut sql = String::from(
            "SELECT id, account_id, timestamp, value, change_type, encrypted_metadata
             FROM historical_snapshots WHERE account_id = ?1",
        );
        let mut bounds: Vec<i64> = Vec::new();
        if let Some(from) = from {
            bounds.push(from);
            sql.push_str(&format!(" AND timestamp >= ?{}", bounds.len() + 1));
        }
        if let Some(to) = to {
            bounds.push(to);
            sql.push_str(&format!(" AND timestamp <= ?{}", bounds.len() + 1));
        }
        sql.push_str(" ORDER BY timestamp ASC, rowid ASC");

        let mut stmt = conn.prepare(&sql)?;
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&account_id];
        for bound in &bounds {
            params_vec.push(bound);
        }

        let rows = stmt.query_map(params_vec.as_slice(), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<Vec<u8>>>(5)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (id, account_id, timestamp, value, change_type, encrypted_metadata) = row?;
            let reason = ChangeReason::from_str(&change_type)?;

            // Metadata is contextual; a blob that no longer authenticates
            // degrades to None rather than hiding the value itself.
            let metadata = match encrypted_metadata {
                Some(blob) => match self.db.master_key().decrypt(&blob) {
                    Ok(plaintext) => serde_json::from_slice(&plaintext).ok(),
                    Err(_) => {
                        tracing::warn!(snapshot_id = %id, "Skipping undecryptable snapshot metadata");
                        None
                    }
                },
                None => None,
            };

            snapshots.push(Snapshot {
                id,
                account_id,
                timestamp,
                value,
                reason,
                metadata,
            });
        }

        Ok(snapshots)
    }
}

/// Append a snapshot within an enclosing transaction.
pub(crate) fn record_snapshot_tx(
    tx: &Transaction<'_>,
    master_key: &MasterKey,
    account_id: &str,
    value: f64,
    reason: ChangeReason,
    metadata: Option<&serde_json::Value>,
) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    let timestamp = chrono::Utc::now().timestamp();

    let encrypted_metadata = match metadata {
        Some(value) => Some(master_key.encrypt(&serde_json::to_vec(value)?)?),
        None => None,
    };

    tx.execute(
        "INSERT INTO historical_snapshots (id, account_id, timestamp, value, change_type, encrypted_metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![id, account_id, timestamp, value, reason.as_str(), encrypted_metadata],
    )?;

    Ok(id)
}
