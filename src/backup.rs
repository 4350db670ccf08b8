//! Encrypted backup export and import
//!
//! A backup is one JSON document (accounts with decrypted payloads, their
//! snapshot history, and the watchlist) sealed as a single AEAD frame under
//! the session key. Import validates record-by-record: malformed or
//! duplicate entries are skipped and counted, never fatal to the rest of
//! the restore.

use crate::{
    history::record_snapshot_tx,
    migrations,
    models::{AccountFilter, AccountPayload, ChangeReason},
    repository::sync_positions_tx,
    watchlist::{WatchlistDetails, WatchlistStorage},
    Database, Error, Repository, Result, SnapshotStore,
};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Backup document format version
pub const BACKUP_FORMAT_VERSION: u32 = 1;

/// How to treat records that already exist locally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Keep existing records; skip incoming duplicates
    Merge,
    /// Clear accounts, snapshots, and watchlist before importing
    Replace,
}

/// Outcome counters for an import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Accounts written
    pub accounts_imported: usize,
    /// Accounts skipped (duplicate id or failed validation)
    pub accounts_skipped: usize,
    /// Stock positions written (within imported trading accounts)
    pub positions_imported: usize,
    /// History snapshots written
    pub snapshots_imported: usize,
    /// Watchlist entries written
    pub watchlist_imported: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupMetadata {
    backup_id: String,
    exported_at: i64,
    format_version: u32,
    accounts_count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupSnapshot {
    timestamp: i64,
    value: f64,
    change_type: String,
    metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupAccount {
    id: String,
    name: String,
    institution: String,
    created_date: i64,
    last_updated: i64,
    is_demo: bool,
    payload: AccountPayload,
    #[serde(default)]
    snapshots: Vec<BackupSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupWatchlistEntry {
    symbol: String,
    details: WatchlistDetails,
    added_date: i64,
    last_price_update: Option<i64>,
    is_demo: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct BackupDocument {
    backup_metadata: BackupMetadata,
    accounts: Vec<BackupAccount>,
    #[serde(default)]
    watchlist: Vec<BackupWatchlistEntry>,
}

/// Export and import of encrypted backups
pub struct BackupEngine<'a> {
    db: &'a Database,
}

impl<'a> BackupEngine<'a> {
    /// Create backup engine
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Export every account (with history) and the watchlist as one
    /// encrypted blob.
    pub fn export_all(&self) -> Result<Vec<u8>> {
        let repository = Repository::new(self.db);
        let snapshots = SnapshotStore::new(self.db);
        let watchlist = WatchlistStorage::new(self.db);

        let accounts = repository.get_accounts(&AccountFilter::default())?;
        let mut backup_accounts = Vec::with_capacity(accounts.len());
        for account in accounts {
            let history = snapshots
                .get_history(&account.id, None, None)?
                .into_iter()
                .map(|s| BackupSnapshot {
                    timestamp: s.timestamp,
                    value: s.value,
                    change_type: s.reason.as_str().to_string(),
                    metadata: s.metadata,
                })
                .collect();

            backup_accounts.push(BackupAccount {
                id: account.id,
                name: account.name,
                institution: account.institution,
                created_date: account.created_at,
                last_updated: account.last_updated,
                is_demo: account.is_demo,
                payload: account.payload,
                snapshots: history,
            });
        }

        let watchlist_entries = watchlist
            .get_items(true)?
            .into_iter()
            .map(|item| BackupWatchlistEntry {
                symbol: item.symbol,
                details: item.details,
                added_date: item.added_date,
                last_price_update: item.last_price_update,
                is_demo: item.is_demo,
            })
            .collect::<Vec<_>>();

        let document = BackupDocument {
            backup_metadata: BackupMetadata {
                backup_id: Uuid::new_v4().to_string(),
                exported_at: chrono::Utc::now().timestamp(),
                format_version: BACKUP_FORMAT_VERSION,
                accounts_count: backup_accounts.len(),
            },
            accounts: backup_accounts,
            watchlist: watchlist_entries,
        };

        let json = serde_json::to_vec(&document)?;
        let blob = self.db.master_key().encrypt(&json)?;
        tracing::info!(
            accounts = document.backup_metadata.accounts_count,
            "Exported encrypted backup"
        );
        Ok(blob)
    }

    /// Restore a backup produced by [`BackupEngine::export_all`].
    ///
    /// The whole import is one transaction; individual bad records are
    /// skipped and counted rather than aborting it.
    pub fn import_all(&self, blob: &[u8], mode: ImportMode) -> Result<ImportStats> {
        let json = self.db.master_key().decrypt(blob)?;
        let document: BackupDocument = serde_json::from_slice(&json)
            .map_err(|e| Error::Validation(format!("Backup document is malformed: {}", e)))?;

        if document.backup_metadata.format_version > BACKUP_FORMAT_VERSION {
            return Err(Error::Validation(format!(
                "Backup format version {} is newer than supported version {}",
                document.backup_metadata.format_version, BACKUP_FORMAT_VERSION
            )));
        }

        let mut stats = ImportStats::default();
        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        if mode == ImportMode::Replace {
            tx.execute("DELETE FROM historical_snapshots", [])?;
            tx.execute("DELETE FROM stock_positions", [])?;
            tx.execute("DELETE FROM accounts", [])?;
            tx.execute("DELETE FROM watchlist", [])?;
        }

        for account in &document.accounts {
            match self.import_account(&tx, account) {
                Ok(Some((positions, snapshots))) => {
                    stats.accounts_imported += 1;
                    stats.positions_imported += positions;
                    stats.snapshots_imported += snapshots;
                }
                Ok(None) => stats.accounts_skipped += 1,
                Err(e) => {
                    tracing::warn!(account_id = %account.id, error = %e, "Skipping account in backup");
                    stats.accounts_skipped += 1;
                }
            }
        }

        for entry in &document.watchlist {
            match self.import_watchlist_entry(&tx, entry) {
                Ok(true) => stats.watchlist_imported += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(symbol = %entry.symbol, error = %e, "Skipping watchlist entry in backup");
                }
            }
        }

        tx.commit()?;
        tracing::info!(
            imported = stats.accounts_imported,
            skipped = stats.accounts_skipped,
            "Backup import finished"
        );
        Ok(stats)
    }

    /// Import one account; `Ok(None)` means a duplicate was skipped.
    fn import_account(
        &self,
        tx: &rusqlite::Transaction<'_>,
        account: &BackupAccount,
    ) -> Result<Option<(usize, usize)>> {
        if account.id.trim().is_empty() || account.name.trim().is_empty() {
            return Err(Error::Validation("Account is missing id or name".to_string()));
        }
        account.payload.validate()?;

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM accounts WHERE id = ?1",
                params![account.id],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(None);
        }

        let encrypted_data = self.db.master_key().encrypt(&account.payload.to_bytes()?)?;
        tx.execute(
            "INSERT INTO accounts (id, name, institution, type, encrypted_data,
                                   created_date, last_updated, schema_version, is_demo)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                account.id,
                account.name,
                account.institution,
                account.payload.kind().as_str(),
                encrypted_data,
                account.created_date,
                account.last_updated,
                migrations::SCHEMA_VERSION,
                account.is_demo,
            ],
        )?;

        sync_positions_tx(tx, &account.id, &account.payload)?;
        let positions = match &account.payload {
            AccountPayload::Trading(details) => details.positions.len(),
            _ => 0,
        };

        let mut snapshots = 0;
        for snapshot in &account.snapshots {
            let reason = match ChangeReason::from_str(&snapshot.change_type) {
                Ok(reason) => reason,
                Err(_) => {
                    tracing::warn!(
                        account_id = %account.id,
                        change_type = %snapshot.change_type,
                        "Skipping snapshot with unknown change type"
                    );
                    continue;
                }
            };

            let encrypted_metadata = match &snapshot.metadata {
                Some(value) => Some(self.db.master_key().encrypt(&serde_json::to_vec(value)?)?),
                None => None,
            };
            tx.execute(
                "INSERT INTO historical_snapshots
                     (id, account_id, timestamp, value, change_type, encrypted_metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::new_v4().to_string(),
                    account.id,
                    snapshot.timestamp,
                    snapshot.value,
                    reason.as_str(),
                    encrypted_metadata,
                ],
            )?;
            snapshots += 1;
        }

        // A restored account still needs a baseline for trend queries.
        if snapshots == 0 {
            record_snapshot_tx(
                tx,
                self.db.master_key(),
                &account.id,
                account.payload.current_value(),
                ChangeReason::InitialEntry,
                None,
            )?;
            snapshots = 1;
        }

        Ok(Some((positions, snapshots)))
    }

    /// Import one watchlist entry; `Ok(false)` means a duplicate was skipped.
    fn import_watchlist_entry(
        &self,
        tx: &rusqlite::Transaction<'_>,
        entry: &BackupWatchlistEntry,
    ) -> Result<bool> {
        let symbol = entry.symbol.trim().to_uppercase();
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::Validation(format!("Invalid symbol: {}", entry.symbol)));
        }

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM watchlist WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Ok(false);
        }

        let encrypted_data = self.db.master_key().encrypt(&serde_json::to_vec(&entry.details)?)?;
        tx.execute(
            "INSERT INTO watchlist (id, symbol, encrypted_data, added_date, last_price_update, is_demo)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                symbol,
                encrypted_data,
                entry.added_date,
                entry.last_price_update,
                entry.is_demo,
            ],
        )?;
        Ok(true)
    }
}
