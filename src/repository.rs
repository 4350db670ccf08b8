//! Data access layer
//!
//! The repository composes key derivation and field encryption so callers
//! only ever see decrypted [`AccountRecord`]s: payloads are encrypted on
//! every write and decrypted on every read. Each logical operation takes the
//! connection lock once and runs inside one transaction, so a value change
//! and its history snapshot commit or roll back together.

use crate::{
    database,
    history::record_snapshot_tx,
    migrations,
    models::{
        AccountFilter, AccountPayload, AccountRecord, AccountUpdate, ChangeReason, NewAccount,
        StockPosition, TradingDetails, VALUE_CHANGE_THRESHOLD,
    },
    Database, Error, Result,
};
use chrono::NaiveDate;
use rusqlite::{params, OptionalExtension, Transaction};
use uuid::Uuid;

/// Settings keys reserved for the unlock flow; not writable through
/// [`Repository::set_setting`]
const RESERVED_SETTINGS: &[&str] = &["kdf_salt", "kdf_iterations", "key_check"];

/// Partial update to a stock position; `None` fields keep their value
#[derive(Debug, Clone, Default)]
pub struct PositionUpdate {
    /// New share quantity
    pub shares: Option<f64>,
    /// New purchase price
    pub purchase_price: Option<f64>,
    /// New purchase date
    pub purchase_date: Option<NaiveDate>,
    /// New market price
    pub current_price: Option<f64>,
}

/// Repository for account, position, and settings operations
pub struct Repository<'a> {
    db: &'a Database,
}

impl<'a> Repository<'a> {
    /// Create repository
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Create a new account and record its initial value snapshot.
    pub fn create_account(&self, account: NewAccount) -> Result<String> {
        if account.name.trim().is_empty() {
            return Err(Error::Validation("Account name cannot be empty".to_string()));
        }
        if account.institution.trim().is_empty() {
            return Err(Error::Validation("Institution cannot be empty".to_string()));
        }
        account.payload.validate()?;

        let id = account
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = chrono::Utc::now().timestamp();
        let kind = account.payload.kind();
        let value = account.payload.current_value();
        let encrypted_data = self.db.master_key().encrypt(&account.payload.to_bytes()?)?;
        let metadata = snapshot_metadata(&account.name, kind.as_str(), &account.institution);

        database::with_busy_retry(|| {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            let exists: Option<String> = tx
                .query_row("SELECT id FROM accounts WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(Error::Validation(format!("Account {} already exists", id)));
            }

            tx.execute(
                "INSERT INTO accounts (id, name, institution, type, encrypted_data,
                                       created_date, last_updated, schema_version, is_demo)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    id,
                    account.name,
                    account.institution,
                    kind.as_str(),
                    encrypted_data,
                    now,
                    now,
                    migrations::SCHEMA_VERSION,
                    account.is_demo,
                ],
            )?;

            sync_positions_tx(&tx, &id, &account.payload)?;
            record_snapshot_tx(
                &tx,
                self.db.master_key(),
                &id,
                value,
                ChangeReason::InitialEntry,
                Some(&metadata),
            )?;

            tx.commit()?;
            Ok(id.clone())
        })
    }

    /// Fetch one account by id.
    ///
    /// Unlike listings, a direct fetch surfaces decode failures: the caller
    /// named this record and needs to know it is unreadable.
    pub fn get_account(&self, id: &str) -> Result<AccountRecord> {
        let conn = self.db.conn();
        let row = conn
            .query_row(
                "SELECT id, name, institution, type, encrypted_data,
                        created_date, last_updated, schema_version, is_demo
                 FROM accounts WHERE id = ?1",
                params![id],
                |row| RawAccountRow::from_row(row),
            )
            .optional()?
            .ok_or_else(|| Error::NotFound(format!("Account {}", id)))?;
        drop(conn);

        self.decode_account(row)
    }

    /// List accounts, optionally filtered by kind and/or demo flag.
    ///
    /// A row whose payload fails to authenticate or deserialize is skipped
    /// with a warning; one corrupt record never hides the rest of the
    /// portfolio.
    pub fn get_accounts(&self, filter: &AccountFilter) -> Result<Vec<AccountRecord>> {
        let rows = {
            let conn = self.db.conn();

            let mut sql = String::from(
                "SELECT id, name, institution, type, encrypted_data,
                        created_date, last_updated, schema_version, is_demo
                 FROM accounts",
            );
            let mut clauses: Vec<String> = Vec::new();
            let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

            if let Some(kind) = filter.kind {
                args.push(Box::new(kind.as_str().to_string()));
                clauses.push(format!("type = ?{}", args.len()));
            }
            if let Some(is_demo) = filter.is_demo {
                args.push(Box::new(is_demo));
                clauses.push(format!("is_demo = ?{}", args.len()));
            }
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY name");

            let mut stmt = conn.prepare(&sql)?;
            let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|a| a.as_ref()).collect();
            let mapped = stmt.query_map(params_ref.as_slice(), |row| RawAccountRow::from_row(row))?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match self.decode_account(row) {
                Ok(account) => accounts.push(account),
                Err(e) => {
                    tracing::warn!(account_id = %id, error = %e, "Skipping unreadable account record");
                }
            }
        }

        Ok(accounts)
    }

    /// Apply a partial update; appends a `ManualUpdate` snapshot in the same
    /// transaction when the account's value moves.
    pub fn update_account(&self, id: &str, changes: AccountUpdate) -> Result<()> {
        let existing = self.get_account(id)?;
        let old_value = existing.payload.current_value();

        let name = changes.name.unwrap_or(existing.name);
        let institution = changes.institution.unwrap_or(existing.institution);
        let is_demo = changes.is_demo.unwrap_or(existing.is_demo);
        let payload = changes.payload.unwrap_or(existing.payload);

        if name.trim().is_empty() {
            return Err(Error::Validation("Account name cannot be empty".to_string()));
        }
        if institution.trim().is_empty() {
            return Err(Error::Validation("Institution cannot be empty".to_string()));
        }
        payload.validate()?;

        self.write_account(
            id,
            &name,
            &institution,
            is_demo,
            &payload,
            old_value,
            ChangeReason::ManualUpdate,
        )
    }

    /// Delete an account and everything it owns. Idempotent: deleting an
    /// absent id succeeds quietly.
    pub fn delete_account(&self, id: &str) -> Result<()> {
        database::with_busy_retry(|| {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            tx.execute(
                "DELETE FROM historical_snapshots WHERE account_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM stock_positions WHERE trading_account_id = ?1",
                params![id],
            )?;
            let deleted = tx.execute("DELETE FROM accounts WHERE id = ?1", params![id])?;

            tx.commit()?;
            if deleted > 0 {
                tracing::info!(account_id = %id, "Deleted account");
            }
            Ok(())
        })
    }

    /// Remove every demo-flagged account, cascading to positions and
    /// snapshots. Returns the number of accounts removed.
    pub fn delete_demo_accounts(&self) -> Result<usize> {
        database::with_busy_retry(|| {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            let demo_ids: Vec<String> = {
                let mut stmt = tx.prepare("SELECT id FROM accounts WHERE is_demo = 1")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };

            if demo_ids.is_empty() {
                return Ok(0);
            }

            let placeholders = std::iter::repeat("?")
                .take(demo_ids.len())
                .collect::<Vec<_>>()
                .join(",");
            tx.execute(
                &format!(
                    "DELETE FROM historical_snapshots WHERE account_id IN ({})",
                    placeholders
                ),
                rusqlite::params_from_iter(demo_ids.iter()),
            )?;
            tx.execute(
                &format!(
                    "DELETE FROM stock_positions WHERE trading_account_id IN ({})",
                    placeholders
                ),
                rusqlite::params_from_iter(demo_ids.iter()),
            )?;
            let deleted = tx.execute("DELETE FROM accounts WHERE is_demo = 1", [])?;

            tx.commit()?;
            tracing::info!(count = deleted, "Deleted demo accounts");
            Ok(deleted)
        })
    }

    /// Positions owned by a trading account
    pub fn get_positions(&self, account_id: &str) -> Result<Vec<StockPosition>> {
        let details = self.trading_details(account_id)?;
        Ok(details.positions)
    }

    /// Add a position to a trading account. A uuid is assigned when the
    /// caller leaves `position.id` empty.
    pub fn add_position(&self, account_id: &str, mut position: StockPosition) -> Result<String> {
        position.symbol = position.symbol.trim().to_uppercase();
        position.validate()?;
        if position.id.is_empty() {
            position.id = Uuid::new_v4().to_string();
        }

        let mut details = self.trading_details(account_id)?;
        if details.positions.iter().any(|p| p.id == position.id) {
            return Err(Error::Validation(format!(
                "Position {} already exists",
                position.id
            )));
        }

        let position_id = position.id.clone();
        details.positions.push(position);
        self.write_trading_details(account_id, details, ChangeReason::ManualUpdate)?;
        Ok(position_id)
    }

    /// Update fields of an existing position
    pub fn update_position(
        &self,
        account_id: &str,
        position_id: &str,
        changes: PositionUpdate,
    ) -> Result<()> {
        let mut details = self.trading_details(account_id)?;
        let position = details
            .positions
            .iter_mut()
            .find(|p| p.id == position_id)
            .ok_or_else(|| Error::NotFound(format!("Position {}", position_id)))?;

        if let Some(shares) = changes.shares {
            position.shares = shares;
        }
        if let Some(price) = changes.purchase_price {
            position.purchase_price = price;
        }
        if let Some(date) = changes.purchase_date {
            position.purchase_date = date;
        }
        if let Some(price) = changes.current_price {
            position.current_price = Some(price);
            position.last_price_update = Some(chrono::Utc::now().timestamp());
        }
        position.validate()?;

        self.write_trading_details(account_id, details, ChangeReason::ManualUpdate)
    }

    /// Remove a position from a trading account
    pub fn remove_position(&self, account_id: &str, position_id: &str) -> Result<()> {
        let mut details = self.trading_details(account_id)?;
        let before = details.positions.len();
        details.positions.retain(|p| p.id != position_id);
        if details.positions.len() == before {
            return Err(Error::NotFound(format!("Position {}", position_id)));
        }

        self.write_trading_details(account_id, details, ChangeReason::ManualUpdate)
    }

    /// Record a fresh market price for every position with the given symbol.
    ///
    /// Appends a `PriceRefresh` snapshot when the account value moves.
    pub fn update_position_price(&self, account_id: &str, symbol: &str, price: f64) -> Result<()> {
        if price < 0.0 {
            return Err(Error::Validation("Price cannot be negative".to_string()));
        }

        let symbol = symbol.trim().to_uppercase();
        let mut details = self.trading_details(account_id)?;
        let now = chrono::Utc::now().timestamp();

        let mut touched = false;
        for position in details.positions.iter_mut() {
            if position.symbol == symbol {
                position.current_price = Some(price);
                position.last_price_update = Some(now);
                touched = true;
            }
        }
        if !touched {
            return Err(Error::NotFound(format!(
                "No position for symbol {} in account {}",
                symbol, account_id
            )));
        }

        self.write_trading_details(account_id, details, ChangeReason::PriceRefresh)
    }

    /// Store an encrypted application setting
    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        if RESERVED_SETTINGS.contains(&key) {
            return Err(Error::Validation(format!("Setting key {} is reserved", key)));
        }

        let encrypted_value = self.db.master_key().encrypt(value.as_bytes())?;
        let conn = self.db.conn();
        conn.execute(
            "INSERT INTO app_settings (key, encrypted_value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET encrypted_value = excluded.encrypted_value",
            params![key, encrypted_value],
        )?;
        Ok(())
    }

    /// Read and decrypt an application setting
    pub fn get_setting(&self, key: &str) -> Result<String> {
        let conn = self.db.conn();
        let encrypted: Option<Vec<u8>> = conn
            .query_row(
                "SELECT encrypted_value FROM app_settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        drop(conn);

        let encrypted =
            encrypted.ok_or_else(|| Error::NotFound(format!("Setting '{}'", key)))?;
        let plaintext = self.db.master_key().decrypt(&encrypted)?;
        String::from_utf8(plaintext)
            .map_err(|_| Error::Encryption("Setting is not valid UTF-8".to_string()))
    }

    fn decode_account(&self, row: RawAccountRow) -> Result<AccountRecord> {
        let kind = crate::models::AccountKind::from_str(&row.kind)?;
        let plaintext = self.db.master_key().decrypt(&row.encrypted_data)?;
        let payload = AccountPayload::from_bytes(&plaintext, kind)?;

        Ok(AccountRecord {
            id: row.id,
            name: row.name,
            institution: row.institution,
            kind,
            created_at: row.created_at,
            last_updated: row.last_updated,
            is_demo: row.is_demo,
            schema_version: row.schema_version,
            payload,
        })
    }

    fn trading_details(&self, account_id: &str) -> Result<TradingDetails> {
        let account = self.get_account(account_id)?;
        match account.payload {
            AccountPayload::Trading(details) => Ok(details),
            other => Err(Error::Validation(format!(
                "Account {} is {}, not a trading account",
                account_id,
                other.kind().as_str()
            ))),
        }
    }

    fn write_trading_details(
        &self,
        account_id: &str,
        details: TradingDetails,
        reason: ChangeReason,
    ) -> Result<()> {
        let existing = self.get_account(account_id)?;
        let old_value = existing.payload.current_value();
        let payload = AccountPayload::Trading(details);
        payload.validate()?;

        self.write_account(
            account_id,
            &existing.name,
            &existing.institution,
            existing.is_demo,
            &payload,
            old_value,
            reason,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn write_account(
        &self,
        id: &str,
        name: &str,
        institution: &str,
        is_demo: bool,
        payload: &AccountPayload,
        old_value: f64,
        reason: ChangeReason,
    ) -> Result<()> {
        let kind = payload.kind();
        let now = chrono::Utc::now().timestamp();
        let new_value = payload.current_value();
        let encrypted_data = self.db.master_key().encrypt(&payload.to_bytes()?)?;
        let metadata = snapshot_metadata(name, kind.as_str(), institution);

        database::with_busy_retry(|| {
            let mut conn = self.db.conn();
            let tx = conn.transaction()?;

            let updated = tx.execute(
                "UPDATE accounts
                 SET name = ?1, institution = ?2, type = ?3, encrypted_data = ?4,
                     last_updated = ?5, is_demo = ?6, schema_version = ?7
                 WHERE id = ?8",
                params![
                    name,
                    institution,
                    kind.as_str(),
                    encrypted_data,
                    now,
                    is_demo,
                    migrations::SCHEMA_VERSION,
                    id,
                ],
            )?;
            if updated == 0 {
                return Err(Error::NotFound(format!("Account {}", id)));
            }

            sync_positions_tx(&tx, id, payload)?;

            if (new_value - old_value).abs() >= VALUE_CHANGE_THRESHOLD {
                record_snapshot_tx(
                    &tx,
                    self.db.master_key(),
                    id,
                    new_value,
                    reason,
                    Some(&metadata),
                )?;
            }

            tx.commit()?;
            Ok(())
        })
    }
}

/// Plaintext columns of one accounts row, before payload decryption
struct RawAccountRow {
    id: String,
    name: String,
    institution: String,
    kind: String,
    encrypted_data: Vec<u8>,
    created_at: i64,
    last_updated: i64,
    schema_version: i32,
    is_demo: bool,
}

impl RawAccountRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            institution: row.get(2)?,
            kind: row.get(3)?,
            encrypted_data: row.get(4)?,
            created_at: row.get(5)?,
            last_updated: row.get(6)?,
            schema_version: row.get(7)?,
            is_demo: row.get(8)?,
        })
    }
}

/// Rebuild the stock_positions projection for an account.
///
/// The encrypted trading payload is authoritative; the table mirrors it with
/// plaintext-indexable columns and is rewritten on every account write.
pub(crate) fn sync_positions_tx(
    tx: &Transaction<'_>,
    account_id: &str,
    payload: &AccountPayload,
) -> Result<()> {
    tx.execute(
        "DELETE FROM stock_positions WHERE trading_account_id = ?1",
        params![account_id],
    )?;

    if let AccountPayload::Trading(details) = payload {
        for position in &details.positions {
            tx.execute(
                "INSERT INTO stock_positions
                     (id, trading_account_id, symbol, shares, purchase_price,
                      purchase_date, current_price, last_price_update)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    position.id,
                    account_id,
                    position.symbol,
                    position.shares,
                    position.purchase_price,
                    position.purchase_date.to_string(),
                    position.current_price,
                    position.last_price_update,
                ],
            )?;
        }
    }

    Ok(())
}

fn snapshot_metadata(name: &str, kind: &str, institution: &str) -> serde_json::Value {
    serde_json::json!({
        "account_name": name,
        "account_type": kind,
        "institution": institution,
    })
}
