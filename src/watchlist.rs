//! Stock watchlist storage
//!
//! Symbols the user tracks without owning. The ticker is a plaintext
//! indexable column; notes and price data live in an encrypted blob.

use crate::{Database, Error, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of tracked symbols
pub const MAX_WATCHLIST_SIZE: usize = 50;

/// Maximum ticker symbol length
pub const MAX_SYMBOL_LENGTH: usize = 10;

/// Encrypted portion of a watchlist entry
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WatchlistDetails {
    /// Free-form user notes
    pub notes: Option<String>,
    /// Price the user is waiting for
    pub target_price: Option<f64>,
    /// Last fetched market price
    pub current_price: Option<f64>,
}

/// One tracked symbol (decrypted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistItem {
    /// Entry ID (uuid string)
    pub id: String,
    /// Ticker symbol (uppercase)
    pub symbol: String,
    /// Encrypted details, decrypted
    pub details: WatchlistDetails,
    /// Unix timestamp the symbol was added
    pub added_date: i64,
    /// Unix timestamp of the last price fetch
    pub last_price_update: Option<i64>,
    /// Sample-data flag
    pub is_demo: bool,
}

/// Watchlist storage operations
pub struct WatchlistStorage<'a> {
    db: &'a Database,
}

impl<'a> WatchlistStorage<'a> {
    /// Create watchlist storage
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Track a new symbol. Rejects duplicates, malformed tickers, and
    /// additions beyond [`MAX_WATCHLIST_SIZE`].
    pub fn add_symbol(&self, symbol: &str, details: WatchlistDetails, is_demo: bool) -> Result<String> {
        let symbol = normalize_symbol(symbol)?;

        let id = Uuid::new_v4().to_string();
        let added_date = chrono::Utc::now().timestamp();
        let encrypted_data = self.db.master_key().encrypt(&serde_json::to_vec(&details)?)?;

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let count: i64 = tx.query_row("SELECT COUNT(*) FROM watchlist", [], |row| row.get(0))?;
        if count as usize >= MAX_WATCHLIST_SIZE {
            return Err(Error::Validation(format!(
                "Watchlist is full ({} symbols)",
                MAX_WATCHLIST_SIZE
            )));
        }

        let exists: Option<String> = tx
            .query_row(
                "SELECT id FROM watchlist WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(Error::Validation(format!("{} is already on the watchlist", symbol)));
        }

        tx.execute(
            "INSERT INTO watchlist (id, symbol, encrypted_data, added_date, last_price_update, is_demo)
             VALUES (?1, ?2, ?3, ?4, NULL, ?5)",
            params![id, symbol, encrypted_data, added_date, is_demo],
        )?;
        tx.commit()?;

        tracing::info!(%symbol, "Added symbol to watchlist");
        Ok(id)
    }

    /// All tracked symbols, ordered by ticker.
    ///
    /// Entries whose blob no longer decrypts are skipped with a warning.
    pub fn get_items(&self, include_demo: bool) -> Result<Vec<WatchlistItem>> {
        let rows = {
            let conn = self.db.conn();
            let sql = if include_demo {
                "SELECT id, symbol, encrypted_data, added_date, last_price_update, is_demo
                 FROM watchlist ORDER BY symbol"
            } else {
                "SELECT id, symbol, encrypted_data, added_date, last_price_update, is_demo
                 FROM watchlist WHERE is_demo = 0 ORDER BY symbol"
            };
            let mut stmt = conn.prepare(sql)?;
            let mapped = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, bool>(5)?,
                ))
            })?;
            mapped.collect::<std::result::Result<Vec<_>, _>>()?
        };

        let mut items = Vec::with_capacity(rows.len());
        for (id, symbol, encrypted_data, added_date, last_price_update, is_demo) in rows {
            let details = match self
                .db
                .master_key()
                .decrypt(&encrypted_data)
                .and_then(|plaintext| Ok(serde_json::from_slice(&plaintext)?))
            {
                Ok(details) => details,
                Err(e) => {
                    tracing::warn!(%symbol, error = %e, "Skipping unreadable watchlist entry");
                    continue;
                }
            };

            items.push(WatchlistItem {
                id,
                symbol,
                details,
                added_date,
                last_price_update,
                is_demo,
            });
        }

        Ok(items)
    }

    /// Stop tracking a symbol
    pub fn remove_symbol(&self, symbol: &str) -> Result<()> {
        let symbol = normalize_symbol(symbol)?;
        let conn = self.db.conn();
        let deleted = conn.execute("DELETE FROM watchlist WHERE symbol = ?1", params![symbol])?;
        if deleted == 0 {
            return Err(Error::NotFound(format!("Watchlist symbol {}", symbol)));
        }
        Ok(())
    }

    /// Record a fresh market price for a tracked symbol
    pub fn update_price(&self, symbol: &str, price: f64) -> Result<()> {
        if price < 0.0 {
            return Err(Error::Validation("Price cannot be negative".to_string()));
        }
        let symbol = normalize_symbol(symbol)?;

        let mut conn = self.db.conn();
        let tx = conn.transaction()?;

        let encrypted: Option<Vec<u8>> = tx
            .query_row(
                "SELECT encrypted_data FROM watchlist WHERE symbol = ?1",
                params![symbol],
                |row| row.get(0),
            )
            .optional()?;
        let encrypted =
            encrypted.ok_or_else(|| Error::NotFound(format!("Watchlist symbol {}", symbol)))?;

        let mut details: WatchlistDetails =
            serde_json::from_slice(&self.db.master_key().decrypt(&encrypted)?)?;
        details.current_price = Some(price);

        let encrypted_data = self.db.master_key().encrypt(&serde_json::to_vec(&details)?)?;
        let now = chrono::Utc::now().timestamp();
        tx.execute(
            "UPDATE watchlist SET encrypted_data = ?1, last_price_update = ?2 WHERE symbol = ?3",
            params![encrypted_data, now, symbol],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Remove every demo-flagged entry; returns the number removed
    pub fn delete_demo_items(&self) -> Result<usize> {
        let conn = self.db.conn();
        let deleted = conn.execute("DELETE FROM watchlist WHERE is_demo = 1", [])?;
        Ok(deleted)
    }
}

fn normalize_symbol(symbol: &str) -> Result<String> {
    let symbol = symbol.trim().to_uppercase();
    if symbol.is_empty() || symbol.len() > MAX_SYMBOL_LENGTH {
        return Err(Error::Validation(format!(
            "Symbol must be 1-{} characters",
            MAX_SYMBOL_LENGTH
        )));
    }
    if !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::Validation(
            "Symbol must be alphanumeric".to_string(),
        ));
    }
    Ok(symbol)
}
