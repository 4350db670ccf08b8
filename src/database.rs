//! Database connection and unlock flow
//!
//! [`Database`] is the single owner of the SQLite connection and the
//! session's derived key. All reads and writes in the crate go through it;
//! the mutex enforces the one-writer-at-a-time discipline while keeping the
//! lock scope to a single logical operation.

use crate::{
    kdf::{self, KdfParams},
    migrations,
    security::MasterKey,
    Error, Result,
};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Settings key holding the hex-encoded KDF salt
pub(crate) const SETTING_KDF_SALT: &str = "kdf_salt";

/// Settings key holding the PBKDF2 iteration count
pub(crate) const SETTING_KDF_ITERATIONS: &str = "kdf_iterations";

/// Settings key holding the encrypted key-check token
pub(crate) const SETTING_KEY_CHECK: &str = "key_check";

/// Plaintext of the key-check token; decrypting it proves the password
const KEY_CHECK_PLAINTEXT: &[u8] = b"networth-key-check-v1";

/// Delay before the single retry on a locked database
const BUSY_RETRY_DELAY_MS: u64 = 50;

/// Database connection wrapper holding the session key
pub struct Database {
    conn: Mutex<Connection>,
    master_key: MasterKey,
}

impl Database {
    /// Initialize a brand-new encrypted database at `path`.
    ///
    /// Generates the salt (once, for the lifetime of the database), stores
    /// the KDF parameters beside it, and writes the encrypted key-check
    /// token used to verify the password on later unlocks.
    pub fn create<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        let mut conn = open_connection(path.as_ref())?;

        if load_meta(&conn, SETTING_KDF_SALT)?.is_some() {
            return Err(Error::Validation(
                "Database is already initialized; unlock it instead".to_string(),
            ));
        }

        let salt = kdf::generate_salt();
        let kdf_params = KdfParams::default();
        let master_key = MasterKey::from_password(password, &salt, &kdf_params)?;
        let key_check = master_key.encrypt(KEY_CHECK_PLAINTEXT)?;

        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2)",
            params![SETTING_KDF_SALT, hex::encode(salt)],
        )?;
        tx.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2)",
            params![SETTING_KDF_ITERATIONS, kdf_params.iterations.to_string()],
        )?;
        tx.execute(
            "INSERT INTO app_settings (key, encrypted_value) VALUES (?1, ?2)",
            params![SETTING_KEY_CHECK, key_check],
        )?;
        tx.commit()?;

        tracing::info!("Initialized encrypted database");

        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// Open an existing database and verify the master password.
    ///
    /// Runs pending migrations first, then derives the key from the stored
    /// salt and attempts to decrypt the key-check token; failure means a
    /// wrong password (or a database encrypted by someone else entirely).
    pub fn unlock<P: AsRef<Path>>(path: P, password: &str) -> Result<Self> {
        let conn = open_connection(path.as_ref())?;

        let salt_hex = load_meta(&conn, SETTING_KDF_SALT)?.ok_or_else(|| {
            Error::Storage("Database is not initialized; create it first".to_string())
        })?;
        let salt = hex::decode(&salt_hex)
            .map_err(|_| Error::Storage("Stored salt is not valid hex".to_string()))?;

        let iterations = match load_meta(&conn, SETTING_KDF_ITERATIONS)? {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|_| Error::Storage("Stored iteration count is invalid".to_string()))?,
            None => KdfParams::default().iterations,
        };

        let master_key = MasterKey::from_password(password, &salt, &KdfParams { iterations })?;

        let key_check: Vec<u8> = conn
            .query_row(
                "SELECT encrypted_value FROM app_settings WHERE key = ?1",
                params![SETTING_KEY_CHECK],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| Error::Storage("Key-check token is missing".to_string()))?;

        match master_key.decrypt(&key_check) {
            Ok(plaintext) if plaintext == KEY_CHECK_PLAINTEXT => {}
            _ => {
                return Err(Error::Authentication(
                    "Master password is incorrect".to_string(),
                ))
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            master_key,
        })
    }

    /// Whether a database at `path` has completed first-time setup
    pub fn is_initialized<P: AsRef<Path>>(path: P) -> bool {
        if !path.as_ref().exists() {
            return false;
        }

        let conn = match Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        ) {
            Ok(conn) => conn,
            Err(_) => return false,
        };

        matches!(load_meta(&conn, SETTING_KDF_SALT), Ok(Some(_)))
    }

    /// Lock the underlying connection for one logical operation
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    /// Session key for field-level encryption
    pub fn master_key(&self) -> &MasterKey {
        &self.master_key
    }

    /// Re-encrypt the whole database under a key derived from `new_password`.
    ///
    /// The salt is NOT regenerated; only the derived key changes. Every
    /// encrypted column (account payloads, snapshot metadata, watchlist
    /// details, encrypted settings, key-check token) is rewritten inside one
    /// transaction, so a failure leaves the database readable under the old
    /// password. Rows whose ciphertext no longer authenticates are left
    /// untouched and logged; they were unreadable before the change too.
    pub fn change_master_password(&mut self, current: &str, new: &str) -> Result<()> {
        let (salt, kdf_params) = {
            let conn = self.conn.lock();
            let salt_hex = load_meta(&conn, SETTING_KDF_SALT)?
                .ok_or_else(|| Error::Storage("Database is not initialized".to_string()))?;
            let salt = hex::decode(&salt_hex)
                .map_err(|_| Error::Storage("Stored salt is not valid hex".to_string()))?;
            let iterations = match load_meta(&conn, SETTING_KDF_ITERATIONS)? {
                Some(raw) => raw
                    .parse::<u32>()
                    .map_err(|_| Error::Storage("Stored iteration count is invalid".to_string()))?,
                None => KdfParams::default().iterations,
            };
            (salt, KdfParams { iterations })
        };

        let old_key = MasterKey::from_password(current, &salt, &kdf_params)?;
        if old_key.as_bytes() != self.master_key.as_bytes() {
            return Err(Error::Authentication(
                "Current master password is incorrect".to_string(),
            ));
        }

        let new_key = MasterKey::from_password(new, &salt, &kdf_params)?;

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;

            reencrypt_column(&tx, &old_key, &new_key, "accounts", "id", "encrypted_data")?;
            reencrypt_column(
                &tx,
                &old_key,
                &new_key,
                "historical_snapshots",
                "id",
                "encrypted_metadata",
            )?;
            reencrypt_column(&tx, &old_key, &new_key, "watchlist", "id", "encrypted_data")?;
            reencrypt_column(&tx, &old_key, &new_key, "app_settings", "key", "encrypted_value")?;

            tx.commit()?;
        }

        self.master_key = new_key;
        tracing::info!("Master password changed; database re-encrypted");
        Ok(())
    }
}

/// Platform-default database location
pub fn default_db_path() -> Result<PathBuf> {
    let proj = directories::ProjectDirs::from("com.networth", "Networth", "networth-tracker")
        .ok_or_else(|| {
            Error::Storage("Could not determine platform-specific data dir".to_string())
        })?;
    let data_dir = proj.data_dir();
    std::fs::create_dir_all(data_dir)
        .map_err(|e| Error::Storage(format!("Failed to create data dir: {}", e)))?;
    Ok(data_dir.join("networth.sqlite"))
}

fn open_connection(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Cannot create database directory: {}", e)))?;
        }
    }

    let mut conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;

    migrations::run_migrations(&mut conn)?;
    Ok(conn)
}

/// Read a plaintext settings row (KDF metadata lives here)
pub(crate) fn load_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn reencrypt_column(
    tx: &rusqlite::Transaction<'_>,
    old_key: &MasterKey,
    new_key: &MasterKey,
    table: &str,
    id_column: &str,
    blob_column: &str,
) -> Result<()> {
    let select = format!(
        "SELECT {id}, {blob} FROM {table} WHERE {blob} IS NOT NULL",
        id = id_column,
        blob = blob_column,
        table = table
    );
    let update = format!(
        "UPDATE {table} SET {blob} = ?1 WHERE {id} = ?2",
        table = table,
        blob = blob_column,
        id = id_column
    );

    let mut stmt = tx.prepare(&select)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?;

    for row in rows {
        let (id, old_blob) = row?;
        let plaintext = match old_key.decrypt(&old_blob) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                tracing::warn!(table, id = %id, "Skipping undecryptable row during rekey");
                continue;
            }
        };
        let new_blob = new_key.encrypt(&plaintext)?;
        tx.execute(&update, params![new_blob, id])?;
    }

    Ok(())
}

/// Run `op`, retrying once after a short pause if the database is locked.
pub(crate) fn with_busy_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(Error::Database(e)) if is_busy(&e) => {
            tracing::warn!("Database busy, retrying once");
            thread::sleep(Duration::from_millis(BUSY_RETRY_DELAY_MS));
            op().map_err(|err| match err {
                Error::Database(e2) if is_busy(&e2) => {
                    Error::Storage(format!("Database locked: {}", e2))
                }
                other => other,
            })
        }
        other => other,
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(info, _)
            if info.code == rusqlite::ErrorCode::DatabaseBusy
                || info.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_create_and_unlock() {
        let file = NamedTempFile::new().unwrap();
        let db = Database::create(file.path(), "open sesame 123").unwrap();
        drop(db);

        let db = Database::unlock(file.path(), "open sesame 123").unwrap();
        let frame = db.master_key().encrypt(b"check").unwrap();
        assert_eq!(db.master_key().decrypt(&frame).unwrap(), b"check");
    }

    #[test]
    fn test_wrong_password_rejected() {
        let file = NamedTempFile::new().unwrap();
        Database::create(file.path(), "right password").unwrap();

        let result = Database::unlock(file.path(), "wrong password");
        assert!(matches!(result, Err(Error::Authentication(_))));
    }

    #[test]
    fn test_double_create_rejected() {
        let file = NamedTempFile::new().unwrap();
        Database::create(file.path(), "password one").unwrap();
        assert!(Database::create(file.path(), "password two").is_err());
    }

    #[test]
    fn test_is_initialized() {
        let file = NamedTempFile::new().unwrap();
        assert!(!Database::is_initialized(file.path()));
        Database::create(file.path(), "some password").unwrap();
        assert!(Database::is_initialized(file.path()));
    }

    #[test]
    fn test_unlock_uninitialized_fails() {
        let file = NamedTempFile::new().unwrap();
        // Valid schema but no salt/key-check rows.
        {
            let mut conn = Connection::open(file.path()).unwrap();
            migrations::run_migrations(&mut conn).unwrap();
        }
        assert!(matches!(
            Database::unlock(file.path(), "anything"),
            Err(Error::Storage(_))
        ));
    }
}
