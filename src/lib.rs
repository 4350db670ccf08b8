//! Encrypted SQLite storage for the networth tracker
//!
//! Provides the encrypted-at-rest database behind a local, single-user
//! personal-finance application: master-password key derivation, field-level
//! authenticated encryption, versioned schema migrations, and a repository
//! layer with automatic value-history snapshots.
//!
//! ## Security model
//!
//! - **Key Derivation**: PBKDF2-HMAC-SHA256 (100k+ iterations) over a
//!   per-database random salt; parameters stored beside the salt
//! - **Field Encryption**: AES-256-GCM or ChaCha20-Poly1305 AEAD frames for
//!   every sensitive column; fresh nonce per write
//! - **Unlock Gate**: a key-check token that only decrypts under the right
//!   password; no password hash is ever stored
//! - **Key Hygiene**: the derived key lives in zeroized memory for the
//!   session only and is never logged or persisted
//! - **Fault Isolation**: one corrupt record is skipped with a warning, it
//!   never takes down a listing
//!
//! ## Typical flow
//!
//! ```no_run
//! use networth_storage_sqlite::{Database, Repository, SnapshotStore};
//! use networth_storage_sqlite::models::{AccountPayload, NewAccount, SavingsDetails};
//!
//! # fn main() -> networth_storage_sqlite::Result<()> {
//! let db = Database::create("networth.sqlite", "correct horse battery staple")?;
//! let repo = Repository::new(&db);
//!
//! let id = repo.create_account(NewAccount::new(
//!     "Emergency Fund",
//!     "Example Bank",
//!     AccountPayload::Savings(SavingsDetails { balance: 1000.0, interest_rate: 4.2 }),
//! ))?;
//!
//! let history = SnapshotStore::new(&db).get_history(&id, None, None)?;
//! assert_eq!(history.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backup;
pub mod database;
pub mod error;
pub mod history;
pub mod kdf;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod security;
pub mod watchlist;

pub use backup::{BackupEngine, ImportMode, ImportStats, BACKUP_FORMAT_VERSION};
pub use database::{default_db_path, Database};
pub use error::{Error, Result};
pub use history::SnapshotStore;
pub use kdf::{generate_salt, KdfParams};
pub use models::*;
pub use repository::{PositionUpdate, Repository};
pub use security::{EncryptionAlgorithm, MasterKey};
pub use watchlist::{WatchlistDetails, WatchlistItem, WatchlistStorage};
