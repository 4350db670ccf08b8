//! Backup export/import tests

use chrono::NaiveDate;
use networth_storage_sqlite::models::{
    AccountFilter, AccountPayload, AccountUpdate, NewAccount, SavingsDetails, StockPosition,
    TradingDetails,
};
use networth_storage_sqlite::watchlist::{WatchlistDetails, WatchlistStorage};
use networth_storage_sqlite::{
    BackupEngine, Database, Error, ImportMode, Repository, SnapshotStore, BACKUP_FORMAT_VERSION,
};
use tempfile::NamedTempFile;

fn open_db() -> (NamedTempFile, Database) {
    let file = NamedTempFile::new().unwrap();
    let db = Database::create(file.path(), "backup test password").unwrap();
    (file, db)
}

fn savings(balance: f64) -> AccountPayload {
    AccountPayload::Savings(SavingsDetails {
        balance,
        interest_rate: 2.0,
    })
}

#[test]
fn test_export_import_round_trip() {
    let (_file, db) = open_db();
    let repo = Repository::new(&db);
    let watchlist = WatchlistStorage::new(&db);
    let engine = BackupEngine::new(&db);

    let savings_id = repo
        .create_account(NewAccount::new("Savings", "Bank", savings(1000.0)))
        .unwrap();
    repo.update_account(
        &savings_id,
        AccountUpdate {
            payload: Some(savings(1100.0)),
            ..Default::default()
        },
    )
    .unwrap();

    let trading_id = repo
        .create_account(NewAccount::new(
            "Brokerage",
            "Example Securities",
            AccountPayload::Trading(TradingDetails {
                broker_name: "Example Securities".to_string(),
                cash_balance: 50.0,
                positions: vec![
                    StockPosition {
                        id: "pos-1".to_string(),
                        symbol: "ACME".to_string(),
                        shares: 2.0,
                        purchase_price: 10.0,
                        purchase_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                        current_price: Some(12.0),
                        last_price_update: Some(1_700_000_000),
                    },
                    StockPosition {
                        id: "pos-2".to_string(),
                        symbol: "GLOBEX".to_string(),
                        shares: 1.0,
                        purchase_price: 30.0,
                        purchase_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
                        current_price: None,
                        last_price_update: None,
                    },
                ],
            }),
        ))
        .unwrap();

    watchlist
        .add_symbol(
            "INITECH",
            WatchlistDetails {
                notes: Some("waiting for a dip".to_string()),
                target_price: Some(42.0),
                current_price: None,
            },
            false,
        )
        .unwrap();

    let blob = engine.export_all().unwrap();

    // Wipe and restore.
    repo.delete_account(&savings_id).unwrap();
    repo.delete_account(&trading_id).unwrap();
    watchlist.remove_symbol("INITECH").unwrap();
    assert!(repo.get_accounts(&AccountFilter::default()).unwrap().is_empty());

    let stats = engine.import_all(&blob, ImportMode::Replace).unwrap();
    assert_eq!(stats.accounts_imported, 2);
    assert_eq!(stats.accounts_skipped, 0);
    assert_eq!(stats.positions_imported, 2);
    assert_eq!(stats.snapshots_imported, 3); // 2 for savings, 1 for trading
    assert_eq!(stats.watchlist_imported, 1);

    let restored = repo.get_account(&savings_id).unwrap();
    assert_eq!(restored.current_value(), 1100.0);

    let history = SnapshotStore::new(&db).get_history(&savings_id, None, None).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].value, 1000.0);
    assert_eq!(history[1].value, 1100.0);

    let positions = repo.get_positions(&trading_id).unwrap();
    assert_eq!(positions.len(), 2);

    let items = watchlist.get_items(true).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].details.target_price, Some(42.0));
}

#[test]
fn test_merge_skips_duplicate_ids() {
    // Backup holds 10 accounts, 2 of which still exist locally: merge must
    // report 8 imported and 2 skipped.
    let (_file, db) = open_db();
    let repo = Repository::new(&db);
    let engine = BackupEngine::new(&db);

    let mut ids = Vec::new();
    for i in 0..10 {
        ids.push(
            repo.create_account(NewAccount::new(format!("Account {}", i), "Bank", savings(100.0)))
                .unwrap(),
        );
    }

    let blob = engine.export_all().unwrap();

    for id in &ids[2..] {
        repo.delete_account(id).unwrap();
    }
    assert_eq!(repo.get_accounts(&AccountFilter::default()).unwrap().len(), 2);

    let stats = engine.import_all(&blob, ImportMode::Merge).unwrap();
    assert_eq!(stats.accounts_imported, 8);
    assert_eq!(stats.accounts_skipped, 2);
    assert_eq!(repo.get_accounts(&AccountFilter::default()).unwrap().len(), 10);
}

#[test]
fn test_replace_clears_existing_data() {
    let (_file, db) = open_db();
    let repo = Repository::new(&db);
    let engine = BackupEngine::new(&db);

    repo.create_account(NewAccount::new("Kept", "Bank", savings(1.0)))
        .unwrap();
    let blob = engine.export_all().unwrap();

    repo.create_account(NewAccount::new("Added After Export", "Bank", savings(2.0)))
        .unwrap();
    assert_eq!(repo.get_accounts(&AccountFilter::default()).unwrap().len(), 2);

    engine.import_all(&blob, ImportMode::Replace).unwrap();

    let accounts = repo.get_accounts(&AccountFilter::default()).unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].name, "Kept");
}

#[test]
fn test_malformed_records_are_skipped_individually() {
    let (_file, db) = open_db();
    let repo = Repository::new(&db);
    let engine = BackupEngine::new(&db);

    // Hand-built document: one good account, one with a negative balance,
    // one missing its name.
    let document = serde_json::json!({
        "backup_metadata": {
            "backup_id": "11111111-2222-3333-4444-555555555555",
            "exported_at": 1_700_000_000,
            "format_version": BACKUP_FORMAT_VERSION,
            "accounts_count": 3,
        },
        "accounts": [
            {
                "id": "good-1",
                "name": "Good",
                "institution": "Bank",
                "created_date": 1_700_000_000,
                "last_updated": 1_700_000_000,
                "is_demo": false,
                "payload": { "account_type": "SAVINGS", "balance": 10.0, "interest_rate": 1.0 },
                "snapshots": [],
            },
            {
                "id": "bad-balance",
                "name": "Bad",
                "institution": "Bank",
                "created_date": 1_700_000_000,
                "last_updated": 1_700_000_000,
                "is_demo": false,
                "payload": { "account_type": "SAVINGS", "balance": -10.0, "interest_rate": 1.0 },
                "snapshots": [],
            },
            {
                "id": "bad-name",
                "name": "  ",
                "institution": "Bank",
                "created_date": 1_700_000_000,
                "last_updated": 1_700_000_000,
                "is_demo": false,
                "payload": { "account_type": "SAVINGS", "balance": 10.0, "interest_rate": 1.0 },
                "snapshots": [],
            },
        ],
        "watchlist": [],
    });
    let blob = db
        .master_key()
        .encrypt(&serde_json::to_vec(&document).unwrap())
        .unwrap();

    let stats = engine.import_all(&blob, ImportMode::Merge).unwrap();
    assert_eq!(stats.accounts_imported, 1);
    assert_eq!(stats.accounts_skipped, 2);

    let accounts = repo.get_accounts(&AccountFilter::default()).unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, "good-1");

    // Restored accounts with no exported history get a baseline snapshot.
    assert_eq!(stats.snapshots_imported, 1);
    let history = SnapshotStore::new(&db).get_history("good-1", None, None).unwrap();
    assert_eq!(history.len(), 1);
}

#[test]
fn test_unreadable_blob_is_rejected() {
    let (_file, db) = open_db();
    let engine = BackupEngine::new(&db);

    assert!(matches!(
        engine.import_all(b"not a backup at all", ImportMode::Merge),
        Err(Error::Encryption(_))
    ));

    // A well-encrypted frame that isn't JSON is a validation failure.
    let blob = db.master_key().encrypt(b"hello world").unwrap();
    assert!(matches!(
        engine.import_all(&blob, ImportMode::Merge),
        Err(Error::Validation(_))
    ));
}

#[test]
fn test_future_format_version_rejected() {
    let (_file, db) = open_db();
    let engine = BackupEngine::new(&db);

    let document = serde_json::json!({
        "backup_metadata": {
            "backup_id": "11111111-2222-3333-4444-555555555555",
            "exported_at": 1_700_000_000,
            "format_version": BACKUP_FORMAT_VERSION + 1,
            "accounts_count": 0,
        },
        "accounts": [],
        "watchlist": [],
    });
    let blob = db
        .master_key()
        .encrypt(&serde_json::to_vec(&document).unwrap())
        .unwrap();

    assert!(matches!(
        engine.import_all(&blob, ImportMode::Merge),
        Err(Error::Validation(_))
    ));
}
