use punchcard_types::WalletRecord;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use super::{Mutator, StorageError, Upserted, WalletStore};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Legacy rows may hold NULLs, REAL counters or non-text strings; every
/// column is coerced to the type the record expects.
const SELECT_COLUMNS: &str = "wallet_address,
    CAST(COALESCE(tokens, 0) AS INTEGER),
    CAST(COALESCE(punches, 0) AS INTEGER),
    CAST(COALESCE(bonusPunches, 0) AS INTEGER),
    CAST(COALESCE(referredBy, '') AS TEXT),
    CAST(COALESCE(characterName, '') AS TEXT),
    CAST(COALESCE(winCount, 0) AS INTEGER)";

/// Columns added after the first `wallet_data` layout.
const ADDED_COLUMNS: [(&str, &str); 2] = [
    ("bonusPunches", "INTEGER NOT NULL DEFAULT 0"),
    ("winCount", "INTEGER NOT NULL DEFAULT 0"),
];

/// Durable store backed by a single SQLite writer connection.
///
/// Each upsert runs in its own `BEGIN IMMEDIATE` transaction, so the read, the
/// mutation and the write for an address commit together or not at all.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`, upgrading older layouts in place.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn init_schema(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS wallet_data (
             wallet_address TEXT PRIMARY KEY,
             tokens INTEGER NOT NULL DEFAULT 0,
             punches INTEGER NOT NULL DEFAULT 0,
             referredBy TEXT NOT NULL DEFAULT '',
             characterName TEXT NOT NULL DEFAULT '',
             bonusPunches INTEGER NOT NULL DEFAULT 0,
             winCount INTEGER NOT NULL DEFAULT 0
         );",
    )?;

    let existing = {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('wallet_data')")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
    };
    for (column, definition) in ADDED_COLUMNS {
        if existing.iter().any(|name| name == column) {
            continue;
        }
        conn.execute_batch(&format!(
            "ALTER TABLE wallet_data ADD COLUMN {column} {definition};"
        ))?;
        info!(column, "upgraded wallet_data schema");
    }

    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS wallet_data_win_count
             ON wallet_data(winCount DESC, wallet_address ASC);",
    )?;
    Ok(())
}

fn counter(address: &str, field: &'static str, value: i64) -> Result<u64, StorageError> {
    u64::try_from(value).map_err(|_| StorageError::Corrupt {
        address: address.to_string(),
        field,
        value,
    })
}

fn column(value: u64) -> i64 {
    // Counters saturate at MAX_COUNTER before they reach the store.
    i64::try_from(value).unwrap_or(i64::MAX)
}

type RawRecord = (String, i64, i64, i64, String, String, i64);

fn map_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode(raw: RawRecord) -> Result<WalletRecord, StorageError> {
    let (address, tokens, punches, bonus_punches, referred_by, character_name, win_count) = raw;
    Ok(WalletRecord {
        tokens: counter(&address, "tokens", tokens)?,
        punches: counter(&address, "punches", punches)?,
        bonus_punches: counter(&address, "bonusPunches", bonus_punches)?,
        win_count: counter(&address, "winCount", win_count)?,
        referred_by,
        character_name,
        address,
    })
}

fn read_record(conn: &Connection, address: &str) -> Result<Option<WalletRecord>, StorageError> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM wallet_data WHERE wallet_address = ?1"),
            params![address],
            map_row,
        )
        .optional()?;
    raw.map(decode).transpose()
}

fn write_record(conn: &Connection, record: &WalletRecord) -> Result<(), StorageError> {
    conn.execute(
        "INSERT INTO wallet_data
             (wallet_address, tokens, punches, bonusPunches, referredBy, characterName, winCount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(wallet_address) DO UPDATE SET
             tokens = excluded.tokens,
             punches = excluded.punches,
             bonusPunches = excluded.bonusPunches,
             referredBy = excluded.referredBy,
             characterName = excluded.characterName,
             winCount = excluded.winCount",
        params![
            record.address,
            column(record.tokens),
            column(record.punches),
            column(record.bonus_punches),
            record.referred_by,
            record.character_name,
            column(record.win_count),
        ],
    )?;
    Ok(())
}

impl WalletStore for SqliteStore {
    fn get(&self, address: &str) -> Result<Option<WalletRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        read_record(&conn, address)
    }

    fn upsert(&self, address: &str, mutate: Mutator<'_>) -> Result<Upserted, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing = read_record(&tx, address)?;
        let created = existing.is_none();
        let mut record = existing.unwrap_or_else(|| WalletRecord::new(address));
        mutate(&mut record, created);
        record.address = address.to_string();
        write_record(&tx, &record)?;
        tx.commit()?;
        Ok(Upserted { record, created })
    }

    fn list_top(&self, limit: usize) -> Result<Vec<WalletRecord>, StorageError> {
        let conn = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM wallet_data
             WHERE wallet_address IS NOT NULL
             ORDER BY CAST(COALESCE(winCount, 0) AS INTEGER) DESC, wallet_address ASC
             LIMIT ?1"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], map_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(decode(row?)?);
        }
        Ok(records)
    }
}
