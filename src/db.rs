use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::entities::{
    BankAccount, BankType, Direction, Tenant, TenantId, Transaction, TransactionStatus,
};

/// Event for audit trail (every sync run leaves one behind)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

/// Connection shared by the synchronizers, the orchestrator and the server.
/// Never hold the lock across an `.await`.
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Open (or create) the database file and make sure the schema exists.
pub fn open_shared(path: &str) -> Result<SharedConnection> {
    let conn = Connection::open(path).with_context(|| format!("Failed to open database {}", path))?;
    setup_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

pub fn open_shared_in_memory() -> Result<SharedConnection> {
    let conn = Connection::open_in_memory()?;
    setup_database(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Run `f` under the connection lock
pub fn with_connection<T>(db: &SharedConnection, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
    let conn = db.lock().unwrap_or_else(|e| e.into_inner());
    f(&conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    // ==========================================================================
    // Tenants (registered externally, enumerated by the orchestrator)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS tenants (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Bank accounts (upserted on account_number)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS bank_accounts (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            bank_type TEXT NOT NULL,
            account_number TEXT UNIQUE NOT NULL,
            currency TEXT NOT NULL,
            balance TEXT NOT NULL,
            mfo_number TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Transactions (immutable, unique on the bank-assigned id)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS transactions (
            id TEXT PRIMARY KEY,
            tenant_id TEXT NOT NULL,
            transaction_id TEXT UNIQUE NOT NULL,
            receiver_name TEXT,
            receiver_inn TEXT,
            receiver_account TEXT,
            receiver_bank_code TEXT,
            sender_name TEXT,
            sender_inn TEXT,
            sender_account TEXT,
            sender_bank_code TEXT,
            payment_amount TEXT NOT NULL,
            currency TEXT NOT NULL DEFAULT 'UZS',
            payment_description TEXT,
            payment_purpose_code TEXT,
            payment_number TEXT,
            direction TEXT,
            document_date TEXT,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Events Table (audit trail)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Session entries (durable session store: device ids, credentials, tokens)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_entries (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            expires_at TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_bank_accounts_tenant ON bank_accounts(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_tenant ON transactions(tenant_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_transactions_document_date ON transactions(document_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// TENANTS
// ============================================================================

pub fn insert_tenant(conn: &Connection, tenant: &Tenant) -> Result<()> {
    conn.execute(
        "INSERT INTO tenants (id, name) VALUES (?1, ?2)
         ON CONFLICT(id) DO UPDATE SET name = excluded.name",
        params![tenant.id.to_string(), tenant.name],
    )
    .context("Failed to insert tenant")?;

    Ok(())
}

pub fn get_tenant(conn: &Connection, tenant_id: &TenantId) -> Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            "SELECT id, name FROM tenants WHERE id = ?1",
            [tenant_id.to_string()],
            row_to_tenant,
        )
        .optional()?;

    Ok(tenant)
}

pub fn list_tenants(conn: &Connection) -> Result<Vec<Tenant>> {
    let mut stmt = conn.prepare("SELECT id, name FROM tenants ORDER BY created_at, id")?;

    let tenants = stmt
        .query_map([], row_to_tenant)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(tenants)
}

fn row_to_tenant(row: &Row<'_>) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: parse_column(row, 0, |s| TenantId::from_str(s).map_err(|e| e.to_string()))?,
        name: row.get(1)?,
    })
}

// ============================================================================
// BANK ACCOUNTS
// ============================================================================

/// Outcome of an account upsert batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpsertResult {
    pub inserted: usize,
    pub updated: usize,
    pub accounts: Vec<BankAccount>,
}

impl UpsertResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

const ACCOUNT_COLUMNS: &str = "id, tenant_id, bank_type, account_number, currency, balance, mfo_number, created_at, updated_at";

/// Insert new accounts and overwrite every mutable field of existing ones,
/// keyed by account number, in a single statement.
pub fn upsert_bank_accounts(
    conn: &Connection,
    accounts: &[BankAccount],
    now: DateTime<Utc>,
) -> Result<UpsertResult> {
    if accounts.is_empty() {
        return Ok(UpsertResult::default());
    }

    let tx = conn.unchecked_transaction()?;

    let numbers: Vec<&str> = accounts.iter().map(|a| a.account_number.as_str()).collect();
    let existing = existing_account_numbers(&tx, &numbers)?;

    let now_str = now.to_rfc3339();
    let placeholders = (0..accounts.len())
        .map(|i| {
            let base = i * 9;
            format!(
                "(?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{}, ?{})",
                base + 1,
                base + 2,
                base + 3,
                base + 4,
                base + 5,
                base + 6,
                base + 7,
                base + 8,
                base + 9
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        "INSERT INTO bank_accounts ({cols}) VALUES {placeholders}
         ON CONFLICT(account_number) DO UPDATE SET
            bank_type = excluded.bank_type,
            currency = excluded.currency,
            balance = excluded.balance,
            mfo_number = excluded.mfo_number,
            tenant_id = excluded.tenant_id,
            updated_at = excluded.updated_at
         RETURNING {cols}",
        cols = ACCOUNT_COLUMNS,
        placeholders = placeholders,
    );

    let mut values: Vec<Option<String>> = Vec::with_capacity(accounts.len() * 9);
    for account in accounts {
        values.push(Some(account.id.clone()));
        values.push(Some(account.tenant_id.to_string()));
        values.push(Some(account.bank_type.as_str().to_string()));
        values.push(Some(account.account_number.clone()));
        values.push(Some(account.currency.clone()));
        values.push(Some(account.balance.to_string()));
        values.push(account.mfo_number.clone());
        values.push(Some(now_str.clone()));
        values.push(Some(now_str.clone()));
    }

    let stored = {
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), row_to_account)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to upsert bank accounts")?;
        rows
    };

    tx.commit()?;

    let updated = stored
        .iter()
        .filter(|a| existing.contains(&a.account_number))
        .count();

    Ok(UpsertResult {
        inserted: stored.len() - updated,
        updated,
        accounts: stored,
    })
}

fn existing_account_numbers(conn: &Connection, numbers: &[&str]) -> Result<HashSet<String>> {
    let placeholders = vec!["?"; numbers.len()].join(", ");
    let sql = format!(
        "SELECT account_number FROM bank_accounts WHERE account_number IN ({})",
        placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    let found = stmt
        .query_map(params_from_iter(numbers.iter()), |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;

    Ok(found)
}

pub fn get_bank_accounts_by_tenant(conn: &Connection, tenant_id: &TenantId) -> Result<Vec<BankAccount>> {
    let sql = format!(
        "SELECT {} FROM bank_accounts WHERE tenant_id = ?1 ORDER BY account_number",
        ACCOUNT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let accounts = stmt
        .query_map([tenant_id.to_string()], row_to_account)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(accounts)
}

pub fn count_bank_accounts(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM bank_accounts", [], |row| row.get(0))?;

    Ok(count)
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<BankAccount> {
    Ok(BankAccount {
        id: row.get(0)?,
        tenant_id: parse_column(row, 1, |s| TenantId::from_str(s).map_err(|e| e.to_string()))?,
        bank_type: parse_column(row, 2, |s| {
            BankType::parse(s).ok_or_else(|| format!("unknown bank type {}", s))
        })?,
        account_number: row.get(3)?,
        currency: row.get(4)?,
        balance: parse_column(row, 5, |s| Decimal::from_str(s).map_err(|e| e.to_string()))?,
        mfo_number: row.get(6)?,
        created_at: parse_column(row, 7, parse_timestamp)?,
        updated_at: parse_column(row, 8, parse_timestamp)?,
    })
}

// ============================================================================
// TRANSACTIONS
// ============================================================================

/// Which of the given bank transaction ids are not stored yet.
/// Preserves the input order.
pub fn get_non_existing_transaction_ids(conn: &Connection, transaction_ids: &[String]) -> Result<Vec<String>> {
    if transaction_ids.is_empty() {
        return Ok(Vec::new());
    }

    let placeholders = vec!["?"; transaction_ids.len()].join(", ");
    let sql = format!(
        "SELECT transaction_id FROM transactions WHERE transaction_id IN ({})",
        placeholders
    );

    let mut stmt = conn.prepare(&sql)?;
    let existing = stmt
        .query_map(params_from_iter(transaction_ids.iter()), |row| row.get::<_, String>(0))?
        .collect::<Result<HashSet<_>, _>>()?;

    Ok(transaction_ids
        .iter()
        .filter(|id| !existing.contains(*id))
        .cloned()
        .collect())
}

/// Result of a bulk insert
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
}

/// Insert the whole batch in one SQLite transaction. Either every row is
/// written (duplicates of already-stored ids are skipped) or none is.
pub fn insert_transactions(conn: &Connection, transactions: &[Transaction]) -> Result<InsertReport> {
    let tx = conn.unchecked_transaction()?;
    let mut report = InsertReport::default();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO transactions (
                id, tenant_id, transaction_id,
                receiver_name, receiver_inn, receiver_account, receiver_bank_code,
                sender_name, sender_inn, sender_account, sender_bank_code,
                payment_amount, currency, payment_description, payment_purpose_code,
                payment_number, direction, document_date, status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(transaction_id) DO NOTHING",
        )?;

        for t in transactions {
            let changed = stmt
                .execute(params![
                    t.id,
                    t.tenant_id.to_string(),
                    t.transaction_id,
                    t.receiver_name,
                    t.receiver_inn,
                    t.receiver_account,
                    t.receiver_bank_code,
                    t.sender_name,
                    t.sender_inn,
                    t.sender_account,
                    t.sender_bank_code,
                    t.payment_amount.to_string(),
                    t.currency,
                    t.payment_description,
                    t.payment_purpose_code,
                    t.payment_number,
                    t.direction.as_ref().map(|d| d.as_str().to_string()),
                    t.document_date.map(|dt| dt.to_rfc3339()),
                    t.status.as_str(),
                    t.created_at.to_rfc3339(),
                ])
                .with_context(|| format!("Failed to insert transaction {}", t.transaction_id))?;

            if changed == 0 {
                report.duplicates += 1;
            } else {
                report.inserted += 1;
            }
        }
    }

    tx.commit()?;

    Ok(report)
}

const TRANSACTION_COLUMNS: &str = "id, tenant_id, transaction_id,
    receiver_name, receiver_inn, receiver_account, receiver_bank_code,
    sender_name, sender_inn, sender_account, sender_bank_code,
    payment_amount, currency, payment_description, payment_purpose_code,
    payment_number, direction, document_date, status, created_at";

pub fn get_transactions_by_tenant(conn: &Connection, tenant_id: &TenantId) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {} FROM transactions WHERE tenant_id = ?1 ORDER BY document_date DESC, transaction_id",
        TRANSACTION_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;

    let transactions = stmt
        .query_map([tenant_id.to_string()], row_to_transaction)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(transactions)
}

pub fn count_transactions(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |row| row.get(0))?;

    Ok(count)
}

fn row_to_transaction(row: &Row<'_>) -> rusqlite::Result<Transaction> {
    let direction: Option<String> = row.get(16)?;
    let document_date: Option<String> = row.get(17)?;

    Ok(Transaction {
        id: row.get(0)?,
        tenant_id: parse_column(row, 1, |s| TenantId::from_str(s).map_err(|e| e.to_string()))?,
        transaction_id: row.get(2)?,
        receiver_name: row.get(3)?,
        receiver_inn: row.get(4)?,
        receiver_account: row.get(5)?,
        receiver_bank_code: row.get(6)?,
        sender_name: row.get(7)?,
        sender_inn: row.get(8)?,
        sender_account: row.get(9)?,
        sender_bank_code: row.get(10)?,
        payment_amount: parse_column(row, 11, |s| Decimal::from_str(s).map_err(|e| e.to_string()))?,
        currency: row.get(12)?,
        payment_description: row.get(13)?,
        payment_purpose_code: row.get(14)?,
        payment_number: row.get(15)?,
        direction: direction.map(Direction::from),
        document_date: document_date.and_then(|s| parse_timestamp(&s).ok()),
        status: parse_column(row, 18, |s| {
            TransactionStatus::parse(s).ok_or_else(|| format!("unknown status {}", s))
        })?,
        created_at: parse_column(row, 19, parse_timestamp)?,
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO events (
            event_id, timestamp, event_type, entity_type, entity_id, data, actor
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            data_json,
            event.actor,
        ],
    )?;

    Ok(())
}

/// Delete events recorded before `cutoff`, `batch_size` rows per statement.
/// Returns the total removed.
pub fn delete_events_older_than(
    conn: &Connection,
    cutoff: DateTime<Utc>,
    batch_size: usize,
) -> Result<usize> {
    let batch_size = batch_size.max(1);
    let cutoff = cutoff.to_rfc3339();
    let mut total = 0;

    loop {
        let deleted = conn
            .execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events WHERE timestamp < ?1 ORDER BY id LIMIT ?2
                )",
                params![cutoff, batch_size as i64],
            )
            .context("Failed to delete old events")?;
        total += deleted;

        if deleted < batch_size {
            break;
        }
    }

    Ok(total)
}

/// Get events for a specific entity
pub fn get_events_for_entity(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, event_type, entity_type, entity_id, data, actor
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY timestamp DESC, id DESC",
    )?;

    let events = stmt
        .query_map(params![entity_type, entity_id], |row| {
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: parse_column(row, 1, parse_timestamp)?,
                event_type: row.get(2)?,
                entity_type: row.get(3)?,
                entity_id: row.get(4)?,
                data: serde_json::from_str(&data_json).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e))
                })?,
                actor: row.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

// ============================================================================
// SESSION ENTRIES
// ============================================================================

/// Live value for `key`. Entries past `expires_at` are deleted on read.
pub fn get_session_entry(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT value, expires_at FROM session_entries WHERE key = ?1",
            [key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((value, expires_at)) = row else {
        return Ok(None);
    };

    if is_expired(expires_at.as_deref(), now) {
        conn.execute("DELETE FROM session_entries WHERE key = ?1", [key])?;
        return Ok(None);
    }

    Ok(Some(value))
}

pub fn put_session_entry(
    conn: &Connection,
    key: &str,
    value: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO session_entries (key, value, expires_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
        params![key, value, expires_at.map(|at| at.to_rfc3339())],
    )
    .with_context(|| format!("Failed to store session entry {}", key))?;
    Ok(())
}

/// True if a live entry was removed
pub fn delete_session_entry(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<bool> {
    let live = get_session_entry(conn, key, now)?.is_some();
    conn.execute("DELETE FROM session_entries WHERE key = ?1", [key])?;
    Ok(live)
}

/// Expiry of a live entry; `None` when missing or stored without expiry
pub fn session_entry_expiry(conn: &Connection, key: &str, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    if get_session_entry(conn, key, now)?.is_none() {
        return Ok(None);
    }
    let expires_at: Option<String> = conn.query_row(
        "SELECT expires_at FROM session_entries WHERE key = ?1",
        [key],
        |row| row.get(0),
    )?;
    Ok(expires_at.and_then(|s| parse_timestamp(&s).ok()))
}

/// Drop every expired entry. Returns how many went.
pub fn purge_expired_session_entries(conn: &Connection, now: DateTime<Utc>) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT key, expires_at FROM session_entries WHERE expires_at IS NOT NULL")?;
    let expired: Vec<String> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|(_, at)| is_expired(at.as_deref(), now))
        .map(|(key, _)| key)
        .collect();

    for key in &expired {
        conn.execute("DELETE FROM session_entries WHERE key = ?1", [key])?;
    }
    Ok(expired.len())
}

fn is_expired(expires_at: Option<&str>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => false,
        // unreadable expiry counts as expired
        Some(raw) => parse_timestamp(raw).map(|at| at <= now).unwrap_or(true),
    }
}

// ============================================================================
// COLUMN HELPERS
// ============================================================================

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| e.to_string())
}

fn parse_column<T>(
    row: &Row<'_>,
    idx: usize,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).map_err(|msg| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
    })
}
