// Bank Sync - Core Library
// Exposes all modules for use in the CLI, the API server, and tests

pub mod accounts;
pub mod auth;
pub mod bank;
pub mod business;
pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod session_store;
pub mod transactions;

// Re-export commonly used types
pub use accounts::AccountSynchronizer;
pub use auth::{AuthOutcome, AuthState, Authenticator, BankSession, Credentials, TokenPair};
pub use bank::BankClient;
pub use business::{BusinessContext, BusinessContextResolver};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Settings;
pub use db::{
    Event, InsertReport, SharedConnection, UpsertResult,
    setup_database, open_shared, open_shared_in_memory,
    insert_tenant, get_tenant, list_tenants,
    upsert_bank_accounts, get_bank_accounts_by_tenant,
    get_non_existing_transaction_ids, insert_transactions, get_transactions_by_tenant,
    insert_event, get_events_for_entity,
};
pub use entities::{
    BankAccount, BankType, Direction, Tenant, TenantId, Transaction, TransactionStatus,
};
pub use error::{SyncError, SyncFailure, SyncPhase, SyncResult};
pub use orchestrator::{
    DispatchSummary, DispatchedTask, Orchestrator, RetryPolicy, SyncKind, TaskRecord,
    TaskHandle, TaskId, TaskRegistry, TaskStatus,
};
pub use scheduler::{Maintenance, MaintenanceReport, Scheduler};
pub use session_store::{MemorySessionStore, SessionKey, SessionStore, SqliteSessionStore};
pub use transactions::{DiscoveryMode, NewTransactions, TransactionSynchronizer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
