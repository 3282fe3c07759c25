// Entity Models
//
// Tenants own one bank session, a set of bank accounts and a ledger of
// transactions. Accounts are upserted on every sync; transactions are
// immutable once ingested.

pub mod account;
pub mod tenant;
pub mod transaction;

pub use account::{BankAccount, BankType};
pub use tenant::{Tenant, TenantId};
pub use transaction::{Direction, Transaction, TransactionStatus};
