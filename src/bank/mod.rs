// Bank API access
//
// `client` speaks HTTP; `models` holds the wire shapes it decodes.

pub mod client;
pub mod models;

pub use client::{ApiVersion, BankClient};
pub use models::from_minor_units;
