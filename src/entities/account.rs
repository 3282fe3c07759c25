// 💳 Bank Account - one row per account number
//
// Balance and routing data are VALUES that the bank owns: every sync
// overwrites them. The account number is the identity we upsert on.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TenantId;

// ============================================================================
// BANK TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BankType {
    Kapitalbank,
    IpakYuli,
}

impl BankType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BankType::Kapitalbank => "KAPITALBANK",
            BankType::IpakYuli => "IPAK_YULI",
        }
    }

    pub fn parse(value: &str) -> Option<BankType> {
        match value {
            "KAPITALBANK" => Some(BankType::Kapitalbank),
            "IPAK_YULI" => Some(BankType::IpakYuli),
            _ => None,
        }
    }
}

// ============================================================================
// BANK ACCOUNT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BankAccount {
    /// Row identity (UUID). Kept across upserts.
    pub id: String,

    pub tenant_id: TenantId,

    pub bank_type: BankType,

    /// Unique across all tenants
    pub account_number: String,

    /// ISO 4217 alpha code (UZS, USD, ...)
    pub currency: String,

    /// Decimal balance (minor units already divided down)
    pub balance: Decimal,

    /// Branch routing code
    pub mfo_number: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BankAccount {
    pub fn new(
        tenant_id: TenantId,
        bank_type: BankType,
        account_number: String,
        currency: String,
        balance: Decimal,
        mfo_number: Option<String>,
    ) -> Self {
        let now = Utc::now();

        BankAccount {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id,
            bank_type,
            account_number,
            currency,
            balance,
            mfo_number,
            created_at: now,
            updated_at: now,
        }
    }

    /// Mask account number (show only last 4 digits)
    ///
    /// Example: "20208000900123456001" → "*6001"
    pub fn mask_account_number(full_number: &str) -> String {
        let chars: Vec<char> = full_number.chars().collect();
        if chars.len() <= 4 {
            return full_number.to_string();
        }
        let last4: String = chars[chars.len() - 4..].iter().collect();
        format!("*{}", last4)
    }

    pub fn masked_number(&self) -> String {
        Self::mask_account_number(&self.account_number)
    }
}
