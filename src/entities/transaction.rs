// 🧾 Transaction - immutable ledger entry
//
// Identity is the bank-assigned transaction id. Once a row is stored this
// crate never touches it again.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::TenantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Unfilled,
    Filled,
    Rejected,
    Confirmed,
    Sent,
    Completed,
    Failed,
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Unfilled => "unfilled",
            TransactionStatus::Filled => "filled",
            TransactionStatus::Rejected => "rejected",
            TransactionStatus::Confirmed => "confirmed",
            TransactionStatus::Sent => "sent",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(value: &str) -> Option<TransactionStatus> {
        match value {
            "unfilled" => Some(TransactionStatus::Unfilled),
            "filled" => Some(TransactionStatus::Filled),
            "rejected" => Some(TransactionStatus::Rejected),
            "confirmed" => Some(TransactionStatus::Confirmed),
            "sent" => Some(TransactionStatus::Sent),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "canceled" => Some(TransactionStatus::Canceled),
            _ => None,
        }
    }
}

/// Money flow relative to the tenant. Unknown values are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Direction {
    In,
    Out,
    Other(String),
}

impl Direction {
    pub fn as_str(&self) -> &str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Other(raw) => raw,
        }
    }
}

impl From<String> for Direction {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "in" => Direction::In,
            "out" => Direction::Out,
            _ => Direction::Other(value),
        }
    }
}

impl From<Direction> for String {
    fn from(direction: Direction) -> Self {
        direction.as_str().to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Row identity (UUID)
    pub id: String,

    pub tenant_id: TenantId,

    /// Bank-assigned id, unique across the ledger
    pub transaction_id: String,

    // Receiver
    pub receiver_name: Option<String>,
    pub receiver_inn: Option<String>,
    pub receiver_account: Option<String>,
    pub receiver_bank_code: Option<String>,

    // Sender
    pub sender_name: Option<String>,
    pub sender_inn: Option<String>,
    pub sender_account: Option<String>,
    pub sender_bank_code: Option<String>,

    pub payment_amount: Decimal,
    pub currency: String,
    pub payment_description: Option<String>,
    pub payment_purpose_code: Option<String>,
    pub payment_number: Option<String>,
    pub direction: Option<Direction>,

    /// None when the bank sent no date or one we could not parse
    pub document_date: Option<DateTime<Utc>>,

    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    pub fn is_incoming(&self) -> bool {
        self.direction == Some(Direction::In)
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == Some(Direction::Out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_parsing() {
        assert_eq!(Direction::from("IN".to_string()), Direction::In);
        assert_eq!(Direction::from("out".to_string()), Direction::Out);
        assert_eq!(
            Direction::from("internal".to_string()),
            Direction::Other("internal".to_string())
        );
    }

    #[test]
    fn test_direction_serializes_as_plain_string() {
        let json = serde_json::to_string(&Direction::Out).unwrap();
        assert_eq!(json, "\"out\"");

        let parsed: Direction = serde_json::from_str("\"in\"").unwrap();
        assert_eq!(parsed, Direction::In);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            TransactionStatus::Unfilled,
            TransactionStatus::Completed,
            TransactionStatus::Canceled,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionStatus::parse("bogus"), None);
    }
}
