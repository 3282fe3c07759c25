//! Wire types for the bank API.
//!
//! Every response is wrapped in `{"result": ...}`; money is sent in minor
//! units and ids arrive as numbers or strings depending on the endpoint.

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use std::str::FromStr;

/// `{"result": T}` envelope
#[derive(Debug, Deserialize)]
pub struct Envelope<T> {
    pub result: Option<T>,
}

/// One page of a paginated listing
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
    #[serde(default)]
    pub total_pages: u32,
}

// ============================================================================
// AUTH
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub login: String,
    pub password: String,
    pub confirm_type: u8,
}

/// `/auth` result: either tokens, or a step-up challenge
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResult {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub need_confirm: bool,
    pub confirm_token: Option<String>,
    pub confirm_phone: Option<String>,
}

impl LoginResult {
    pub fn requires_confirmation(&self) -> bool {
        self.need_confirm && self.confirm_token.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    pub confirm_code: String,
    pub confirm_token: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmResult {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

// ============================================================================
// BUSINESS CONTEXT
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessInfo {
    #[serde(deserialize_with = "string_or_number")]
    pub business_code: String,
    #[serde(deserialize_with = "string_or_number")]
    pub branch: String,
}

// ============================================================================
// ACCOUNTS
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyInfo {
    pub alpha_code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountItem {
    #[serde(deserialize_with = "string_or_number")]
    pub number: String,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub branch: Option<String>,
    #[serde(default)]
    pub currency: Option<CurrencyInfo>,
    /// Minor units
    #[serde(default, deserialize_with = "minor_units")]
    pub current_balance: Decimal,
}

// ============================================================================
// PAYMENT ORDERS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentOrderSummary {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOrderDetail {
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub id: Option<String>,
    pub proved_date: Option<String>,
    /// Minor units
    #[serde(default, deserialize_with = "minor_units")]
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<CurrencyInfo>,
    pub receiver_name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub receiver_inn_or_pinfl: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub receiver_account_number: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub receiver_branch: Option<String>,
    pub sender_name: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sender_inn: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sender_account_number: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub sender_branch: Option<String>,
    pub payment_purpose: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub payment_purpose_code: Option<String>,
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub payment_number: Option<String>,
    pub direction: Option<String>,
}

// ============================================================================
// FIELD HELPERS
// ============================================================================

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Int(v) => v.to_string(),
            Scalar::Float(v) => v.to_string(),
            Scalar::Str(s) => s,
        }
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Scalar::deserialize(d).map(Scalar::into_string)
}

fn opt_string_or_number<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(Option::<Scalar>::deserialize(d)?.map(Scalar::into_string))
}

fn minor_units<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
    let value = match Option::<Scalar>::deserialize(d)? {
        None => return Ok(Decimal::ZERO),
        Some(v) => v,
    };

    match value {
        Scalar::Int(v) => Ok(from_minor_units(v)),
        Scalar::Float(v) => Decimal::from_f64_retain(v)
            .map(|d| (d / Decimal::ONE_HUNDRED).round_dp(2))
            .ok_or_else(|| serde::de::Error::custom(format!("amount out of range: {}", v))),
        Scalar::Str(s) => Decimal::from_str(s.trim())
            .map(|d| (d / Decimal::ONE_HUNDRED).round_dp(2))
            .map_err(|e| serde::de::Error::custom(format!("invalid amount {:?}: {}", s, e))),
    }
}

/// Exact minor → major unit conversion (tiyin → sum, cents → dollars).
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}
