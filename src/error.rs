// ⚠️ Sync Errors - one taxonomy for the whole bank integration
//
// Every failure a tenant's unit of work can hit lands in SyncError.
// The orchestrator only needs one question answered: retry or give up?

use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result alias used across the integration.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Timeout, connection reset, 5xx, throttling
    #[error("transient network failure: {0}")]
    TransientNetwork(String),

    /// Bad credentials, invalid OTP, explicit error body from the bank
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The OTP confirmation window elapsed (or the session was already used)
    #[error("confirmation session expired, restart the login flow")]
    SessionExpired,

    /// Silent refresh needed but no login ever completed for this tenant
    #[error("credentials not found, authenticate first")]
    CredentialsNotFound,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Anything else the provider threw at us
    #[error("unexpected upstream response: {0}")]
    UnexpectedUpstream(String),

    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),
}

impl SyncError {
    /// Whether the orchestrator should spend retry budget on this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_) | SyncError::UnexpectedUpstream(_) | SyncError::Storage(_)
        )
    }

    /// Stable machine-readable kind, used in task payloads and audit events.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::TransientNetwork(_) => "transient_network",
            SyncError::AuthenticationRejected(_) => "authentication_rejected",
            SyncError::SessionExpired => "session_expired",
            SyncError::CredentialsNotFound => "credentials_not_found",
            SyncError::NotFound(_) => "not_found",
            SyncError::InvalidInput(_) => "invalid_input",
            SyncError::UnexpectedUpstream(_) => "unexpected_upstream",
            SyncError::Storage(_) => "storage",
        }
    }

    /// Attach the phase this error happened in.
    pub fn in_phase(self, phase: SyncPhase) -> SyncFailure {
        SyncFailure { phase, error: self }
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Storage(err)
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            SyncError::TransientNetwork(err.to_string())
        } else {
            SyncError::UnexpectedUpstream(err.to_string())
        }
    }
}

// ============================================================================
// PHASES
// ============================================================================

/// Step of a tenant's unit of work, reported with terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Enumerate,
    Authenticate,
    ResolveContext,
    FetchAccounts,
    PersistAccounts,
    Discover,
    Hydrate,
    PersistTransactions,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Enumerate => "enumerate",
            SyncPhase::Authenticate => "authenticate",
            SyncPhase::ResolveContext => "resolve_context",
            SyncPhase::FetchAccounts => "fetch_accounts",
            SyncPhase::PersistAccounts => "persist_accounts",
            SyncPhase::Discover => "discover",
            SyncPhase::Hydrate => "hydrate",
            SyncPhase::PersistTransactions => "persist_transactions",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error paired with the phase it surfaced in.
#[derive(Debug, Error)]
#[error("{phase}: {error}")]
pub struct SyncFailure {
    pub phase: SyncPhase,
    #[source]
    pub error: SyncError,
}

impl SyncFailure {
    pub fn is_retryable(&self) -> bool {
        self.error.is_retryable()
    }
}

/// Lets `?` tag a plain `SyncResult` with a phase.
pub trait PhaseExt<T> {
    fn phase(self, phase: SyncPhase) -> Result<T, SyncFailure>;
}

impl<T> PhaseExt<T> for SyncResult<T> {
    fn phase(self, phase: SyncPhase) -> Result<T, SyncFailure> {
        self.map_err(|e| e.in_phase(phase))
    }
}
