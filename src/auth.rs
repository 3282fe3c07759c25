// 🔐 Authenticator - login → OTP confirm → tokens, plus silent refresh
//
// Per-tenant state lives in the session store:
//   device id     30 days, created lazily
//   credentials   no expiry, written once
//   otp session   65 seconds
//   token pair    12 hours
//
// Any call that needs a bearer token goes through `authorize`, which
// re-runs the login with cached credentials when the tokens are gone.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::bank::models::{ConfirmRequest, LoginRequest, LoginResult};
use crate::bank::BankClient;
use crate::entities::TenantId;
use crate::error::{SyncError, SyncResult};
use crate::session_store::{get_json, set_json, set_json_with_ttl, SessionKey, SessionStore};

const DEVICE_TTL_DAYS: i64 = 30;
const TOKEN_TTL_HOURS: i64 = 12;
/// How long an OTP confirmation session stays usable
pub const CONFIRMATION_TTL_SECS: i64 = 65;

/// `confirmType` sent with every login
const CONFIRM_TYPE_SMS: u8 = 0;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub login: String,
    pub password: String,
}

impl Credentials {
    /// Trimmed credentials; blank login or password is rejected.
    pub fn new(login: &str, password: &str) -> SyncResult<Self> {
        let login = login.trim();
        let password = password.trim();
        if login.is_empty() || password.is_empty() {
            return Err(SyncError::InvalidInput(
                "login and password are required".to_string(),
            ));
        }
        Ok(Credentials {
            login: login.to_string(),
            password: password.to_string(),
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub user_id: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("user_id", &self.user_id)
            .field("access_token", &"***")
            .finish()
    }
}

/// In-flight OTP challenge
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConfirmationSession {
    tenant_id: TenantId,
    confirm_token: String,
    user_id: Option<String>,
}

/// What the caller needs to hit a data endpoint
#[derive(Clone)]
pub struct BankSession {
    pub device_id: String,
    pub access_token: String,
}

impl fmt::Debug for BankSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankSession")
            .field("device_id", &self.device_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AuthOutcome {
    Authenticated(TokenPair),
    NeedsConfirmation {
        session_id: Uuid,
        confirm_phone: Option<String>,
    },
    Rejected {
        reason: String,
    },
}

impl AuthOutcome {
    pub fn state(&self) -> AuthState {
        match self {
            AuthOutcome::Authenticated(_) => AuthState::Authenticated,
            AuthOutcome::NeedsConfirmation { .. } => AuthState::AwaitingOtp,
            AuthOutcome::Rejected { .. } => AuthState::NoSession,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    NoSession,
    Authenticating,
    AwaitingOtp,
    Authenticated,
}

// ============================================================================
// AUTHENTICATOR
// ============================================================================

#[derive(Clone)]
pub struct Authenticator {
    store: Arc<dyn SessionStore>,
    client: BankClient,
    in_flight: Arc<Mutex<HashMap<TenantId, usize>>>,
}

impl Authenticator {
    pub fn new(store: Arc<dyn SessionStore>, client: BankClient) -> Self {
        Authenticator {
            store,
            client,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn client(&self) -> &BankClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Device fingerprint, generated on first use
    pub async fn device_id(&self, tenant: &TenantId) -> SyncResult<String> {
        let key = SessionKey::device(tenant);
        if let Some(existing) = self.store.get(&key).await? {
            return Ok(existing);
        }

        let device_id = generate_device_id();
        self.store
            .set_with_ttl(&key, device_id.clone(), Duration::days(DEVICE_TTL_DAYS))
            .await?;
        Ok(device_id)
    }

    /// Interactive login. Bank refusals come back as `Rejected`, transport
    /// failures as `Err`.
    #[instrument(skip(self, login, password), fields(tenant = %tenant))]
    pub async fn login(
        &self,
        tenant: &TenantId,
        login: &str,
        password: &str,
    ) -> SyncResult<AuthOutcome> {
        let credentials = Credentials::new(login, password)?;
        let _authenticating = self.begin(tenant);

        let device_id = self.device_id(tenant).await?;
        let result = match self.send_login(&device_id, &credentials).await {
            Ok(result) => result,
            Err(SyncError::AuthenticationRejected(reason)) => {
                warn!(%reason, "bank rejected login");
                return Ok(AuthOutcome::Rejected { reason });
            }
            Err(e) => return Err(e),
        };

        self.remember_credentials(tenant, &credentials).await?;

        if result.requires_confirmation() {
            let session_id = self.open_confirmation(tenant, &result).await?;
            info!(%session_id, "login needs OTP confirmation");
            return Ok(AuthOutcome::NeedsConfirmation {
                session_id,
                confirm_phone: result.confirm_phone,
            });
        }

        let tokens = token_pair(result.user_id, result.access_token, result.refresh_token)
            .ok_or_else(|| {
                SyncError::UnexpectedUpstream("login response carried no access token".to_string())
            })?;
        self.save_tokens(tenant, &tokens).await?;
        info!("login completed without confirmation");

        Ok(AuthOutcome::Authenticated(tokens))
    }

    /// Submit the OTP for a confirmation session. A session is usable once.
    #[instrument(skip(self, code), fields(tenant = %tenant))]
    pub async fn confirm_otp(
        &self,
        tenant: &TenantId,
        session_id: &Uuid,
        code: &str,
    ) -> SyncResult<TokenPair> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SyncError::InvalidInput("confirmation code is required".to_string()));
        }

        let key = SessionKey::confirmation(session_id);
        let session: ConfirmationSession = get_json(self.store.as_ref(), &key)
            .await?
            .ok_or(SyncError::SessionExpired)?;

        if session.tenant_id != *tenant {
            return Err(SyncError::InvalidInput(
                "confirmation session belongs to another tenant".to_string(),
            ));
        }

        // Claim the session before the network call so a replay never reaches the bank
        if !self.store.delete(&key).await? {
            return Err(SyncError::SessionExpired);
        }

        let _authenticating = self.begin(tenant);
        let device_id = self.device_id(tenant).await?;
        let request = ConfirmRequest {
            confirm_code: code.to_string(),
            confirm_token: session.confirm_token,
            user_id: session.user_id.clone(),
        };

        let result = match self.client.confirm(&device_id, &request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "OTP confirmation failed");
                return Err(e);
            }
        };

        let tokens = token_pair(session.user_id, result.access_token, result.refresh_token)
            .ok_or_else(|| {
                SyncError::AuthenticationRejected(
                    "confirmation returned no access token".to_string(),
                )
            })?;
        self.save_tokens(tenant, &tokens).await?;
        info!("OTP confirmed");

        Ok(tokens)
    }

    /// Device id and a valid bearer token, refreshing silently at most once.
    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn authorize(&self, tenant: &TenantId) -> SyncResult<BankSession> {
        let device_id = self.device_id(tenant).await?;

        let tokens = match self.cached_tokens(tenant).await? {
            Some(tokens) => tokens,
            None => self.refresh(tenant, &device_id).await?,
        };

        Ok(BankSession {
            device_id,
            access_token: tokens.access_token,
        })
    }

    pub async fn access_token(&self, tenant: &TenantId) -> SyncResult<String> {
        Ok(self.authorize(tenant).await?.access_token)
    }

    pub async fn state(&self, tenant: &TenantId) -> SyncResult<AuthState> {
        if self.is_in_flight(tenant) {
            return Ok(AuthState::Authenticating);
        }
        if self.cached_tokens(tenant).await?.is_some() {
            return Ok(AuthState::Authenticated);
        }
        Ok(AuthState::NoSession)
    }

    pub async fn has_credentials(&self, tenant: &TenantId) -> SyncResult<bool> {
        Ok(self.store.get(&SessionKey::credentials(tenant)).await?.is_some())
    }

    /// Overwrite stored credentials (the only way to change them).
    #[instrument(skip(self, login, password), fields(tenant = %tenant))]
    pub async fn replace_credentials(
        &self,
        tenant: &TenantId,
        login: &str,
        password: &str,
    ) -> SyncResult<()> {
        let credentials = Credentials::new(login, password)?;
        set_json(self.store.as_ref(), &SessionKey::credentials(tenant), &credentials).await?;
        info!("credentials replaced");
        Ok(())
    }

    /// Drop tokens and business context; credentials stay for silent refresh.
    pub async fn logout(&self, tenant: &TenantId) -> SyncResult<()> {
        self.store.delete(&SessionKey::tokens(tenant)).await?;
        self.store.delete(&SessionKey::business_context(tenant)).await?;
        info!(tenant = %tenant, "bank session cleared");
        Ok(())
    }

    /// Drop everything including credentials.
    pub async fn forget(&self, tenant: &TenantId) -> SyncResult<()> {
        self.logout(tenant).await?;
        self.store.delete(&SessionKey::credentials(tenant)).await?;
        info!(tenant = %tenant, "bank credentials forgotten");
        Ok(())
    }

    /// Pass a data-call result through, dropping the cached token pair when
    /// the bank refused it so the next attempt logs in again.
    pub async fn discard_refused_token<T>(
        &self,
        tenant: &TenantId,
        result: SyncResult<T>,
    ) -> SyncResult<T> {
        if let Err(SyncError::AuthenticationRejected(reason)) = &result {
            warn!(tenant = %tenant, %reason, "bank refused cached token, discarding it");
            self.store.delete(&SessionKey::tokens(tenant)).await?;
        }
        result
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    async fn refresh(&self, tenant: &TenantId, device_id: &str) -> SyncResult<TokenPair> {
        let credentials: Credentials =
            get_json(self.store.as_ref(), &SessionKey::credentials(tenant))
                .await?
                .ok_or(SyncError::CredentialsNotFound)?;

        let _authenticating = self.begin(tenant);
        info!(tenant = %tenant, "tokens missing, re-authenticating with cached credentials");

        let result = self.send_login(device_id, &credentials).await?;
        let confirmation_demanded = result.requires_confirmation();

        let tokens = match token_pair(result.user_id, result.access_token, result.refresh_token) {
            Some(tokens) => tokens,
            None if confirmation_demanded => {
                warn!(tenant = %tenant, "silent refresh refused: bank demands confirmation");
                return Err(SyncError::AuthenticationRejected(
                    "confirmation required".to_string(),
                ));
            }
            None => {
                return Err(SyncError::UnexpectedUpstream(
                    "login response carried no access token".to_string(),
                ))
            }
        };

        self.save_tokens(tenant, &tokens).await?;
        Ok(tokens)
    }

    async fn send_login(&self, device_id: &str, credentials: &Credentials) -> SyncResult<LoginResult> {
        let request = LoginRequest {
            login: credentials.login.clone(),
            password: credentials.password.clone(),
            confirm_type: CONFIRM_TYPE_SMS,
        };
        self.client.login(device_id, &request).await
    }

    async fn cached_tokens(&self, tenant: &TenantId) -> SyncResult<Option<TokenPair>> {
        let tokens: Option<TokenPair> =
            get_json(self.store.as_ref(), &SessionKey::tokens(tenant)).await?;
        Ok(tokens.filter(|t| !t.access_token.is_empty()))
    }

    async fn save_tokens(&self, tenant: &TenantId, tokens: &TokenPair) -> SyncResult<()> {
        set_json_with_ttl(
            self.store.as_ref(),
            &SessionKey::tokens(tenant),
            tokens,
            Duration::hours(TOKEN_TTL_HOURS),
        )
        .await
    }

    async fn remember_credentials(
        &self,
        tenant: &TenantId,
        credentials: &Credentials,
    ) -> SyncResult<()> {
        if self.has_credentials(tenant).await? {
            return Ok(());
        }
        set_json(self.store.as_ref(), &SessionKey::credentials(tenant), credentials).await
    }

    async fn open_confirmation(&self, tenant: &TenantId, result: &LoginResult) -> SyncResult<Uuid> {
        let confirm_token = result.confirm_token.clone().ok_or_else(|| {
            SyncError::UnexpectedUpstream("confirmation demanded without a token".to_string())
        })?;

        let session_id = Uuid::new_v4();
        let session = ConfirmationSession {
            tenant_id: *tenant,
            confirm_token,
            user_id: result.user_id.clone(),
        };

        set_json_with_ttl(
            self.store.as_ref(),
            &SessionKey::confirmation(&session_id),
            &session,
            Duration::seconds(CONFIRMATION_TTL_SECS),
        )
        .await?;

        Ok(session_id)
    }

    fn begin(&self, tenant: &TenantId) -> InFlight {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(*tenant).or_insert(0) += 1;
        InFlight {
            map: Arc::clone(&self.in_flight),
            tenant: *tenant,
        }
    }

    fn is_in_flight(&self, tenant: &TenantId) -> bool {
        let map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.get(tenant).copied().unwrap_or(0) > 0
    }
}

/// Marks a tenant as `Authenticating` until dropped
struct InFlight {
    map: Arc<Mutex<HashMap<TenantId, usize>>>,
    tenant: TenantId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = map.get_mut(&self.tenant) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&self.tenant);
            }
        }
    }
}

fn token_pair(
    user_id: Option<String>,
    access_token: Option<String>,
    refresh_token: Option<String>,
) -> Option<TokenPair> {
    let access_token = access_token.filter(|t| !t.is_empty())?;
    Some(TokenPair {
        user_id,
        access_token,
        refresh_token,
    })
}

/// 32 hex chars, same shape as the bank's own web client fingerprint
fn generate_device_id() -> String {
    let mut hasher = Sha256::new();
    hasher.update(Uuid::new_v4().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BankConfig;
    use crate::session_store::MemorySessionStore;

    fn create_test_authenticator() -> (Authenticator, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        let client = BankClient::new(BankConfig::for_base_url("http://127.0.0.1:9")).unwrap();
        (Authenticator::new(store.clone(), client), store)
    }

    #[test]
    fn test_device_id_shape() {
        let id = generate_device_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_device_id());
    }

    #[test]
    fn test_credentials_are_trimmed() {
        let creds = Credentials::new("  acme ", " s3cret\n").unwrap();
        assert_eq!(creds.login, "acme");
        assert_eq!(creds.password, "s3cret");
        assert!(Credentials::new("acme", "   ").is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let creds = Credentials::new("acme", "s3cret").unwrap();
        assert!(!format!("{:?}", creds).contains("s3cret"));

        let tokens = TokenPair {
            user_id: Some("7".into()),
            access_token: "tok-abc".into(),
            refresh_token: Some("ref-abc".into()),
        };
        let debug = format!("{:?}", tokens);
        assert!(!debug.contains("tok-abc"));
        assert!(!debug.contains("ref-abc"));
    }

    #[tokio::test]
    async fn test_device_id_is_stable_per_tenant() {
        let (auth, store) = create_test_authenticator();
        let tenant = TenantId::new();

        let first = auth.device_id(&tenant).await.unwrap();
        let second = auth.device_id(&tenant).await.unwrap();
        assert_eq!(first, second);

        let ttl = store.ttl_remaining(&SessionKey::device(&tenant)).await.unwrap().unwrap();
        assert!(ttl > Duration::days(29));

        let other = auth.device_id(&TenantId::new()).await.unwrap();
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn test_authorize_without_credentials() {
        let (auth, _) = create_test_authenticator();
        let err = auth.authorize(&TenantId::new()).await.unwrap_err();
        assert!(matches!(err, SyncError::CredentialsNotFound));
    }

    #[tokio::test]
    async fn test_authorize_uses_cached_tokens() {
        let (auth, store) = create_test_authenticator();
        let tenant = TenantId::new();
        let tokens = TokenPair {
            user_id: None,
            access_token: "cached".into(),
            refresh_token: None,
        };
        set_json_with_ttl(store.as_ref(), &SessionKey::tokens(&tenant), &tokens, Duration::hours(1))
            .await
            .unwrap();

        let session = auth.authorize(&tenant).await.unwrap();
        assert_eq!(session.access_token, "cached");
        assert_eq!(auth.state(&tenant).await.unwrap(), AuthState::Authenticated);
    }

    #[tokio::test]
    async fn test_unknown_confirmation_session_is_expired() {
        let (auth, _) = create_test_authenticator();
        let err = auth
            .confirm_otp(&TenantId::new(), &Uuid::new_v4(), "123456")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::SessionExpired));
    }

    #[tokio::test]
    async fn test_logout_keeps_credentials_forget_drops_them() {
        let (auth, _) = create_test_authenticator();
        let tenant = TenantId::new();
        auth.replace_credentials(&tenant, "acme", "pw").await.unwrap();

        auth.logout(&tenant).await.unwrap();
        assert!(auth.has_credentials(&tenant).await.unwrap());

        auth.forget(&tenant).await.unwrap();
        assert!(!auth.has_credentials(&tenant).await.unwrap());
        assert_eq!(auth.state(&tenant).await.unwrap(), AuthState::NoSession);
    }

    #[test]
    fn test_in_flight_guard() {
        let (auth, _) = create_test_authenticator();
        let tenant = TenantId::new();
        {
            let _guard = auth.begin(&tenant);
            assert!(auth.is_in_flight(&tenant));
        }
        assert!(!auth.is_in_flight(&tenant));
    }
}
