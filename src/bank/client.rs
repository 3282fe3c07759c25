// 🏦 Bank Client - typed HTTP surface of the bank's business API
//
// Six endpoints: login, OTP confirm, business list, accounts page,
// payment-order page, payment-order detail. Every request carries the
// provider's client fingerprint headers.

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::models::{
    AccountItem, BusinessInfo, ConfirmRequest, ConfirmResult, Envelope, LoginRequest, LoginResult,
    Page, PaymentOrderDetail, PaymentOrderSummary,
};
use crate::auth::BankSession;
use crate::business::BusinessContext;
use crate::config::BankConfig;
use crate::error::{SyncError, SyncResult};

/// `x-api-version` header value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    V2,
    V4,
}

impl ApiVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiVersion::V2 => "2.0",
            ApiVersion::V4 => "4.0",
        }
    }
}

/// How non-2xx statuses are classified
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointKind {
    Auth,
    Data,
}

#[derive(Clone)]
pub struct BankClient {
    http: reqwest::Client,
    config: BankConfig,
    base_url: String,
}

impl std::fmt::Debug for BankClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BankClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl BankClient {
    pub fn new(config: BankConfig) -> SyncResult<Self> {
        if config.base_url.trim().is_empty() {
            return Err(SyncError::InvalidInput("bank base URL is empty".to_string()));
        }

        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| SyncError::InvalidInput(format!("failed to build HTTP client: {}", e)))?;

        let base_url = config.base_url.trim().trim_end_matches('/').to_string();

        Ok(Self {
            http,
            config,
            base_url,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    // ========================================================================
    // AUTH ENDPOINTS
    // ========================================================================

    /// `POST /auth`
    pub async fn login(&self, device_id: &str, request: &LoginRequest) -> SyncResult<LoginResult> {
        let builder = self
            .request(Method::POST, "/auth", device_id, ApiVersion::V2, None)
            .json(request);
        self.execute(builder, EndpointKind::Auth, "/auth").await
    }

    /// `PUT /auth/confirm`
    pub async fn confirm(
        &self,
        device_id: &str,
        request: &ConfirmRequest,
    ) -> SyncResult<ConfirmResult> {
        let builder = self
            .request(Method::PUT, "/auth/confirm", device_id, ApiVersion::V2, None)
            .json(request);
        self.execute(builder, EndpointKind::Auth, "/auth/confirm")
            .await
    }

    // ========================================================================
    // DATA ENDPOINTS
    // ========================================================================

    /// `GET /business/list`
    pub async fn business_list(&self, session: &BankSession) -> SyncResult<Vec<BusinessInfo>> {
        let no_query: [(&str, &str); 0] = [];
        self.get_data(session, "/business/list".to_string(), ApiVersion::V2, &no_query)
            .await
    }

    /// `GET /business/{code}/{branch}/filtered-accounts`
    pub async fn accounts_page(
        &self,
        session: &BankSession,
        context: &BusinessContext,
        page_number: u32,
        page_size: u32,
    ) -> SyncResult<Page<AccountItem>> {
        let path = format!("{}/filtered-accounts", business_prefix(context));
        self.get_data(session, path, ApiVersion::V2, &paging(page_number, page_size))
            .await
    }

    /// `GET /business/{code}/{branch}/paymentOrders/inBank`
    pub async fn transactions_page(
        &self,
        session: &BankSession,
        context: &BusinessContext,
        page_number: u32,
        page_size: u32,
    ) -> SyncResult<Page<PaymentOrderSummary>> {
        let path = format!("{}/paymentOrders/inBank", business_prefix(context));
        self.get_data(session, path, ApiVersion::V2, &paging(page_number, page_size))
            .await
    }

    /// `GET /business/{code}/{branch}/paymentOrders/{id}?source=bank`
    pub async fn transaction_detail(
        &self,
        session: &BankSession,
        context: &BusinessContext,
        transaction_id: &str,
    ) -> SyncResult<PaymentOrderDetail> {
        let path = format!(
            "{}/paymentOrders/{}",
            business_prefix(context),
            transaction_id
        );
        self.get_data(session, path, ApiVersion::V4, &[("source", "bank")])
            .await
    }

    // ========================================================================
    // PLUMBING
    // ========================================================================

    async fn get_data<T, Q>(
        &self,
        session: &BankSession,
        path: String,
        version: ApiVersion,
        query: &Q,
    ) -> SyncResult<T>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        let builder = self
            .request(
                Method::GET,
                &path,
                &session.device_id,
                version,
                Some(&session.access_token),
            )
            .query(query);
        self.execute(builder, EndpointKind::Data, &path).await
    }

    /// Request with the full provider header set
    fn request(
        &self,
        method: Method,
        path: &str,
        device_id: &str,
        version: ApiVersion,
        bearer: Option<&str>,
    ) -> RequestBuilder {
        let cfg = &self.config;
        let url = format!("{}{}", self.base_url, path);

        let mut builder = self
            .http
            .request(method, url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/plain, */*")
            .header("Accept-Language", cfg.language.as_str())
            .header("Content-Language", content_language(&cfg.language))
            .header("Origin", cfg.origin.as_str())
            .header("User-Agent", cfg.user_agent.as_str())
            .header("x-api-version", version.as_str())
            .header("x-device-info", format!("{} {}", cfg.user_agent, device_id))
            .header(
                "x-user-app",
                format!("name={};version={}", cfg.app_name, cfg.app_version),
            )
            .header(
                "x-user-device",
                format!("id={};type=Desktop;name=Chrome", device_id),
            )
            .header(
                "x-user-os",
                format!("name={};version={}", cfg.os_name, cfg.os_version),
            );

        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }

        builder
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        kind: EndpointKind,
        endpoint: &str,
    ) -> SyncResult<T> {
        let response = builder.send().await?;
        let status = response.status();
        debug!(endpoint, status = status.as_u16(), "bank response");

        let body = response.text().await?;
        let refusal = error_text(&body);

        if !status.is_success() || refusal.is_some() {
            let has_error_body = refusal.is_some();
            let reason = refusal.unwrap_or_else(|| format!("{} returned {}", endpoint, status));
            return Err(classify_status(kind, status, has_error_body, reason));
        }

        let envelope: Envelope<T> = serde_json::from_str(&body).map_err(|e| {
            SyncError::UnexpectedUpstream(format!("undecodable response from {}: {}", endpoint, e))
        })?;

        envelope.result.ok_or_else(|| {
            SyncError::UnexpectedUpstream(format!("response from {} has no result", endpoint))
        })
    }
}

fn business_prefix(context: &BusinessContext) -> String {
    format!("/business/{}/{}", context.business_code, context.branch)
}

fn paging(page_number: u32, page_size: u32) -> [(&'static str, u32); 2] {
    [("pageNumber", page_number), ("pageSize", page_size)]
}

/// `ru-RU` -> `ru`
fn content_language(language: &str) -> &str {
    language.split('-').next().unwrap_or(language)
}

/// Auth endpoints: any client error or `{"error": ...}` body is a refusal,
/// even with a 200 status. Timeouts, throttling and bare 5xx stay transient.
fn classify_status(
    kind: EndpointKind,
    status: StatusCode,
    has_error_body: bool,
    reason: String,
) -> SyncError {
    let code = status.as_u16();
    match kind {
        EndpointKind::Auth => match code {
            408 | 429 => SyncError::TransientNetwork(reason),
            500..=599 if !has_error_body => SyncError::TransientNetwork(reason),
            _ if has_error_body || status.is_client_error() => {
                SyncError::AuthenticationRejected(reason)
            }
            _ => SyncError::UnexpectedUpstream(reason),
        },
        EndpointKind::Data => match code {
            401 | 403 => SyncError::AuthenticationRejected(reason),
            404 => SyncError::NotFound(reason),
            408 | 429 | 500..=599 => SyncError::TransientNetwork(reason),
            _ => SyncError::UnexpectedUpstream(reason),
        },
    }
}

/// Pull a human-readable message out of an `{"error": ...}` body
fn error_text(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .or_else(|| Some(serde_json::Value::Object(map.clone()).to_string())),
        serde_json::Value::Null | serde_json::Value::Bool(false) => None,
        serde_json::Value::String(_) => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_empty_base_url() {
        let err = BankClient::new(BankConfig::default()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BankClient::new(BankConfig::for_base_url("https://bank.example/api/")).unwrap();
        assert_eq!(client.base_url(), "https://bank.example/api");
    }

    #[test]
    fn test_classify_auth_statuses() {
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::CONFLICT,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            let err = classify_status(EndpointKind::Auth, status, false, "bad".into());
            assert!(matches!(err, SyncError::AuthenticationRejected(_)), "{}", status);
        }

        // an error body is a refusal whatever the status
        for status in [StatusCode::OK, StatusCode::INTERNAL_SERVER_ERROR] {
            let err = classify_status(EndpointKind::Auth, status, true, "locked".into());
            assert!(matches!(err, SyncError::AuthenticationRejected(_)), "{}", status);
        }

        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
        ] {
            let err = classify_status(EndpointKind::Auth, status, false, String::new());
            assert!(matches!(err, SyncError::TransientNetwork(_)), "{}", status);
        }
    }

    #[test]
    fn test_classify_data_statuses() {
        // 400 on a data endpoint is not an auth problem
        let err = classify_status(EndpointKind::Data, StatusCode::BAD_REQUEST, true, "bad".into());
        assert!(matches!(err, SyncError::UnexpectedUpstream(_)));

        let err = classify_status(EndpointKind::Data, StatusCode::UNAUTHORIZED, false, "expired".into());
        assert!(matches!(err, SyncError::AuthenticationRejected(_)));

        let err = classify_status(EndpointKind::Data, StatusCode::OK, true, "oops".into());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_transient_statuses() {
        for status in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            let err = classify_status(EndpointKind::Data, status, false, String::new());
            assert!(err.is_retryable(), "{} should be retryable", status);
        }

        let err = classify_status(EndpointKind::Data, StatusCode::NOT_FOUND, false, String::new());
        assert!(matches!(err, SyncError::NotFound(_)));
    }

    #[test]
    fn test_error_text_extraction() {
        assert_eq!(
            error_text(r#"{"error": "Неверный логин или пароль"}"#).as_deref(),
            Some("Неверный логин или пароль")
        );
        assert_eq!(
            error_text(r#"{"error": {"code": 7, "message": "OTP invalid"}}"#).as_deref(),
            Some("OTP invalid")
        );
        assert_eq!(error_text(r#"{"result": null}"#), None);
        assert_eq!(error_text(r#"{"result": {}, "error": null}"#), None);
        assert_eq!(error_text("<html>502</html>"), None);
    }

    #[test]
    fn test_content_language() {
        assert_eq!(content_language("ru-RU"), "ru");
        assert_eq!(content_language("uz"), "uz");
    }
}
