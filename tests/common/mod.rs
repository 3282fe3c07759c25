//! Shared fixtures for the integration tests: a wiremock bank and a wired-up
//! authenticator over in-memory storage.

#![allow(dead_code)]

use chrono::{Duration, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use bank_sync::config::{BankConfig, SyncSettings};
use bank_sync::session_store::set_json_with_ttl;
use bank_sync::{
    db, Authenticator, BankClient, BusinessContext, ManualClock, MemorySessionStore,
    SessionKey, SharedConnection, Tenant, TokenPair,
};

pub const BUSINESS_CODE: &str = "B100";
pub const BRANCH: &str = "00873";

pub struct TestBank {
    pub server: MockServer,
    pub clock: ManualClock,
    pub store: MemorySessionStore,
    pub auth: Authenticator,
    pub db: SharedConnection,
    pub tenant: Tenant,
}

impl TestBank {
    /// Mock server, simulated clock, in-memory store and database with one tenant
    pub async fn start() -> Self {
        let server = MockServer::start().await;
        let clock = ManualClock::default();
        let store = MemorySessionStore::with_clock(Arc::new(clock.clone()));
        let client = BankClient::new(BankConfig::for_base_url(server.uri())).unwrap();
        let auth = Authenticator::new(Arc::new(store.clone()), client);

        let db = db::open_shared_in_memory().unwrap();
        let tenant = Tenant::new("Test LLC");
        db::with_connection(&db, |conn| db::insert_tenant(conn, &tenant)).unwrap();

        TestBank {
            server,
            clock,
            store,
            auth,
            db,
            tenant,
        }
    }

    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            page_size: 2,
            ..SyncSettings::for_testing()
        }
    }

    pub fn add_tenant(&self, name: &str) -> Tenant {
        let tenant = Tenant::new(name);
        db::with_connection(&self.db, |conn| db::insert_tenant(conn, &tenant)).unwrap();
        tenant
    }

    /// Put a live token pair in the store, as a completed login would
    pub async fn seed_tokens(&self, tenant: &Tenant) {
        let tokens = TokenPair {
            user_id: Some("7".to_string()),
            access_token: "seeded-access".to_string(),
            refresh_token: Some("seeded-refresh".to_string()),
        };
        set_json_with_ttl(&self.store, &SessionKey::tokens(&tenant.id), &tokens, Duration::hours(12))
            .await
            .unwrap();
    }

    /// Put a business context in the store so no business-list call is made
    pub async fn seed_context(&self, tenant: &Tenant) {
        let context = BusinessContext {
            business_code: BUSINESS_CODE.to_string(),
            branch: BRANCH.to_string(),
        };
        set_json_with_ttl(
            &self.store,
            &SessionKey::business_context(&tenant.id),
            &context,
            Duration::days(30),
        )
        .await
        .unwrap();
    }

    /// Tokens and context in place: syncs go straight to the data endpoints
    pub async fn seed_session(&self, tenant: &Tenant) {
        self.seed_tokens(tenant).await;
        self.seed_context(tenant).await;
    }
}

// ============================================================================
// Response bodies
// ============================================================================

pub fn envelope(result: Value) -> Value {
    json!({ "result": result })
}

pub fn login_tokens(access: &str) -> Value {
    envelope(json!({
        "userId": 7,
        "accessToken": access,
        "refreshToken": format!("{}-refresh", access),
        "needConfirm": false
    }))
}

pub fn login_needs_confirm() -> Value {
    envelope(json!({
        "userId": 7,
        "needConfirm": true,
        "confirmToken": "confirm-token-1",
        "confirmPhone": "+99890*****12"
    }))
}

pub fn account_item(number: &str, balance_minor: i64, currency: &str) -> Value {
    json!({
        "number": number,
        "branch": BRANCH,
        "currency": { "alphaCode": currency },
        "currentBalance": balance_minor
    })
}

pub fn page(items: Vec<Value>, total_pages: u32) -> Value {
    envelope(json!({ "items": items, "totalPages": total_pages }))
}

pub fn id_page(ids: &[&str], total_pages: u32) -> Value {
    page(ids.iter().map(|id| json!({ "id": id })).collect(), total_pages)
}

pub fn payment_order(id: &str, amount_minor: i64, proved_date: &str) -> Value {
    envelope(json!({
        "id": id,
        "provedDate": proved_date,
        "amount": amount_minor,
        "currency": { "alphaCode": "UZS" },
        "receiverName": "Receiver LLC",
        "receiverInnOrPinfl": "301234567",
        "receiverAccountNumber": "20208000100000000001",
        "receiverBranch": "00873",
        "senderName": "Test LLC",
        "senderInn": 309876543,
        "senderAccountNumber": "20208000900123456001",
        "senderBranch": "00873",
        "paymentPurpose": "Payment for services",
        "paymentPurposeCode": "00668",
        "paymentNumber": "15",
        "direction": "out"
    }))
}

// ============================================================================
// Mounts
// ============================================================================

pub fn business_path(suffix: &str) -> String {
    format!("/business/{}/{}/{}", BUSINESS_CODE, BRANCH, suffix)
}

pub async fn mount_login(server: &MockServer, body: Value, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_business_list(server: &MockServer, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path("/business/list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(json!([
            { "businessCode": BUSINESS_CODE, "branch": BRANCH }
        ]))))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_accounts_page(server: &MockServer, page_number: u32, body: Value) {
    Mock::given(method("GET"))
        .and(path(business_path("filtered-accounts")))
        .and(query_param("pageNumber", page_number.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

pub async fn mount_transactions_page(server: &MockServer, page_number: u32, body: Value, expected_calls: u64) {
    Mock::given(method("GET"))
        .and(path(business_path("paymentOrders/inBank")))
        .and(query_param("pageNumber", page_number.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_payment_order(server: &MockServer, id: &str, body: Value) {
    Mock::given(method("GET"))
        .and(path(business_path(&format!("paymentOrders/{}", id))))
        .and(query_param("source", "bank"))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

/// Today as the bank formats `provedDate`
pub fn proved_date() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
}
