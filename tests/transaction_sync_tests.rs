//! Transaction discovery and hydration against a mock bank.

mod common;

use common::*;
use rust_decimal::Decimal;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, ResponseTemplate};

use bank_sync::bank::models::PaymentOrderDetail;
use bank_sync::transactions::map_payment_order;
use bank_sync::{
    db, BankSession, BusinessContext, DiscoveryMode, Direction, SyncError, SyncPhase, TenantId,
    TransactionSynchronizer,
};

fn synchronizer(bank: &TestBank) -> TransactionSynchronizer {
    TransactionSynchronizer::new(bank.auth.clone(), bank.db.clone(), bank.settings())
}

fn context() -> BusinessContext {
    BusinessContext {
        business_code: BUSINESS_CODE.to_string(),
        branch: BRANCH.to_string(),
    }
}

async fn session(bank: &TestBank) -> BankSession {
    bank.auth.authorize(&bank.tenant.id).await.unwrap()
}

/// Store ids as if an earlier sync had ingested them
fn preload(bank: &TestBank, tenant: TenantId, ids: &[&str]) {
    let rows: Vec<_> = ids
        .iter()
        .map(|id| map_payment_order(tenant, id, PaymentOrderDetail::default()))
        .collect();
    db::with_connection(&bank.db, |conn| db::insert_transactions(conn, &rows)).unwrap();
}

fn stored_count(bank: &TestBank) -> usize {
    db::with_connection(&bank.db, |conn| db::get_transactions_by_tenant(conn, &bank.tenant.id))
        .unwrap()
        .len()
}

/// Pages 1-2 entirely new, page 3 entirely known, page 4 must not be requested
async fn mount_three_pages_then_known(bank: &TestBank, page_four_calls: u64) {
    mount_transactions_page(&bank.server, 1, id_page(&["A", "B"], 4), 1).await;
    mount_transactions_page(&bank.server, 2, id_page(&["C", "D"], 4), 1).await;
    mount_transactions_page(&bank.server, 3, id_page(&["X", "Y"], 4), 1).await;
    mount_transactions_page(&bank.server, 4, id_page(&["E"], 4), page_four_calls).await;
}

#[tokio::test]
async fn test_discovery_stops_at_first_known_page() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    preload(&bank, bank.tenant.id, &["X", "Y"]);
    mount_three_pages_then_known(&bank, 0).await;

    let sync = synchronizer(&bank);
    assert_eq!(sync.mode(), DiscoveryMode::EarlyStop);
    let discovery = sync.discover(&session(&bank).await, &context()).await.unwrap();

    assert_eq!(discovery.unknown_ids, vec!["A", "B", "C", "D"]);
    assert_eq!(discovery.pages_fetched, 3);
    assert_eq!(discovery.ids_seen, 6);
}

#[tokio::test]
async fn test_exhaustive_discovery_pages_past_known_page() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    preload(&bank, bank.tenant.id, &["X", "Y"]);
    mount_three_pages_then_known(&bank, 1).await;

    let sync = synchronizer(&bank).with_mode(DiscoveryMode::Exhaustive);
    let discovery = sync.discover(&session(&bank).await, &context()).await.unwrap();

    assert_eq!(discovery.unknown_ids, vec!["A", "B", "C", "D", "E"]);
    assert_eq!(discovery.pages_fetched, 4);
}

#[tokio::test]
async fn test_partially_known_page_stops_discovery() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    preload(&bank, bank.tenant.id, &["B"]);
    mount_transactions_page(&bank.server, 1, id_page(&["A", "B"], 3), 1).await;
    mount_transactions_page(&bank.server, 2, id_page(&["C", "D"], 3), 0).await;

    let discovery = synchronizer(&bank)
        .discover(&session(&bank).await, &context())
        .await
        .unwrap();

    assert_eq!(discovery.unknown_ids, vec!["A"]);
    assert_eq!(discovery.pages_fetched, 1);
}

#[tokio::test]
async fn test_ids_repeated_across_pages_collected_once() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    mount_transactions_page(&bank.server, 1, id_page(&["A", "B"], 2), 1).await;
    mount_transactions_page(&bank.server, 2, id_page(&["B", "C"], 2), 1).await;

    let discovery = synchronizer(&bank)
        .with_mode(DiscoveryMode::Exhaustive)
        .discover(&session(&bank).await, &context())
        .await
        .unwrap();

    assert_eq!(discovery.unknown_ids, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_sync_hydrates_and_maps_orders() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    mount_transactions_page(&bank.server, 1, id_page(&["1001"], 1), 1).await;
    mount_payment_order(&bank.server, "1001", payment_order("1001", 250_000, "2024-03-15T10:30:00")).await;

    let result = synchronizer(&bank).sync(&bank.tenant.id).await.unwrap();

    assert_eq!(result.count(), 1);
    assert_eq!(result.report.inserted, 1);

    let stored = db::with_connection(&bank.db, |conn| db::get_transactions_by_tenant(conn, &bank.tenant.id)).unwrap();
    assert_eq!(stored.len(), 1);
    let tx = &stored[0];
    assert_eq!(tx.transaction_id, "1001");
    assert_eq!(tx.payment_amount, Decimal::new(250_000, 2));
    assert_eq!(tx.currency, "UZS");
    assert_eq!(tx.sender_inn.as_deref(), Some("309876543"));
    assert_eq!(tx.receiver_bank_code.as_deref(), Some("00873"));
    assert_eq!(tx.payment_description.as_deref(), Some("Payment for services"));
    assert_eq!(tx.direction, Some(Direction::Out));
    assert_eq!(
        tx.document_date.map(|d| d.to_rfc3339()),
        Some("2024-03-15T10:30:00+00:00".to_string())
    );
}

#[tokio::test]
async fn test_rerun_ingests_nothing_new() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    // Both runs see the same list; details are fetched only on the first
    Mock::given(method("GET"))
        .and(path(business_path("paymentOrders/inBank")))
        .respond_with(ResponseTemplate::new(200).set_body_json(id_page(&["A", "B"], 1)))
        .expect(2)
        .mount(&bank.server)
        .await;
    Mock::given(method("GET"))
        .and(path(business_path("paymentOrders/A")))
        .respond_with(ResponseTemplate::new(200).set_body_json(payment_order("A", 100, &proved_date())))
        .expect(1)
        .mount(&bank.server)
        .await;
    Mock::given(method("GET"))
        .and(path(business_path("paymentOrders/B")))
        .respond_with(ResponseTemplate::new(200).set_body_json(payment_order("B", 200, &proved_date())))
        .expect(1)
        .mount(&bank.server)
        .await;

    let sync = synchronizer(&bank);
    let first = sync.sync(&bank.tenant.id).await.unwrap();
    let second = sync.sync(&bank.tenant.id).await.unwrap();

    assert_eq!(first.report.inserted, 2);
    assert_eq!(second.count(), 0);
    assert_eq!(second.report.inserted, 0);
    assert_eq!(second.pages_fetched, 1);
    assert_eq!(stored_count(&bank), 2);
}

#[tokio::test]
async fn test_malformed_date_keeps_the_row() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    mount_transactions_page(&bank.server, 1, id_page(&["A", "B"], 1), 1).await;
    mount_payment_order(&bank.server, "A", payment_order("A", 100, "15/03/2024 ??")).await;
    mount_payment_order(&bank.server, "B", payment_order("B", 200, "2024-03-15")).await;

    let result = synchronizer(&bank).sync(&bank.tenant.id).await.unwrap();

    assert_eq!(result.report.inserted, 2);
    let a = result.transactions.iter().find(|t| t.transaction_id == "A").unwrap();
    let b = result.transactions.iter().find(|t| t.transaction_id == "B").unwrap();
    assert!(a.document_date.is_none());
    assert!(b.document_date.is_some());
}

#[tokio::test]
async fn test_hydration_failure_stores_nothing() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    mount_transactions_page(&bank.server, 1, id_page(&["A", "B"], 1), 1).await;
    mount_payment_order(&bank.server, "A", payment_order("A", 100, &proved_date())).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/business/.+/paymentOrders/B$"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&bank.server)
        .await;

    let failure = synchronizer(&bank).sync(&bank.tenant.id).await.unwrap_err();

    assert_eq!(failure.phase, SyncPhase::Hydrate);
    assert!(matches!(failure.error, SyncError::TransientNetwork(_)));
    assert_eq!(stored_count(&bank), 0);
}

#[tokio::test]
async fn test_empty_list_is_a_quiet_success() {
    let bank = TestBank::start().await;
    bank.seed_session(&bank.tenant).await;
    mount_transactions_page(&bank.server, 1, id_page(&[], 0), 1).await;

    let result = synchronizer(&bank).sync(&bank.tenant.id).await.unwrap();

    assert_eq!(result.count(), 0);
    assert_eq!(result.pages_fetched, 1);
    assert_eq!(stored_count(&bank), 0);
}
