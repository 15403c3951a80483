//! End-to-end reservation lifecycle tests over the in-memory gateway

use std::sync::Arc;

use chrono::Duration;
use rust_decimal_macros::dec;
use uuid::Uuid;

use flashsale_core::bus::{settle, Disposition, Envelope, EventHandler, EventType, HandlerError, NullPublisher};
use flashsale_core::config::{ReservationConfig, SweeperConfig};
use flashsale_core::models::{ItemStatus, NewItem};
use flashsale_core::notification::{MailTransport, NotificationWorker, RenderedEmail, TemplateRegistry};
use flashsale_core::storage::StorageGateway;
use flashsale_core::{
    Error, ExpirationSweeper, ExpireOutcome, Item, MemoryGateway, ReservationEngine,
    ReservationStatus,
};

fn engine_over(gateway: MemoryGateway) -> Arc<ReservationEngine> {
    Arc::new(ReservationEngine::new(
        Arc::new(gateway),
        Arc::new(NullPublisher),
        ReservationConfig::default(),
    ))
}

async fn seed_item(gw: &MemoryGateway, stock: i32, max_per_user: i32) -> Item {
    gw.insert_item(&NewItem {
        sku: format!("SKU-{}", Uuid::new_v4()),
        name: "Limited Widget".to_string(),
        price: dec!(49.90),
        original_price: Some(dec!(99.90)),
        stock,
        status: ItemStatus::Active,
        image_url: None,
        sale_start: None,
        sale_end: None,
        max_per_user,
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn per_user_cap_gates_before_stock() {
    // stock=10, max_per_user=5: a request for 6 trips the cap for every
    // user, stock is never touched
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());

    let first = engine.create_reservation(Uuid::new_v4(), item.id, 6).await;
    let second = engine.create_reservation(Uuid::new_v4(), item.id, 6).await;

    assert!(matches!(first, Err(Error::PreconditionFailed(_))));
    assert!(matches!(second, Err(Error::PreconditionFailed(_))));

    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.reserved_stock, 0);
    assert_eq!(after.available_stock, 10);
}

#[tokio::test]
async fn hundred_buyers_one_unit() {
    // stock=1, 100 concurrent create(qty=1): exactly one Pending hold,
    // everyone else sees InsufficientStock
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 1, 5).await;
    let engine = engine_over(gw.clone());

    let mut handles = Vec::new();
    for _ in 0..100 {
        let engine = Arc::clone(&engine);
        let item_id = item.id;
        handles.push(tokio::spawn(async move {
            engine.create_reservation(Uuid::new_v4(), item_id, 1).await
        }));
    }

    let mut committed = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => committed += 1,
            Err(Error::InsufficientStock { .. }) => insufficient += 1,
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(committed, 1);
    assert_eq!(insufficient, 99);

    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.reserved_stock, 1);
    assert_eq!(after.available_stock, 0);
    assert!(after.counts_consistent());

    let stats = engine.reservation_stats(None).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn no_interleaving_oversells() {
    // stock=5, max_per_user=1, 50 distinct buyers racing: at most 5 units
    // ever committed Pending+Confirmed
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 5, 1).await;
    let engine = engine_over(gw.clone());

    let mut handles = Vec::new();
    for _ in 0..50 {
        let engine = Arc::clone(&engine);
        let item_id = item.id;
        handles.push(tokio::spawn(async move {
            engine.create_reservation(Uuid::new_v4(), item_id, 1).await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Ok(res) = handle.await.unwrap() {
            winners.push(res);
        }
    }
    assert_eq!(winners.len(), 5);

    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.reserved_stock, 5);
    assert_eq!(after.available_stock, 0);

    // Each winner holds a distinct code
    let mut codes: Vec<_> = winners.iter().map(|r| r.reservation_code.clone()).collect();
    codes.sort();
    codes.dedup();
    assert_eq!(codes.len(), 5);
}

#[tokio::test]
async fn create_then_cancel_restores_available() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 10).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let before = gw.find_item(item.id).await.unwrap().available_stock;
    let res = engine.create_reservation(user, item.id, 7).await.unwrap();
    assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, before - 7);

    engine.cancel_reservation(user, res.id, None).await.unwrap();
    assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, before);
}

#[tokio::test]
async fn sweeper_releases_expired_hold() {
    // Pending qty=3 past its deadline: one tick expires it and returns the
    // units to the available bucket
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let res = engine.create_reservation(user, item.id, 3).await.unwrap();
    assert_eq!(gw.find_item(item.id).await.unwrap().reserved_stock, 3);

    // Force the deadline into the past the way an operator clock would see it
    let past = res.expires_at + Duration::seconds(1);
    let outcome = engine.expire_reservation(res.id, past).await.unwrap();
    assert!(matches!(outcome, ExpireOutcome::Expired(_)));

    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.reserved_stock, 0);
    assert_eq!(after.available_stock, 10);

    let swept = gw.find_reservation(res.id).await.unwrap();
    assert_eq!(swept.status, ReservationStatus::Expired);

    // Terminal states are never left: a confirm attempt is rejected
    let err = engine.confirm_reservation(user, res.id).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn confirm_consumes_stock_and_blocks_cancel() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let res = engine.create_reservation(user, item.id, 4).await.unwrap();
    let confirmed = engine.confirm_reservation(user, res.id).await.unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert!(confirmed.confirmed_at.is_some());

    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.stock, 6);
    assert_eq!(after.reserved_stock, 0);
    assert_eq!(after.available_stock, 6);

    let err = engine.cancel_reservation(user, res.id, None).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn quantity_boundary_at_available_stock() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 8, 20).await;
    let engine = engine_over(gw.clone());

    // quantity = available + 1 fails and changes nothing
    let err = engine
        .create_reservation(Uuid::new_v4(), item.id, 9)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientStock { available: 8, requested: 9 }));
    assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, 8);

    // quantity = available succeeds and drains the bucket to zero
    let res = engine.create_reservation(Uuid::new_v4(), item.id, 8).await.unwrap();
    assert_eq!(res.quantity, 8);
    assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, 0);
}

#[tokio::test]
async fn admin_cancel_empty_reason_changes_nothing() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let res = engine.create_reservation(user, item.id, 2).await.unwrap();

    let err = engine
        .admin_cancel_reservation(Uuid::new_v4(), res.id, "")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Reservation and stock untouched
    let unchanged = gw.find_reservation(res.id).await.unwrap();
    assert_eq!(unchanged.status, ReservationStatus::Pending);
    assert_eq!(gw.find_item(item.id).await.unwrap().reserved_stock, 2);

    // With a reason the cancel goes through, prefixed
    let cancelled = engine
        .admin_cancel_reservation(Uuid::new_v4(), res.id, "sale ended early")
        .await
        .unwrap();
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("Admin cancelled: sale ended early")
    );
    assert_eq!(gw.find_item(item.id).await.unwrap().reserved_stock, 0);
}

#[tokio::test]
async fn sweeper_tick_twice_same_outcomes() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 20, 20).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    // Three holds that will be overdue, one that stays live
    let mut overdue = Vec::new();
    for _ in 0..3 {
        overdue.push(engine.create_reservation(user, item.id, 2).await.unwrap());
    }
    let live = engine.create_reservation(user, item.id, 2).await.unwrap();

    // Expire the overdue holds directly at a future instant
    let later = overdue[0].expires_at + Duration::seconds(30);
    for res in &overdue {
        engine.expire_reservation(res.id, later).await.unwrap();
    }

    let sweeper = Arc::new(ExpirationSweeper::new(
        Arc::clone(&engine),
        SweeperConfig::default(),
    ));

    // Both ticks see the same terminal world and change nothing further
    let first = sweeper.tick_now().await;
    assert_eq!(first.expired, 0);
    let second = sweeper.tick_now().await;
    assert_eq!(second.expired, 0);

    for res in &overdue {
        assert_eq!(
            gw.find_reservation(res.id).await.unwrap().status,
            ReservationStatus::Expired
        );
    }
    assert_eq!(
        gw.find_reservation(live.id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(gw.find_item(item.id).await.unwrap().reserved_stock, 2);
}

#[tokio::test]
async fn expired_reservation_cannot_confirm() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let res = engine.create_reservation(user, item.id, 1).await.unwrap();
    engine
        .expire_reservation(res.id, res.expires_at + Duration::seconds(1))
        .await
        .unwrap();

    let err = engine.confirm_reservation(user, res.id).await.unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
    assert_eq!(gw.find_item(item.id).await.unwrap().available_stock, 10);
}

#[tokio::test]
async fn listing_filters_by_status_and_pages() {
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 50, 50).await;
    let engine = engine_over(gw);
    let user = Uuid::new_v4();

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(engine.create_reservation(user, item.id, 1).await.unwrap().id);
    }
    engine.confirm_reservation(user, ids[0]).await.unwrap();
    engine.cancel_reservation(user, ids[1], None).await.unwrap();

    let pending = engine
        .list_user_reservations(user, Some(ReservationStatus::Pending))
        .await
        .unwrap();
    assert_eq!(pending.len(), 3);

    let all = engine.list_user_reservations(user, None).await.unwrap();
    assert_eq!(all.len(), 5);

    let page = engine
        .list_reservations(&flashsale_core::ReservationFilter {
            user_id: Some(user),
            page: 1,
            per_page: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.total, 5);
}

/// A mailer that records instead of dispatching
struct SinkMailer(std::sync::Mutex<Vec<String>>);

#[async_trait::async_trait]
impl MailTransport for SinkMailer {
    async fn send(&self, to: &str, _email: &RenderedEmail) -> flashsale_core::Result<()> {
        self.0.lock().unwrap().push(to.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn malformed_email_event_dead_letters_without_retry() {
    // Wire-level scenario: {type: "verification", to: "x@y", data: {}} with
    // the token missing goes straight to the DLQ
    let mailer = Arc::new(SinkMailer(std::sync::Mutex::new(Vec::new())));
    let worker =
        NotificationWorker::new(TemplateRegistry::new().unwrap(), Arc::clone(&mailer) as _);

    let envelope = Envelope::new(EventType::Verification, "x@y", serde_json::json!({}));
    let outcome = worker.handle(&envelope).await;
    assert!(matches!(outcome, Err(HandlerError::Discard(_))));

    let disposition = settle(envelope, outcome, 3);
    match disposition {
        Disposition::DeadLetter(dlq) => {
            assert!(dlq.error.contains("user_name"));
            assert_eq!(dlq.original["type"], "verification");
        }
        other => panic!("expected dead letter, got {:?}", other),
    }
    assert!(mailer.0.lock().unwrap().is_empty());
}

#[tokio::test]
async fn expire_cancel_race_settles_once() {
    // An owner cancel racing the sweeper's expire: exactly one transition
    // wins and stock is released exactly once
    let gw = MemoryGateway::new();
    let item = seed_item(&gw, 10, 5).await;
    let engine = engine_over(gw.clone());
    let user = Uuid::new_v4();

    let res = engine.create_reservation(user, item.id, 4).await.unwrap();
    let past = res.expires_at + Duration::seconds(1);

    let cancel_engine = Arc::clone(&engine);
    let cancel = tokio::spawn(async move {
        cancel_engine.cancel_reservation(user, res.id, None).await
    });
    let expire_engine = Arc::clone(&engine);
    let expire =
        tokio::spawn(async move { expire_engine.expire_reservation(res.id, past).await });

    let cancel_result = cancel.await.unwrap();
    let expire_result = expire.await.unwrap().unwrap();

    let final_status = gw.find_reservation(res.id).await.unwrap().status;
    match (&cancel_result, &expire_result) {
        (Ok(_), ExpireOutcome::AlreadyTerminal(_)) => {
            assert_eq!(final_status, ReservationStatus::Cancelled)
        }
        (Err(Error::PreconditionFailed(_)), ExpireOutcome::Expired(_)) => {
            assert_eq!(final_status, ReservationStatus::Expired)
        }
        other => panic!("unexpected race outcome: {:?}", other),
    }

    // Either way the hold was released exactly once
    let after = gw.find_item(item.id).await.unwrap();
    assert_eq!(after.reserved_stock, 0);
    assert_eq!(after.available_stock, 10);
}
