//! Ledger integration tests.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;

use coffer_core::{
    Account, Caller, Conflict, Currency, EconomyError, Page, Role, TransactionFilter,
    TransactionType, UserId,
};
use coffer_engine::{DeductRequest, GrantRequest, TransferRequest};
use coffer_store::{MemoryStore, Store, StoreError};

use common::{RacingStore, TestHarness, CREDITS};

// ============================================================================
// Grant / Deduct
// ============================================================================

#[tokio::test]
async fn admin_grant_on_empty_account() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);

    let tx = harness
        .economy
        .admin
        .grant(&harness.admin, GrantRequest::new(user, CREDITS, 50))
        .await
        .unwrap();

    assert_eq!(tx.amount, 50);
    assert_eq!(tx.balance_after, 50);
    assert_eq!(tx.transaction_type, TransactionType::Grant);

    let account = harness
        .economy
        .ledger
        .account(user, CREDITS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance, 50);
    assert_eq!(account.total_earned, 50);
    assert_eq!(account.total_spent, 0);
    assert_eq!(harness.entries(user).await, 1);
    harness.assert_conserved(user).await;
}

#[tokio::test]
async fn grant_then_deduct_restores_balance() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    harness.fund(user, 40).await;
    let before = harness
        .economy
        .ledger
        .account(user, CREDITS)
        .await
        .unwrap()
        .unwrap();

    harness
        .economy
        .ledger
        .grant(GrantRequest::new(user, CREDITS, 25).with_type(TransactionType::Reward))
        .await
        .unwrap();
    let tx = harness
        .economy
        .ledger
        .deduct(DeductRequest::new(user, CREDITS, 25))
        .await
        .unwrap();
    assert_eq!(tx.amount, -25);
    assert_eq!(tx.balance_after, 40);

    let after = harness
        .economy
        .ledger
        .account(user, CREDITS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.balance, before.balance);
    assert_eq!(after.total_earned - before.total_earned, 25);
    assert_eq!(after.total_spent - before.total_spent, 25);
    harness.assert_conserved(user).await;
}

#[tokio::test]
async fn deduct_without_funds_changes_nothing() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    harness.fund(user, 20).await;

    let err = harness
        .economy
        .ledger
        .deduct(DeductRequest::new(user, CREDITS, 30))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EconomyError::InsufficientFunds {
            balance: 20,
            required: 30,
            ..
        }
    ));
    assert!(err.to_string().contains('◆'));
    assert_eq!(harness.balance(user).await, 20);
    assert_eq!(harness.entries(user).await, 1);
}

#[tokio::test]
async fn deduct_from_unknown_account_leaves_no_account() {
    let harness = TestHarness::new().await;
    let user = UserId::new(9);

    let err = harness
        .economy
        .ledger
        .deduct(DeductRequest::new(user, CREDITS, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EconomyError::InsufficientFunds { .. }));
    assert!(harness
        .economy
        .ledger
        .account(user, CREDITS)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn invalid_amounts_and_types_are_rejected() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    let ledger = &harness.economy.ledger;

    for amount in [0, -5] {
        assert!(matches!(
            ledger.grant(GrantRequest::new(user, CREDITS, amount)).await,
            Err(EconomyError::Validation(_))
        ));
        assert!(matches!(
            ledger.deduct(DeductRequest::new(user, CREDITS, amount)).await,
            Err(EconomyError::Validation(_))
        ));
    }

    assert!(matches!(
        ledger
            .grant(GrantRequest::new(user, CREDITS, 5).with_type(TransactionType::ShopPurchase))
            .await,
        Err(EconomyError::Validation(_))
    ));
    assert!(matches!(
        ledger
            .deduct(DeductRequest::new(user, CREDITS, 5).with_type(TransactionType::Refund))
            .await,
        Err(EconomyError::Validation(_))
    ));
    assert!(matches!(
        ledger.grant(GrantRequest::new(user, " ", 5)).await,
        Err(EconomyError::Validation(_))
    ));
}

#[tokio::test]
async fn transfer_and_shop_types_cannot_be_written_directly() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    harness.fund(user, 50).await;
    let ledger = &harness.economy.ledger;

    for kind in [
        TransactionType::TransferOut,
        TransactionType::ShopPurchase,
        TransactionType::ShopGift,
    ] {
        let err = ledger
            .deduct(DeductRequest::new(user, CREDITS, 5).with_type(kind))
            .await
            .unwrap_err();
        assert!(matches!(err, EconomyError::Validation(_)), "{kind}: {err}");
    }
    assert!(matches!(
        ledger
            .grant(GrantRequest::new(user, CREDITS, 5).with_type(TransactionType::TransferIn))
            .await,
        Err(EconomyError::Validation(_))
    ));

    assert_eq!(harness.balance(user).await, 50);
    assert_eq!(harness.entries(user).await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_grants_all_land() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);

    let grants = (0..20).map(|_| {
        harness
            .economy
            .ledger
            .grant(GrantRequest::new(user, CREDITS, 5))
    });
    for result in join_all(grants).await {
        result.unwrap();
    }

    assert_eq!(harness.balance(user).await, 100);
    assert_eq!(harness.entries(user).await, 20);
    harness.assert_conserved(user).await;
}

// ============================================================================
// Account creation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_account_creation_yields_one_row() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);

    let calls = (0..16).map(|_| harness.economy.ledger.get_or_create_account(user, CREDITS));
    let accounts: Vec<Account> = join_all(calls)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    let first = accounts[0].id;
    assert!(accounts.iter().all(|a| a.id == first));
    assert_eq!(harness.economy.ledger.balances(user).await.unwrap().len(), 1);
}

#[tokio::test]
async fn lost_creation_race_reselects_existing_account() {
    let store = Arc::new(RacingStore::new());
    let script = Arc::clone(&store.script);
    let harness = TestHarness::with_store(store).await;
    let user = UserId::new(7);
    harness.fund(user, 10).await;

    script.hide_next_account.store(true, Ordering::SeqCst);
    harness.fund(user, 5).await;

    assert!(!script.hide_next_account.load(Ordering::SeqCst));
    assert_eq!(harness.economy.ledger.balances(user).await.unwrap().len(), 1);
    assert_eq!(harness.balance(user).await, 15);
    harness.assert_conserved(user).await;
}

#[tokio::test]
async fn memory_store_reports_duplicate_accounts_as_unique_violation() {
    let store = MemoryStore::new();
    let mut unit = store.begin().await.unwrap();
    unit.insert_account(UserId::new(1), CREDITS).await.unwrap();
    let err = unit
        .insert_account(UserId::new(1), CREDITS)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::UniqueViolation { .. }));
}

// ============================================================================
// Transfers
// ============================================================================

#[tokio::test]
async fn transfer_settles_both_sides() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 100).await;

    let receipt = harness
        .economy
        .ledger
        .transfer(TransferRequest::new(alice, bob, CREDITS, 40).with_description("rent"))
        .await
        .unwrap();

    assert_eq!(receipt.debit.amount, -40);
    assert_eq!(receipt.debit.balance_after, 60);
    assert_eq!(receipt.debit.transaction_type, TransactionType::TransferOut);
    assert_eq!(receipt.debit.related_user_id, Some(bob));
    assert_eq!(receipt.credit.amount, 40);
    assert_eq!(receipt.credit.balance_after, 40);
    assert_eq!(receipt.credit.transaction_type, TransactionType::TransferIn);
    assert_eq!(receipt.credit.related_user_id, Some(alice));
    assert_eq!(receipt.credit.description.as_deref(), Some("rent"));

    assert_eq!(harness.balance(alice).await, 60);
    assert_eq!(harness.balance(bob).await, 40);
    harness.assert_conserved(alice).await;
    harness.assert_conserved(bob).await;
}

#[tokio::test]
async fn transfer_without_funds_changes_nothing() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 30).await;
    harness.fund(bob, 5).await;

    let err = harness
        .economy
        .ledger
        .transfer(TransferRequest::new(alice, bob, CREDITS, 31))
        .await
        .unwrap_err();
    assert!(matches!(err, EconomyError::InsufficientFunds { .. }));

    assert_eq!(harness.balance(alice).await, 30);
    assert_eq!(harness.balance(bob).await, 5);
    assert_eq!(harness.entries(alice).await, 1);
    assert_eq!(harness.entries(bob).await, 1);
}

#[tokio::test]
async fn transfer_validation() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 100).await;
    let ledger = &harness.economy.ledger;

    assert!(matches!(
        ledger
            .transfer(TransferRequest::new(alice, alice, CREDITS, 10))
            .await,
        Err(EconomyError::Validation(_))
    ));
    assert!(matches!(
        ledger.transfer(TransferRequest::new(alice, bob, CREDITS, 0)).await,
        Err(EconomyError::Validation(_))
    ));

    let mut credits = Currency::new(CREDITS, "Credits", "◆");
    credits.config.set("min_transfer", json!(10), None);
    harness
        .economy
        .admin
        .upsert_currency(&harness.admin, credits)
        .await
        .unwrap();

    let err = ledger
        .transfer(TransferRequest::new(alice, bob, CREDITS, 5))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("at least 10 ◆"));
    ledger
        .transfer(TransferRequest::new(alice, bob, CREDITS, 10))
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn opposing_transfers_conserve_value() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 100).await;
    harness.fund(bob, 100).await;

    let transfers = (0..10).map(|i| {
        let (from, to) = if i % 2 == 0 { (alice, bob) } else { (bob, alice) };
        harness
            .economy
            .ledger
            .transfer(TransferRequest::new(from, to, CREDITS, 7))
    });
    for result in join_all(transfers).await {
        result.unwrap();
    }

    assert_eq!(harness.balance(alice).await + harness.balance(bob).await, 200);
    harness.assert_conserved(alice).await;
    harness.assert_conserved(bob).await;
}

// ============================================================================
// Frozen accounts & administration
// ============================================================================

#[tokio::test]
async fn frozen_account_accepts_credits_only() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 50).await;

    let account = harness
        .economy
        .admin
        .set_account_frozen(&harness.admin, alice, CREDITS, true)
        .await
        .unwrap();
    assert!(account.is_frozen);

    assert!(matches!(
        harness
            .economy
            .ledger
            .deduct(DeductRequest::new(alice, CREDITS, 5))
            .await,
        Err(EconomyError::Conflict(Conflict::AccountFrozen))
    ));
    assert!(matches!(
        harness
            .economy
            .ledger
            .transfer(TransferRequest::new(alice, bob, CREDITS, 5))
            .await,
        Err(EconomyError::Conflict(Conflict::AccountFrozen))
    ));

    harness.fund(alice, 5).await;
    assert_eq!(harness.balance(alice).await, 55);

    harness
        .economy
        .admin
        .set_account_frozen(&harness.admin, alice, CREDITS, false)
        .await
        .unwrap();
    harness
        .economy
        .ledger
        .deduct(DeductRequest::new(alice, CREDITS, 5))
        .await
        .unwrap();
}

#[tokio::test]
async fn admin_deduct_may_go_negative() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    harness.fund(user, 20).await;

    let tx = harness
        .economy
        .admin
        .deduct(
            &harness.admin,
            DeductRequest::new(user, CREDITS, 30).with_description("chargeback"),
            true,
        )
        .await
        .unwrap();
    assert_eq!(tx.balance_after, -10);

    let account = harness
        .economy
        .ledger
        .account(user, CREDITS)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(account.balance, -10);
    assert_eq!(account.display_balance(), 0);
    harness.assert_conserved(user).await;

    // Without the flag the admin path still enforces funds.
    assert!(matches!(
        harness
            .economy
            .admin
            .deduct(&harness.admin, DeductRequest::new(user, CREDITS, 1), false)
            .await,
        Err(EconomyError::InsufficientFunds { .. })
    ));
}

#[tokio::test]
async fn admin_operations_require_admin_role() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);

    for role in [Role::Member, Role::Moderator] {
        let caller = Caller::new(UserId::new(2), role);
        assert!(matches!(
            harness
                .economy
                .admin
                .grant(&caller, GrantRequest::new(user, CREDITS, 5))
                .await,
            Err(EconomyError::Forbidden)
        ));
        assert!(matches!(
            harness
                .economy
                .admin
                .upsert_currency(&caller, Currency::new("gems", "Gems", "💎"))
                .await,
            Err(EconomyError::Forbidden)
        ));
    }
    assert_eq!(harness.balance(user).await, 0);
}

#[tokio::test]
async fn admin_grant_refuses_inactive_currency() {
    let harness = TestHarness::new().await;
    let mut gems = Currency::new("gems", "Gems", "💎");
    gems.is_active = false;
    harness
        .economy
        .admin
        .upsert_currency(&harness.admin, gems)
        .await
        .unwrap();

    for code in ["gems", "unknown"] {
        assert!(matches!(
            harness
                .economy
                .admin
                .grant(&harness.admin, GrantRequest::new(UserId::new(7), code, 5))
                .await,
            Err(EconomyError::Validation(_))
        ));
    }
    assert!(!harness.economy.currencies.is_currency_active("gems").await.unwrap());
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test]
async fn history_is_newest_first_and_filterable() {
    let harness = TestHarness::new().await;
    let (alice, bob) = (UserId::new(10), UserId::new(11));
    harness.fund(alice, 100).await;
    harness
        .economy
        .ledger
        .transfer(TransferRequest::new(alice, bob, CREDITS, 10))
        .await
        .unwrap();
    harness
        .economy
        .ledger
        .deduct(DeductRequest::new(alice, CREDITS, 5))
        .await
        .unwrap();

    let history = harness
        .economy
        .ledger
        .history(TransactionFilter::for_user(alice))
        .await
        .unwrap();
    let types: Vec<_> = history.iter().map(|tx| tx.transaction_type).collect();
    assert_eq!(
        types,
        [
            TransactionType::Deduct,
            TransactionType::TransferOut,
            TransactionType::Grant
        ]
    );

    let mut filter = TransactionFilter::for_user(alice);
    filter.transaction_type = Some(TransactionType::TransferOut);
    let outgoing = harness.economy.ledger.history(filter).await.unwrap();
    assert_eq!(outgoing.len(), 1);

    let mut paged = TransactionFilter::for_user(alice);
    paged.page = Page::new(1, 1);
    let second = harness.economy.ledger.history(paged).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].transaction_type, TransactionType::TransferOut);
}

#[tokio::test]
async fn balances_and_formatting() {
    let harness = TestHarness::new().await;
    let user = UserId::new(7);
    let mut gems = Currency::new("gems", "Gems", "💎");
    gems.precision = 2;
    harness
        .economy
        .admin
        .upsert_currency(&harness.admin, gems)
        .await
        .unwrap();

    harness.fund(user, 30).await;
    harness
        .economy
        .ledger
        .grant(GrantRequest::new(user, "gems", 1250))
        .await
        .unwrap();

    let balances = harness.economy.ledger.balances(user).await.unwrap();
    let codes: Vec<_> = balances.iter().map(|a| a.currency_code.as_str()).collect();
    assert_eq!(codes, ["credits", "gems"]);

    let currencies = &harness.economy.currencies;
    assert_eq!(currencies.format_amount("gems", 1250).await.unwrap(), "12.50 💎");
    assert_eq!(currencies.display_name("gems").await.unwrap(), "Gems");
    assert_eq!(currencies.list(true).await.unwrap().len(), 2);
}
