mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pdae::db::{MemoryRepository, Repository};
use pdae::identifiers::{IdentifierAllocator, IdentifierKind, DEFAULT_PRODUCTS};

fn allocator() -> (Arc<MemoryRepository>, IdentifierAllocator) {
    let repo = Arc::new(MemoryRepository::new());
    let allocator = IdentifierAllocator::new(repo.clone());
    (repo, allocator)
}

#[tokio::test]
async fn init_sequences_seeds_products_and_respects_existing_numbers() {
    let (repo, allocator) = allocator();
    repo.insert_policy(common::policy(1, "WCP", "000007", "CA"));

    let products = allocator.init_sequences().await.unwrap();
    assert_eq!(products.len(), DEFAULT_PRODUCTS.len());

    let tracker = repo.get_tracker("WCP").await.unwrap().unwrap();
    assert_eq!((tracker.last_used, tracker.last_reserved), (7, 7));
    assert_eq!(allocator.reserve("WCP").await.unwrap(), "000008");
    assert_eq!(allocator.reserve("GEN").await.unwrap(), "000001");

    // running it again changes nothing
    allocator.init_sequences().await.unwrap();
    assert_eq!(repo.list_products().await.unwrap().len(), DEFAULT_PRODUCTS.len());
}

#[tokio::test]
async fn issued_bases_are_contiguous_and_unique() {
    let (_repo, allocator) = allocator();
    allocator.init_sequences().await.unwrap();

    let mut numbers = Vec::new();
    for _ in 0..5 {
        let app = allocator.allocate_application("GEN").await.unwrap();
        numbers.push(app.base_number);
    }
    let quote = allocator.allocate_quote("GEN", None).await.unwrap();
    numbers.push(quote.base_number);

    assert_eq!(numbers, (1..=6).collect::<Vec<i32>>());
    assert_eq!(numbers.iter().collect::<HashSet<_>>().len(), numbers.len());
}

#[tokio::test]
async fn derived_identifiers_inherit_their_base() {
    let (_repo, allocator) = allocator();
    allocator.init_sequences().await.unwrap();

    let app = allocator.allocate_application("AUT").await.unwrap();
    assert_eq!(app.to_string(), "APP-AUT-000001-00");

    let quote = allocator.allocate_quote("AUT", Some(&app)).await.unwrap();
    assert_eq!(quote.to_string(), "QTE-AUT-000001-00");

    let revised = allocator.revise_quote(&quote).await.unwrap();
    assert_eq!(revised.to_string(), "QTE-AUT-000001-00-01");

    let policy = allocator.policy_from_quote(&revised);
    assert_eq!(policy.kind, IdentifierKind::Policy);
    assert_eq!(policy.to_string(), "POL-AUT-000001-00");

    let renewal = allocator.renewal_of(&policy).unwrap();
    assert_eq!(renewal.to_string(), "POL-AUT-000001-01");
}

#[tokio::test]
async fn last_base_number_is_usable_and_then_exhausted() {
    let (repo, allocator) = allocator();
    allocator.init_sequences().await.unwrap();
    repo.record_reference("UMB", 999_998, None);
    repo.init_tracker("UMB").await.unwrap();

    assert_eq!(allocator.reserve("UMB").await.unwrap(), "999999");
    let err = allocator.reserve("UMB").await.unwrap_err();
    assert_eq!(err.kind(), "sequence_exhausted");
}

#[tokio::test]
async fn unknown_products_cannot_reserve() {
    let (_repo, allocator) = allocator();
    let err = allocator.reserve("XYZ").await.unwrap_err();
    assert_eq!(err.kind(), "product_unknown");
}

#[tokio::test]
async fn sweep_releases_unconfirmed_reservations() {
    let (repo, allocator) = allocator();
    allocator.init_sequences().await.unwrap();

    allocator.reserve("PRO").await.unwrap();
    allocator.reserve("PRO").await.unwrap();
    assert!(allocator.sweep(Duration::from_secs(3600)).await.unwrap().is_empty());

    let reset = allocator.sweep(Duration::ZERO).await.unwrap();
    assert_eq!(reset, vec!["PRO".to_string()]);
    let tracker = repo.get_tracker("PRO").await.unwrap().unwrap();
    assert_eq!((tracker.last_used, tracker.last_reserved), (0, 0));
    assert_eq!(allocator.reserve("PRO").await.unwrap(), "000001");
}

#[tokio::test]
async fn confirmed_bases_survive_the_sweep() {
    let (repo, allocator) = allocator();
    allocator.init_sequences().await.unwrap();

    let base = allocator.reserve("COM").await.unwrap();
    allocator.confirm("COM", &base).await.unwrap();
    assert!(allocator.sweep(Duration::ZERO).await.unwrap().is_empty());

    let tracker = repo.get_tracker("COM").await.unwrap().unwrap();
    assert_eq!((tracker.last_used, tracker.last_reserved), (1, 1));

    let err = allocator.confirm("COM", "12ab").await.unwrap_err();
    assert_eq!(err.kind(), "validation_error");
}
