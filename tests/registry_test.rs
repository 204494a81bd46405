//! Tests for the tidepool pool registry

mod common;

use tidepool::error::Error;
use tidepool::registry::PoolRegistry;

use common::{test_config, MockFactory};

// ==================== Create and Lookup Tests ====================

#[tokio::test]
async fn test_create_and_get() {
    let registry = PoolRegistry::new();
    let (_state, factory) = MockFactory::new();
    let config = test_config().with_min_size(1).with_max_size(2);

    let pool = registry.create("main", config, factory).await.unwrap();
    assert_eq!(pool.size(), 1);
    assert_eq!(registry.len(), 1);

    let looked_up = registry.get("main").unwrap();
    assert_eq!(looked_up.size(), 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_duplicate_name_rejected() {
    let registry = PoolRegistry::new();
    let (_state, factory) = MockFactory::new();
    let config = test_config().with_min_size(1).with_max_size(2);

    registry
        .create("main", config.clone(), factory.clone())
        .await
        .unwrap();
    let err = registry.create("main", config, factory).await.unwrap_err();
    assert!(matches!(err, Error::Configuration { .. }));
    assert_eq!(registry.len(), 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_get_unknown_returns_none() {
    let registry = PoolRegistry::new();
    assert!(registry.get("missing").is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_failed_construction_registers_nothing() {
    let registry = PoolRegistry::new();
    let (state, factory) = MockFactory::new();
    state
        .fail_next_connects
        .store(10, std::sync::atomic::Ordering::SeqCst);
    let config = test_config().with_min_size(1).with_max_size(2);

    let err = registry.create("broken", config, factory).await.unwrap_err();
    assert!(matches!(err, Error::ConnectionFailed { .. }));
    assert!(registry.is_empty());
}

// ==================== Close Tests ====================

#[tokio::test]
async fn test_close_removes_and_closes_pool() {
    let registry = PoolRegistry::new();
    let (_state, factory) = MockFactory::new();
    let config = test_config().with_min_size(1).with_max_size(2);

    let pool = registry.create("main", config, factory).await.unwrap();
    assert!(registry.close("main").await);

    assert!(pool.is_closed());
    assert!(registry.get("main").is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_close_unknown_returns_false() {
    let registry = PoolRegistry::new();
    assert!(!registry.close("missing").await);
}

#[tokio::test]
async fn test_close_all() {
    let registry = PoolRegistry::new();
    let (_state, factory) = MockFactory::new();
    let config = test_config().with_min_size(1).with_max_size(2);

    let a = registry
        .create("a", config.clone(), factory.clone())
        .await
        .unwrap();
    let b = registry
        .create("b", config.clone(), factory.clone())
        .await
        .unwrap();
    let c = registry.create("c", config, factory).await.unwrap();
    assert_eq!(registry.len(), 3);

    registry.close_all().await;
    assert!(registry.is_empty());
    assert!(a.is_closed() && b.is_closed() && c.is_closed());
}

#[tokio::test]
async fn test_names() {
    let registry = PoolRegistry::new();
    let (_state, factory) = MockFactory::new();
    let config = test_config().with_min_size(1).with_max_size(2);

    registry
        .create("alpha", config.clone(), factory.clone())
        .await
        .unwrap();
    registry.create("beta", config, factory).await.unwrap();

    let mut names = registry.names();
    names.sort();
    assert_eq!(names, vec!["alpha", "beta"]);

    registry.close_all().await;
}

// ==================== Global Registry Tests ====================

#[tokio::test]
async fn test_global_is_a_singleton() {
    let first = PoolRegistry::global() as *const PoolRegistry;
    let second = PoolRegistry::global() as *const PoolRegistry;
    assert_eq!(first, second);
}
