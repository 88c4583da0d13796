use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;

use super::CacheService;
use crate::utils::retry::RetryPolicy;

fn open_cache() -> (TempDir, CacheService) {
    let dir = TempDir::new().unwrap();
    let cache = CacheService::new(dir.path().join("cache").to_string_lossy().into_owned());
    cache.connect().unwrap();
    (dir, cache)
}

#[test]
fn set_then_get_returns_value() {
    let (_dir, cache) = open_cache();
    assert!(cache.set("greeting", &json!({ "text": "hello" }), 60));
    assert_eq!(cache.get("greeting"), Some(json!({ "text": "hello" })));
    assert_eq!(cache.get("missing"), None);
}

#[test]
fn expired_entries_are_gone() {
    let (_dir, cache) = open_cache();
    assert!(cache.set("flash", &"sale", 0));
    assert_eq!(cache.get("flash"), None);
    assert!(!cache.exists("flash"));
}

#[test]
fn del_and_exists() {
    let (_dir, cache) = open_cache();
    cache.set("k", &1, 60);
    assert!(cache.exists("k"));
    assert!(cache.del("k"));
    assert!(!cache.exists("k"));
    assert!(cache.del("k"));
}

#[test]
fn disconnected_cache_is_cold() {
    let cache = CacheService::new("unused-path");
    assert!(!cache.is_connected());
    assert!(!cache.set("k", &1, 60));
    assert_eq!(cache.get("k"), None);
    assert!(!cache.del("k"));
    assert!(!cache.exists("k"));
    assert_eq!(cache.incr("k"), 0);
    assert!(cache.mget(&["k"]).is_empty());
    assert!(!cache.flush_all());
}

#[test]
fn incr_counts_from_one_and_rejects_non_integers() {
    let (_dir, cache) = open_cache();
    assert_eq!(cache.incr("views"), 1);
    assert_eq!(cache.incr("views"), 2);

    cache.set("name", &"bob", 60);
    assert_eq!(cache.incr("name"), 0);
    assert_eq!(cache.get("name"), Some(json!("bob")));
}

#[test]
fn mget_keeps_key_order() {
    let (_dir, cache) = open_cache();
    cache.set("a", &1, 60);
    cache.set("c", &3, 60);
    assert_eq!(
        cache.mget(&["a", "b", "c"]),
        vec![Some(json!(1)), None, Some(json!(3))]
    );
}

#[test]
fn expire_shortens_ttl() {
    let (_dir, cache) = open_cache();
    cache.set("k", &1, 3600);
    assert!(cache.expire("k", 0));
    assert_eq!(cache.get("k"), None);
    assert!(!cache.expire("absent", 10));
}

#[test]
fn flush_all_clears_everything() {
    let (_dir, cache) = open_cache();
    cache.set("a", &1, 60);
    cache.set("b", &2, 60);
    assert!(cache.flush_all());
    assert_eq!(cache.mget(&["a", "b"]), vec![None, None]);
}

#[test]
fn domain_helpers_use_namespaced_keys() {
    let (_dir, cache) = open_cache();
    let products = json!([{ "id": "p1" }]);
    assert!(cache.cache_products(&products, "shoes"));
    assert_eq!(cache.get("products:shoes"), Some(products.clone()));
    assert_eq!(cache.get_cached_products("shoes"), Some(products));
    assert_eq!(cache.get_cached_products("hats"), None);

    cache.cache_user_session("u1", &json!({ "token": "t" }));
    assert_eq!(cache.get("session:u1"), Some(json!({ "token": "t" })));
    assert_eq!(cache.get_cached_user_session("u1"), Some(json!({ "token": "t" })));

    cache.cache_cart("u1", &json!({ "items": [] }));
    assert_eq!(cache.get_cached_cart("u1"), Some(json!({ "items": [] })));
}

#[test]
fn disconnect_makes_cache_cold() {
    let (_dir, cache) = open_cache();
    cache.set("k", &"v", 60);
    cache.disconnect();
    assert!(!cache.is_connected());
    assert_eq!(cache.get("k"), None);
}

#[tokio::test]
async fn connect_with_retry_reports_failure() {
    let dir = TempDir::new().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"not a directory").unwrap();
    let cache = CacheService::new(blocker.join("db").to_string_lossy().into_owned());

    let connected = cache
        .connect_with_retry(RetryPolicy::new(2, Duration::from_millis(1)))
        .await;
    assert!(!connected);
    assert!(!cache.is_connected());
}

#[test]
fn concurrent_incr_loses_no_updates() {
    let (_dir, cache) = open_cache();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..200 {
                    assert!(cache.incr("hits") > 0);
                }
            });
        }
    });

    assert_eq!(cache.get("hits"), Some(json!(1600)));
}

#[test]
fn concurrent_expire_and_incr_keep_counter_intact() {
    let (_dir, cache) = open_cache();
    cache.set("visits", &0, 3600);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            for _ in 0..200 {
                cache.incr("visits");
            }
        });
        scope.spawn(|| {
            for _ in 0..200 {
                assert!(cache.expire("visits", 3600));
            }
        });
    });

    assert_eq!(cache.get("visits"), Some(json!(200)));
}

#[test]
fn expired_counter_restarts_at_one() {
    let (_dir, cache) = open_cache();
    cache.set("attempts", &41, 0);
    assert_eq!(cache.incr("attempts"), 1);
    assert!(!cache.expire("gone", 10));
}
