//! End-to-end request flows against a mocked upstream.

mod common;

use accp_server::store::{MemoryStore, SecondaryStore};
use common::{Counting, eventually, get, get_with, proxy};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn users_route(dsn: &str, extra: &str) -> String {
    format!(
        r#"
proxy:
  routes:
    api:
      routes:
        v1/users:
          parameters:
            dsn: "{dsn}"
            methods: [GET]
{extra}
"#
    )
}

#[tokio::test]
async fn test_cache_miss_then_hit() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"hello":"world"}"#))
        .expect(1)
        .mount(&upstream)
        .await;

    let extra = "            cache:\n              memory:\n                ttl: 5s\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    let first = get(&proxy.app, "/api/v1/users").await;
    let second = get(&proxy.app, "/api/v1/users").await;

    assert_eq!(first.status, 200);
    assert_eq!(first.text(), r#"{"hello":"world"}"#);
    assert_eq!(first.header("accp-response-source"), Some("back"));
    assert_eq!(second.body, first.body);
    assert_eq!(second.header("accp-response-source"), Some("cache"));
    assert_eq!(
        second.header("accp-refreshed"),
        first.header("accp-refreshed")
    );
    assert_eq!(
        second.header("accp-response-uuid"),
        first.header("accp-response-uuid")
    );
}

#[tokio::test]
async fn test_concurrent_identical_requests_share_one_upstream_call() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/users"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("slow")
                .set_delay(Duration::from_millis(500)),
        )
        .expect(1)
        .mount(&upstream)
        .await;

    let proxy = proxy(&users_route(&upstream.uri(), ""));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let app = proxy.app.clone();
        tasks.push(tokio::spawn(
            async move { get(&app, "/api/v1/users").await },
        ));
    }

    let mut uuids = HashSet::new();
    for task in tasks {
        let reply = task.await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.text(), "slow");
        uuids.insert(reply.header("accp-response-uuid").unwrap().to_string());
    }
    assert_eq!(uuids.len(), 1);

    let route = proxy.router.find("/api/v1/users").unwrap();
    assert!(route.flights().is_empty());
}

#[tokio::test]
async fn test_error_response_cached_for_ttl_err() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&upstream)
        .await;

    let extra = "            cache:\n              memory:\n                ttl: 60s\n                ttl_err: 1s\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    let first = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(first.status, 500);
    assert_eq!(first.text(), "boom");

    let second = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(second.status, 500);
    assert_eq!(second.header("accp-response-source"), Some("cache"));
    assert_eq!(upstream.received_requests().await.unwrap().len(), 1);

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let third = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(third.status, 200);
    assert_eq!(third.text(), "recovered");
    assert_eq!(upstream.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_limit_reached_on_third_request() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .expect(2)
        .mount(&upstream)
        .await;

    let extra = r#"            limits:
              token:
                header_names: [Authorization]
                max_counter: 2
                ttl: 10s
"#;
    let proxy = proxy(&users_route(&upstream.uri(), extra));
    let auth = [("authorization", "Bearer T")];

    let first = get_with(&proxy.app, "/api/v1/users", &auth).await;
    let second = get_with(&proxy.app, "/api/v1/users", &auth).await;
    let third = get_with(&proxy.app, "/api/v1/users", &auth).await;

    assert_eq!(first.status, 200);
    assert_eq!(first.header("accp-response-source"), Some("back"));
    assert_eq!(second.status, 200);
    assert_eq!(second.header("accp-response-source"), Some("cache"));
    assert_eq!(third.status, 429);
    assert_eq!(third.text(), "limit reached");

    // Another caller has its own budget
    let other = get_with(&proxy.app, "/api/v1/users", &[("authorization", "Bearer U")]).await;
    assert_eq!(other.status, 200);
}

#[tokio::test]
async fn test_inactive_token_is_rejected_before_upstream() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&upstream)
        .await;

    let auth = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/introspect"))
        .and(body_string_contains("token=T"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"active":false}"#))
        .expect(1)
        .mount(&auth)
        .await;

    let yaml = format!(
        r#"
introspector:
  dsn: "{auth}"
  endpoint: /introspect
proxy:
  routes:
    api:
      parameters:
        dsn: "{upstream}"
        introspect: true
"#,
        auth = auth.uri(),
        upstream = upstream.uri()
    );
    let proxy = common::proxy_with(&yaml, |deps| {
        let cfg = accp_config::load_config_from_str(&yaml).unwrap();
        let introspector = accp_server::introspect::Introspector::new(&cfg.introspector).unwrap();
        deps.with_introspector(std::sync::Arc::new(introspector))
    });

    let reply = get_with(&proxy.app, "/api/items", &[("authorization", "Bearer T")]).await;
    assert_eq!(reply.status, 401);
    assert_eq!(reply.text(), "unauthorized");

    let route = proxy.router.find("/api/items").unwrap();
    assert!(route.cache().unwrap().memory().is_empty());
}

#[tokio::test]
async fn test_counter_refresh_updates_entry() {
    let upstream = MockServer::start().await;
    let counting = Counting::default();
    Mock::given(method("GET"))
        .respond_with(counting.clone())
        .mount(&upstream)
        .await;

    let extra = "            refresh:\n              max_count: 3\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");
    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");
    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");

    // The third hit is due; it is still served the old entry
    let fourth = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(fourth.text(), "v=1");
    assert!(eventually(|| counting.calls() == 2).await);

    let route = proxy.router.find("/api/v1/users").unwrap();
    let cache = route.cache().unwrap();
    let settle = || {
        let mut refreshed = false;
        cache.memory().range(|_, entry| {
            refreshed |= entry.response.body.as_ref() == b"v=2";
        });
        refreshed
    };
    assert!(eventually(settle).await);

    let fifth = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(fifth.text(), "v=2");
    assert_eq!(fifth.header("accp-response-source"), Some("cache"));
    assert_eq!(counting.calls(), 2);
}

#[tokio::test]
async fn test_recreated_entry_counts_hits_from_zero() {
    let upstream = MockServer::start().await;
    let counting = Counting::default();
    Mock::given(method("GET"))
        .respond_with(counting.clone())
        .mount(&upstream)
        .await;

    let extra = "            cache:\n              memory:\n                ttl: 1s\n            refresh:\n              max_count: 3\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");
    get(&proxy.app, "/api/v1/users").await;
    get(&proxy.app, "/api/v1/users").await;

    tokio::time::sleep(Duration::from_millis(1300)).await;

    let recreated = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(recreated.text(), "v=2");
    assert_eq!(recreated.header("accp-response-source"), Some("back"));

    // First hit on the new entry, two short of a refresh
    let hit = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(hit.header("accp-response-source"), Some("cache"));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counting.calls(), 2);
}

#[tokio::test]
async fn test_counters_of_expired_entries_are_pruned() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&upstream)
        .await;

    let extra = "            cache:\n              memory:\n                ttl: 500ms\n                ttl_err: 200ms\n            refresh:\n              max_count: 5\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    for _ in 0..3 {
        get(&proxy.app, "/api/v1/users").await;
    }
    let route = proxy.router.find("/api/v1/users").unwrap();
    assert_eq!(route.refresher().tracked(), 1);

    assert!(eventually(|| route.refresher().tracked() == 0).await);
}

#[tokio::test]
async fn test_period_refresh_replaces_entries() {
    let upstream = MockServer::start().await;
    let counting = Counting::default();
    Mock::given(method("GET"))
        .respond_with(counting.clone())
        .mount(&upstream)
        .await;

    let extra = "            refresh:\n              period: 300ms\n";
    let proxy = proxy(&users_route(&upstream.uri(), extra));

    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");
    assert!(eventually(|| counting.calls() >= 2).await);

    let route = proxy.router.find("/api/v1/users").unwrap();
    let cache = route.cache().unwrap();
    let refreshed = || {
        let mut seen = false;
        cache.memory().range(|_, entry| {
            seen |= entry.response.body.as_ref() != b"v=1";
        });
        seen
    };
    assert!(eventually(refreshed).await);

    let reply = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(reply.header("accp-response-source"), Some("cache"));
    assert_ne!(reply.text(), "v=1");
}

#[tokio::test]
async fn test_failed_refresh_evicts_both_tiers() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("v=1"))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&upstream)
        .await;

    let store = Arc::new(MemoryStore::new());
    let shared: Arc<dyn SecondaryStore> = store.clone();
    let extra = "            pool:\n              timeout: 300ms\n            refresh:\n              max_count: 2\n";
    let proxy = common::proxy_with(&users_route(&upstream.uri(), extra), |deps| {
        deps.with_store(shared.clone())
    });

    assert_eq!(get(&proxy.app, "/api/v1/users").await.text(), "v=1");
    assert!(!store.is_empty());

    // The second hit is due; the replay times out
    let hit = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(hit.header("accp-response-source"), Some("cache"));
    let due = get(&proxy.app, "/api/v1/users").await;
    assert_eq!(due.text(), "v=1");

    let route = proxy.router.find("/api/v1/users").unwrap();
    let cache = route.cache().unwrap();
    assert!(eventually(|| cache.memory().is_empty() && store.is_empty()).await);
}
