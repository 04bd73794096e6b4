//! Boot from configuration, serve over TCP, shut down.

use accp_config::load_config_from_str;
use accp_server::AccpServer;
use tokio::sync::oneshot;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_serves_proxy_and_admin_until_shutdown() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&upstream)
        .await;

    let yaml = format!(
        r#"
proxy:
  listen: "127.0.0.1:0"
  routes:
    api:
      parameters:
        dsn: "{}"
admin:
  enabled: true
  listen: "127.0.0.1:0"
"#,
        upstream.uri()
    );
    let cfg = load_config_from_str(&yaml).unwrap();
    let bound = AccpServer::bootstrap(&cfg).await.unwrap().bind().await.unwrap();
    let addr = bound.local_addr().unwrap();
    let admin = bound.admin_addr().expect("admin listener");

    let (stop, stopped) = oneshot::channel::<()>();
    let serving = tokio::spawn(bound.serve_until(async move {
        let _ = stopped.await;
    }));

    let client = reqwest::Client::new();
    let res = client
        .get(format!("http://{addr}/api/greeting"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()
            .get("accp-response-source")
            .and_then(|v| v.to_str().ok()),
        Some("back")
    );
    assert!(res.headers().contains_key("x-request-id"));
    assert_eq!(res.text().await.unwrap(), "hello");

    let missing = client
        .get(format!("http://{addr}/nowhere"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    let alive: serde_json::Value = client
        .get(format!("http://{admin}/health/alive"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(alive["status"], "ok");

    let ready = client
        .get(format!("http://{admin}/health/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(ready.status(), 200);

    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_duplicated_route_fails_bootstrap() {
    let yaml = r#"
proxy:
  routes:
    api:
      parameters:
        dsn: "http://127.0.0.1:1"
      routes:
        v1: {}
    api/v1: {}
"#;
    let cfg = load_config_from_str(yaml).unwrap();
    let err = AccpServer::bootstrap(&cfg).await.err().expect("bootstrap fails");
    assert!(format!("{err:#}").contains("registered twice"));
}

#[tokio::test]
async fn test_unreachable_redis_fails_bootstrap() {
    let yaml = r#"
redis:
  enabled: true
  url: "redis://127.0.0.1:1"
  timeout_ms: 200
"#;
    let cfg = load_config_from_str(yaml).unwrap();
    assert!(AccpServer::bootstrap(&cfg).await.is_err());
}
