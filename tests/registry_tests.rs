use async_trait::async_trait;
use hyper::{Body, Request, Response};
use std::collections::HashMap;
use std::sync::Arc;

use vgate::config::HandlerConfig;
use vgate::error::VgateError;
use vgate::proxy::Handler;
use vgate::registry::HandlerRegistry;

/// Wrapper handler used to build reference chains in tests: resolves its
/// target at configuration time and delegates every request to it
struct Delegate {
    inner: vgate::proxy::SharedHandler,
}

#[async_trait]
impl Handler for Delegate {
    async fn handle(&self, req: Request<Body>) -> Response<Body> {
        self.inner.handle(req).await
    }
}

/// Leaf handler answering a fixed body
struct FixedBody(&'static str);

#[async_trait]
impl Handler for FixedBody {
    async fn handle(&self, _req: Request<Body>) -> Response<Body> {
        Response::new(Body::from(self.0))
    }
}

fn delegate_config(target: &str) -> HandlerConfig {
    serde_json::from_value(serde_json::json!({
        "Type": "delegate",
        "Config": { "Target": target }
    }))
    .unwrap()
}

fn registry_with_delegates(configs: HashMap<String, HandlerConfig>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new(configs);
    registry.register_type("delegate", |_name, cfg, registry| {
        let target = cfg
            .get("Target")
            .and_then(|v| v.as_str())
            .ok_or_else(|| VgateError::config("delegate requires Target"))?;
        let inner = registry.handler_by_name(target)?;
        Ok(Arc::new(Delegate { inner }) as vgate::proxy::SharedHandler)
    });
    registry
}

async fn body_of(handler: &vgate::proxy::SharedHandler) -> String {
    let resp = handler
        .handle(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await;
    let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_chain_resolves_through_three_handlers() {
    let mut registry = registry_with_delegates(HashMap::from([
        ("h1".to_string(), delegate_config("h2")),
        ("h2".to_string(), delegate_config("h3")),
    ]));
    registry.register_static("h3", Arc::new(FixedBody("3")));

    let handler = registry.handler_by_name("h1").unwrap();
    assert_eq!(body_of(&handler).await, "3");
}

#[tokio::test]
async fn test_dag_references_are_fine() {
    // Diamond: both branches share a leaf; not a cycle
    let mut registry = registry_with_delegates(HashMap::from([
        ("left".to_string(), delegate_config("leaf")),
        ("right".to_string(), delegate_config("leaf")),
    ]));
    registry.register_static("leaf", Arc::new(FixedBody("leaf")));

    let left = registry.handler_by_name("left").unwrap();
    let right = registry.handler_by_name("right").unwrap();
    assert_eq!(body_of(&left).await, "leaf");
    assert_eq!(body_of(&right).await, "leaf");
}

#[tokio::test]
async fn test_two_node_cycle_fails_with_path() {
    let mut registry = registry_with_delegates(HashMap::from([
        ("h1".to_string(), delegate_config("h2")),
        ("h2".to_string(), delegate_config("h1")),
    ]));

    let err = registry.handler_by_name("h1").unwrap_err();
    match err {
        VgateError::HandlerCycle { name, path } => {
            assert_eq!(name, "h1");
            assert!(path.contains("h1 -> h2"));
        }
        other => panic!("expected HandlerCycle, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cycle_failure_does_not_poison_registry() {
    let mut registry = registry_with_delegates(HashMap::from([
        ("bad".to_string(), delegate_config("bad")),
        ("good".to_string(), delegate_config("leaf")),
    ]));
    registry.register_static("leaf", Arc::new(FixedBody("ok")));

    assert!(registry.handler_by_name("bad").is_err());
    // Resolution state was unwound; unrelated handlers still configure
    let good = registry.handler_by_name("good").unwrap();
    assert_eq!(body_of(&good).await, "ok");
}

#[tokio::test]
async fn test_memoized_resolution_shares_instances() {
    let mut registry = registry_with_delegates(HashMap::from([
        ("a".to_string(), delegate_config("shared")),
        ("b".to_string(), delegate_config("shared")),
        (
            "shared".to_string(),
            serde_json::from_value(serde_json::json!({
                "Type": "Redirect",
                "Config": { "URL": "https://example.com/", "Code": 302 }
            }))
            .unwrap(),
        ),
    ]));

    registry.handler_by_name("a").unwrap();
    registry.handler_by_name("b").unwrap();
    let first = registry.handler_by_name("shared").unwrap();
    let second = registry.handler_by_name("shared").unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}
