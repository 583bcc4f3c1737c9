mod support;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use hostguard::engine::{Action, Operator, Predicate, Rule};
use hostguard::store::{OriginType, Route, StoreRegistry, TracingAuditSink};

use support::harness::spawn_waf;

fn rule(id: &str, priority: u32) -> Rule {
    Rule {
        id: id.to_string(),
        name: format!("rule {id}"),
        description: String::new(),
        enabled: true,
        action: Action::Block,
        expression: vec![Predicate {
            field: "request.cf.country".to_string(),
            operator: Operator::Equals,
            value: json!("T1"),
        }],
        tags: Default::default(),
        priority,
        trigger_alert: false,
        block_http_code: None,
    }
}

fn url_route(id: &str, host: &str) -> Route {
    Route {
        id: id.to_string(),
        incoming_host: host.to_string(),
        origin_type: OriginType::Url,
        origin_url: Some("http://origin.example".to_string()),
        origin_service_name: None,
        enabled: true,
    }
}

#[tokio::test]
async fn configuration_survives_a_registry_reopen() -> Result<()> {
    let waf = spawn_waf(HashMap::new()).await?;
    let global = waf.registry.global();
    global.create_rule("tester", rule("persisted", 1)).await?;
    global
        .create_route("tester", url_route("rt-www", "www.domain.com"))
        .await?;
    waf.registry
        .route_store("rt-www")?
        .create_rule("tester", rule("route-scoped", 1))
        .await?;

    // A second registry over the same directory models a process restart.
    let reopened = StoreRegistry::open(&waf.data_dir, Arc::new(TracingAuditSink))?;
    let snapshot = reopened.global().snapshot().await?;
    assert!(snapshot.rule("persisted").is_some());
    assert!(snapshot.rule("adm-rt-www").is_some());
    assert!(snapshot.route("rt-www").is_some());

    let route_snapshot = reopened.route_store("rt-www")?.snapshot().await?;
    assert!(route_snapshot.rule("route-scoped").is_some());
    Ok(())
}

#[tokio::test]
async fn admission_rules_stay_coherent_with_routes() -> Result<()> {
    let waf = spawn_waf(HashMap::new()).await?;
    let global = waf.registry.global();

    let mut route = global
        .create_route("tester", url_route("rt-a", "a.domain.com"))
        .await?;
    global
        .create_route("tester", url_route("rt-b", "b.domain.com"))
        .await?;

    let snapshot = global.snapshot().await?;
    // Every enabled route has an enabled admission rule on its host.
    for (route_id, host) in [("rt-a", "a.domain.com"), ("rt-b", "b.domain.com")] {
        let admission = snapshot
            .rule(&format!("adm-{route_id}"))
            .unwrap_or_else(|| panic!("admission rule for {route_id}"));
        assert!(admission.enabled);
        assert_eq!(admission.action, Action::Allow);
        assert_eq!(admission.expression[0].value, json!(host));
    }

    route.enabled = false;
    global.update_route("tester", "rt-a", route).await?;
    let snapshot = global.snapshot().await?;
    assert!(!snapshot.rule("adm-rt-a").unwrap().enabled);
    assert!(snapshot.rule("adm-rt-b").unwrap().enabled);
    Ok(())
}

#[tokio::test]
async fn evaluate_is_pure_over_a_snapshot() -> Result<()> {
    use hostguard::engine::Outcome;
    use hostguard::request::WafRequest;

    let waf = spawn_waf(HashMap::new()).await?;
    let global = waf.registry.global();
    global.create_rule("tester", rule("tor", 1)).await?;

    let mut meta = serde_json::Map::new();
    meta.insert("country".to_string(), json!("T1"));
    let request = WafRequest {
        method: http::Method::GET,
        target: "/".to_string(),
        host: "www.domain.com".to_string(),
        headers: vec![("host".to_string(), "www.domain.com".to_string())],
        meta,
        peer: "198.51.100.7".parse()?,
        content_length: None,
        chunked: false,
    };

    let first = global.evaluate(&request).await?;
    let second = global.evaluate(&request).await?;
    assert_eq!(first, second);
    assert!(matches!(first, Outcome::Match { ref rule_id, .. } if rule_id == "tor"));
    Ok(())
}

#[tokio::test]
async fn route_store_files_die_with_their_route() -> Result<()> {
    let waf = spawn_waf(HashMap::new()).await?;
    let global = waf.registry.global();
    global
        .create_route("tester", url_route("rt-tmp", "tmp.domain.com"))
        .await?;
    waf.registry
        .route_store("rt-tmp")?
        .create_rule("tester", rule("scoped", 1))
        .await?;

    let db_path = waf.data_dir.join("routes").join("rt-tmp.db");
    assert!(db_path.exists());

    global.delete_route("tester", "rt-tmp").await?;
    waf.registry.drop_route_store("rt-tmp");
    assert!(!db_path.exists());

    // Recreating the route starts from an empty ruleset.
    global
        .create_route("tester", url_route("rt-tmp", "tmp.domain.com"))
        .await?;
    let snapshot = waf.registry.route_store("rt-tmp")?.snapshot().await?;
    assert!(snapshot.rules.is_empty());
    Ok(())
}
