use std::collections::BTreeSet;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{db, AuditRecord, StoreError, TenantStore};
use crate::engine::model::{ROUTE_ADMISSION_TAG, ROUTE_LINK_TAG_PREFIX};
use crate::engine::{Action, Operator, Predicate, Rule};

/// Where an admitted request is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Service,
    Url,
}

/// One tenant's entry in the global route directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub id: String,
    /// Exact FQDN or left-wildcard `*.suffix`; stored lowercased, unique.
    pub incoming_host: String,
    pub origin_type: OriginType,
    #[serde(default)]
    pub origin_url: Option<String>,
    #[serde(default)]
    pub origin_service_name: Option<String>,
    pub enabled: bool,
}

/// A route's origin once its record has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedOrigin {
    Url(String),
    Service(String),
}

impl Route {
    /// Validated origin accessor. A row that lost its URL or service name
    /// (however that happened) resolves to a misconfiguration, not a panic.
    pub fn origin(&self) -> Result<ResolvedOrigin, String> {
        match self.origin_type {
            OriginType::Url => self
                .origin_url
                .as_ref()
                .filter(|url| !url.is_empty())
                .map(|url| ResolvedOrigin::Url(url.clone()))
                .ok_or_else(|| format!("route '{}' has origin_type=url but no origin_url", self.id)),
            OriginType::Service => self
                .origin_service_name
                .as_ref()
                .filter(|name| !name.is_empty())
                .map(|name| ResolvedOrigin::Service(name.clone()))
                .ok_or_else(|| {
                    format!(
                        "route '{}' has origin_type=service but no origin_service_name",
                        self.id
                    )
                }),
        }
    }

    fn admission_rule_id(route_id: &str) -> String {
        format!("adm-{route_id}")
    }
}

impl TenantStore {
    /// Creates a route and, in the same transaction, the global ALLOW rule
    /// that admits its host.
    pub async fn create_route(&self, actor: &str, mut route: Route) -> Result<Route, StoreError> {
        self.require_global()?;
        route.id = route.id.trim().to_string();
        route.incoming_host = route.incoming_host.trim().to_ascii_lowercase();
        validate_route(&route)?;

        let stored = route.clone();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            if route_exists(&tx, &stored.id)? {
                return Err(StoreError::Conflict(format!(
                    "route '{}' already exists",
                    stored.id
                )));
            }
            if host_taken(&tx, &stored.incoming_host, None)? {
                return Err(StoreError::Conflict(format!(
                    "incoming host '{}' is already routed",
                    stored.incoming_host
                )));
            }
            insert_route(&tx, &stored)?;
            let admission = admission_rule(&stored, db::max_enabled_priority(&tx)? + 1);
            db::insert_rule(&tx, &admission)?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "route.create",
            &route.id,
            None,
            Some(route_json(&route)),
        ))
        .await;
        Ok(route)
    }

    /// Full replace of a route. Host changes rewrite the admission rule's
    /// expression; enable/disable toggles it in lockstep, same transaction.
    pub async fn update_route(
        &self,
        actor: &str,
        id: &str,
        mut route: Route,
    ) -> Result<Route, StoreError> {
        self.require_global()?;
        route.id = id.to_string();
        route.incoming_host = route.incoming_host.trim().to_ascii_lowercase();
        validate_route(&route)?;

        let stored = route.clone();
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(before) = load_route(&tx, &stored.id)? else {
                    return Err(StoreError::NotFound(format!("route '{}'", stored.id)));
                };
                if host_taken(&tx, &stored.incoming_host, Some(&stored.id))? {
                    return Err(StoreError::Conflict(format!(
                        "incoming host '{}' is already routed",
                        stored.incoming_host
                    )));
                }
                replace_route(&tx, &stored)?;
                sync_admission_rule(&tx, &stored)?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "route.update",
            id,
            Some(route_json(&before)),
            Some(route_json(&route)),
        ))
        .await;
        Ok(route)
    }

    /// Deletes a route together with its admission rule. The caller is
    /// responsible for dropping the route's own tenant store afterwards.
    pub async fn delete_route(&self, actor: &str, id: &str) -> Result<Route, StoreError> {
        self.require_global()?;
        let target = id.to_string();
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(before) = load_route(&tx, &target)? else {
                    return Err(StoreError::NotFound(format!("route '{target}'")));
                };
                tx.execute("DELETE FROM routes WHERE id = ?1", params![target])?;
                tx.execute(
                    "DELETE FROM rules WHERE id = ?1",
                    params![Route::admission_rule_id(&target)],
                )?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "route.delete",
            id,
            Some(route_json(&before)),
            None,
        ))
        .await;
        Ok(before)
    }

    fn require_global(&self) -> Result<(), StoreError> {
        if self.id().is_global() {
            Ok(())
        } else {
            Err(StoreError::InvalidInput(
                "routes live in the global store only".into(),
            ))
        }
    }
}

fn route_json(route: &Route) -> Value {
    serde_json::to_value(route).unwrap_or(Value::Null)
}

fn validate_route(route: &Route) -> Result<(), StoreError> {
    if route.id.is_empty() {
        return Err(StoreError::InvalidInput("route id must not be empty".into()));
    }
    if route
        .id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
    {
        return Err(StoreError::InvalidInput(format!(
            "route id '{}' may only contain alphanumerics, '-' and '_'",
            route.id
        )));
    }
    validate_incoming_host(&route.incoming_host)?;
    route.origin().map_err(StoreError::InvalidInput)?;
    Ok(())
}

fn validate_incoming_host(host: &str) -> Result<(), StoreError> {
    let bare = host.strip_prefix("*.").unwrap_or(host);
    if bare.is_empty() {
        return Err(StoreError::InvalidInput(
            "incoming host must not be empty".into(),
        ));
    }
    if bare.contains('*') {
        return Err(StoreError::InvalidInput(format!(
            "only a left-anchored '*.' wildcard is supported, got '{host}'"
        )));
    }
    let labels_ok = bare.split('.').all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok {
        return Err(StoreError::InvalidInput(format!(
            "incoming host '{host}' is not a valid hostname"
        )));
    }
    Ok(())
}

fn admission_rule(route: &Route, priority: u32) -> Rule {
    let mut tags = BTreeSet::new();
    tags.insert(ROUTE_ADMISSION_TAG.to_string());
    tags.insert(format!("{ROUTE_LINK_TAG_PREFIX}{}", route.id));
    Rule {
        id: Route::admission_rule_id(&route.id),
        name: format!("Admit {}", route.incoming_host),
        description: format!("Auto-generated admission for route '{}'", route.id),
        enabled: route.enabled,
        action: Action::Allow,
        expression: vec![Predicate {
            field: "request.headers.host".to_string(),
            operator: Operator::Equals,
            value: json!(route.incoming_host),
        }],
        tags,
        priority,
        trigger_alert: false,
        block_http_code: None,
    }
}

fn sync_admission_rule(conn: &Connection, route: &Route) -> Result<(), StoreError> {
    let admission_id = Route::admission_rule_id(&route.id);
    let Some(mut admission) = db::load_rule(conn, &admission_id)? else {
        // Older data may predate explicit linkage; recreate rather than drift.
        let admission = admission_rule(route, db::max_enabled_priority(conn)? + 1);
        return db::insert_rule(conn, &admission);
    };

    let enabling = route.enabled && !admission.enabled;
    admission.name = format!("Admit {}", route.incoming_host);
    admission.expression = vec![Predicate {
        field: "request.headers.host".to_string(),
        operator: Operator::Equals,
        value: json!(route.incoming_host),
    }];
    admission.enabled = route.enabled;
    if enabling {
        admission.priority = db::max_enabled_priority(conn)? + 1;
    }
    db::replace_rule(conn, &admission)?;
    Ok(())
}

fn route_exists(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM routes WHERE id = ?1",
        params![id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

fn host_taken(conn: &Connection, host: &str, exclude: Option<&str>) -> Result<bool, StoreError> {
    let count: u32 = match exclude {
        Some(id) => conn.query_row(
            "SELECT COUNT(*) FROM routes WHERE incoming_host = ?1 AND id != ?2",
            params![host, id],
            |row| row.get(0),
        )?,
        None => conn.query_row(
            "SELECT COUNT(*) FROM routes WHERE incoming_host = ?1",
            params![host],
            |row| row.get(0),
        )?,
    };
    Ok(count > 0)
}

fn load_route(conn: &Connection, id: &str) -> Result<Option<Route>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM routes WHERE id = ?1")?;
    let mut rows = statement.query_map(params![id], db::route_from_row)?;
    match rows.next() {
        Some(route) => Ok(Some(route?)),
        None => Ok(None),
    }
}

fn insert_route(conn: &Connection, route: &Route) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO routes (id, incoming_host, origin_type, origin_url, \
         origin_service_name, enabled) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            route.id,
            route.incoming_host,
            origin_type_text(route.origin_type),
            route.origin_url,
            route.origin_service_name,
            route.enabled,
        ],
    )?;
    Ok(())
}

fn replace_route(conn: &Connection, route: &Route) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE routes SET incoming_host = ?2, origin_type = ?3, origin_url = ?4, \
         origin_service_name = ?5, enabled = ?6 WHERE id = ?1",
        params![
            route.id,
            route.incoming_host,
            origin_type_text(route.origin_type),
            route.origin_url,
            route.origin_service_name,
            route.enabled,
        ],
    )?;
    Ok(())
}

fn origin_type_text(origin_type: OriginType) -> &'static str {
    match origin_type {
        OriginType::Service => "service",
        OriginType::Url => "url",
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn url_route(id: &str, host: &str, origin_url: &str) -> Route {
        Route {
            id: id.to_string(),
            incoming_host: host.to_string(),
            origin_type: OriginType::Url,
            origin_url: Some(origin_url.to_string()),
            origin_service_name: None,
            enabled: true,
        }
    }

    pub fn service_route(id: &str, host: &str, service: &str) -> Route {
        Route {
            id: id.to_string(),
            incoming_host: host.to_string(),
            origin_type: OriginType::Service,
            origin_url: None,
            origin_service_name: Some(service.to_string()),
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{service_route, url_route};
    use super::*;
    use crate::store::test_support::registry;

    #[tokio::test]
    async fn create_route_installs_enabled_admission_rule() {
        let fixture = registry();
        let store = fixture.registry.global();
        store
            .create_route("tester", url_route("rt-1", "www.domain.com", "http://origin.example"))
            .await
            .unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot.route_by_host("www.domain.com").is_some());
        let admission = snapshot.rule("adm-rt-1").expect("admission rule");
        assert!(admission.enabled);
        assert!(admission.is_route_admission());
        assert_eq!(admission.linked_route_id(), Some("rt-1"));
        assert_eq!(admission.action, Action::Allow);
        assert_eq!(admission.expression.len(), 1);
        assert_eq!(admission.expression[0].field, "request.headers.host");
        assert_eq!(admission.expression[0].value, json!("www.domain.com"));
    }

    #[tokio::test]
    async fn duplicate_host_is_a_conflict() {
        let fixture = registry();
        let store = fixture.registry.global();
        store
            .create_route("tester", url_route("rt-1", "www.domain.com", "http://a.example"))
            .await
            .unwrap();
        let err = store
            .create_route("tester", url_route("rt-2", "www.domain.com", "http://b.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn disabling_route_disables_admission_in_lockstep() {
        let fixture = registry();
        let store = fixture.registry.global();
        let mut route = store
            .create_route("tester", url_route("rt-1", "www.domain.com", "http://origin.example"))
            .await
            .unwrap();

        route.enabled = false;
        store.update_route("tester", "rt-1", route.clone()).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert!(!snapshot.rule("adm-rt-1").unwrap().enabled);

        route.enabled = true;
        store.update_route("tester", "rt-1", route).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        let admission = snapshot.rule("adm-rt-1").unwrap();
        assert!(admission.enabled);
        assert!(admission.priority >= 1);
    }

    #[tokio::test]
    async fn host_change_rewrites_admission_expression() {
        let fixture = registry();
        let store = fixture.registry.global();
        let mut route = store
            .create_route("tester", url_route("rt-1", "old.domain.com", "http://origin.example"))
            .await
            .unwrap();
        route.incoming_host = "new.domain.com".to_string();
        store.update_route("tester", "rt-1", route).await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        let admission = snapshot.rule("adm-rt-1").unwrap();
        assert_eq!(admission.expression[0].value, json!("new.domain.com"));
        assert!(snapshot.route_by_host("new.domain.com").is_some());
        assert!(snapshot.route_by_host("old.domain.com").is_none());
    }

    #[tokio::test]
    async fn delete_route_removes_admission_rule_transactionally() {
        let fixture = registry();
        let store = fixture.registry.global();
        store
            .create_route("tester", url_route("rt-1", "www.domain.com", "http://origin.example"))
            .await
            .unwrap();
        store.delete_route("tester", "rt-1").await.unwrap();

        let snapshot = store.snapshot().await.unwrap();
        assert!(snapshot.routes.is_empty());
        assert!(snapshot.rule("adm-rt-1").is_none());
    }

    #[tokio::test]
    async fn wildcard_hosts_validate_left_anchor_only() {
        let fixture = registry();
        let store = fixture.registry.global();
        store
            .create_route("tester", url_route("rt-wild", "*.ex.com", "http://origin.example"))
            .await
            .unwrap();

        let err = store
            .create_route("tester", url_route("rt-bad", "a.*.ex.com", "http://origin.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn service_route_without_name_is_invalid() {
        let fixture = registry();
        let store = fixture.registry.global();
        let mut route = service_route("rt-svc", "svc.domain.com", "billing");
        route.origin_service_name = None;
        let err = store.create_route("tester", route).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn route_store_rejects_route_writes() {
        let fixture = registry();
        let store = fixture.registry.route_store("rt-1").unwrap();
        let err = store
            .create_route("tester", url_route("rt-2", "x.domain.com", "http://origin.example"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "got {err:?}");
    }
}
