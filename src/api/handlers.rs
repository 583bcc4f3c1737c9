use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::{resolve_actor, Actor};
use super::error::ApiError;
use super::ApiContext;
use crate::engine::Rule;
use crate::store::{ErrorPage, Route, TenantStore};

/// A handled API call: status plus JSON body.
#[derive(Debug)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl ApiResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
        }
    }

    fn created(body: Value) -> Self {
        Self {
            status: StatusCode::CREATED,
            body,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReorderBody {
    active_ids: Vec<String>,
}

/// Routes one admin-plane request. Everything except `/healthz` requires a
/// resolved session; writes additionally require the administrator role.
pub async fn dispatch(
    ctx: &ApiContext,
    method: &Method,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let segments: Vec<&str> = path
        .split('?')
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    if let ["healthz"] = segments.as_slice() {
        return match *method {
            Method::GET => Ok(ApiResponse::ok(json!({"status": "ok"}))),
            _ => Err(ApiError::method_not_allowed()),
        };
    }

    let actor = resolve_actor(headers)?;

    match segments.as_slice() {
        ["ops", "feeds", "refresh"] => {
            require(method, Method::POST)?;
            actor.require_administrator()?;
            let refreshed_at = ctx.registry.global().touch_feed_state(&actor.name).await?;
            Ok(ApiResponse::ok(json!({"refreshed_at": refreshed_at})))
        }
        ["ops", "events", "aggregate"] => {
            require(method, Method::POST)?;
            actor.require_administrator()?;
            ctx.events.aggregate().await.map_err(|err| {
                ApiError::from(crate::store::StoreError::Internal(err.to_string()))
            })?;
            Ok(ApiResponse::ok(json!({"aggregated": true})))
        }
        ["api", "global", "config"] => {
            require(method, Method::GET)?;
            let snapshot = ctx.registry.global().snapshot().await?;
            let mut pages: Vec<&ErrorPage> = snapshot.error_pages.values().collect();
            pages.sort_by_key(|page| page.http_code);
            Ok(ApiResponse::ok(json!({
                "rules": snapshot.rules.as_ref(),
                "routes": snapshot.routes.as_ref(),
                "error_pages": pages,
            })))
        }
        ["api", "global", "rules", rest @ ..] => {
            rules_resource(ctx.registry.global(), &actor, method, rest, body).await
        }
        ["api", "global", "error-pages", rest @ ..] => {
            error_pages_resource(ctx, &actor, method, rest, body).await
        }
        ["api", "routes", rest @ ..] => routes_resource(ctx, &actor, method, rest, body).await,
        _ => Err(ApiError::not_found(format!("no resource at '{path}'"))),
    }
}

async fn rules_resource(
    store: Arc<TenantStore>,
    actor: &Actor,
    method: &Method,
    rest: &[&str],
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    match (method, rest) {
        (&Method::GET, []) => {
            let snapshot = store.snapshot().await?;
            Ok(ApiResponse::ok(json!({"rules": snapshot.rules.as_ref()})))
        }
        (&Method::POST, []) => {
            actor.require_administrator()?;
            let rule: Rule = parse_body(body)?;
            let created = store.create_rule(&actor.name, rule).await?;
            Ok(ApiResponse::created(json!(created)))
        }
        (&Method::POST, ["reorder"]) => {
            actor.require_administrator()?;
            let reorder: ReorderBody = parse_body(body)?;
            store.reorder(&actor.name, reorder.active_ids).await?;
            let snapshot = store.snapshot().await?;
            Ok(ApiResponse::ok(json!({"rules": snapshot.rules.as_ref()})))
        }
        (&Method::GET, [id]) => {
            let snapshot = store.snapshot().await?;
            let rule = snapshot
                .rule(id)
                .ok_or_else(|| ApiError::not_found(format!("rule '{id}'")))?;
            Ok(ApiResponse::ok(json!(rule)))
        }
        (&Method::PUT, [id]) => {
            actor.require_administrator()?;
            let rule: Rule = parse_body(body)?;
            let updated = store.update_rule(&actor.name, id, rule).await?;
            Ok(ApiResponse::ok(json!(updated)))
        }
        (&Method::DELETE, [id]) => {
            actor.require_administrator()?;
            store.delete_rule(&actor.name, id).await?;
            Ok(ApiResponse::ok(json!({"deleted": id})))
        }
        _ => Err(ApiError::method_not_allowed()),
    }
}

async fn routes_resource(
    ctx: &ApiContext,
    actor: &Actor,
    method: &Method,
    rest: &[&str],
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let global = ctx.registry.global();
    match (method, rest) {
        (&Method::GET, []) => {
            let snapshot = global.snapshot().await?;
            Ok(ApiResponse::ok(json!({"routes": snapshot.routes.as_ref()})))
        }
        (&Method::POST, []) => {
            actor.require_administrator()?;
            let route: Route = parse_body(body)?;
            let created = global.create_route(&actor.name, route).await?;
            Ok(ApiResponse::created(json!(created)))
        }
        (&Method::GET, [id]) => {
            let snapshot = global.snapshot().await?;
            let route = snapshot
                .route(id)
                .ok_or_else(|| ApiError::not_found(format!("route '{id}'")))?;
            Ok(ApiResponse::ok(json!(route)))
        }
        (&Method::PUT, [id]) => {
            actor.require_administrator()?;
            let route: Route = parse_body(body)?;
            let updated = global.update_route(&actor.name, id, route).await?;
            Ok(ApiResponse::ok(json!(updated)))
        }
        (&Method::DELETE, [id]) => {
            actor.require_administrator()?;
            global.delete_route(&actor.name, id).await?;
            // The route's ruleset dies with the route.
            ctx.registry.drop_route_store(id);
            Ok(ApiResponse::ok(json!({"deleted": id})))
        }
        (_, [route_id, "rules", rule_rest @ ..]) => {
            let snapshot = global.snapshot().await?;
            if snapshot.route(route_id).is_none() {
                return Err(ApiError::not_found(format!("route '{route_id}'")));
            }
            let store = ctx.registry.route_store(route_id)?;
            rules_resource(store, actor, method, rule_rest, body).await
        }
        _ => Err(ApiError::method_not_allowed()),
    }
}

async fn error_pages_resource(
    ctx: &ApiContext,
    actor: &Actor,
    method: &Method,
    rest: &[&str],
    body: &[u8],
) -> Result<ApiResponse, ApiError> {
    let global = ctx.registry.global();
    match (method, rest) {
        (&Method::GET, []) => {
            let snapshot = global.snapshot().await?;
            let mut pages: Vec<&ErrorPage> = snapshot.error_pages.values().collect();
            pages.sort_by_key(|page| page.http_code);
            Ok(ApiResponse::ok(json!({"error_pages": pages})))
        }
        (&Method::GET, [code]) => {
            let code = parse_code(code)?;
            let snapshot = global.snapshot().await?;
            let page = snapshot
                .error_pages
                .get(&code)
                .ok_or_else(|| ApiError::not_found(format!("error page {code}")))?;
            Ok(ApiResponse::ok(json!(page)))
        }
        (&Method::PUT, [code]) => {
            actor.require_administrator()?;
            let code = parse_code(code)?;
            let mut page: ErrorPage = parse_body(body)?;
            page.http_code = code;
            let stored = global.upsert_error_page(&actor.name, page).await?;
            Ok(ApiResponse::ok(json!(stored)))
        }
        (&Method::DELETE, [code]) => {
            actor.require_administrator()?;
            let code = parse_code(code)?;
            global.delete_error_page(&actor.name, code).await?;
            Ok(ApiResponse::ok(json!({"deleted": code})))
        }
        _ => Err(ApiError::method_not_allowed()),
    }
}

fn require(method: &Method, wanted: Method) -> Result<(), ApiError> {
    if *method == wanted {
        Ok(())
    } else {
        Err(ApiError::method_not_allowed())
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|err| ApiError::bad_request(format!("invalid request body: {err}")))
}

fn parse_code(segment: &str) -> Result<u16, ApiError> {
    segment
        .parse::<u16>()
        .map_err(|_| ApiError::bad_request(format!("'{segment}' is not an HTTP status code")))
}
