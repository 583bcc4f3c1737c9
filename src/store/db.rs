use std::collections::BTreeSet;
use std::path::Path;

use rusqlite::{params, Connection, Row};

use super::routes::{OriginType, Route};
use super::{ErrorPage, StoreError, TenantId};
use crate::engine::{Action, Predicate, Rule};

const COMMON_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS rules (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    description     TEXT NOT NULL DEFAULT '',
    enabled         INTEGER NOT NULL,
    action          TEXT NOT NULL,
    expression_json TEXT NOT NULL,
    tags_json       TEXT NOT NULL,
    priority        INTEGER NOT NULL,
    trigger_alert   INTEGER NOT NULL DEFAULT 0,
    block_http_code INTEGER
);
";

// Beyond routes and error pages, the global tenant also owns the opaque
// keyed records of the surrounding product: admin users, one-time auth
// gates, threat-feed state, and outbound integrations. The core creates the
// tables and only ever touches feed_state.
const GLOBAL_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS routes (
    id                  TEXT PRIMARY KEY,
    incoming_host       TEXT NOT NULL UNIQUE,
    origin_type         TEXT NOT NULL,
    origin_url          TEXT,
    origin_service_name TEXT,
    enabled             INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS error_pages (
    http_code    INTEGER PRIMARY KEY,
    name         TEXT NOT NULL,
    description  TEXT NOT NULL DEFAULT '',
    content_type TEXT NOT NULL,
    body         TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS users (
    key         TEXT PRIMARY KEY,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS auth_gates (
    key         TEXT PRIMARY KEY,
    record_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS feed_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS integrations (
    key         TEXT PRIMARY KEY,
    record_json TEXT NOT NULL
);
";

pub(super) fn open(path: &Path, id: &TenantId) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(COMMON_SCHEMA)?;
    if id.is_global() {
        conn.execute_batch(GLOBAL_SCHEMA)?;
    }
    Ok(conn)
}

pub(super) fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<Rule> {
    let expression_json: String = row.get("expression_json")?;
    let tags_json: String = row.get("tags_json")?;
    let action_text: String = row.get("action")?;
    let expression: Vec<Predicate> =
        serde_json::from_str(&expression_json).unwrap_or_default();
    let tags: BTreeSet<String> = serde_json::from_str(&tags_json).unwrap_or_default();
    let action = parse_action(&action_text);
    Ok(Rule {
        id: row.get("id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
        action,
        expression,
        tags,
        priority: row.get("priority")?,
        trigger_alert: row.get("trigger_alert")?,
        block_http_code: row.get("block_http_code")?,
    })
}

fn parse_action(text: &str) -> Action {
    match text {
        "BLOCK" => Action::Block,
        "CHALLENGE" => Action::Challenge,
        "LOG" => Action::Log,
        _ => Action::Allow,
    }
}

pub(super) fn insert_rule(conn: &Connection, rule: &Rule) -> Result<(), StoreError> {
    let expression_json = serde_json::to_string(&rule.expression)
        .map_err(|err| StoreError::Internal(err.to_string()))?;
    let tags_json = serde_json::to_string(&rule.tags)
        .map_err(|err| StoreError::Internal(err.to_string()))?;
    conn.execute(
        "INSERT INTO rules (id, name, description, enabled, action, expression_json, \
         tags_json, priority, trigger_alert, block_http_code) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            rule.id,
            rule.name,
            rule.description,
            rule.enabled,
            rule.action.as_str(),
            expression_json,
            tags_json,
            rule.priority,
            rule.trigger_alert,
            rule.block_http_code,
        ],
    )?;
    Ok(())
}

pub(super) fn replace_rule(conn: &Connection, rule: &Rule) -> Result<usize, StoreError> {
    let expression_json = serde_json::to_string(&rule.expression)
        .map_err(|err| StoreError::Internal(err.to_string()))?;
    let tags_json = serde_json::to_string(&rule.tags)
        .map_err(|err| StoreError::Internal(err.to_string()))?;
    let changed = conn.execute(
        "UPDATE rules SET name = ?2, description = ?3, enabled = ?4, action = ?5, \
         expression_json = ?6, tags_json = ?7, priority = ?8, trigger_alert = ?9, \
         block_http_code = ?10 WHERE id = ?1",
        params![
            rule.id,
            rule.name,
            rule.description,
            rule.enabled,
            rule.action.as_str(),
            expression_json,
            tags_json,
            rule.priority,
            rule.trigger_alert,
            rule.block_http_code,
        ],
    )?;
    Ok(changed)
}

pub(super) fn load_rule(conn: &Connection, id: &str) -> Result<Option<Rule>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM rules WHERE id = ?1")?;
    let mut rows = statement.query_map(params![id], rule_from_row)?;
    match rows.next() {
        Some(rule) => Ok(Some(rule?)),
        None => Ok(None),
    }
}

pub(super) fn load_rules(conn: &Connection) -> Result<Vec<Rule>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM rules ORDER BY priority, id")?;
    let rows = statement.query_map([], rule_from_row)?;
    let mut rules = Vec::new();
    for rule in rows {
        rules.push(rule?);
    }
    Ok(rules)
}

pub(super) fn route_from_row(row: &Row<'_>) -> rusqlite::Result<Route> {
    let origin_type: String = row.get("origin_type")?;
    Ok(Route {
        id: row.get("id")?,
        incoming_host: row.get("incoming_host")?,
        origin_type: if origin_type == "service" {
            OriginType::Service
        } else {
            OriginType::Url
        },
        origin_url: row.get("origin_url")?,
        origin_service_name: row.get("origin_service_name")?,
        enabled: row.get("enabled")?,
    })
}

pub(super) fn load_routes(conn: &Connection) -> Result<Vec<Route>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM routes ORDER BY incoming_host")?;
    let rows = statement.query_map([], route_from_row)?;
    let mut routes = Vec::new();
    for route in rows {
        routes.push(route?);
    }
    Ok(routes)
}

pub(super) fn load_error_pages(conn: &Connection) -> Result<Vec<ErrorPage>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM error_pages ORDER BY http_code")?;
    let rows = statement.query_map([], |row| {
        Ok(ErrorPage {
            http_code: row.get("http_code")?,
            name: row.get("name")?,
            description: row.get("description")?,
            content_type: row.get("content_type")?,
            body: row.get("body")?,
        })
    })?;
    let mut pages = Vec::new();
    for page in rows {
        pages.push(page?);
    }
    Ok(pages)
}

/// Highest priority currently held by an enabled rule, or 0 in an empty set.
pub(super) fn max_enabled_priority(conn: &Connection) -> Result<u32, StoreError> {
    let max: Option<u32> = conn.query_row(
        "SELECT MAX(priority) FROM rules WHERE enabled = 1",
        [],
        |row| row.get(0),
    )?;
    Ok(max.unwrap_or(0))
}
