use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::Connection;

use super::routes::Route;
use super::{db, ErrorPage, StoreError, TenantId};
use crate::engine::Rule;

/// Immutable point-in-time view of a tenant store's configuration. Published
/// behind an `Arc`; readers never observe a torn ruleset.
#[derive(Debug)]
pub struct StoreSnapshot {
    /// Sorted by `(priority, id)` at load so scans are deterministic.
    pub rules: Arc<[Rule]>,
    /// Route directory; empty outside the global store.
    pub routes: Arc<[Route]>,
    /// Error pages keyed by status code; empty outside the global store.
    pub error_pages: HashMap<u16, ErrorPage>,
}

impl StoreSnapshot {
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.id == id)
    }

    pub fn route(&self, id: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.id == id)
    }

    pub fn route_by_host(&self, host: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.incoming_host == host)
    }
}

pub(super) fn load(conn: &Connection, id: &TenantId) -> Result<StoreSnapshot, StoreError> {
    let rules = db::load_rules(conn)?;
    let (routes, error_pages) = if id.is_global() {
        let routes = db::load_routes(conn)?;
        let pages = db::load_error_pages(conn)?
            .into_iter()
            .map(|page| (page.http_code, page))
            .collect();
        (routes, pages)
    } else {
        (Vec::new(), HashMap::new())
    };
    Ok(StoreSnapshot {
        rules: Arc::from(rules.into_boxed_slice()),
        routes: Arc::from(routes.into_boxed_slice()),
        error_pages,
    })
}
