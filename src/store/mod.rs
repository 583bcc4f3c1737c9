pub mod audit;
mod db;
pub mod error_pages;
pub mod routes;
pub mod rules;
pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use tokio::task;
use tracing::{info, warn};

use crate::engine::{evaluate_rules, project, Outcome};
use crate::request::WafRequest;

pub use audit::{AuditRecord, AuditSink, TracingAuditSink};
pub use error_pages::{BlockResponse, ErrorPage};
pub use routes::{OriginType, ResolvedOrigin, Route};
pub use snapshot::StoreSnapshot;

/// Error taxonomy shared by the store and the configuration API.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store failure: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Internal(err.to_string())
    }
}

impl From<task::JoinError> for StoreError {
    fn from(err: task::JoinError) -> Self {
        StoreError::Internal(format!("store task aborted: {err}"))
    }
}

/// Identity of a tenant store: the process-wide global singleton or one
/// route's private store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantId {
    Global,
    Route(String),
}

impl TenantId {
    /// Context label used in audit and event records.
    pub fn context(&self) -> String {
        match self {
            TenantId::Global => "global".to_string(),
            TenantId::Route(id) => id.clone(),
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, TenantId::Global)
    }
}

/// Durable configuration store for one tenant: an embedded SQLite database
/// fronted by a write-invalidated immutable snapshot.
///
/// Mutations serialize on the connection mutex inside `spawn_blocking`;
/// readers clone the published `Arc` snapshot and never hold a lock across
/// evaluation.
pub struct TenantStore {
    id: TenantId,
    conn: Arc<Mutex<Connection>>,
    snapshot: RwLock<Option<Arc<StoreSnapshot>>>,
    reload: tokio::sync::Mutex<()>,
    audit: Arc<dyn AuditSink>,
}

impl TenantStore {
    pub fn open(
        id: TenantId,
        path: &Path,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, StoreError> {
        let conn = db::open(path, &id)?;
        Ok(Self {
            id,
            conn: Arc::new(Mutex::new(conn)),
            snapshot: RwLock::new(None),
            reload: tokio::sync::Mutex::new(()),
            audit,
        })
    }

    pub fn id(&self) -> &TenantId {
        &self.id
    }

    /// Current cached view; loads from persistence on miss. Concurrent misses
    /// coordinate on one reload so the database sees a single load.
    pub async fn snapshot(&self) -> Result<Arc<StoreSnapshot>, StoreError> {
        if let Some(snapshot) = self.snapshot.read().clone() {
            return Ok(snapshot);
        }

        let _guard = self.reload.lock().await;
        if let Some(snapshot) = self.snapshot.read().clone() {
            return Ok(snapshot);
        }

        let conn = self.conn.clone();
        let id = self.id.clone();
        let loaded = task::spawn_blocking(move || {
            let conn = conn.lock();
            snapshot::load(&conn, &id)
        })
        .await??;
        let loaded = Arc::new(loaded);
        *self.snapshot.write() = Some(loaded.clone());
        Ok(loaded)
    }

    /// Projects the request and scans this tenant's ruleset. Pure with
    /// respect to the acquired snapshot.
    pub async fn evaluate(&self, request: &WafRequest) -> Result<Outcome, StoreError> {
        let snapshot = self.snapshot().await?;
        let fields = project(request);
        Ok(evaluate_rules(&snapshot.rules, &fields))
    }

    fn invalidate(&self) {
        *self.snapshot.write() = None;
    }

    /// Runs a blocking closure against the connection, and on success
    /// invalidates the snapshot so the next read observes the write.
    pub(crate) async fn write<T, F>(&self, mutation: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        let result = task::spawn_blocking(move || {
            let mut conn = conn.lock();
            mutation(&mut conn)
        })
        .await??;
        self.invalidate();
        Ok(result)
    }

    /// Emits an audit record for a committed write. Failure is logged; the
    /// write stands regardless.
    pub(crate) async fn emit_audit(&self, record: AuditRecord) {
        if let Err(err) = self.audit.append(record).await {
            warn!(tenant = %self.id.context(), error = %err, "audit emission failed");
        }
    }

    /// Records a threat-feed refresh tick in the global store's opaque feed
    /// state. Ingestion itself happens outside the core.
    pub async fn touch_feed_state(&self, actor: &str) -> Result<String, StoreError> {
        if !self.id.is_global() {
            return Err(StoreError::InvalidInput(
                "feed state lives in the global store only".into(),
            ));
        }
        let now = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| StoreError::Internal(err.to_string()))?;
        let stamp = now.clone();
        self.write(move |conn| {
            conn.execute(
                "INSERT INTO feed_state (key, value) VALUES ('last_refresh', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = ?1",
                rusqlite::params![stamp],
            )?;
            Ok(())
        })
        .await?;
        self.emit_audit(AuditRecord::new(
            actor,
            self.id.context(),
            "feeds.refresh",
            "last_refresh",
            None,
            Some(serde_json::Value::String(now.clone())),
        ))
        .await;
        Ok(now)
    }
}

/// Process-wide directory of tenant stores: the global singleton plus one
/// store per route, created on first reference and destroyed with the route.
pub struct StoreRegistry {
    data_dir: PathBuf,
    audit: Arc<dyn AuditSink>,
    global: Arc<TenantStore>,
    routes: RwLock<HashMap<String, Arc<TenantStore>>>,
}

impl StoreRegistry {
    pub fn open(data_dir: &Path, audit: Arc<dyn AuditSink>) -> Result<Self, StoreError> {
        std::fs::create_dir_all(data_dir.join("routes"))
            .map_err(|err| StoreError::Internal(format!("creating data dir: {err}")))?;
        let global_path = data_dir.join("global.db");
        let fresh = !global_path.exists();
        let global = Arc::new(TenantStore::open(
            TenantId::Global,
            &global_path,
            audit.clone(),
        )?);
        if fresh {
            info!(path = %global_path.display(), "created global tenant store");
        }
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            audit,
            global,
            routes: RwLock::new(HashMap::new()),
        })
    }

    pub fn global(&self) -> Arc<TenantStore> {
        self.global.clone()
    }

    /// Store owning the given route's ruleset, opened on first reference.
    pub fn route_store(&self, route_id: &str) -> Result<Arc<TenantStore>, StoreError> {
        if let Some(store) = self.routes.read().get(route_id) {
            return Ok(store.clone());
        }

        let mut routes = self.routes.write();
        if let Some(store) = routes.get(route_id) {
            return Ok(store.clone());
        }
        let path = self.route_db_path(route_id);
        let store = Arc::new(TenantStore::open(
            TenantId::Route(route_id.to_string()),
            &path,
            self.audit.clone(),
        )?);
        routes.insert(route_id.to_string(), store.clone());
        Ok(store)
    }

    /// Drops a deleted route's store and removes its database file.
    pub fn drop_route_store(&self, route_id: &str) {
        self.routes.write().remove(route_id);
        let path = self.route_db_path(route_id);
        if path.exists() {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!(route = route_id, error = %err, "failed to remove route store file");
            }
        }
    }

    fn route_db_path(&self, route_id: &str) -> PathBuf {
        self.data_dir.join("routes").join(format!("{route_id}.db"))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::registry;
    use super::*;

    #[tokio::test]
    async fn snapshot_loads_empty_store() {
        let fixture = registry();
        let global = fixture.registry.global();
        let snapshot = global.snapshot().await.unwrap();
        assert!(snapshot.rules.is_empty());
        assert!(snapshot.routes.is_empty());
    }

    #[tokio::test]
    async fn snapshot_is_cached_until_invalidated() {
        let fixture = registry();
        let global = fixture.registry.global();
        let first = global.snapshot().await.unwrap();
        let second = global.snapshot().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        global.invalidate();
        let third = global.snapshot().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn route_store_is_created_on_first_reference() {
        let fixture = registry();
        let store = fixture.registry.route_store("rt-1").unwrap();
        assert_eq!(store.id(), &TenantId::Route("rt-1".to_string()));
        let again = fixture.registry.route_store("rt-1").unwrap();
        assert!(Arc::ptr_eq(&store, &again));
    }

    #[tokio::test]
    async fn dropped_route_store_loses_its_database() {
        let fixture = registry();
        let _ = fixture.registry.route_store("rt-gone").unwrap();
        let path = fixture.registry.route_db_path("rt-gone");
        assert!(path.exists());
        fixture.registry.drop_route_store("rt-gone");
        assert!(!path.exists());
    }
}
