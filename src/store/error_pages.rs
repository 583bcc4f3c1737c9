use http::StatusCode;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{AuditRecord, StoreError, StoreSnapshot, TenantStore};

/// Operator-configured response body served for a blocking status code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPage {
    pub http_code: u16,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub content_type: String,
    pub body: String,
}

/// Fully resolved response for a terminated request.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: String,
}

pub const FALLBACK_BLOCK_BODY: &str = "<h1>Forbidden</h1>";
const FALLBACK_CONTENT_TYPE: &str = "text/html; charset=utf-8";

impl StoreSnapshot {
    /// Resolves a firing rule's `block_http_code` (default 403) against the
    /// configured error pages, falling back to the hard-coded 403 body.
    pub fn block_response(&self, block_http_code: Option<u16>) -> BlockResponse {
        let code = block_http_code.unwrap_or(403);
        if let Some(page) = self.error_pages.get(&code) {
            if let Ok(status) = StatusCode::from_u16(code) {
                return BlockResponse {
                    status,
                    content_type: page.content_type.clone(),
                    body: page.body.clone(),
                };
            }
        }
        BlockResponse {
            status: StatusCode::from_u16(code).unwrap_or(StatusCode::FORBIDDEN),
            content_type: FALLBACK_CONTENT_TYPE.to_string(),
            body: FALLBACK_BLOCK_BODY.to_string(),
        }
    }
}

impl TenantStore {
    /// Inserts or replaces the error page for one status code.
    pub async fn upsert_error_page(
        &self,
        actor: &str,
        page: ErrorPage,
    ) -> Result<ErrorPage, StoreError> {
        self.require_global_pages()?;
        if StatusCode::from_u16(page.http_code).is_err() {
            return Err(StoreError::InvalidInput(format!(
                "{} is not an HTTP status code",
                page.http_code
            )));
        }
        if page.content_type.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "error page content_type must not be empty".into(),
            ));
        }

        let stored = page.clone();
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let before = load_page(&tx, stored.http_code)?;
                tx.execute(
                    "INSERT INTO error_pages (http_code, name, description, content_type, body) \
                     VALUES (?1, ?2, ?3, ?4, ?5) \
                     ON CONFLICT(http_code) DO UPDATE SET name = ?2, description = ?3, \
                     content_type = ?4, body = ?5",
                    params![
                        stored.http_code,
                        stored.name,
                        stored.description,
                        stored.content_type,
                        stored.body,
                    ],
                )?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "error_page.upsert",
            &page.http_code.to_string(),
            before.map(|page| page_json(&page)),
            Some(page_json(&page)),
        ))
        .await;
        Ok(page)
    }

    pub async fn delete_error_page(&self, actor: &str, http_code: u16) -> Result<(), StoreError> {
        self.require_global_pages()?;
        let before = self
            .write(move |conn| {
                let tx = conn.transaction()?;
                let Some(before) = load_page(&tx, http_code)? else {
                    return Err(StoreError::NotFound(format!("error page {http_code}")));
                };
                tx.execute(
                    "DELETE FROM error_pages WHERE http_code = ?1",
                    params![http_code],
                )?;
                tx.commit()?;
                Ok(before)
            })
            .await?;

        self.emit_audit(AuditRecord::new(
            actor,
            self.id().context(),
            "error_page.delete",
            &http_code.to_string(),
            Some(page_json(&before)),
            None,
        ))
        .await;
        Ok(())
    }

    fn require_global_pages(&self) -> Result<(), StoreError> {
        if self.id().is_global() {
            Ok(())
        } else {
            Err(StoreError::InvalidInput(
                "error pages live in the global store only".into(),
            ))
        }
    }
}

fn page_json(page: &ErrorPage) -> Value {
    serde_json::to_value(page).unwrap_or(Value::Null)
}

fn load_page(conn: &rusqlite::Connection, code: u16) -> Result<Option<ErrorPage>, StoreError> {
    let mut statement = conn.prepare("SELECT * FROM error_pages WHERE http_code = ?1")?;
    let mut rows = statement.query_map(params![code], |row| {
        Ok(ErrorPage {
            http_code: row.get("http_code")?,
            name: row.get("name")?,
            description: row.get("description")?,
            content_type: row.get("content_type")?,
            body: row.get("body")?,
        })
    })?;
    match rows.next() {
        Some(page) => Ok(Some(page?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::registry;

    fn page(code: u16, body: &str) -> ErrorPage {
        ErrorPage {
            http_code: code,
            name: format!("page {code}"),
            description: String::new(),
            content_type: "text/html".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn fallback_serves_hardcoded_forbidden() {
        let fixture = registry();
        let store = fixture.registry.global();
        let snapshot = store.snapshot().await.unwrap();
        let response = snapshot.block_response(None);
        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert!(response.body.starts_with("<h1>Forbidden</h1>"));
        assert!(response.content_type.starts_with("text/html"));
    }

    #[tokio::test]
    async fn configured_page_overrides_fallback() {
        let fixture = registry();
        let store = fixture.registry.global();
        store
            .upsert_error_page("tester", page(429, "<h1>Slow down</h1>"))
            .await
            .unwrap();
        let snapshot = store.snapshot().await.unwrap();
        let response = snapshot.block_response(Some(429));
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.body, "<h1>Slow down</h1>");
    }

    #[tokio::test]
    async fn unconfigured_code_keeps_status_with_fallback_body() {
        let fixture = registry();
        let store = fixture.registry.global();
        let snapshot = store.snapshot().await.unwrap();
        let response = snapshot.block_response(Some(451));
        assert_eq!(response.status.as_u16(), 451);
        assert_eq!(response.body, FALLBACK_BLOCK_BODY);
    }

    #[tokio::test]
    async fn upsert_replaces_and_delete_removes() {
        let fixture = registry();
        let store = fixture.registry.global();
        store.upsert_error_page("tester", page(403, "v1")).await.unwrap();
        store.upsert_error_page("tester", page(403, "v2")).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.block_response(None).body, "v2");

        store.delete_error_page("tester", 403).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        assert_eq!(snapshot.block_response(None).body, FALLBACK_BLOCK_BODY);

        let err = store.delete_error_page("tester", 403).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn invalid_status_code_rejected() {
        let fixture = registry();
        let store = fixture.registry.global();
        let err = store
            .upsert_error_page("tester", page(99, "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "got {err:?}");
    }
}
