//! Page directory import from a JSON document.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use linkweave_markdown::word_count;
use linkweave_shared::{LinkweaveError, Page, Result, Scope};
use linkweave_storage::Storage;

/// `{ "pages": [...], "scopes": [...] }`.
#[derive(Debug, Default, Deserialize)]
pub struct ImportDocument {
    #[serde(default)]
    pub pages: Vec<Page>,
    #[serde(default)]
    pub scopes: Vec<Scope>,
}

impl ImportDocument {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| LinkweaveError::validation(format!("invalid import document: {e}")))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub pages: usize,
    pub scopes: usize,
}

/// Read and import a JSON document from disk.
pub async fn import_file(storage: &Storage, path: &Path) -> Result<ImportSummary> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| LinkweaveError::io(path, e))?;
    import_document(storage, ImportDocument::parse(&text)?).await
}

/// Upsert every page and scope in `doc`. Word counts are recomputed from the
/// bodies. Nothing is written unless the whole document checks out.
#[instrument(skip_all, fields(pages = doc.pages.len(), scopes = doc.scopes.len()))]
pub async fn import_document(storage: &Storage, mut doc: ImportDocument) -> Result<ImportSummary> {
    let mut ids = HashSet::new();
    for page in &mut doc.pages {
        page.check()?;
        if !ids.insert(page.id.clone()) {
            return Err(LinkweaveError::validation(format!(
                "page {} appears twice",
                page.id
            )));
        }
        page.word_count = word_count(&page.body);
    }

    let mut scope_ids = HashSet::new();
    for scope in &mut doc.scopes {
        if scope.id.trim().is_empty() {
            return Err(LinkweaveError::validation("scope id must not be empty"));
        }
        if !scope_ids.insert(scope.id.clone()) {
            return Err(LinkweaveError::validation(format!(
                "scope {} appears twice",
                scope.id
            )));
        }
        let mut seen = HashSet::new();
        scope.members.retain(|m| seen.insert(m.clone()));
        for member in &scope.members {
            if !ids.contains(member) && storage.get_page(member).await?.is_none() {
                return Err(LinkweaveError::validation(format!(
                    "scope {} lists unknown page {member}",
                    scope.id
                )));
            }
        }
        if let Some(hub) = scope.hub_id.as_deref().filter(|h| !scope.contains(h)) {
            warn!(scope = %scope.id, hub, "designated hub is not a member");
        }
    }

    for page in &doc.pages {
        storage.upsert_page(page).await?;
    }
    for scope in &doc.scopes {
        storage.upsert_scope(scope).await?;
    }

    let summary = ImportSummary {
        pages: doc.pages.len(),
        scopes: doc.scopes.len(),
    };
    info!(pages = summary.pages, scopes = summary.scopes, "import complete");
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fixtures::storage;
    use linkweave_shared::ScopeKind;

    const DOC: &str = r#"{
        "pages": [
            {"id": "h", "url": "/running", "role": "hub", "primary_term": "trail running",
             "body": "Trail running `code here` takes you into the hills.", "word_count": 999,
             "status": "approved", "labels": ["outdoor"]},
            {"id": "d1", "url": "https://example.com/shoes", "role": "dependent",
             "primary_term": "trail shoes", "body": "Shoes matter.", "status": "draft"}
        ],
        "scopes": [
            {"id": "trail", "kind": "hierarchical", "members": ["h", "d1", "h"], "hub_id": "h"}
        ]
    }"#;

    #[tokio::test]
    async fn imports_pages_and_scopes() {
        let storage = storage().await;
        let summary = import_document(&storage, ImportDocument::parse(DOC).unwrap())
            .await
            .unwrap();
        assert_eq!(summary, ImportSummary { pages: 2, scopes: 1 });

        let hub = storage.get_page("h").await.unwrap().unwrap();
        assert_eq!(hub.word_count, 7);
        assert!(hub.labels.contains("outdoor"));

        let scope = storage.require_scope("trail").await.unwrap();
        assert_eq!(scope.kind, ScopeKind::Hierarchical);
        assert_eq!(scope.members, vec!["h", "d1"]);
    }

    #[tokio::test]
    async fn rejects_unknown_members_without_writing() {
        let storage = storage().await;
        let doc = ImportDocument::parse(
            r#"{"pages": [{"id": "a", "url": "/a", "role": "standalone",
                 "primary_term": "alpha", "body": "", "status": "approved"}],
                "scopes": [{"id": "s", "kind": "flat", "members": ["a", "ghost"]}]}"#,
        )
        .unwrap();
        let err = import_document(&storage, doc).await.unwrap_err();
        assert!(matches!(err, LinkweaveError::Validation { .. }));
        assert!(storage.get_page("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rejects_bad_pages() {
        let storage = storage().await;
        let bad_url = ImportDocument::parse(
            r#"{"pages": [{"id": "a", "url": "not a url", "role": "standalone",
                 "primary_term": "alpha", "body": "", "status": "approved"}]}"#,
        )
        .unwrap();
        assert!(import_document(&storage, bad_url).await.is_err());

        assert!(ImportDocument::parse(r#"{"pages": [{"id": "a"}]}"#).is_err());
    }
}
