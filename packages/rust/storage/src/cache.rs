//! Text-generation cache keyed by prompt hash and model.

use chrono::Utc;
use libsql::params;
use linkweave_shared::Result;
use uuid::Uuid;

use crate::{Storage, col_str, db_err};

impl Storage {
    /// Get a cached generation result.
    pub async fn get_generation_cache(
        &self,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result FROM generation_cache WHERE prompt_hash = ?1 AND model_id = ?2",
                params![prompt_hash, model_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(col_str(&row, 0)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Store a generation result in the cache (upserts).
    pub async fn set_generation_cache(
        &self,
        kind: &str,
        prompt_hash: &str,
        model_id: &str,
        result: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO generation_cache (id, kind, prompt_hash, model_id, result, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(prompt_hash, model_id) DO UPDATE SET
                   result = excluded.result,
                   created_at = excluded.created_at",
                params![id.as_str(), kind, prompt_hash, model_id, result, now.as_str()],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Drop every cached result produced by `model_id`.
    pub async fn invalidate_generation_cache(&self, model_id: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM generation_cache WHERE model_id = ?1",
                params![model_id],
            )
            .await
            .map_err(db_err)
    }
}
