//! Persisted route-utterance embeddings.
//!
//! Vectors are keyed by `(model_id, text_hash)` so that switching embedding
//! models never mixes vector spaces: a lookup under the new model simply
//! misses.  `text_hash` is the URL-safe base64 of the SHA-256 of the
//! utterance.  A moka cache sits in front of the table.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use ring::digest::{SHA256, digest};
use rusqlite::{OptionalExtension, params};
use tracing::{debug, info, instrument};

use crate::cache::CacheLayer;
use crate::db::Database;
use crate::error::StoreResult;

/// Stable hash of an utterance, used as half of the storage key.
pub fn text_hash(text: &str) -> String {
    URL_SAFE_NO_PAD.encode(digest(&SHA256, text.as_bytes()).as_ref())
}

fn cache_key(model_id: &str, hash: &str) -> String {
    format!("{model_id}\u{1f}{hash}")
}

fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[derive(Clone)]
pub struct EmbeddingStore {
    db: Database,
    cache: CacheLayer<String, Arc<Vec<f32>>>,
}

impl EmbeddingStore {
    pub fn new(db: Database, cache_capacity: u64) -> Self {
        Self {
            db,
            cache: CacheLayer::builder("embeddings")
                .max_capacity(cache_capacity)
                .build(),
        }
    }

    pub fn cache(&self) -> &CacheLayer<String, Arc<Vec<f32>>> {
        &self.cache
    }

    pub async fn get(&self, model_id: &str, text: &str) -> StoreResult<Option<Arc<Vec<f32>>>> {
        let hash = text_hash(text);
        let key = cache_key(model_id, &hash);
        if let Some(hit) = self.cache.get(&key).await {
            return Ok(Some(hit));
        }

        let model = model_id.to_string();
        let blob: Option<Vec<u8>> = self
            .db
            .execute(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT vector FROM route_embeddings WHERE model_id = ?1 AND text_hash = ?2",
                        params![model, hash],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        match blob {
            Some(blob) => {
                let vector = Arc::new(blob_to_vector(&blob));
                self.cache.insert(key, Arc::clone(&vector)).await;
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    /// One slot per input text, `None` where nothing is stored.
    pub async fn get_many(
        &self,
        model_id: &str,
        texts: &[String],
    ) -> StoreResult<Vec<Option<Arc<Vec<f32>>>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.get(model_id, text).await?);
        }
        Ok(out)
    }

    pub async fn put(&self, model_id: &str, text: &str, vector: Vec<f32>) -> StoreResult<()> {
        self.put_many(model_id, vec![(text.to_string(), vector)])
            .await
    }

    /// Upsert a batch in one transaction.
    #[instrument(skip(self, entries), fields(count = entries.len()))]
    pub async fn put_many(&self, model_id: &str, entries: Vec<(String, Vec<f32>)>) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, Vec<f32>)> = entries
            .into_iter()
            .map(|(text, vector)| (text_hash(&text), vector))
            .collect();

        let model = model_id.to_string();
        let persisted = rows.clone();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO route_embeddings (model_id, text_hash, dims, vector, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5) \
                         ON CONFLICT(model_id, text_hash) DO UPDATE SET \
                             dims = excluded.dims, vector = excluded.vector",
                    )?;
                    let now = Utc::now().timestamp_millis();
                    for (hash, vector) in &persisted {
                        stmt.execute(params![
                            model,
                            hash,
                            vector.len() as i64,
                            vector_to_blob(vector),
                            now
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;

        for (hash, vector) in rows {
            self.cache
                .insert(cache_key(model_id, &hash), Arc::new(vector))
                .await;
        }
        debug!(model_id, "embeddings stored");
        Ok(())
    }

    pub async fn count(&self, model_id: &str) -> StoreResult<usize> {
        let model = model_id.to_string();
        self.db
            .execute(move |conn| {
                let n: i64 = conn.query_row(
                    "SELECT count(*) FROM route_embeddings WHERE model_id = ?1",
                    params![model],
                    |row| row.get(0),
                )?;
                Ok(n as usize)
            })
            .await
    }

    /// Remove every vector for `model_id`; used before a full re-embed.
    pub async fn clear_model(&self, model_id: &str) -> StoreResult<usize> {
        let model = model_id.to_string();
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM route_embeddings WHERE model_id = ?1",
                    params![model],
                )?)
            })
            .await?;
        self.cache.invalidate_all();
        Ok(removed)
    }

    /// Remove vectors produced by any model other than `keep_model_id`.
    pub async fn prune_other_models(&self, keep_model_id: &str) -> StoreResult<usize> {
        let model = keep_model_id.to_string();
        let removed = self
            .db
            .execute(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM route_embeddings WHERE model_id <> ?1",
                    params![model],
                )?)
            })
            .await?;
        self.cache.invalidate_all();
        if removed > 0 {
            info!(keep = keep_model_id, removed, "pruned embeddings of retired models");
        }
        Ok(removed)
    }
}
