//! Vector embeddings for semantic inbox context (spec §11). The similarity
//! index itself is an external collaborator; this module is the consuming
//! side: pack/unpack, cosine scoring, content-hash dedup, and the HTTP call
//! to the embeddings service.

use sea_orm::{ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::entities::message_embedding;
use crate::error::AppError;

const EMBEDDINGS_URL: &str = "https://openrouter.ai/api/v1/embeddings";
const SIMILARITY_THRESHOLD: f32 = 0.1;

pub struct EmbeddingsClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl EmbeddingsClient {
    pub fn new(api_key: String, model: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http, api_key, model })
    }

    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let truncated: String = text.chars().take(8000).collect();
        let resp = self
            .http
            .post(EMBEDDINGS_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.model, "input": truncated }))
            .send()
            .await
            .map_err(|e| AppError::Connection(format!("embeddings request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(AppError::Connection(format!(
                "embeddings service returned {}",
                resp.status()
            )));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AppError::Parse(format!("invalid embeddings response: {e}")))?;

        let vector = body["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| AppError::Parse("embeddings response missing data[0].embedding".to_string()))?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        Ok(vector)
    }

    /// Embeds and stores a message, skipping the call entirely when the
    /// content hash hasn't changed since the last embedding.
    pub async fn embed_message(
        &self,
        db: &DatabaseConnection,
        account_id: Uuid,
        message_id: &str,
        subject: &str,
        body: &str,
    ) -> Result<bool, AppError> {
        let truncated_body: String = body.chars().take(2000).collect();
        let text = format!("{subject}\n{truncated_body}");
        let content_hash = content_hash(&text);

        let existing = message_embedding::Entity::find_by_id(message_id.to_string())
            .one(db)
            .await?;
        if let Some(ref existing) = existing {
            if existing.content_hash == content_hash {
                return Ok(false);
            }
        }

        let vector = self.embed_text(&text).await?;
        let blob = pack_vector(&vector);

        let active = message_embedding::ActiveModel {
            message_id: Set(message_id.to_string()),
            account_id: Set(account_id),
            content_hash: Set(content_hash),
            embedding: Set(blob),
            model: Set(self.model.clone()),
            embedded_at: Set(chrono::Utc::now().into()),
        };

        if existing.is_some() {
            active.update(db).await?;
        } else {
            active.insert(db).await?;
        }
        Ok(true)
    }

    /// Finds up to `limit` stored messages most similar to `query`, above
    /// the fixed 0.1 cosine threshold.
    pub async fn find_similar(
        &self,
        db: &DatabaseConnection,
        account_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<SimilarMessage>, AppError> {
        let rows = message_embedding::Entity::find()
            .filter(message_embedding::Column::AccountId.eq(account_id))
            .all(db)
            .await?;
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let query_vector = self.embed_text(query).await?;

        let mut scored: Vec<(String, f32)> = rows
            .into_iter()
            .map(|row| {
                let stored = unpack_vector(&row.embedding);
                (row.message_id, cosine_similarity(&query_vector, &stored))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .filter(|(_, score)| *score >= SIMILARITY_THRESHOLD)
            .take(limit)
            .map(|(message_id, score)| SimilarMessage { message_id, score })
            .collect())
    }
}

pub struct SimilarMessage {
    pub message_id: String,
    pub score: f32,
}

fn content_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    hex::encode(digest)[..16].to_string()
}

pub fn pack_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn unpack_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_round_trips_through_pack_unpack() {
        let original = vec![0.1_f32, -2.5, 3.75, 0.0];
        let packed = pack_vector(&original);
        assert_eq!(packed.len(), original.len() * 4);
        let unpacked = unpack_vector(&packed);
        assert_eq!(unpacked, original);
    }

    #[test]
    fn cosine_similarity_identity_is_one() {
        let v = vec![1.0_f32, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![0.0_f32, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_opposite_is_negative_one() {
        let a = vec![1.0_f32, 0.0];
        let b = vec![-1.0_f32, 0.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        let a = vec![0.0_f32, 0.0];
        let b = vec![1.0_f32, 1.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn content_hash_is_stable_and_truncated() {
        let h1 = content_hash("hello world");
        let h2 = content_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }
}
