use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{
    de::{self, Visitor},
    Deserialize, Deserializer, Serialize,
};
use surrealdb::sql::Thing;
use tracing::info;

use common::{error::AppError, storage::db::SurrealDbClient};

pub const CHUNK_TABLE: &str = "chunk_point";

struct FlexibleIdVisitor;

impl<'de> Visitor<'de> for FlexibleIdVisitor {
    type Value = String;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string or a Thing")
    }

    fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value.to_string())
    }

    fn visit_string<E>(self, value: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(value)
    }

    fn visit_map<A>(self, map: A) -> Result<Self::Value, A::Error>
    where
        A: de::MapAccess<'de>,
    {
        let thing = Thing::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(thing.id.to_raw())
    }
}

fn deserialize_flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(FlexibleIdVisitor)
}

/// One embedded chunk plus the header fields retrieval filters on. Never
/// persisted anywhere but the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPoint {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub unit_id: String,
    pub origin: Option<String>,
    pub primary: Option<String>,
    pub secondary: Vec<String>,
    pub file: String,
    pub text: String,
    pub embedding: Vec<f32>,
}

impl ChunkPoint {
    /// Point ids are derived from the record name and chunk index, so
    /// re-embedding the same record overwrites instead of duplicating.
    pub fn point_id(record_stem: &str, chunk_index: usize) -> String {
        format!("{record_stem}-{chunk_index:04}")
    }
}

/// Boundary to the vector store: idempotent batch upsert plus a
/// fetch-all-by-unit scan. `wait` on upsert requests a durability
/// acknowledgement before returning.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ensure_ready(&self, dimension: usize) -> Result<(), AppError>;
    async fn upsert(&self, points: &[ChunkPoint], wait: bool) -> Result<(), AppError>;
    async fn fetch_by_unit(&self, unit_id: &str) -> Result<Vec<ChunkPoint>, AppError>;
}

/// SurrealDB-backed store: one schemaless table with an HNSW index over the
/// embedding field and plain indexes over the filterable payload fields.
pub struct SurrealVectorStore {
    db: Arc<SurrealDbClient>,
}

impl SurrealVectorStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    async fn ensure_ready(&self, dimension: usize) -> Result<(), AppError> {
        self.db
            .query(format!("DEFINE TABLE IF NOT EXISTS {CHUNK_TABLE} SCHEMALESS"))
            .await?;
        self.db
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_embedding ON {CHUNK_TABLE} FIELDS embedding HNSW DIMENSION {dimension}"
            ))
            .await?;
        self.db
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_chunk_unit ON {CHUNK_TABLE} FIELDS unit_id"
            ))
            .await?;
        info!(dimension, "vector store ready");
        Ok(())
    }

    async fn upsert(&self, points: &[ChunkPoint], _wait: bool) -> Result<(), AppError> {
        // The engine acknowledges writes synchronously; `wait` is part of
        // the interface contract for stores that buffer.
        for point in points {
            let _: Option<ChunkPoint> = self
                .db
                .upsert((CHUNK_TABLE, point.id.as_str()))
                .content(point.clone())
                .await?;
        }
        Ok(())
    }

    async fn fetch_by_unit(&self, unit_id: &str) -> Result<Vec<ChunkPoint>, AppError> {
        let mut response = self
            .db
            .query(format!(
                "SELECT * FROM {CHUNK_TABLE} WHERE unit_id = $unit_id"
            ))
            .bind(("unit_id", unit_id.to_string()))
            .await?;
        let points: Vec<ChunkPoint> = response.take(0)?;
        Ok(points)
    }
}
