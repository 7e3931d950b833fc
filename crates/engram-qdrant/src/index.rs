use std::collections::HashMap;

use async_trait::async_trait;
use engram_core::{EngramError, VectorEntry, VectorIndex, VectorMatch};
use qdrant_client::qdrant::{
    value::Kind, CreateCollectionBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, Value as QdrantValue, VectorParamsBuilder,
};
use qdrant_client::Qdrant;
use serde_json::Value as JsonValue;

pub const DEFAULT_COLLECTION: &str = "engram";
pub const DEFAULT_VECTOR_SIZE: u64 = 1536;

// ---------------------------------------------------------------------------
// QdrantIndexConfig
// ---------------------------------------------------------------------------

/// Configuration for connecting to a Qdrant instance.
#[derive(Debug, Clone)]
pub struct QdrantIndexConfig {
    /// Qdrant gRPC URL (e.g. `http://localhost:6334`).
    pub url: String,
    /// Optional API token for authentication.
    pub token: Option<String>,
    /// Name of the collection holding cache entries.
    pub collection: String,
    /// Dimensionality of the embedding vectors.
    pub vector_size: u64,
}

impl QdrantIndexConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            collection: DEFAULT_COLLECTION.to_string(),
            vector_size: DEFAULT_VECTOR_SIZE,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_vector_size(mut self, vector_size: u64) -> Self {
        self.vector_size = vector_size;
        self
    }
}

// ---------------------------------------------------------------------------
// QdrantVectorIndex
// ---------------------------------------------------------------------------

/// A [`VectorIndex`] implementation backed by [Qdrant](https://qdrant.tech/).
///
/// Each cache entry is stored as a point with:
/// - **id**: UUID v5 derived from the cache id (cache ids are not UUIDs)
/// - **vector**: the embedding, compared by cosine similarity
/// - **payload**: `cache_id` (the original id) and `metadata` (JSON object)
pub struct QdrantVectorIndex {
    client: Qdrant,
    config: QdrantIndexConfig,
}

impl QdrantVectorIndex {
    /// Create a new index, connecting to Qdrant at the configured URL.
    pub fn new(config: QdrantIndexConfig) -> Result<Self, EngramError> {
        let mut builder = Qdrant::from_url(&config.url);
        if let Some(ref token) = config.token {
            builder = builder.api_key(token.clone());
        }
        let client = builder
            .build()
            .map_err(|e| EngramError::Index(format!("failed to build Qdrant client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Create an index from an existing [`Qdrant`] client.
    pub fn from_client(client: Qdrant, config: QdrantIndexConfig) -> Self {
        Self { client, config }
    }

    /// Ensure the configured collection exists, creating it if necessary.
    pub async fn ensure_collection(&self) -> Result<(), EngramError> {
        let exists = self
            .client
            .collection_exists(&self.config.collection)
            .await
            .map_err(|e| EngramError::Index(format!("collection_exists check failed: {e}")))?;

        if !exists {
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.config.collection).vectors_config(
                        VectorParamsBuilder::new(self.config.vector_size, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| EngramError::Index(format!("failed to create collection: {e}")))?;
        }
        Ok(())
    }

    pub fn config(&self) -> &QdrantIndexConfig {
        &self.config
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn query(&self, vector: &[f32], top_k: usize) -> Result<Vec<VectorMatch>, EngramError> {
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(&self.config.collection, vector.to_vec(), top_k as u64)
                    .with_payload(true),
            )
            .await
            .map_err(|e| EngramError::Index(format!("search failed: {e}")))?;

        let matches = response
            .result
            .into_iter()
            .map(|point| {
                let id = point
                    .payload
                    .get("cache_id")
                    .and_then(|v| match &v.kind {
                        Some(Kind::StringValue(s)) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();

                let metadata = point.payload.get("metadata").map(qdrant_to_json);

                VectorMatch {
                    id,
                    score: point.score,
                    metadata,
                }
            })
            .collect();

        Ok(matches)
    }

    async fn upsert(&self, entry: VectorEntry) -> Result<(), EngramError> {
        let payload: HashMap<String, QdrantValue> = HashMap::from([
            (
                "cache_id".to_string(),
                json_to_qdrant(&JsonValue::String(entry.id.clone())),
            ),
            ("metadata".to_string(), json_to_qdrant(&entry.metadata)),
        ]);

        let point = PointStruct::new(point_uuid(&entry.id), entry.vector, payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.config.collection, vec![point]))
            .await
            .map_err(|e| EngramError::Index(format!("upsert failed: {e}")))?;

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Derive a deterministic UUID point id from a cache id, so re-upserting the
/// same id overwrites the same point.
fn point_uuid(id: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, id.as_bytes()).to_string()
}

/// Convert a `serde_json::Value` into a `qdrant_client::qdrant::Value`.
fn json_to_qdrant(json: &JsonValue) -> QdrantValue {
    let kind = match json {
        JsonValue::Null => Some(Kind::NullValue(0)),
        JsonValue::Bool(b) => Some(Kind::BoolValue(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Kind::IntegerValue(i))
            } else {
                Some(Kind::DoubleValue(n.as_f64().unwrap_or(0.0)))
            }
        }
        JsonValue::String(s) => Some(Kind::StringValue(s.clone())),
        JsonValue::Array(arr) => {
            let values: Vec<QdrantValue> = arr.iter().map(json_to_qdrant).collect();
            Some(Kind::ListValue(qdrant_client::qdrant::ListValue { values }))
        }
        JsonValue::Object(map) => {
            let fields: HashMap<String, QdrantValue> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_qdrant(v)))
                .collect();
            Some(Kind::StructValue(qdrant_client::qdrant::Struct { fields }))
        }
    };
    QdrantValue { kind }
}

/// Convert a `qdrant_client::qdrant::Value` into a `serde_json::Value`.
fn qdrant_to_json(val: &QdrantValue) -> JsonValue {
    match &val.kind {
        None | Some(Kind::NullValue(_)) => JsonValue::Null,
        Some(Kind::BoolValue(b)) => JsonValue::Bool(*b),
        Some(Kind::IntegerValue(i)) => JsonValue::Number((*i).into()),
        Some(Kind::DoubleValue(d)) => serde_json::Number::from_f64(*d)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Some(Kind::StringValue(s)) => JsonValue::String(s.clone()),
        Some(Kind::ListValue(list)) => {
            JsonValue::Array(list.values.iter().map(qdrant_to_json).collect())
        }
        Some(Kind::StructValue(st)) => {
            let map: serde_json::Map<String, JsonValue> = st
                .fields
                .iter()
                .map(|(k, v)| (k.clone(), qdrant_to_json(v)))
                .collect();
            JsonValue::Object(map)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
