use async_trait::async_trait;
use vrs_core::EntityId;

use crate::StoreError;

/// Entity embeddings keyed by entity identity; one vector per entity.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Replaces any prior vector for the entity.
    async fn replace_entity_vector(
        &self,
        entity_id: EntityId,
        embedding: Vec<f32>,
        metadata: serde_json::Value,
    ) -> Result<(), StoreError>;
}
