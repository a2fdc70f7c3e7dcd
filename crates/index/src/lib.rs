pub mod cache;
pub mod embeddings;
pub mod memory;
pub mod neo4j_store;
pub mod store;
pub mod vector_index;

pub use cache::{CacheStats, CachedEmbedder};
pub use embeddings::{Embedder, EmbeddingClient, EmbeddingConfig, EmbeddingError};
pub use memory::MemoryGraphStore;
pub use neo4j_store::{FULLTEXT_INDEX, Neo4jConfig, Neo4jStore, VECTOR_INDEX};
pub use store::{GraphStats, GraphStore, Row, StoreError, StoreSchema};
pub use vector_index::{
    EntityIndex, HybridIndex, IndexConfig, IndexError, RrfFusion, SearchHit, VectorEntry, VectorIndexer,
};
