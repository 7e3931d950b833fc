mod index;

pub use index::{QdrantIndexConfig, QdrantVectorIndex, DEFAULT_COLLECTION, DEFAULT_VECTOR_SIZE};
