mod fake;
mod openai;

pub use fake::FakeEmbeddings;
pub use openai::{OpenAiEmbeddings, OpenAiEmbeddingsConfig};

// Re-export the Embeddings trait from core (forward-declared there).
pub use engram_core::Embeddings;
