//! Embedding providers
//!
//! The index stores whatever vectors a provider produces. Providers are
//! optional: every caller degrades to substring search without one.

mod engine;
mod hashing;

pub use engine::CachedEmbedder;
pub use hashing::HashEmbedder;

use crate::error::Result;
use crate::node::Memory;

/// Turns text into fixed-dimension vectors
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Text embedded for a memory
pub fn embedding_text(memory: &Memory) -> String {
    if memory.content.is_empty() {
        memory.summary.clone()
    } else {
        format!("{}\n\n{}", memory.summary, memory.content)
    }
}
