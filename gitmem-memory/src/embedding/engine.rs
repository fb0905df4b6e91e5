//! Memoizing wrapper around a provider

use dashmap::DashMap;
use std::sync::Arc;

use super::EmbeddingProvider;
use crate::error::{MemoryError, Result};

/// Provider wrapper with a DashMap cache for repeated lookups
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: DashMap<String, Vec<f32>>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>) -> Self {
        log::info!("Embedding provider ready ({}d)", inner.dimension());
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    /// Get cache size
    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Clear the cache
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn check_dimension(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() == self.inner.dimension() {
            Ok(())
        } else {
            Err(MemoryError::embedding(format!(
                "provider returned {} dimensions, expected {}",
                embedding.len(),
                self.inner.dimension()
            )))
        }
    }
}

impl EmbeddingProvider for CachedEmbedder {
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cached) = self.cache.get(text) {
            return Ok(cached.clone());
        }

        let embedding = self.inner.embed(text)?;
        self.check_dimension(&embedding)?;
        self.cache.insert(text.to_string(), embedding.clone());
        Ok(embedding)
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = texts
            .iter()
            .map(|text| self.cache.get(*text).map(|v| v.clone()))
            .collect();

        let uncached: Vec<(usize, &str)> = results
            .iter()
            .enumerate()
            .filter(|(_, cached)| cached.is_none())
            .map(|(i, _)| (i, texts[i]))
            .collect();

        if !uncached.is_empty() {
            let uncached_texts: Vec<&str> = uncached.iter().map(|(_, t)| *t).collect();
            let fresh = self.inner.embed_batch(&uncached_texts)?;
            if fresh.len() != uncached.len() {
                return Err(MemoryError::embedding(format!(
                    "provider returned {} embeddings for {} texts",
                    fresh.len(),
                    uncached.len()
                )));
            }

            for ((idx, text), emb) in uncached.iter().zip(fresh) {
                self.check_dimension(&emb)?;
                self.cache.insert(text.to_string(), emb.clone());
                results[*idx] = Some(emb);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }
}
