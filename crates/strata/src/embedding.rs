//! Embedding client seam
//!
//! Embedding generation lives outside this crate. Callers that want to query
//! by text hand the manager anything implementing [`Embedder`].

use crate::error::{Result, StrataError};

/// Turns text into a fixed-length vector
pub trait Embedder: Send + Sync {
    /// Embed a single text
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Dimension of every vector this embedder produces
    fn dimension(&self) -> usize;

    /// Embed several texts, failing on the first error
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// Reject an embedder whose output cannot be stored
pub fn check_dimension(embedder: &dyn Embedder, expected: usize) -> Result<()> {
    if embedder.dimension() != expected {
        return Err(StrataError::Config(format!(
            "embedder produces {}-dimensional vectors, store expects {}",
            embedder.dimension(),
            expected
        )));
    }
    Ok(())
}
