use async_openai::types::CreateEmbeddingRequestArgs;
use async_openai::{config::OpenAIConfig, Client};
use futures::{stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::debug;

use crate::config::AppConfig;
use crate::error::AppError;

/// Batched embedding client. Vectors come back L2-normalised so cosine
/// similarity downstream is a plain dot product over unit vectors.
#[derive(Clone)]
pub struct Embedder {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    dimensions: u32,
    batch_size: usize,
    concurrency: usize,
}

impl Embedder {
    pub fn new(client: Arc<Client<OpenAIConfig>>, config: &AppConfig) -> Self {
        Self {
            client,
            model: config.embedding_model.clone(),
            dimensions: config.embedding_dimensions,
            batch_size: config.embedding_batch_size.max(1),
            concurrency: config.embedding_concurrency.clamp(1, 4),
        }
    }

    pub fn dimensions(&self) -> u32 {
        self.dimensions
    }

    pub async fn embed_one(&self, input: &str) -> Result<Vec<f32>, AppError> {
        let mut vectors = self.embed_batch(&[input.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::llm("no embedding data received"))
    }

    /// Embeds every text, preserving order. Batches are issued with bounded
    /// parallelism; each batch retries on transient API failures with
    /// jittered exponential backoff.
    pub async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<Vec<String>> = inputs
            .chunks(self.batch_size)
            .map(|batch| batch.to_vec())
            .collect();
        let total = batches.len();

        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches.into_iter().enumerate())
            .map(|(index, batch)| {
                let embedder = self.clone();
                async move {
                    let retry_strategy = ExponentialBackoff::from_millis(200).map(jitter).take(4);
                    let vectors = Retry::spawn(retry_strategy, || embedder.embed_once(&batch))
                        .await?;
                    debug!(batch = index + 1, total, size = batch.len(), "embedded batch");
                    Ok::<_, AppError>(vectors)
                }
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    async fn embed_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimensions)
            .input(batch.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        if response.data.len() != batch.len() {
            return Err(AppError::llm(format!(
                "embedding response returned {} vectors for {} inputs",
                response.data.len(),
                batch.len()
            )));
        }

        let mut vectors: Vec<(u32, Vec<f32>)> = response
            .data
            .into_iter()
            .map(|d| (d.index, l2_normalise(d.embedding)))
            .collect();
        vectors.sort_by_key(|(index, _)| *index);

        Ok(vectors.into_iter().map(|(_, v)| v).collect())
    }
}

/// Normalises to unit length unless the vector already is (or is zero).
pub fn l2_normalise(mut vector: Vec<f32>) -> Vec<f32> {
    let norm_sq: f32 = vector.iter().map(|v| v * v).sum();
    if norm_sq <= f32::EPSILON {
        return vector;
    }
    let norm = norm_sq.sqrt();
    if (norm - 1.0).abs() > 1e-3 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|v| v * v).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm_a <= f32::EPSILON || norm_b <= f32::EPSILON {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_to_unit_length() {
        let normalised = l2_normalise(vec![3.0, 4.0]);
        let norm: f32 = normalised.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!((normalised[0] - 0.6).abs() < 1e-5);
    }

    #[test]
    fn leaves_unit_and_zero_vectors_alone() {
        assert_eq!(l2_normalise(vec![1.0, 0.0]), vec![1.0, 0.0]);
        assert_eq!(l2_normalise(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }
}
