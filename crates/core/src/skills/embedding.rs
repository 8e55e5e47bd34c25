//! # Embeddings and Clustering
//!
//! Topic strings are embedded through an OpenAI-compatible `/embeddings`
//! endpoint and grouped with deterministic k-means.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use crate::errors::ServiceError;
use crate::services::{ClusteringService, TopicClustering};
use crate::tools::kmeans::kmeans;

/// Inputs per embeddings request
const MAX_BATCH: usize = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const API_KEY_VAR: &str = "OPENAI_API_KEY";

/// Turns strings into vectors, one per input and in input order.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ServiceError>;
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

pub struct OpenAiEmbeddings {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiEmbeddings {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }

    async fn embed_batch(&self, api_key: &str, batch: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: batch,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::from_status(status.as_u16(), &body, retry_after));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::InvalidResponse(format!("embeddings: {}", e)))?;
        order_embeddings(parsed.data, batch.len())
    }
}

#[async_trait]
impl Embedder for OpenAiEmbeddings {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        let api_key = std::env::var(API_KEY_VAR)
            .map_err(|_| ServiceError::Config(format!("{} is not set", API_KEY_VAR)))?;

        let mut vectors = Vec::with_capacity(inputs.len());
        for batch in inputs.chunks(MAX_BATCH) {
            vectors.extend(self.embed_batch(&api_key, batch).await?);
        }
        tracing::debug!(model = %self.model, count = vectors.len(), "Embedded topics");
        Ok(vectors)
    }
}

/// Sort by the response index and check one vector came back per input.
fn order_embeddings(mut data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>, ServiceError> {
    data.sort_by_key(|d| d.index);
    if data.len() != expected || data.iter().enumerate().any(|(i, d)| d.index != i) {
        return Err(ServiceError::InvalidResponse(format!(
            "expected {} embeddings, got {}",
            expected,
            data.len()
        )));
    }
    Ok(data.into_iter().map(|d| d.embedding).collect())
}

/// `Retry-After` in seconds; HTTP dates are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// [`ClusteringService`] that embeds topics and runs k-means over them.
pub struct EmbeddingClusterer<E> {
    embedder: E,
}

impl<E: Embedder> EmbeddingClusterer<E> {
    pub fn new(embedder: E) -> Self {
        Self { embedder }
    }
}

#[async_trait]
impl<E: Embedder> ClusteringService for EmbeddingClusterer<E> {
    async fn cluster(&self, topics: &[String], k: usize) -> Result<TopicClustering, ServiceError> {
        if topics.is_empty() {
            return Ok(TopicClustering::default());
        }
        let vectors = self.embedder.embed(topics).await?;
        let result = kmeans(&vectors, k).ok_or_else(|| {
            ServiceError::InvalidResponse("embeddings could not be clustered".to_string())
        })?;
        tracing::debug!(
            topics = topics.len(),
            k = result.centroids.len(),
            iterations = result.iterations,
            "Clustered topics"
        );
        Ok(TopicClustering {
            vectors,
            assignments: result.assignments,
        })
    }
}
