//! # Tools
//!
//! Deterministic building blocks used by the stages.
//!
//! - `collector` - Directory-backed message source
//! - `transcript` - Message filtering, sampling and chunking
//! - `topics` - Topic merging, normalization and commercial scoring
//! - `kmeans` - Deterministic k-means over embedding vectors

pub mod collector;
pub mod kmeans;
pub mod topics;
pub mod transcript;
