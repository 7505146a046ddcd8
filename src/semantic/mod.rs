//! Semantic search over questions.
//!
//! # Architecture
//!
//! - `embeddings`: hosted embedding providers with retries and fallback
//! - `cache`: TTL and capacity bounded text -> vector memo
//! - `preprocess`: block JSON / HTML flattening and provider input
//! - `index`: cosine ranking primitive
//! - `query`: filter-then-limit vector queries with similarity bounds
//! - `lexical`: relational keyword matching
//! - `hybrid`: score fusion, ranking and pagination
//! - `service`: similar questions, hybrid search, backfill

pub mod cache;
pub mod embeddings;
pub mod hybrid;
pub mod index;
pub mod lexical;
pub mod preprocess;
pub mod query;
pub mod service;

pub use cache::{spawn_sweeper, EmbeddingCache};
pub use embeddings::{Credentials, DimensionPolicy, Embedder, ProviderKind, TextEmbedder};
pub use index::Neighbor;
pub use service::{Pagination, SearchError, SearchHit, SearchParams, SearchService, SimilarQuestion};
