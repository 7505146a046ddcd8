//! Search service: similar questions, hybrid search and embedding backfill.
//!
//! Provider and vector failures degrade instead of failing the request:
//! similar questions come back empty with a message, hybrid search falls
//! back to relational matches only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SemanticSearchConfig;
use crate::questions::{order_by_ids, Author, Category, Question, QuestionStatus, QuestionStore, ScanFilter};
use crate::semantic::embeddings::{EmbeddingError, TextEmbedder};
use crate::semantic::hybrid::{self, ScoreBreakdown};
use crate::semantic::lexical::TextMatch;
use crate::semantic::preprocess::{embedding_input, excerpt};
use crate::semantic::query::{find_similar, VectorQuery};
use crate::semantic::Neighbor;
use crate::visibility::{is_visible, ApprovalStatus, Viewer};

pub const MAX_SIMILAR_LIMIT: usize = 50;
pub const DEFAULT_PAGE_LIMIT: usize = 10;
pub const MAX_PAGE_LIMIT: usize = 100;

const EXCERPT_CHARS: usize = 200;

const MSG_NOT_CONFIGURED: &str = "Similar questions are unavailable: embeddings are not configured";
const MSG_UNAVAILABLE: &str = "Similar questions are temporarily unavailable";
const MSG_NO_TEXT: &str = "This question has no text to compare";
const MSG_KEYWORD_ONLY: &str = "Semantic matching is unavailable, showing keyword matches only";

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("question {0} not found")]
    NotFound(u64),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector query failed: {0}")]
    VectorQuery(anyhow::Error),

    #[error("store error: {0}")]
    Store(anyhow::Error),

    #[error("failed to persist embedding for question {0}: {1}")]
    Persistence(u64, anyhow::Error),
}

/// Public projection of a question.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionSummary {
    pub id: u64,
    pub title: String,
    pub excerpt: String,
    pub status: QuestionStatus,
    pub approval_status: ApprovalStatus,
    pub author: Author,
    pub categories: Vec<Category>,
    pub tags: Vec<String>,
    pub answer_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&Question> for QuestionSummary {
    fn from(q: &Question) -> Self {
        Self {
            id: q.id,
            title: q.title.clone(),
            excerpt: excerpt(&q.content, EXCERPT_CHARS),
            status: q.status,
            approval_status: q.approval_status,
            author: q.author.clone(),
            categories: q.categories.clone(),
            tags: q.tags.clone(),
            answer_count: q.answer_count(),
            created_at: q.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarQuestion {
    #[serde(flatten)]
    pub question: QuestionSummary,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SimilarOutcome {
    pub similar: Vec<SimilarQuestion>,
    /// Shown to the user on degraded paths
    pub message: Option<String>,
    /// Underlying error, only exposed when debug output is enabled
    pub diagnostic: Option<String>,
}

impl SimilarOutcome {
    fn degraded(message: &str, err: impl std::fmt::Display) -> Self {
        Self {
            similar: vec![],
            message: Some(message.to_string()),
            diagnostic: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    pub q: Option<String>,
    pub category_id: Option<u64>,
    pub author_id: Option<u64>,
    pub status: Option<QuestionStatus>,
    pub approval_status: Option<ApprovalStatus>,
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub use_vector: Option<bool>,
    pub vector_weight: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    #[serde(flatten)]
    pub question: QuestionSummary,
    pub score: f32,
    pub relational_score: Option<f32>,
    pub similarity: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone)]
pub struct SearchPage {
    pub results: Vec<SearchHit>,
    pub pagination: Pagination,
    pub used_vector: bool,
    pub message: Option<String>,
    pub diagnostic: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct SearchService<S: ?Sized, E> {
    config: SemanticSearchConfig,
    store: Arc<S>,
    embedder: Arc<E>,
}

impl<S, E> SearchService<S, E>
where
    S: QuestionStore + ?Sized,
    E: TextEmbedder,
{
    pub fn new(config: SemanticSearchConfig, store: Arc<S>, embedder: Arc<E>) -> Self {
        Self {
            config,
            store,
            embedder,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn embedder(&self) -> &Arc<E> {
        &self.embedder
    }

    /// Store calls touch the disk or scan every record, so they run with the
    /// worker thread handed over to the blocking pool.
    fn blocking<T>(&self, f: impl FnOnce(&S) -> T) -> T {
        tokio::task::block_in_place(|| f(self.store.as_ref()))
    }

    /// Questions most similar to question `id`, as seen by `viewer`.
    ///
    /// An unknown id and a source the viewer may not see are both
    /// [`SearchError::NotFound`]. Embedding and vector failures yield an
    /// empty outcome with a message.
    pub async fn similar_questions(
        &self,
        id: u64,
        viewer: Viewer,
        limit: Option<usize>,
        threshold: Option<f32>,
    ) -> Result<SimilarOutcome, SearchError> {
        let source = self
            .blocking(|store| store.get(id))
            .map_err(SearchError::Store)?
            .filter(|q| is_visible(&viewer, q.author.id, q.approval_status))
            .ok_or(SearchError::NotFound(id))?;

        let limit = limit
            .unwrap_or(self.config.similar_limit)
            .clamp(1, MAX_SIMILAR_LIMIT);
        let threshold = threshold
            .filter(|t| t.is_finite())
            .unwrap_or(self.config.similar_threshold)
            .clamp(0.0, 1.0);
        let dimensions = self.config.expected_dimensions();

        let vector = match source.embedding_with_dimensions(dimensions) {
            Some(stored) => stored.to_vec(),
            None => match self.embed_question(&source).await {
                Ok(vector) => vector,
                Err(SearchError::Embedding(EmbeddingError::EmptyInput)) => {
                    return Ok(SimilarOutcome::degraded(MSG_NO_TEXT, EmbeddingError::EmptyInput));
                }
                Err(SearchError::Embedding(err @ EmbeddingError::CredentialMissing(_))) => {
                    log::warn!("similar questions for #{id} skipped: {err}");
                    return Ok(SimilarOutcome::degraded(MSG_NOT_CONFIGURED, err));
                }
                Err(err) => {
                    log::warn!("similar questions for #{id} degraded: {err}");
                    return Ok(SimilarOutcome::degraded(MSG_UNAVAILABLE, err));
                }
            },
        };

        let query = VectorQuery::new(&vector, ScanFilter::for_viewer(viewer), threshold, limit)
            .excluding([id]);

        let neighbors = match self.blocking(|store| find_similar(store, &query, dimensions)) {
            Ok(neighbors) => neighbors,
            Err(err) => {
                log::warn!("similar questions for #{id} degraded: {err}");
                return Ok(SimilarOutcome::degraded(MSG_UNAVAILABLE, err));
            }
        };

        let similarity = neighbors
            .iter()
            .map(|n| (n.id, n.similarity))
            .collect::<HashMap<_, _>>();
        let ids = neighbors.iter().map(|n| n.id).collect::<Vec<_>>();

        let records = self
            .blocking(|store| store.fetch_many(&ids))
            .map_err(SearchError::Store)?;
        let similar = order_by_ids(&ids, records)
            .iter()
            .filter(|q| is_visible(&viewer, q.author.id, q.approval_status))
            .filter_map(|q| {
                similarity.get(&q.id).map(|&similarity| SimilarQuestion {
                    question: QuestionSummary::from(q),
                    similarity,
                })
            })
            .collect();

        Ok(SimilarOutcome {
            similar,
            message: None,
            diagnostic: None,
        })
    }

    /// Generates an embedding for `question` and stores it when it has the
    /// expected length. Storing is best-effort.
    async fn embed_question(&self, question: &Question) -> Result<Vec<f32>, SearchError> {
        let input =
            embedding_input(&question.title, &question.content).ok_or(EmbeddingError::EmptyInput)?;

        let vector = self.embedder.embed(&input).await?;

        let expected = self.config.expected_dimensions();
        if vector.len() != expected {
            return Err(SearchError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }

        if let Err(err) = self.persist(question.id, vector.clone()) {
            log::warn!("{err}");
        }

        Ok(vector)
    }

    fn persist(&self, id: u64, vector: Vec<f32>) -> Result<(), SearchError> {
        self.blocking(|store| store.set_embedding(id, vector))
            .map_err(|err| SearchError::Persistence(id, err))
    }

    /// Relational matches fused with vector similarity, paginated.
    ///
    /// Only relational scan failures are errors. Without a provider key the
    /// vector channel is skipped quietly. Any other vector failure is logged
    /// and the page is built from relational matches alone.
    pub async fn search(&self, params: SearchParams, viewer: Viewer) -> Result<SearchPage, SearchError> {
        let page = params.page.unwrap_or(1).max(1);
        let limit = params
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        let weight = params
            .vector_weight
            .filter(|w| w.is_finite())
            .unwrap_or(self.config.vector_weight)
            .clamp(0.0, 1.0);

        let text = params.q.as_deref().and_then(TextMatch::new);

        let filter = ScanFilter {
            viewer,
            category_id: params.category_id,
            author_id: params.author_id,
            status: params.status,
            approval_status: params.approval_status,
            text: text.clone(),
            exclude: HashSet::new(),
            limit: None,
        };

        let relational = self
            .blocking(|store| store.scan(&filter))
            .map_err(SearchError::Store)?;
        let relational_ids = relational.iter().map(|q| q.id).collect::<Vec<_>>();

        let Some(text) = text else {
            // list mode, newest first
            let total = relational.len();
            let results = hybrid::paginate(&relational, page, limit)
                .iter()
                .enumerate()
                .map(|(offset, q)| {
                    let score = hybrid::relational_score((page - 1).saturating_mul(limit) + offset, total);
                    SearchHit {
                        question: QuestionSummary::from(q),
                        score,
                        relational_score: Some(score),
                        similarity: None,
                    }
                })
                .collect();

            return Ok(SearchPage {
                results,
                pagination: pagination(page, limit, total),
                used_vector: false,
                message: None,
                diagnostic: None,
            });
        };

        let mut message = None;
        let mut diagnostic = None;
        let mut vector_hits = vec![];
        let mut used_vector = false;

        let use_vector = params.use_vector.unwrap_or(true);
        if use_vector && !self.embedder.is_available() {
            log::debug!("no {} key, vector channel skipped", self.embedder.provider());
        }

        if use_vector && self.embedder.is_available() {
            let vector_filter = ScanFilter {
                text: None,
                ..filter.clone()
            };
            let query = params.q.as_deref().map(str::trim).unwrap_or(text.phrase());

            match self.vector_channel(query, vector_filter, limit * 2).await {
                Ok(hits) => {
                    vector_hits = hits;
                    used_vector = true;
                }
                Err(err) => {
                    log::warn!("vector channel failed, using relational matches only: {err}");
                    message = Some(MSG_KEYWORD_ONLY.to_string());
                    diagnostic = Some(err.to_string());
                }
            }
        }

        let mut records = relational
            .into_iter()
            .map(|q| (q.id, q))
            .collect::<HashMap<_, _>>();

        let vector_only = vector_hits
            .iter()
            .map(|n| n.id)
            .filter(|id| !records.contains_key(id))
            .collect::<Vec<_>>();

        if !vector_only.is_empty() {
            match self.blocking(|store| store.fetch_many(&vector_only)) {
                Ok(fetched) => {
                    for q in fetched.into_iter().filter(|q| filter.admits(q)) {
                        records.insert(q.id, q);
                    }
                }
                Err(err) => log::warn!("failed to load vector matches: {err}"),
            }
        }

        // drop hits whose record is gone or no longer visible
        vector_hits.retain(|n| records.contains_key(&n.id));

        let answer_counts = records
            .iter()
            .map(|(id, q)| (*id, q.answer_count()))
            .collect::<HashMap<_, _>>();

        let ranked = hybrid::rank(
            hybrid::fuse(&relational_ids, &vector_hits, weight),
            &answer_counts,
        );

        let results = hybrid::paginate(&ranked, page, limit)
            .iter()
            .filter_map(|breakdown| records.get(&breakdown.id).map(|q| to_hit(q, breakdown)))
            .collect();

        Ok(SearchPage {
            results,
            pagination: pagination(page, limit, ranked.len()),
            used_vector,
            message,
            diagnostic,
        })
    }

    async fn vector_channel(
        &self,
        query: &str,
        filter: ScanFilter,
        limit: usize,
    ) -> Result<Vec<Neighbor>, SearchError> {
        let vector = self.embedder.embed(query).await?;
        let query = VectorQuery::new(&vector, filter, self.config.search_threshold, limit);
        let dimensions = self.config.expected_dimensions();
        self.blocking(|store| find_similar(store, &query, dimensions))
    }

    /// Embeds every question missing a usable embedding, or every question
    /// when `force` is set. `on_progress` is called once per question.
    pub async fn backfill(
        &self,
        force: bool,
        mut on_progress: impl FnMut(&BackfillReport),
    ) -> Result<BackfillReport, SearchError> {
        if !self.embedder.is_available() {
            return Err(EmbeddingError::CredentialMissing(self.embedder.provider()).into());
        }

        let dimensions = self.config.expected_dimensions();
        let ids = self
            .blocking(|store| store.all_ids())
            .map_err(SearchError::Store)?;
        let mut report = BackfillReport::default();

        for id in ids {
            let Some(question) = self
                .blocking(|store| store.get(id))
                .map_err(SearchError::Store)?
            else {
                report.skipped += 1;
                on_progress(&report);
                continue;
            };

            if !force && question.embedding_with_dimensions(dimensions).is_some() {
                report.skipped += 1;
                on_progress(&report);
                continue;
            }

            match self.embed_for_backfill(&question).await {
                Ok(true) => report.embedded += 1,
                Ok(false) => report.skipped += 1,
                Err(err) => {
                    log::warn!("backfill failed for question #{id}: {err}");
                    report.failed += 1;
                }
            }
            on_progress(&report);
        }

        log::info!(
            "backfill done: {} embedded, {} skipped, {} failed",
            report.embedded,
            report.skipped,
            report.failed
        );

        Ok(report)
    }

    /// `Ok(false)` when the question has no text.
    async fn embed_for_backfill(&self, question: &Question) -> Result<bool, SearchError> {
        let Some(input) = embedding_input(&question.title, &question.content) else {
            return Ok(false);
        };

        let vector = self.embedder.embed(&input).await?;

        let expected = self.config.expected_dimensions();
        if vector.len() != expected {
            return Err(SearchError::DimensionMismatch {
                expected,
                got: vector.len(),
            });
        }

        self.persist(question.id, vector)?;
        Ok(true)
    }
}

fn to_hit(question: &Question, breakdown: &ScoreBreakdown) -> SearchHit {
    SearchHit {
        question: QuestionSummary::from(question),
        score: breakdown.score,
        relational_score: breakdown.relational,
        similarity: breakdown.similarity,
    }
}

fn pagination(page: usize, limit: usize, total: usize) -> Pagination {
    Pagination {
        page,
        limit,
        total,
        total_pages: hybrid::total_pages(total, limit),
    }
}
