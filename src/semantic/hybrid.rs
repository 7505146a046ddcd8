//! Hybrid search combining relational and vector rankings.
//!
//! Relational matches get a position-based score between 1.0 (first) and
//! 0.7 (last). Vector similarity times the vector weight is added on top, or
//! used on its own for documents only the vector channel found. Both
//! contributions are non-negative, so fusing can only raise a score.

use std::collections::HashMap;

use serde::Serialize;

use crate::semantic::Neighbor;

/// Score of the best relational match
pub const RELATIONAL_TOP_SCORE: f32 = 1.0;

/// How far the relational score decays across the match list
const RELATIONAL_DECAY: f32 = 0.3;

/// Scores closer than this are compared by answer count instead
const TIE_RESOLUTION: f32 = 100.0;

/// Per-document score record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub id: u64,
    pub relational: Option<f32>,
    /// Raw cosine similarity, before weighting
    pub similarity: Option<f32>,
    pub score: f32,
}

/// Score for position `index` (0-based) in a relational list of `total`.
pub fn relational_score(index: usize, total: usize) -> f32 {
    if total == 0 {
        return RELATIONAL_TOP_SCORE;
    }
    RELATIONAL_TOP_SCORE - RELATIONAL_DECAY * (index as f32 / total as f32)
}

/// Builds the score map from both channels.
///
/// A vector hit adds `similarity * vector_weight` to its relational score.
/// A document only the vector channel found gets that contribution alone
/// and no baseline, so at the default weight of 0.5 it scores at most 0.5
/// and always ranks below relational matches (0.7 and up).
pub fn fuse(
    relational_ids: &[u64],
    vector_hits: &[Neighbor],
    vector_weight: f32,
) -> HashMap<u64, ScoreBreakdown> {
    let weight = vector_weight.clamp(0.0, 1.0);
    let total = relational_ids.len();

    let mut scores: HashMap<u64, ScoreBreakdown> = HashMap::with_capacity(total + vector_hits.len());

    for (index, &id) in relational_ids.iter().enumerate() {
        let score = relational_score(index, total);
        // keep the better position if the list repeats an id
        scores
            .entry(id)
            .and_modify(|entry| {
                if score > entry.score {
                    entry.score = score;
                    entry.relational = Some(score);
                }
            })
            .or_insert(ScoreBreakdown {
                id,
                relational: Some(score),
                similarity: None,
                score,
            });
    }

    for hit in vector_hits {
        if hit.similarity.is_nan() || hit.similarity <= 0.0 {
            continue;
        }

        let contribution = hit.similarity * weight;
        scores
            .entry(hit.id)
            .and_modify(|entry| {
                if entry.similarity.is_none() {
                    entry.similarity = Some(hit.similarity);
                    entry.score += contribution;
                }
            })
            .or_insert(ScoreBreakdown {
                id: hit.id,
                relational: None,
                similarity: Some(hit.similarity),
                score: contribution,
            });
    }

    scores
}

/// Orders fused scores. Scores within 0.01 of each other are ranked by
/// answer count, then by exact score, then by id.
pub fn rank(
    scores: HashMap<u64, ScoreBreakdown>,
    answer_counts: &HashMap<u64, usize>,
) -> Vec<ScoreBreakdown> {
    let bucket = |s: &ScoreBreakdown| (s.score * TIE_RESOLUTION).round() as i64;
    let answers = |s: &ScoreBreakdown| answer_counts.get(&s.id).copied().unwrap_or(0);

    let mut ranked = scores.into_values().collect::<Vec<_>>();
    ranked.sort_by(|a, b| {
        bucket(b)
            .cmp(&bucket(a))
            .then_with(|| answers(b).cmp(&answers(a)))
            .then_with(|| b.score.total_cmp(&a.score))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

/// 1-based page of `items`. Out-of-range pages are empty.
pub fn paginate<T>(items: &[T], page: usize, limit: usize) -> &[T] {
    let start = page.saturating_sub(1).saturating_mul(limit);
    if start >= items.len() {
        return &[];
    }
    let end = start.saturating_add(limit).min(items.len());
    &items[start..end]
}

pub fn total_pages(total: usize, limit: usize) -> usize {
    if limit == 0 {
        return 0;
    }
    total.div_ceil(limit)
}
