//! Cosine nearest-neighbour ranking over stored question embeddings.

use serde::Serialize;

/// A question ranked by closeness to a query vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Neighbor {
    pub id: u64,
    /// Cosine similarity, `1 - distance`. NaN when either vector has no
    /// direction.
    pub similarity: f32,
}

impl Neighbor {
    pub fn distance(&self) -> f32 {
        1.0 - self.similarity
    }
}

/// L2 norm of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Cosine similarity with the query norm precomputed. Returns NaN for a
/// zero-norm target, same as a database vector extension would.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if query_norm < f32::EPSILON || target_norm < f32::EPSILON {
        return f32::NAN;
    }

    let dot_product: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot_product / (query_norm * target_norm)
}

/// Ranks `candidates` by ascending cosine distance to `query` and keeps the
/// first `limit`. Candidates of a different length are skipped. Undefined
/// distances sort last.
pub fn rank_nearest<'a>(
    query: &[f32],
    candidates: impl IntoIterator<Item = (u64, &'a [f32])>,
    limit: usize,
) -> Vec<Neighbor> {
    let query_norm = l2_norm(query);

    let mut ranked = candidates
        .into_iter()
        .filter(|(_, embedding)| embedding.len() == query.len())
        .map(|(id, embedding)| Neighbor {
            id,
            similarity: cosine_similarity(query, embedding, query_norm),
        })
        .collect::<Vec<_>>();

    let sort_key = |n: &Neighbor| {
        let distance = n.distance();
        if distance.is_nan() {
            f32::INFINITY
        } else {
            distance
        }
    };

    ranked.sort_by(|a, b| {
        sort_key(a)
            .total_cmp(&sort_key(b))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked.truncate(limit);
    ranked
}
