//! Filtered nearest-neighbour queries over stored question embeddings.

use std::collections::HashSet;

use crate::{
    questions::{QuestionStore, ScanFilter},
    semantic::{service::SearchError, Neighbor},
};

/// One vector query. `filter` carries the viewer, the structured filters
/// and the ids to exclude; its text match and limit are ignored.
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    pub vector: &'a [f32],
    pub filter: ScanFilter,
    /// Results must be strictly more similar than this
    pub threshold: f32,
    pub limit: usize,
}

impl<'a> VectorQuery<'a> {
    pub fn new(vector: &'a [f32], filter: ScanFilter, threshold: f32, limit: usize) -> Self {
        Self {
            vector,
            filter,
            threshold,
            limit,
        }
    }

    pub fn excluding(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.filter.exclude.extend(ids);
        self
    }
}

/// Runs `query` against `store`. Every returned similarity is in
/// `(threshold, 1.0]`, highest first.
pub fn find_similar<S>(
    store: &S,
    query: &VectorQuery<'_>,
    dimensions: usize,
) -> Result<Vec<Neighbor>, SearchError>
where
    S: QuestionStore + ?Sized,
{
    if query.vector.len() != dimensions {
        return Err(SearchError::DimensionMismatch {
            expected: dimensions,
            got: query.vector.len(),
        });
    }

    if query.vector.iter().any(|x| !x.is_finite()) {
        return Err(SearchError::VectorQuery(anyhow::anyhow!(
            "query vector has non-finite components"
        )));
    }

    if query.limit == 0 {
        return Ok(vec![]);
    }

    let filter = ScanFilter {
        text: None,
        limit: None,
        ..query.filter.clone()
    };

    let neighbors = store
        .nearest(query.vector, &filter, query.limit)
        .map_err(SearchError::VectorQuery)?;

    Ok(post_filter(neighbors, query.threshold, &query.filter.exclude))
}

/// Drops undefined, non-positive and at-or-below-threshold similarities and
/// clamps rounding noise above 1.0.
pub fn post_filter(neighbors: Vec<Neighbor>, threshold: f32, exclude: &HashSet<u64>) -> Vec<Neighbor> {
    let mut kept = neighbors
        .into_iter()
        .filter(|n| !exclude.contains(&n.id))
        .filter(|n| !n.similarity.is_nan() && n.similarity > 0.0 && n.similarity > threshold)
        .map(|n| Neighbor {
            similarity: n.similarity.min(1.0),
            ..n
        })
        .collect::<Vec<_>>();

    kept.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| a.id.cmp(&b.id))
    });
    kept
}
