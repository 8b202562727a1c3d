//! Nearest-neighbour retrieval over a [`VectorStore`].

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::document::SearchResult;
use crate::error::{RagError, Result};
use crate::mmr::mmr_select;
use crate::vectorstore::VectorStore;

/// How the vector index is searched.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Plain top-K by cosine similarity.
    Similarity,
    /// Fetch `fetch_k` candidates, then pick K by maximal marginal relevance.
    Mmr {
        /// Candidates fetched before re-ranking.
        fetch_k: usize,
        /// Relevance/diversity balance in `[0, 1]`.
        lambda: f32,
    },
}

impl Default for SearchStrategy {
    fn default() -> Self {
        Self::Mmr { fetch_k: 20, lambda: 0.5 }
    }
}

impl fmt::Display for SearchStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Similarity => f.write_str("similarity"),
            Self::Mmr { fetch_k, lambda } => write!(f, "mmr(fetch_k={fetch_k}, lambda={lambda})"),
        }
    }
}

/// The strategy kind named by `SEARCH_TYPE`, without its parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchKind {
    Similarity,
    Mmr,
}

impl FromStr for SearchKind {
    type Err = RagError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "similarity" | "topk" | "top_k" => Ok(Self::Similarity),
            "mmr" => Ok(Self::Mmr),
            other => Err(RagError::Config(format!(
                "unknown search type '{other}', expected 'mmr' or 'similarity'"
            ))),
        }
    }
}

fn by_score_desc(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Query `collection` for the `top_k` records most relevant to `embedding`.
///
/// The result set is ordered by non-increasing score, holds at most `top_k`
/// entries, and drops anything scoring below `threshold`. Returned chunks do
/// not carry embeddings.
pub async fn retrieve(
    store: &dyn VectorStore,
    collection: &str,
    embedding: &[f32],
    top_k: usize,
    strategy: &SearchStrategy,
    threshold: f32,
) -> Result<Vec<SearchResult>> {
    let mut results = match *strategy {
        SearchStrategy::Similarity => store.search(collection, embedding, top_k, false).await?,
        SearchStrategy::Mmr { fetch_k, lambda } => {
            let candidates =
                store.search(collection, embedding, fetch_k.max(top_k), true).await?;
            let candidate_count = candidates.len();
            let mut picked = mmr_select(embedding, candidates, top_k, lambda);
            for result in &mut picked {
                result.chunk.embedding = Vec::new();
            }
            debug!(candidate_count, picked = picked.len(), lambda, "mmr re-ranked candidates");
            picked
        }
    };

    results.sort_by(by_score_desc);
    results.truncate(top_k);
    results.retain(|r| r.score >= threshold);
    Ok(results)
}
