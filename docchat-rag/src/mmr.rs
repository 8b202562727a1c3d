//! Maximal Marginal Relevance (MMR) for diversity-aware retrieval.
//!
//! MMR picks results one at a time, each maximising
//! `λ × sim(query, doc) − (1 − λ) × max sim(doc, already_selected)`.
//!
//! λ = 1.0: pure relevance (plain top-K)
//! λ = 0.5: balanced relevance and diversity
//! λ = 0.0: pure diversity

use crate::document::SearchResult;

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 if either vector has zero magnitude or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = magnitude(a);
    let norm_b = magnitude(b);
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

fn magnitude(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Select up to `k` candidates by maximal marginal relevance.
///
/// Candidates must carry their embeddings; the query relevance of a candidate
/// without one falls back to its search score and it is treated as dissimilar
/// to everything. Results are returned in selection order with their original
/// scores.
pub fn mmr_select(
    query: &[f32],
    candidates: Vec<SearchResult>,
    k: usize,
    lambda: f32,
) -> Vec<SearchResult> {
    if candidates.is_empty() || k == 0 {
        return Vec::new();
    }

    let k = k.min(candidates.len());
    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| {
            if c.chunk.embedding.is_empty() {
                c.score
            } else {
                cosine_similarity(query, &c.chunk.embedding)
            }
        })
        .collect();

    let mut remaining: Vec<(SearchResult, f32)> = candidates.into_iter().zip(relevance).collect();
    let mut selected: Vec<SearchResult> = Vec::with_capacity(k);

    while selected.len() < k && !remaining.is_empty() {
        let mut best_idx = 0;
        let mut best_mmr = f32::NEG_INFINITY;

        for (idx, (candidate, relevance)) in remaining.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.chunk.embedding, &s.chunk.embedding))
                .fold(0.0f32, f32::max);
            let mmr = lambda * relevance - (1.0 - lambda) * redundancy;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = idx;
            }
        }

        let (best, _) = remaining.remove(best_idx);
        selected.push(best);
    }

    selected
}
