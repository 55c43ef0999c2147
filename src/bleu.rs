use std::collections::HashMap;

use itertools::Itertools;

pub const DEFAULT_WEIGHTS: [f64; 4] = [0.25; 4];

fn ngram_counts<S: AsRef<str>>(tokens: &[S], max_n: usize) -> HashMap<Vec<&str>, usize> {
    let tokens: Vec<&str> = tokens.iter().map(AsRef::as_ref).collect();
    (1..=max_n)
        .flat_map(|n| tokens.windows(n).map(<[&str]>::to_vec).collect::<Vec<_>>())
        .counts()
}

/// Corpus-level BLEU over tokenised candidates, each with one or more references.
///
/// Clipped n-gram precisions for n in `1..=max_n` are combined as a weighted
/// geometric mean and scaled by the brevity penalty. The reference length used
/// for each candidate is that of its closest-length reference, the first one
/// listed on a tie. Any order with no clipped matches makes the whole score 0.
pub fn corpus_bleu<C, R>(candidates: &[Vec<C>], references: &[Vec<Vec<R>>], max_n: usize, weights: &[f64]) -> f64
where
    C: AsRef<str>,
    R: AsRef<str>,
{
    assert_eq!(
        candidates.len(),
        references.len(),
        "candidate corpus and reference corpus must be the same length"
    );
    assert_eq!(weights.len(), max_n, "need one weight per n-gram order");

    let mut clipped = vec![0usize; max_n];
    let mut total = vec![0usize; max_n];
    let (mut candidate_len, mut reference_len) = (0usize, 0usize);

    for (candidate, refs) in candidates.iter().zip(references) {
        candidate_len += candidate.len();
        reference_len += refs
            .iter()
            .map(Vec::len)
            .min_by_key(|len| len.abs_diff(candidate.len()))
            .unwrap_or_default();

        let mut reference_counts: HashMap<Vec<&str>, usize> = HashMap::new();
        for reference in refs {
            for (ngram, count) in ngram_counts(reference, max_n) {
                let entry = reference_counts.entry(ngram).or_default();
                *entry = (*entry).max(count);
            }
        }

        for (ngram, count) in ngram_counts(candidate, max_n) {
            let matched = reference_counts.get(&ngram).copied().unwrap_or_default();
            clipped[ngram.len() - 1] += count.min(matched);
        }
        for (n, t) in total.iter_mut().enumerate() {
            *t += candidate.len().saturating_sub(n);
        }
    }

    if clipped.iter().any(|c| *c == 0) {
        return 0.0;
    }

    let log_precision: f64 = clipped
        .iter()
        .zip(&total)
        .zip(weights)
        .map(|((c, t), w)| w * (*c as f64 / *t as f64).ln())
        .sum();
    let brevity_penalty = (1.0 - reference_len as f64 / candidate_len as f64).min(0.0).exp();
    brevity_penalty * log_precision.exp()
}

/// `corpus_bleu` with 4-gram orders and uniform weights.
pub fn bleu_score<C: AsRef<str>, R: AsRef<str>>(candidates: &[Vec<C>], references: &[Vec<Vec<R>>]) -> f64 {
    corpus_bleu(candidates, references, 4, &DEFAULT_WEIGHTS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(s: &str) -> Vec<&str> {
        s.split_whitespace().collect()
    }

    #[test]
    fn identical_corpus_scores_one() {
        let candidates = vec![words("a man is riding a horse on the beach")];
        let references = vec![vec![words("a man is riding a horse on the beach")]];
        assert!((bleu_score(&candidates, &references) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn no_four_gram_match_scores_zero() {
        let candidates = vec![words("a dog runs fast")];
        let references = vec![vec![words("a dog runs slowly")]];
        assert_eq!(bleu_score(&candidates, &references), 0.0);
    }

    #[test]
    fn short_candidate_is_penalised() {
        // All precisions are 1, so the score is just the brevity penalty.
        let candidates = vec![words("my full pytorch test")];
        let references = vec![vec![words("my full pytorch test and more")]];
        let expected = (1.0f64 - 6.0 / 4.0).exp();
        assert!((bleu_score(&candidates, &references) - expected).abs() < 1e-9);
    }

    #[test]
    fn matches_reference_values() {
        let candidates = vec![words("My full pytorch test"), words("Another Sentence")];
        let references = vec![
            vec![words("My full pytorch test"), words("Completely Different")],
            vec![words("No Match")],
        ];
        let score = bleu_score(&candidates, &references);
        assert!((score - 0.8408964).abs() < 1e-6, "{score}");
    }

    #[test]
    fn counts_are_clipped_by_references() {
        let candidates = vec![words("the the the the")];
        let references = vec![vec![words("the cat"), words("the the")]];
        // Unigrams clip to 2 of 4 and no trigram matches.
        assert_eq!(bleu_score(&candidates, &references), 0.0);
        let score = corpus_bleu(&candidates, &references, 1, &[1.0]);
        assert!((score - 0.5).abs() < 1e-9, "{score}");
    }
}
