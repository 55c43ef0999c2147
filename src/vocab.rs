use std::collections::HashMap;

use itertools::Itertools;

use crate::config::{SPECIAL_SYMBOLS, UNK_IDX};

/// Bidirectional token <-> id table. Lookups of unknown tokens fall back to the
/// unknown id instead of failing.
#[derive(Debug, Clone)]
pub struct Vocab {
    tokens: Vec<String>,
    indexes: HashMap<String, usize>,
}

impl Vocab {
    /// Builds a vocabulary from tokenized sentences.
    ///
    /// Specials come first in the given order, then every token seen at least
    /// `min_freq` times, most frequent first with ties broken alphabetically.
    /// `max_tokens` caps the total size, specials included.
    pub fn build<I, S>(
        sentences: I,
        min_freq: usize,
        specials: &[&str],
        max_tokens: Option<usize>,
    ) -> Self
    where
        I: IntoIterator<Item = Vec<S>>,
        S: Into<String>,
    {
        let mut counts = sentences
            .into_iter()
            .flatten()
            .map(Into::<String>::into)
            .counts();
        for special in specials {
            counts.remove(*special);
        }

        let budget = max_tokens.map(|m| m.saturating_sub(specials.len()));
        let ordered = counts
            .into_iter()
            .filter(|(_, c)| *c >= min_freq)
            .sorted_by(|(a, ca), (b, cb)| cb.cmp(ca).then_with(|| a.cmp(b)))
            .map(|(t, _)| t)
            .take(budget.unwrap_or(usize::MAX));

        let tokens: Vec<String> = specials
            .iter()
            .map(|s| s.to_string())
            .chain(ordered)
            .collect();
        Self::from_tokens(tokens)
    }

    pub fn from_tokens(tokens: Vec<String>) -> Self {
        let indexes = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self { tokens, indexes }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn index(&self, token: &str) -> usize {
        self.indexes
            .get(token)
            .copied()
            .unwrap_or(UNK_IDX)
    }

    pub fn indexes_from_tokens<S: AsRef<str>>(&self, tokens: &[S]) -> Vec<usize> {
        tokens.iter().map(|t| self.index(t.as_ref())).collect()
    }

    /// Ids past the end of the table read as the unknown symbol.
    pub fn lookup_token(&self, index: usize) -> &str {
        self.tokens
            .get(index)
            .map(String::as_str)
            .unwrap_or(SPECIAL_SYMBOLS[UNK_IDX])
    }

    pub fn lookup_tokens(&self, indexes: &[usize]) -> Vec<String> {
        indexes
            .iter()
            .map(|i| self.lookup_token(*i).to_string())
            .collect()
    }
}
