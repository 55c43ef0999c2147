use unicode_segmentation::UnicodeSegmentation;

pub trait Tokenizer {
    fn tokenize(&self, text: &str) -> Vec<String>;

    fn untokenize(&self, tokens: &[String]) -> String;
}

/// Splits on unicode word boundaries, keeping punctuation as separate tokens
/// and dropping whitespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct WordTokenizer;

impl Tokenizer for WordTokenizer {
    fn tokenize(&self, text: &str) -> Vec<String> {
        text.split_word_bounds()
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    fn untokenize(&self, tokens: &[String]) -> String {
        tokens.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_words_and_punctuation() {
        let tokens = WordTokenizer.tokenize("Eine Gruppe von Menschen steht vor einem Iglu .");
        assert_eq!(
            tokens,
            ["Eine", "Gruppe", "von", "Menschen", "steht", "vor", "einem", "Iglu", "."]
        );
        assert_eq!(WordTokenizer.tokenize("Two dogs, running."), ["Two", "dogs", ",", "running", "."]);
    }

    #[test]
    fn whitespace_only_is_empty() {
        assert!(WordTokenizer.tokenize("  \t ").is_empty());
        assert!(WordTokenizer.tokenize("").is_empty());
    }

    #[test]
    fn untokenize_joins_with_spaces() {
        let tokens = WordTokenizer.tokenize("A dog, running.");
        assert_eq!(WordTokenizer.untokenize(&tokens), "A dog , running .");
    }
}
