use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use crate::{
    config::{Language, BOS_IDX, EOS_IDX, PAD_IDX, SPECIAL_SYMBOLS},
    error::{Error, Result},
    tokenizer::{Tokenizer, WordTokenizer},
    vocab::Vocab,
};

/// Token ids laid out position-major: `seq_len` rows of `batch_size` slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrid {
    data: Vec<usize>,
    seq_len: usize,
    batch_size: usize,
}

impl TokenGrid {
    /// Right-pads every sequence to the longest one and stacks them as columns.
    pub fn pad_sequence(sequences: &[Vec<usize>], padding_value: usize) -> Self {
        let batch_size = sequences.len();
        let seq_len = sequences.iter().map(Vec::len).max().unwrap_or_default();
        let mut data = vec![padding_value; seq_len * batch_size];
        for (b, seq) in sequences.iter().enumerate() {
            for (i, id) in seq.iter().enumerate() {
                data[i * batch_size + b] = *id;
            }
        }
        Self {
            data,
            seq_len,
            batch_size,
        }
    }

    /// (seq_len, batch_size)
    pub fn shape(&self) -> (usize, usize) {
        (self.seq_len, self.batch_size)
    }

    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn get(&self, position: usize, slot: usize) -> usize {
        self.data[position * self.batch_size + slot]
    }

    pub fn column(&self, slot: usize) -> Vec<usize> {
        (0..self.seq_len).map(|i| self.get(i, slot)).collect()
    }

    /// Flattened (batch_size, seq_len) copy, the layout the model consumes.
    pub fn to_batch_major(&self) -> Vec<usize> {
        (0..self.batch_size)
            .flat_map(|b| (0..self.seq_len).map(move |i| self.get(i, b)))
            .collect()
    }

    /// Every position but the last; the teacher-forcing decoder input.
    pub fn drop_last_position(&self) -> Self {
        let seq_len = self.seq_len.saturating_sub(1);
        Self {
            data: self.data[..seq_len * self.batch_size].to_vec(),
            seq_len,
            batch_size: self.batch_size,
        }
    }

    /// Every position but the first; the training target.
    pub fn drop_first_position(&self) -> Self {
        let start = self.batch_size.min(self.data.len());
        Self {
            data: self.data[start..].to_vec(),
            seq_len: self.seq_len.saturating_sub(1),
            batch_size: self.batch_size,
        }
    }
}

/// Tokenizer and vocabulary for one language.
#[derive(Debug, Clone)]
pub struct LanguageTransform<T = WordTokenizer> {
    pub tokenizer: T,
    pub vocab: Vocab,
}

impl<T: Tokenizer> LanguageTransform<T> {
    /// Strip, tokenize, numericalize and wrap with BOS/EOS.
    pub fn transform(&self, sentence: &str) -> Vec<usize> {
        let tokens = self.tokenizer.tokenize(sentence.trim_end_matches(['\n', '\r']));
        let mut ids = Vec::with_capacity(tokens.len() + 2);
        ids.push(BOS_IDX);
        ids.extend(self.vocab.indexes_from_tokens(&tokens));
        ids.push(EOS_IDX);
        ids
    }
}

/// Per-language transforms for a (source, target) pair.
#[derive(Debug, Clone)]
pub struct Transforms<T = WordTokenizer> {
    pub src: LanguageTransform<T>,
    pub tgt: LanguageTransform<T>,
}

impl Transforms<WordTokenizer> {
    /// Builds both vocabularies from the training pairs.
    pub fn from_pairs(pairs: &[(String, String)], src_cap: usize, tgt_cap: usize) -> Self {
        let tokenizer = WordTokenizer;
        let src_vocab = Vocab::build(
            pairs.iter().map(|(s, _)| tokenizer.tokenize(s)),
            1,
            &SPECIAL_SYMBOLS,
            Some(src_cap),
        );
        let tgt_vocab = Vocab::build(
            pairs.iter().map(|(_, t)| tokenizer.tokenize(t)),
            1,
            &SPECIAL_SYMBOLS,
            Some(tgt_cap),
        );
        Self {
            src: LanguageTransform {
                tokenizer,
                vocab: src_vocab,
            },
            tgt: LanguageTransform {
                tokenizer,
                vocab: tgt_vocab,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub src: TokenGrid,
    pub tgt: TokenGrid,
}

pub struct Collator<'a, T = WordTokenizer> {
    transforms: &'a Transforms<T>,
}

impl<'a, T: Tokenizer> Collator<'a, T> {
    pub fn new(transforms: &'a Transforms<T>) -> Self {
        Self { transforms }
    }

    /// Source and target are padded independently to their own longest sequence.
    pub fn collate<S: AsRef<str>>(&self, pairs: &[(S, S)]) -> Batch {
        let (src, tgt): (Vec<_>, Vec<_>) = pairs
            .iter()
            .map(|(s, t)| {
                (
                    self.transforms.src.transform(s.as_ref()),
                    self.transforms.tgt.transform(t.as_ref()),
                )
            })
            .unzip();
        Batch {
            src: TokenGrid::pad_sequence(&src, PAD_IDX),
            tgt: TokenGrid::pad_sequence(&tgt, PAD_IDX),
        }
    }

    /// Consecutive chunks of `batch_size` pairs, the last one possibly smaller.
    pub fn batches<S: AsRef<str>>(&self, pairs: &[(S, S)], batch_size: usize) -> Vec<Batch> {
        pairs
            .chunks(batch_size.max(1))
            .map(|chunk| self.collate(chunk))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
}

impl Split {
    fn file_stem(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "val",
        }
    }
}

/// The Multi30k parallel corpus, read from extracted `{split}.{lang}` files.
#[derive(Debug, Clone)]
pub struct Multi30k {
    root: PathBuf,
    language_pair: (Language, Language),
}

impl Multi30k {
    pub fn new<P: AsRef<Path>>(root: P, language_pair: (Language, Language)) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            language_pair,
        }
    }

    pub fn path(&self, split: Split, language: Language) -> PathBuf {
        self.root
            .join(format!("{}.{}", split.file_stem(), language.code()))
    }

    pub fn pairs(&self, split: Split) -> Result<Vec<(String, String)>> {
        let src = read_lines(&self.path(split, self.language_pair.0))?;
        let tgt = read_lines(&self.path(split, self.language_pair.1))?;
        if src.len() != tgt.len() {
            return Err(Error::Dataset(format!(
                "{split:?} split has {} {} lines but {} {} lines",
                src.len(),
                self.language_pair.0,
                tgt.len(),
                self.language_pair.1
            )));
        }
        Ok(src.into_iter().zip(tgt).collect())
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path).map_err(|e| {
        Error::Dataset(format!("could not open {}: {e}", path.display()))
    })?;
    Ok(BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UNK_IDX;

    fn transforms() -> Transforms {
        let pairs = vec![
            ("ein Hund läuft .".to_string(), "a dog runs .".to_string()),
            (
                "zwei Katzen sitzen auf einer Mauer .".to_string(),
                "two cats sit on a wall .".to_string(),
            ),
        ];
        Transforms::from_pairs(&pairs, 100, 100)
    }

    #[test]
    fn pad_sequence_is_position_major() {
        let grid = TokenGrid::pad_sequence(&[vec![2, 5, 3], vec![2, 6, 7, 8, 3]], PAD_IDX);
        assert_eq!(grid.shape(), (5, 2));
        assert_eq!(grid.column(0), [2, 5, 3, 1, 1]);
        assert_eq!(grid.column(1), [2, 6, 7, 8, 3]);
        assert_eq!(grid.get(1, 1), 6);
        assert_eq!(grid.to_batch_major(), [2, 5, 3, 1, 1, 2, 6, 7, 8, 3]);
    }

    #[test]
    fn shifted_views() {
        let grid = TokenGrid::pad_sequence(&[vec![2, 5, 3], vec![2, 6, 7, 8, 3]], PAD_IDX);
        let input = grid.drop_last_position();
        let target = grid.drop_first_position();
        assert_eq!(input.shape(), (4, 2));
        assert_eq!(target.shape(), (4, 2));
        assert_eq!(input.column(1), [2, 6, 7, 8]);
        assert_eq!(target.column(1), [6, 7, 8, 3]);
        assert_eq!(target.column(0), [5, 3, 1, 1]);
    }

    #[test]
    fn transform_wraps_and_strips_newline() {
        let t = transforms();
        let ids = t.src.transform("ein Hund .\n");
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], BOS_IDX);
        assert_eq!(ids[4], EOS_IDX);
        assert!(ids[1..4].iter().all(|i| *i > EOS_IDX));
        assert_eq!(t.src.transform("Elefant")[1], UNK_IDX);
    }

    #[test]
    fn collate_pads_each_side_to_its_own_max() {
        let t = transforms();
        let collator = Collator::new(&t);
        // 3 and 5 source tokens, 4 and 2 target tokens
        let batch = collator.collate(&[
            ("ein Hund läuft", "a dog runs ."),
            ("zwei Katzen sitzen auf Mauer", "two cats"),
        ]);
        assert_eq!(batch.src.shape(), (7, 2));
        assert_eq!(batch.tgt.shape(), (6, 2));

        for grid in [&batch.src, &batch.tgt] {
            for slot in 0..grid.batch_size() {
                let column = grid.column(slot);
                assert_eq!(column[0], BOS_IDX);
                let last = column.iter().rposition(|id| *id != PAD_IDX).unwrap();
                assert_eq!(column[last], EOS_IDX);
                assert!(column[last + 1..].iter().all(|id| *id == PAD_IDX));
            }
        }
        assert_eq!(batch.src.get(4, 0), EOS_IDX);
        assert_eq!(batch.tgt.get(3, 1), EOS_IDX);
    }

    #[test]
    fn round_trip_reproduces_tokenization() {
        let t = transforms();
        let sentence = "two cats sit on a wall .";
        let ids = t.tgt.transform(sentence);
        let tokens = t.tgt.vocab.lookup_tokens(&ids[1..ids.len() - 1]);
        assert_eq!(tokens, t.tgt.tokenizer.tokenize(sentence));
    }

    #[test]
    fn batches_chunk_in_order() {
        let t = transforms();
        let pairs = vec![("a", "b"), ("c", "d"), ("e", "f")];
        let batches = Collator::new(&t).batches(&pairs, 2);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].src.batch_size(), 2);
        assert_eq!(batches[1].src.batch_size(), 1);
    }

    #[test]
    fn multi30k_reads_aligned_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("val.de"), "ein Hund .\nzwei Katzen .\n").unwrap();
        std::fs::write(dir.path().join("val.en"), "a dog .\ntwo cats .\n").unwrap();
        std::fs::write(dir.path().join("train.de"), "eins\nzwei\n").unwrap();
        std::fs::write(dir.path().join("train.en"), "one\n").unwrap();

        let data = Multi30k::new(dir.path(), (Language::De, Language::En));
        let pairs = data.pairs(Split::Valid).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[1], ("zwei Katzen .".to_string(), "two cats .".to_string()));

        assert!(matches!(data.pairs(Split::Train), Err(Error::Dataset(_))));
        let missing = Multi30k::new(dir.path().join("missing"), (Language::De, Language::En));
        assert!(matches!(missing.pairs(Split::Valid), Err(Error::Dataset(_))));
    }
}
