use crate::{config::PAD_IDX, data::TokenGrid};

/// Additive bias for a disallowed attention position. Finite so that a row
/// whose keys are all masked still normalizes instead of producing NaN.
pub const MASKED: f32 = -1e9;

/// `(i, j)` is true iff position `i` may attend to position `j`, i.e. `i >= j`.
pub fn causal_visibility(size: usize) -> Vec<bool> {
    debug_assert!(size > 0, "mask size must be positive");
    (0..size)
        .flat_map(|i| (0..size).map(move |j| i >= j))
        .collect()
}

/// Square attention mask in additive-bias form: 0 where attending is allowed,
/// [`MASKED`] where it is not.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    size: usize,
    bias: Vec<f32>,
}

impl AttentionMask {
    pub fn from_visibility(size: usize, visible: &[bool]) -> Self {
        assert_eq!(visible.len(), size * size);
        Self {
            size,
            bias: visible
                .iter()
                .map(|v| if *v { 0.0 } else { MASKED })
                .collect(),
        }
    }

    /// Every position sees every other position.
    pub fn full(size: usize) -> Self {
        debug_assert!(size > 0, "mask size must be positive");
        Self {
            size,
            bias: vec![0.0; size * size],
        }
    }

    /// Position `i` sees only positions `j <= i`.
    pub fn causal(size: usize) -> Self {
        Self::from_visibility(size, &causal_visibility(size))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, i: usize, j: usize) -> f32 {
        self.bias[i * self.size + j]
    }

    pub fn is_visible(&self, i: usize, j: usize) -> bool {
        self.get(i, j) == 0.0
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.bias
    }
}

/// One row per batch slot, one column per position; true where the token is padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingMask {
    batch_size: usize,
    seq_len: usize,
    padded: Vec<bool>,
}

impl PaddingMask {
    pub fn from_grid(grid: &TokenGrid) -> Self {
        let (seq_len, batch_size) = grid.shape();
        let padded = (0..batch_size)
            .flat_map(|b| (0..seq_len).map(move |i| grid.get(i, b) == PAD_IDX))
            .collect();
        Self {
            batch_size,
            seq_len,
            padded,
        }
    }

    /// No padding anywhere, as for a single unpadded sentence.
    pub fn none(batch_size: usize, seq_len: usize) -> Self {
        Self {
            batch_size,
            seq_len,
            padded: vec![false; batch_size * seq_len],
        }
    }

    /// (batch_size, seq_len)
    pub fn shape(&self) -> (usize, usize) {
        (self.batch_size, self.seq_len)
    }

    pub fn is_padding(&self, slot: usize, position: usize) -> bool {
        self.padded[slot * self.seq_len + position]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Masks {
    pub src_mask: AttentionMask,
    pub tgt_mask: AttentionMask,
    pub src_padding_mask: PaddingMask,
    pub tgt_padding_mask: PaddingMask,
}

pub fn create_mask(src: &TokenGrid, tgt: &TokenGrid) -> Masks {
    Masks {
        src_mask: AttentionMask::full(src.seq_len()),
        tgt_mask: AttentionMask::causal(tgt.seq_len()),
        src_padding_mask: PaddingMask::from_grid(src),
        tgt_padding_mask: PaddingMask::from_grid(tgt),
    }
}

/// Per (batch, head, query, key) additive bias, flattened in that order.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionBias {
    pub shape: (usize, usize, usize, usize),
    pub data: Vec<f32>,
}

/// Combines an optional square mask over the queries with the keys' padding.
/// Without a mask, `query_len` may differ from the key length, as in
/// cross-attention over encoder memory.
pub fn attention_bias(
    heads: usize,
    query_len: usize,
    mask: Option<&AttentionMask>,
    key_padding: &PaddingMask,
) -> AttentionBias {
    let (batch_size, key_len) = key_padding.shape();
    if let Some(mask) = mask {
        debug_assert_eq!(mask.size(), query_len);
        debug_assert_eq!(mask.size(), key_len);
    }
    let mut data = Vec::with_capacity(batch_size * heads * query_len * key_len);
    for b in 0..batch_size {
        let row: Vec<f32> = (0..query_len)
            .flat_map(|i| {
                (0..key_len).map(move |j| {
                    let m = mask.map(|m| m.get(i, j)).unwrap_or(0.0);
                    let p = if key_padding.is_padding(b, j) { MASKED } else { 0.0 };
                    m + p
                })
            })
            .collect();
        for _ in 0..heads {
            data.extend_from_slice(&row);
        }
    }
    AttentionBias {
        shape: (batch_size, heads, query_len, key_len),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BOS_IDX, EOS_IDX};

    #[test]
    fn causal_mask_allows_only_past_and_present() {
        for size in 1..8 {
            let mask = AttentionMask::causal(size);
            for i in 0..size {
                assert!(mask.is_visible(i, i));
                for j in 0..size {
                    assert_eq!(mask.is_visible(i, j), i >= j, "({i}, {j})");
                    assert!(mask.get(i, j).is_finite());
                }
            }
        }
    }

    #[test]
    fn causal_bias_matches_visibility() {
        let vis = causal_visibility(3);
        assert_eq!(vis, [true, false, false, true, true, false, true, true, true]);
        assert_eq!(
            AttentionMask::causal(3).as_slice(),
            &[0.0, MASKED, MASKED, 0.0, 0.0, MASKED, 0.0, 0.0, 0.0]
        );
    }

    #[test]
    fn src_mask_is_all_zero() {
        // lengths 3 and 5 plus BOS/EOS
        let src = TokenGrid::pad_sequence(
            &[vec![BOS_IDX, 4, 5, 6, EOS_IDX], vec![BOS_IDX, 4, 5, 6, 7, 8, EOS_IDX]],
            PAD_IDX,
        );
        let tgt = TokenGrid::pad_sequence(&[vec![BOS_IDX, 9], vec![BOS_IDX, 9]], PAD_IDX);
        let masks = create_mask(&src, &tgt);
        assert_eq!(src.shape(), (7, 2));
        assert_eq!(masks.src_mask.size(), 7);
        assert!(masks.src_mask.as_slice().iter().all(|b| *b == 0.0));
        assert_eq!(masks.tgt_mask, AttentionMask::causal(2));
    }

    #[test]
    fn padding_mask_is_batch_major() {
        let src = TokenGrid::pad_sequence(&[vec![2, 4, 3], vec![2, 3]], PAD_IDX);
        let mask = PaddingMask::from_grid(&src);
        assert_eq!(mask.shape(), (2, 3));
        assert!(!mask.is_padding(0, 2));
        assert!(mask.is_padding(1, 2));
        assert!(!mask.is_padding(1, 1));
    }

    #[test]
    fn bias_combines_mask_and_key_padding() {
        let keys = TokenGrid::pad_sequence(&[vec![2, 3], vec![2]], PAD_IDX);
        let padding = PaddingMask::from_grid(&keys);
        let mask = AttentionMask::causal(2);
        let bias = attention_bias(3, 2, Some(&mask), &padding);
        assert_eq!(bias.shape, (2, 3, 2, 2));
        // slot 0, any head
        assert_eq!(&bias.data[4..8], &[0.0, MASKED, 0.0, 0.0]);
        // slot 1: key 1 is padding on top of the causal mask
        assert_eq!(&bias.data[12..16], &[0.0, 2.0 * MASKED, 0.0, MASKED]);

        let cross = attention_bias(1, 3, None, &padding);
        assert_eq!(cross.shape, (2, 1, 3, 2));
        assert_eq!(&cross.data[6..], &[0.0, MASKED, 0.0, MASKED, 0.0, MASKED]);
    }
}
