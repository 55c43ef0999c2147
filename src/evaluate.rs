use colored::Colorize;
use dfdx::prelude::*;

use crate::{
    bleu::bleu_score,
    config::{BOS_IDX, EOS_IDX},
    data::Transforms,
    decode::{greedy_decode, Session},
    error::Result,
    mask::AttentionMask,
    model::BuiltModel,
    tokenizer::Tokenizer,
    train::RunContext,
};

/// Number of (output, target) pairs echoed by [`evaluate_with_bleu`].
pub const SHOWN_EXAMPLES: usize = 5;

/// Greedy translation of one source sentence, as space separated target tokens.
pub fn translate<
    const SV: usize,
    const TV: usize,
    const M: usize,
    const H: usize,
    const F: usize,
    const EL: usize,
    const DL: usize,
    const L: usize,
    D: Device<f32>,
    T: Tokenizer,
>(
    model: &BuiltModel<SV, TV, M, H, F, EL, DL, L, D>,
    ctx: &RunContext<D>,
    transforms: &Transforms<T>,
    sentence: &str,
) -> Result<String> {
    let src = transforms.src.transform(sentence);
    let num_tokens = src.len();
    let src_mask = AttentionMask::full(num_tokens);
    let tgt_tokens = greedy_decode(
        &Session::new(model, ctx),
        &src,
        &src_mask,
        num_tokens + 5,
        BOS_IDX,
    )?;
    let ids: Vec<usize> = tgt_tokens
        .into_iter()
        .filter(|t| *t != BOS_IDX && *t != EOS_IDX)
        .collect();
    let tokens = transforms.tgt.vocab.lookup_tokens(&ids);
    Ok(transforms.tgt.tokenizer.untokenize(&tokens))
}

/// Translates every source sentence and scores the outputs against the
/// tokenised targets with corpus BLEU. The first few pairs are printed.
pub fn evaluate_with_bleu<
    const SV: usize,
    const TV: usize,
    const M: usize,
    const H: usize,
    const F: usize,
    const EL: usize,
    const DL: usize,
    const L: usize,
    D: Device<f32>,
    T: Tokenizer,
>(
    model: &BuiltModel<SV, TV, M, H, F, EL, DL, L, D>,
    ctx: &RunContext<D>,
    transforms: &Transforms<T>,
    pairs: &[(String, String)],
) -> Result<f64> {
    let mut candidates = Vec::with_capacity(pairs.len());
    let mut references = Vec::with_capacity(pairs.len());
    for (i, (src, tgt)) in pairs.iter().enumerate() {
        let output = translate(model, ctx, transforms, src)?;
        let target = tgt.trim_end_matches(['\n', '\r']);
        if i < SHOWN_EXAMPLES {
            println!("{} {}", "output:".bold(), output);
            println!("{} {}", "target:".bold(), target.dimmed());
        }
        candidates.push(transforms.tgt.tokenizer.tokenize(&output));
        references.push(vec![transforms.tgt.tokenizer.tokenize(target)]);
    }
    Ok(bleu_score(&candidates, &references))
}
