use dfdx::prelude::*;

use crate::{
    config::EOS_IDX,
    error::Error,
    mask::{attention_bias, AttentionMask, PaddingMask},
    model::{bias_tensor, BuiltModel, Hidden},
    train::RunContext,
};

/// What greedy decoding needs from a model.
pub trait Seq2Seq {
    type Memory;
    type Hidden;
    type Error;

    fn encode(&self, src: &[usize], src_mask: &AttentionMask) -> Result<Self::Memory, Self::Error>;

    /// Hidden states for every position of `ys`.
    fn decode(
        &self,
        ys: &[usize],
        memory: &Self::Memory,
        tgt_mask: &AttentionMask,
    ) -> Result<Self::Hidden, Self::Error>;

    /// Logits over the target vocabulary for the last decoded position.
    fn generator(&self, hidden: &Self::Hidden) -> Result<Vec<f32>, Self::Error>;
}

/// Index of the largest value; ties go to the lowest index.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, x) in logits.iter().enumerate().skip(1) {
        if *x > logits[best] {
            best = i;
        }
    }
    best
}

/// Extends `[start_symbol]` one arg-max token at a time, stopping after EOS or
/// once the sequence holds `max_len` tokens. The result keeps the start symbol.
pub fn greedy_decode<M: Seq2Seq>(
    model: &M,
    src: &[usize],
    src_mask: &AttentionMask,
    max_len: usize,
    start_symbol: usize,
) -> Result<Vec<usize>, M::Error> {
    let memory = model.encode(src, src_mask)?;
    let mut ys = vec![start_symbol];
    for _ in 0..max_len.saturating_sub(1) {
        let tgt_mask = AttentionMask::causal(ys.len());
        let out = model.decode(&ys, &memory, &tgt_mask)?;
        let next_word = argmax(&model.generator(&out)?);
        ys.push(next_word);
        if next_word == EOS_IDX {
            break;
        }
    }
    Ok(ys)
}

/// A model paired with the run context it executes under.
pub struct Session<'a, Model, D: Storage<f32>> {
    pub model: &'a Model,
    pub ctx: &'a RunContext<D>,
}

impl<'a, Model, D: Storage<f32>> Session<'a, Model, D> {
    pub fn new(model: &'a Model, ctx: &'a RunContext<D>) -> Self {
        Self { model, ctx }
    }
}

impl<
        'a,
        const SV: usize,
        const TV: usize,
        const M: usize,
        const H: usize,
        const F: usize,
        const EL: usize,
        const DL: usize,
        const L: usize,
        D: Device<f32>,
    > Seq2Seq for Session<'a, BuiltModel<SV, TV, M, H, F, EL, DL, L, D>, D>
{
    type Memory = Hidden<M, D>;
    type Hidden = Hidden<M, D>;
    type Error = Error;

    fn encode(&self, src: &[usize], src_mask: &AttentionMask) -> Result<Self::Memory, Error> {
        let dev = &self.ctx.device;
        let ids = dev
            .try_tensor_from_vec(src.to_vec(), (1, src.len()))
            .map_err(Error::device)?;
        let bias = attention_bias(H, src.len(), Some(src_mask), &PaddingMask::none(1, src.len()));
        let bias = bias_tensor(dev, &bias).map_err(Error::device)?;
        self.model
            .try_encode(ids, &bias, self.ctx.dropout())
            .map_err(Error::device)
    }

    fn decode(
        &self,
        ys: &[usize],
        memory: &Self::Memory,
        tgt_mask: &AttentionMask,
    ) -> Result<Self::Hidden, Error> {
        let dev = &self.ctx.device;
        let src_len = memory.shape().1;
        let ids = dev
            .try_tensor_from_vec(ys.to_vec(), (1, ys.len()))
            .map_err(Error::device)?;
        let tgt_bias = attention_bias(H, ys.len(), Some(tgt_mask), &PaddingMask::none(1, ys.len()));
        let memory_bias = attention_bias(H, ys.len(), None, &PaddingMask::none(1, src_len));
        self.model
            .try_decode(
                ids,
                memory,
                &bias_tensor(dev, &tgt_bias).map_err(Error::device)?,
                &bias_tensor(dev, &memory_bias).map_err(Error::device)?,
                self.ctx.dropout(),
            )
            .map_err(Error::device)
    }

    fn generator(&self, hidden: &Self::Hidden) -> Result<Vec<f32>, Error> {
        let logits = self
            .model
            .generator
            .try_forward(hidden.clone())
            .map_err(Error::device)?
            .as_vec();
        Ok(logits[logits.len().saturating_sub(TV)..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::{
        config::{BOS_IDX, EOS_IDX},
        model::tests::TestModel,
    };

    /// Emits a fixed script of tokens, one per decode step.
    struct Scripted {
        script: Vec<usize>,
        vocab: usize,
        decodes: Cell<usize>,
    }

    impl Scripted {
        fn new(script: Vec<usize>) -> Self {
            Self {
                script,
                vocab: 12,
                decodes: Cell::new(0),
            }
        }
    }

    impl Seq2Seq for Scripted {
        type Memory = usize;
        type Hidden = usize;
        type Error = ();

        fn encode(&self, src: &[usize], src_mask: &AttentionMask) -> Result<usize, ()> {
            assert_eq!(src_mask.size(), src.len());
            Ok(src.len())
        }

        fn decode(&self, ys: &[usize], _: &usize, tgt_mask: &AttentionMask) -> Result<usize, ()> {
            assert_eq!(tgt_mask.size(), ys.len());
            assert_eq!(ys[0], BOS_IDX);
            self.decodes.set(self.decodes.get() + 1);
            Ok(ys.len() - 1)
        }

        fn generator(&self, step: &usize) -> Result<Vec<f32>, ()> {
            let mut logits = vec![0.0; self.vocab];
            logits[self.script[*step % self.script.len()]] = 1.0;
            Ok(logits)
        }
    }

    #[test]
    fn max_len_one_never_decodes() {
        let model = Scripted::new(vec![5]);
        let ys = greedy_decode(&model, &[2, 7, 3], &AttentionMask::full(3), 1, BOS_IDX).unwrap();
        assert_eq!(ys, [BOS_IDX]);
        assert_eq!(model.decodes.get(), 0);
    }

    #[test]
    fn stops_at_eos() {
        let model = Scripted::new(vec![5, 6, EOS_IDX, 7]);
        let ys = greedy_decode(&model, &[2, 3], &AttentionMask::full(2), 10, BOS_IDX).unwrap();
        assert_eq!(ys, [BOS_IDX, 5, 6, EOS_IDX]);
        assert_eq!(model.decodes.get(), 3);
    }

    #[test]
    fn bounded_without_eos() {
        let model = Scripted::new(vec![5]);
        let ys = greedy_decode(&model, &[2, 3], &AttentionMask::full(2), 6, BOS_IDX).unwrap();
        assert_eq!(ys.len(), 6);
        assert_eq!(model.decodes.get(), 5);
        assert!(ys[1..].iter().all(|y| *y == 5));
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[3.0]), 0);
        assert_eq!(argmax(&[-1.0, -0.5, -2.0]), 1);
        assert_eq!(argmax(&[1.0, 1.0]), 0);
    }

    #[test]
    fn real_model_decodes_within_bound() {
        let dev: Cpu = Default::default();
        let model = TestModel::build_on_device(&dev);
        let ctx = RunContext::eval(dev);
        let session = Session::new(&model, &ctx);
        let src = [BOS_IDX, 5, 6, 7, EOS_IDX];
        let ys = greedy_decode(&session, &src, &AttentionMask::full(src.len()), 8, BOS_IDX).unwrap();
        assert_eq!(ys[0], BOS_IDX);
        assert!(ys.len() <= 8);
        assert!(ys.iter().all(|y| *y < 16));
        if ys.len() < 8 {
            assert_eq!(*ys.last().unwrap(), EOS_IDX);
        }
    }

    #[test]
    fn session_generator_returns_one_row_of_logits() {
        let dev: Cpu = Default::default();
        let model = TestModel::build_on_device(&dev);
        let ctx = RunContext::eval(dev);
        let session = Session::new(&model, &ctx);
        let memory = session.encode(&[2, 4, 3], &AttentionMask::full(3)).unwrap();
        let hidden = session
            .decode(&[2, 9], &memory, &AttentionMask::causal(2))
            .unwrap();
        assert_eq!(session.generator(&hidden).unwrap().len(), 16);
    }
}
