use dfdx::prelude::*;

use crate::{
    config::{DROPOUT, PAD_IDX},
    data::{Batch, TokenGrid},
    error::{Error, Result},
    mask::create_mask,
    model::{BuiltModel, MaskTensors},
    optim::Adam,
    utils::{test_progress_bar, train_progress_bar, ExponentialAverage, Tensorboard},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Train,
    Eval,
}

/// The device a pass runs on and whether dropout is active.
#[derive(Debug, Clone)]
pub struct RunContext<D> {
    pub device: D,
    pub mode: Mode,
    pub dropout: f64,
}

impl<D> RunContext<D> {
    pub fn train(device: D) -> Self {
        Self {
            device,
            mode: Mode::Train,
            dropout: DROPOUT,
        }
    }

    pub fn eval(device: D) -> Self {
        Self {
            device,
            mode: Mode::Eval,
            dropout: 0.0,
        }
    }

    /// Dropout probability for this pass; always 0 outside training.
    pub fn dropout(&self) -> f64 {
        match self.mode {
            Mode::Train => self.dropout,
            Mode::Eval => 0.0,
        }
    }
}

/// One-hot rows for every target, with padding positions left all zero.
pub fn padded_one_hot<const V: usize, D: Device<f32>>(
    targets: &TokenGrid,
    dev: &D,
) -> Result<(Tensor<(usize, usize, Const<V>), f32, D>, usize)> {
    let (seq_len, batch_size) = targets.shape();
    let mut data = vec![0.0; batch_size * seq_len * V];
    let mut count = 0;
    for b in 0..batch_size {
        for s in 0..seq_len {
            let t = targets.get(s, b);
            if t == PAD_IDX {
                continue;
            }
            if t >= V {
                return Err(Error::Dataset(format!("target id {t} is outside a vocabulary of {V}")));
            }
            data[(b * seq_len + s) * V + t] = 1.0;
            count += 1;
        }
    }
    let probs = dev
        .try_tensor_from_vec(data, (batch_size, seq_len, Const::<V>))
        .map_err(Error::device)?;
    Ok((probs, count))
}

/// Token-level cross entropy averaged over non-padding targets. A batch made
/// entirely of padding has loss 0.
pub fn try_padded_cross_entropy<const V: usize, D: Device<f32>, T: Tape<f32, D>>(
    logits: Tensor<(usize, usize, Const<V>), f32, D, T>,
    target_probs: Tensor<(usize, usize, Const<V>), f32, D>,
    count: usize,
) -> std::result::Result<Tensor<Rank0, f32, D, T>, D::Err> {
    logits
        .try_log_softmax::<Axis<2>>()?
        .try_mul(target_probs)?
        .try_sum::<Rank0, _>()?
        .try_negate()?
        .try_mul(1.0 / count.max(1) as f32)
}

/// Splits the target into decoder input and expected output, builds the masks
/// and uploads everything the forward pass needs.
fn prepare<D: Device<f32>>(
    batch: &Batch,
    heads: usize,
    dev: &D,
) -> Result<(
    Tensor<(usize, usize), usize, D>,
    Tensor<(usize, usize), usize, D>,
    TokenGrid,
    MaskTensors<D>,
)> {
    let tgt_input = batch.tgt.drop_last_position();
    let tgt_out = batch.tgt.drop_first_position();
    let masks = MaskTensors::try_new(dev, &create_mask(&batch.src, &tgt_input), heads)
        .map_err(Error::device)?;
    let (src_len, batch_size) = batch.src.shape();
    let src = dev
        .try_tensor_from_vec(batch.src.to_batch_major(), (batch_size, src_len))
        .map_err(Error::device)?;
    let tgt = dev
        .try_tensor_from_vec(tgt_input.to_batch_major(), (batch_size, tgt_input.seq_len()))
        .map_err(Error::device)?;
    Ok((src, tgt, tgt_out, masks))
}

/// One optimisation step per batch. Returns the mean batch loss.
pub fn train_epoch<
    const SV: usize,
    const TV: usize,
    const M: usize,
    const H: usize,
    const F: usize,
    const EL: usize,
    const DL: usize,
    const L: usize,
    D: Device<f32>,
>(
    model: &mut BuiltModel<SV, TV, M, H, F, EL, DL, L, D>,
    optimizer: &mut Adam,
    batches: &[Batch],
    ctx: &RunContext<D>,
    mut tensorboard: Option<&mut Tensorboard>,
) -> Result<f32>
where
    Tensor<Rank0, f32, D>: AsArray<Array = f32>,
{
    let dev = &ctx.device;
    let bar = train_progress_bar(batches.len() as u64);
    let mut loss_avg = ExponentialAverage::<f32>::new();
    let mut total = 0.0;
    let mut grads = model.try_alloc_grads().map_err(Error::device)?;
    for (i, batch) in batches.iter().enumerate() {
        let (src, tgt, tgt_out, masks) = prepare(batch, H, dev)?;
        let logits = model
            .try_forward(src.traced(grads), tgt, &masks, ctx.dropout())
            .map_err(Error::device)?;
        let (probs, count) = padded_one_hot::<TV, D>(&tgt_out, dev)?;
        let loss = try_padded_cross_entropy(logits, probs, count).map_err(Error::device)?;
        let value = loss.retaped::<NoneTape>().array();

        grads = loss.try_backward().map_err(Error::device)?;
        optimizer.update(model, &grads)?;
        model.try_zero_grads(&mut grads).map_err(Error::device)?;

        total += value;
        loss_avg.update(value);
        bar.set_position(i as u64 + 1);
        bar.set_message(format!("Loss: {:.2}", loss_avg.value));
        if let Some(tb) = tensorboard.as_deref_mut() {
            tb.record("train_loss", value, batch.src.batch_size());
        }
    }
    bar.finish_and_clear();

    Ok(if batches.is_empty() {
        0.0
    } else {
        total / batches.len() as f32
    })
}

/// Mean batch loss without gradients or dropout.
pub fn evaluate<
    const SV: usize,
    const TV: usize,
    const M: usize,
    const H: usize,
    const F: usize,
    const EL: usize,
    const DL: usize,
    const L: usize,
    D: Device<f32>,
>(
    model: &BuiltModel<SV, TV, M, H, F, EL, DL, L, D>,
    batches: &[Batch],
    ctx: &RunContext<D>,
) -> Result<f32>
where
    Tensor<Rank0, f32, D>: AsArray<Array = f32>,
{
    let dev = &ctx.device;
    let bar = test_progress_bar(batches.len() as u64);
    let mut loss_avg = ExponentialAverage::<f32>::new();
    let mut total = 0.0;
    for (i, batch) in batches.iter().enumerate() {
        let (src, tgt, tgt_out, masks) = prepare(batch, H, dev)?;
        let logits = model
            .try_forward(src, tgt, &masks, ctx.dropout())
            .map_err(Error::device)?;
        let (probs, count) = padded_one_hot::<TV, D>(&tgt_out, dev)?;
        let loss = try_padded_cross_entropy(logits, probs, count)
            .map_err(Error::device)?
            .array();

        total += loss;
        loss_avg.update(loss);
        bar.set_position(i as u64 + 1);
        bar.set_message(format!("Loss: {:.2}", loss_avg.value));
    }
    bar.finish_and_clear();

    Ok(if batches.is_empty() {
        0.0
    } else {
        total / batches.len() as f32
    })
}
