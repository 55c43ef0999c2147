#![allow(clippy::type_complexity)]

use std::time::Instant;

use colored::Colorize;
use dfdx::prelude::*;

use multi30k_translate::{
    checkpoint::{load_checkpoint, save_checkpoint},
    config::{Dev, TranslatorModel, SRC_LANGUAGE, SRC_VOCAB_SIZE, TGT_LANGUAGE, TGT_VOCAB_SIZE},
    data::{Collator, Multi30k, Split, Transforms},
    evaluate::{evaluate_with_bleu, translate},
    model::{num_params, try_xavier_init},
    optim::{Adam, AdamConfig},
    train::{evaluate, train_epoch, RunContext},
    utils::{pretty_print_num, Tensorboard},
    Error, Result,
};

// Switches
const LOAD_MODEL: bool = false;
const VALID_MODE: bool = false;
const SAVE_MODEL: bool = true;

// Training
const NUM_EPOCHS: usize = 1;
const BATCH_SIZE: usize = 128;

// Paths
const DATA_ROOT: &str = "../data/multi30k";
const CHECKPOINT_DIR: &str = "../checkpoints";
const LOAD_PATH: &str = "../checkpoints/checkpoint_at_epoch_1.npz";
const LOGDIR: &str = "../logdir";

const SAMPLE_SENTENCE: &str = "Eine Gruppe von Menschen steht vor einem Iglu .";

fn main() {
    if let Err(e) = run() {
        println!("{} {e}", "Error:".bold().red());
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let dataset = Multi30k::new(DATA_ROOT, (SRC_LANGUAGE, TGT_LANGUAGE));
    let train_pairs = dataset.pairs(Split::Train)?;
    let transforms = Transforms::from_pairs(&train_pairs, SRC_VOCAB_SIZE, TGT_VOCAB_SIZE);
    println!(
        "Vocab sizes: {} {}, {} {}",
        SRC_LANGUAGE,
        transforms.src.vocab.len(),
        TGT_LANGUAGE,
        transforms.tgt.vocab.len()
    );

    let dev: Dev = Default::default();
    let mut model = TranslatorModel::try_build_on_device(&dev).map_err(Error::device)?;
    try_xavier_init(&mut model).map_err(Error::device)?;
    let mut optimizer = Adam::new(AdamConfig::default());

    if LOAD_MODEL {
        load_checkpoint(LOAD_PATH, &mut model, &mut optimizer)?;
        println!("{} {LOAD_PATH} (step {})", "Loaded".bold().green(), optimizer.step);
    }

    println!("Model Parameters: {}", pretty_print_num(num_params(&mut model)));

    let eval_ctx = RunContext::eval(dev.clone());
    println!(
        "{} {}",
        "Sample:".bold(),
        translate(&model, &eval_ctx, &transforms, SAMPLE_SENTENCE)?
    );

    let valid_pairs = dataset.pairs(Split::Valid)?;
    if VALID_MODE {
        let score = evaluate_with_bleu(&model, &eval_ctx, &transforms, &valid_pairs)?;
        println!("{} {:.4}", "BLEU:".bold().cyan(), score);
        return Ok(());
    }

    let collator = Collator::new(&transforms);
    let train_batches = collator.batches(&train_pairs, BATCH_SIZE);
    let valid_batches = collator.batches(&valid_pairs, BATCH_SIZE);
    let train_ctx = RunContext::train(dev);
    let mut tensorboard = Tensorboard::new(LOGDIR);

    for epoch in 1..=NUM_EPOCHS {
        println!("{}", format!("Epoch {epoch}").bold().cyan());
        let start = Instant::now();
        let train_loss = train_epoch(
            &mut model,
            &mut optimizer,
            &train_batches,
            &train_ctx,
            Some(&mut tensorboard),
        )?;
        let epoch_time = start.elapsed().as_secs_f32();
        let val_loss = evaluate(&model, &valid_batches, &eval_ctx)?;
        tensorboard.record("val_loss", val_loss, 0);
        tensorboard.flush();

        println!(
            "Epoch: {epoch}, Train loss: {}, Val loss: {}, Epoch time = {epoch_time:.3}s",
            format!("{train_loss:.3}").bold(),
            format!("{val_loss:.3}").bold(),
        );
        println!(
            "{} {}",
            "Sample:".bold(),
            translate(&model, &eval_ctx, &transforms, SAMPLE_SENTENCE)?
        );

        if SAVE_MODEL {
            let path = format!("{CHECKPOINT_DIR}/checkpoint_at_epoch_{epoch}.npz");
            if let Err(e) = save_checkpoint(&path, &model, &optimizer) {
                println!("{} {e}", "Error Saving Model:".bold().red());
            }
        }
    }
    Ok(())
}
