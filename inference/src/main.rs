use std::io::{self, BufRead, Write};

use colored::Colorize;
use dfdx::prelude::*;

use multi30k_translate::{
    checkpoint::load_checkpoint,
    config::{Dev, TranslatorModel, SRC_LANGUAGE, SRC_VOCAB_SIZE, TGT_LANGUAGE, TGT_VOCAB_SIZE},
    data::{Multi30k, Split, Transforms},
    evaluate::translate,
    optim::Adam,
    train::RunContext,
    Error, Result,
};

const DATA_ROOT: &str = "../data/multi30k";
const CHECKPOINT: &str = "../checkpoints/checkpoint_at_epoch_1.npz";

fn main() {
    if let Err(e) = run() {
        println!("{} {e}", "Error:".bold().red());
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    // Vocabularies are not stored in the checkpoint, so rebuild them the way training did.
    let train_pairs = Multi30k::new(DATA_ROOT, (SRC_LANGUAGE, TGT_LANGUAGE)).pairs(Split::Train)?;
    let transforms = Transforms::from_pairs(&train_pairs, SRC_VOCAB_SIZE, TGT_VOCAB_SIZE);

    let dev: Dev = Default::default();
    let mut model = TranslatorModel::try_build_on_device(&dev).map_err(Error::device)?;
    load_checkpoint(CHECKPOINT, &mut model, &mut Adam::default())?;
    let ctx = RunContext::eval(dev);
    println!("{} {CHECKPOINT}", "Loaded".bold().green());

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        writeln!(stdout, "{}", translate(&model, &ctx, &transforms, &line)?)?;
        stdout.flush()?;
    }
    Ok(())
}
