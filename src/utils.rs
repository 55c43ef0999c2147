use std::{collections::HashMap, fmt::Write};

use indicatif::{ProgressBar, ProgressState, ProgressStyle};
use num_traits::{Float, Zero};
use rand::Rng;
use tensorboard_rs::summary_writer::SummaryWriter;

pub fn pretty_print_num(num: usize) -> String {
    match num {
        1_000_000_000_000.. => format!("{:.2}T", num as f64 / 1_000_000_000_000.),
        1_000_000_000..=999_999_999_999 => format!("{:.2}B", num as f64 / 1_000_000_000.),
        1_000_000..=999_999_999 => format!("{:.2}M", num as f64 / 1_000_000.),
        1_000..=999_999 => format!("{:.2}K", num as f64 / 1_000.),
        _ => num.to_string(),
    }
}

/// Seconds as `1d 2h 3m 4.5s`, leaving out the leading zero units.
pub fn pretty_print_duration(secs_f64: f64) -> String {
    let secs = secs_f64 as u64;
    let mut string = format!("{:.1}s", secs_f64 % 60.);
    if (secs / 60) % 60 > 0 {
        string = format!("{}m {}", (secs / 60) % 60, string);
    }
    if (secs / 3600) % 24 > 0 {
        string = format!("{}h {}", (secs / 3600) % 24, string);
    }
    if secs / 86400 > 0 {
        string = format!("{}d {}", secs / 86400, string);
    }
    string
}

const LOSS_SMOOTHING: f64 = 0.99;

/// Bias-corrected running mean of the batch losses shown on the progress bars.
pub struct ExponentialAverage<T: Float> {
    moment: f64,
    pub value: T,
    steps: i32,
}

impl<T: Float> Default for ExponentialAverage<T> {
    fn default() -> Self {
        Self {
            moment: 0.,
            value: Zero::zero(),
            steps: 0,
        }
    }
}

impl<T: Float> ExponentialAverage<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, loss: T) {
        self.steps = self.steps.saturating_add(1);
        let loss = loss.to_f64().unwrap_or(f64::NAN);
        self.moment = LOSS_SMOOTHING * self.moment + (1. - LOSS_SMOOTHING) * loss;
        let correction = 1. - LOSS_SMOOTHING.powi(self.steps);
        self.value = T::from(self.moment / correction).unwrap_or_else(T::nan);
    }
}

/// Scalar logging into a tensorboard run directory. Every run gets a random id
/// so several runs can share one log directory.
pub struct Tensorboard {
    writer: SummaryWriter,
    pub iter: usize,
    id: String,
}

impl Tensorboard {
    pub fn new(logdir: &str) -> Self {
        Self {
            writer: SummaryWriter::new(logdir),
            id: rand::thread_rng()
                .sample_iter(&rand::distributions::Alphanumeric)
                .take(20)
                .map(char::from)
                .collect::<String>(),
            iter: 0,
        }
    }

    pub fn record(&mut self, metric_name: &str, metric: f32, steps: usize) {
        self.iter += steps;
        self.writer.add_scalars(
            metric_name,
            &HashMap::from([(self.id.clone(), metric)]),
            self.iter,
        );
    }

    pub fn flush(&mut self) {
        self.writer.flush();
    }
}

fn stylized_bar(steps: u64, color: &str) -> ProgressBar {
    let bar = ProgressBar::new(steps);
    let template = format!(
        "{{spinner:.{color}.bright}} {{percent}}│{{wide_bar:.{color}.bright/blue}}│{{pos:>7}}/{{len:7}}({{msg}} | {{rate}} | {{eta}} | {{elapsed_precise}})"
    );
    let style = match ProgressStyle::with_template(&template) {
        Ok(style) => style,
        Err(_) => ProgressStyle::default_bar(),
    };
    bar.set_style(
        style
            .with_key("eta", |state: &ProgressState, w: &mut dyn Write| {
                write!(w, "{}", pretty_print_duration(state.eta().as_secs_f64())).ok();
            })
            .with_key("rate", |state: &ProgressState, w: &mut dyn Write| {
                if state.per_sec() < 1. {
                    write!(w, "{:.1}s/it", 1. / state.per_sec()).ok();
                } else {
                    write!(w, "{:.1}it/s", state.per_sec()).ok();
                }
            })
            .with_key("percent", |state: &ProgressState, w: &mut dyn Write| {
                write!(w, "{:.1}%", state.fraction() * 100.).ok();
            })
            .progress_chars("█▉▊▋▌▍▎▏  "),
    );
    bar
}

/// Creates a training stylized progress bar
pub fn train_progress_bar(steps: u64) -> ProgressBar {
    stylized_bar(steps, "green")
}

/// Creates a test stylized progress bar
pub fn test_progress_bar(steps: u64) -> ProgressBar {
    stylized_bar(steps, "yellow")
}
