//! PC decoder training binary.
//!
//! Trains a decoder-style predictive-coding graph to reconstruct examples
//! from a JSON dataset. Writes one JSONL line per relaxation step and per
//! epoch, and saves weight checkpoints.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use log::{error, info};
use pcx::checkpoint::{load_weights, save_weights};
use pcx::data::{
    fixed_batches, load_examples, mean_std, shuffle_rows, standardize, train_eval_split,
};
use pcx::{
    internal_states, test_on_batch, train_on_batch, uniform_init, Config, DualOptimizer,
    ModelParams, Optimizer, PCNResult, PcGraph, PcMode,
};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[derive(Parser, Debug)]
#[command(name = "pcx-train", about = "Train a predictive-coding decoder")]
struct Args {
    /// JSON file holding an array of examples (arrays of numbers)
    #[arg(long)]
    data: PathBuf,

    /// JSON training config; flags below override its fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint directory
    #[arg(long, default_value = "output/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Resume weights from a checkpoint directory
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Mini-batch size (a ragged final batch is dropped)
    #[arg(long, default_value_t = 64)]
    batch_size: usize,

    /// Fraction of examples held out for evaluation
    #[arg(long, default_value_t = 0.1)]
    eval_fraction: f32,

    /// Save a checkpoint every N epochs (0 = only the best)
    #[arg(long, default_value_t = 0)]
    save_every: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Relaxation steps per batch (T)
    #[arg(long)]
    relax_steps: Option<usize>,

    #[arg(long)]
    x_lr: Option<f32>,

    #[arg(long)]
    w_lr: Option<f32>,

    /// "pc" or "ppc"
    #[arg(long)]
    pc_mode: Option<PcMode>,

    #[arg(long, default_value_t = 64)]
    internal_dim: usize,

    #[arg(long, default_value_t = 256)]
    hidden_dim: usize,

    #[arg(long, default_value_t = 1)]
    num_hidden_layers: usize,

    #[arg(long, default_value = "gelu")]
    activation: String,

    /// Learn the internal-state prior with a Linear(1, internal_dim) layer
    #[arg(long, default_value_t = false)]
    prior_layer: bool,

    /// Initial internal states drawn from U[-limit, limit] (0 = zeros)
    #[arg(long, default_value_t = 0.0)]
    init_limit: f32,
}

fn build_config(args: &Args) -> PCNResult<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(steps) = args.relax_steps {
        config.relax_steps = steps;
    }
    if let Some(lr) = args.x_lr {
        config.x_lr = lr;
    }
    if let Some(lr) = args.w_lr {
        config.w_lr = lr;
    }
    if let Some(mode) = args.pc_mode {
        config.pc_mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn write_line(out: &mut impl Write, value: &serde_json::Value) -> PCNResult<()> {
    writeln!(out, "{value}")?;
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return f32::NAN;
    }
    values.iter().sum::<f32>() / values.len() as f32
}

fn run(args: &Args) -> PCNResult<()> {
    let config = build_config(args)?;
    let init = uniform_init(args.init_limit)?;

    let dataset = load_examples(&args.data)?;
    let (mut train, mut eval) = train_eval_split(&dataset, args.eval_fraction);
    let (data_mean, data_std) = mean_std(&train);
    standardize(&mut train, data_mean, data_std);
    standardize(&mut eval, data_mean, data_std);

    let params = ModelParams {
        internal_dim: args.internal_dim,
        hidden_dim: args.hidden_dim,
        num_hidden_layers: args.num_hidden_layers,
        output_dim: dataset.ncols(),
        activation: args.activation.clone(),
        use_prior_layer: args.prior_layer,
    };
    let mut rng = StdRng::seed_from_u64(args.seed);
    let mut graph = PcGraph::new(&params, init, &mut rng)?;

    if let Some(dir) = &args.resume {
        info!("resuming weights from {}", dir.display());
        load_weights(&mut graph, dir)?;
    }

    let mut optim = DualOptimizer::from_config(&config, args.batch_size)?;
    let mut eval_x = Optimizer::x_from_config(&config, args.batch_size)?;

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut metrics = BufWriter::new(File::create(&args.metrics_file)?);

    info!(
        "network {:?} ({}), {} train / {} eval examples, mode {}, T={}",
        graph.dims(),
        graph.activation_name(),
        train.nrows(),
        eval.nrows(),
        config.pc_mode,
        config.relax_steps
    );
    info!("data mean={data_mean:.4} std={data_std:.4}");

    let eval_batches = fixed_batches(&eval, args.batch_size)?;
    let mut best_test_mse = f32::INFINITY;
    let mut t_step = 0usize;

    for epoch in 0..args.epochs {
        let start = Instant::now();
        let shuffled = shuffle_rows(&train, &mut rng);

        let mut train_mses = Vec::new();
        for batch in fixed_batches(&shuffled, args.batch_size)? {
            let report = train_on_batch(&mut graph, &batch, &mut optim, &config)?;
            for (i, record) in report.steps.iter().enumerate() {
                let mut line = serde_json::to_value(record.summary(t_step + i))?;
                line["event"] = "step".into();
                write_line(&mut metrics, &line)?;
            }
            t_step += report.steps.len();
            train_mses.push(report.mse);
        }

        let mut test_mses = Vec::with_capacity(eval_batches.len());
        for batch in &eval_batches {
            test_mses.push(test_on_batch(&mut graph, batch, &mut eval_x, &config)?);
        }

        let train_mse = mean(&train_mses);
        let test_mse = mean(&test_mses);
        let mut epoch_event = serde_json::json!({
            "event": "epoch",
            "epochs": epoch + 1,
            "train_mse": train_mse,
            "test_mse": test_mse,
            "elapsed_secs": start.elapsed().as_secs_f32(),
        });
        if let Some(batch) = eval_batches.first() {
            let states = internal_states(&mut graph, batch, &mut eval_x, &config)?;
            let (m, s) = mean_std(&states);
            epoch_event["internal_states_mean"] = m.into();
            epoch_event["internal_states_std"] = s.into();
        }
        write_line(&mut metrics, &epoch_event)?;
        metrics.flush()?;

        info!(
            "epoch {}: train_mse={train_mse:.6} test_mse={test_mse:.6} ({:.1}s)",
            epoch + 1,
            start.elapsed().as_secs_f32()
        );

        if args.save_every > 0 && (epoch + 1) % args.save_every == 0 {
            save_weights(&graph, &args.checkpoint_dir.join(format!("epochs_{}", epoch + 1)))?;
        }
        if test_mse < best_test_mse {
            best_test_mse = test_mse;
            save_weights(&graph, &args.checkpoint_dir.join("best"))?;
        }
    }

    save_weights(&graph, &args.checkpoint_dir.join("final"))?;
    info!("done: best test_mse={best_test_mse:.6}");
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("training failed: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::parse_from([
            "pcx-train",
            "--data",
            "x.json",
            "--relax-steps",
            "3",
            "--pc-mode",
            "ppc",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.relax_steps, 3);
        assert_eq!(config.pc_mode, PcMode::Ppc);
        assert_eq!(config.w_lr, Config::default().w_lr);
    }

    #[test]
    fn test_bad_mode_flag_is_rejected() {
        let parsed = Args::try_parse_from(["pcx-train", "--data", "x.json", "--pc-mode", "bp"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_non_finite_init_limit_is_rejected() {
        for limit in ["inf", "1e39", "NaN"] {
            let args = Args::parse_from(["pcx-train", "--data", "x.json", "--init-limit", limit]);
            assert!(matches!(
                uniform_init(args.init_limit),
                Err(pcx::PCNError::InvalidConfig(_))
            ));
        }
    }
}
