//! Agent training binary.
//!
//! Runs an [`AgentPredQ`] against a built-in environment and writes JSONL
//! metrics (one event per logged step plus checkpoint events) so a
//! dashboard can tail the file.

use clap::{Parser, ValueEnum};
use neorl::checkpoint::{load_checkpoint, save_checkpoint};
use neorl::{
    train_agent_with, AgentDesc, AgentPredQ, ComputeContext, Environment, OnOffTask, Pong,
    TrainingConfig,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum EnvKind {
    /// Alternating on/off input, reward for activating one action unit
    OnOff,
    /// Headless pong on a 16x16 field
    Pong,
}

#[derive(Parser, Debug)]
#[command(name = "neorl-train", about = "Train a predictive-hierarchy Q agent on a built-in task")]
struct Args {
    /// Environment to train on
    #[arg(long, value_enum, default_value_t = EnvKind::OnOff)]
    env: EnvKind,

    /// Number of agent steps
    #[arg(long, default_value_t = 10_000)]
    steps: u64,

    /// Seed for model initialisation and exploration
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// JSON file with an AgentDesc (missing fields take defaults)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output metrics file (JSONL)
    #[arg(long, default_value = "data/output/metrics.jsonl")]
    metrics_file: PathBuf,

    /// Checkpoint file written every `checkpoint_every` steps and at the end
    #[arg(long, default_value = "data/checkpoints/agent.json")]
    checkpoint: PathBuf,

    /// Save a checkpoint every N steps (0 = only at the end)
    #[arg(long, default_value_t = 5000)]
    checkpoint_every: u64,

    /// Resume from checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Log and record metrics every N steps
    #[arg(long, default_value_t = 100)]
    log_every: u64,

    /// Run without learning
    #[arg(long, default_value_t = false)]
    no_learn: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut env: Box<dyn Environment> = match args.env {
        EnvKind::OnOff => Box::new(OnOffTask::default()),
        EnvKind::Pong => Box::new(Pong::new(args.seed)),
    };

    let mut rng = StdRng::seed_from_u64(args.seed);

    let (mut agent, start_step) = if let Some(ref ckpt_path) = args.resume {
        let (info, agent) =
            load_checkpoint::<AgentPredQ>(ckpt_path).expect("Failed to load checkpoint");
        log::info!("Resumed at step {}", info.step);
        (agent, info.step)
    } else {
        let mut desc = match args.config {
            Some(ref path) => {
                let json = fs::read_to_string(path).expect("Failed to read config");
                serde_json::from_str::<AgentDesc>(&json).expect("Failed to parse config")
            }
            None => AgentDesc::default(),
        };
        desc.hierarchy.input_size = env.observation_size();
        desc.action_size = env.action_size();
        let agent = AgentPredQ::new(desc, &mut rng).expect("Failed to create agent");
        (agent, 0)
    };

    if let Some(parent) = args.metrics_file.parent() {
        fs::create_dir_all(parent).expect("Failed to create metrics output directory");
    }
    let mut metrics_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&args.metrics_file)
        .expect("Failed to open metrics file");

    log::info!(
        "Training on {:?} for {} steps, {} layers, metrics at {}",
        args.env,
        args.steps,
        agent.hierarchy().num_layers(),
        args.metrics_file.display()
    );

    let config = TrainingConfig {
        learn: !args.no_learn,
        log_interval: args.log_every,
        // Step metrics go to the JSONL file instead.
        history: Some(0),
        ..Default::default()
    };
    let decay = config.reward_decay;
    let mut average_reward = 0.0f32;
    let mut ctx = ComputeContext::new();
    let started = Instant::now();

    let result = train_agent_with(
        &mut agent,
        env.as_mut(),
        &mut ctx,
        &mut rng,
        args.steps,
        &config,
        |step, m, agent| {
            average_reward = (1.0 - decay) * average_reward + decay * m.reward;
            let global_step = start_step + step + 1;
            if args.log_every > 0 && global_step % args.log_every == 0 {
                let event = serde_json::json!({
                    "type": "step",
                    "step": global_step,
                    "reward": m.reward,
                    "average_reward": average_reward,
                    "q": m.q,
                    "td_error": m.td_error,
                    "elapsed_secs": started.elapsed().as_secs_f64(),
                });
                writeln!(metrics_file, "{}", event)?;
            }
            if args.checkpoint_every > 0 && global_step % args.checkpoint_every == 0 {
                save_checkpoint(agent, global_step, &args.checkpoint)?;
                let event = serde_json::json!({
                    "type": "checkpoint",
                    "step": global_step,
                    "path": args.checkpoint.to_string_lossy(),
                });
                writeln!(metrics_file, "{}", event)?;
                metrics_file.flush()?;
            }
            Ok(())
        },
    );

    match result {
        Ok(metrics) => {
            let final_step = start_step + metrics.len() as u64;
            save_checkpoint(&agent, final_step, &args.checkpoint).expect("Failed to save checkpoint");
            let stats = ctx.stats();
            log::info!(
                "Training complete: {} steps, {} episodes, average reward {:.4}, {} launches, {} syncs, {:.1}s",
                metrics.len(),
                metrics.episodes,
                metrics.average_reward,
                stats.launches,
                stats.syncs,
                started.elapsed().as_secs_f64()
            );
        }
        Err(e) => {
            log::error!("Training failed: {e}");
            std::process::exit(1);
        }
    }
}
