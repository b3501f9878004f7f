use clap::{Parser, Subcommand};
use colored::*;
use fedpg_br::attack::AttackKind;
use fedpg_br::checkpoint::Checkpoint;
use fedpg_br::metrics::{JsonlSink, LogSink, PerformanceSummary, RunLog, TelemetrySink};
use fedpg_br::trainer::{evaluate_checkpoint, run_experiment};
use fedpg_br::worker::WorkerPool;
use fedpg_br::{Config, Result};
use log::{error, info};
use rand::Rng as _;
use std::time::Instant;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "data/config.json")]
    config: String,

    /// Single run seed (overrides `seeds` in the config)
    #[arg(short, long)]
    seed: Option<u64>,

    /// Number of runs with freshly drawn seeds (overrides `seeds`)
    #[arg(short, long)]
    runs: Option<usize>,

    /// Attack of the Byzantine workers (overrides `attack_type`)
    #[arg(short, long)]
    attack: Option<String>,

    /// Number of Byzantine workers (overrides `num_byzantine`)
    #[arg(short = 'b', long)]
    byzantine: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Train the federation (default)
    Train {
        /// Resume from a checkpoint file
        #[arg(short, long)]
        load: Option<String>,
    },
    /// Evaluate a saved master policy
    Eval {
        /// Checkpoint file
        #[arg(short, long)]
        load: String,
    },
}

fn apply_overrides(config: &mut Config, args: &Args) -> Result<()> {
    if let Some(seed) = args.seed {
        config.seeds = vec![seed];
    }
    if let Some(runs) = args.runs {
        let mut rng = rand::thread_rng();
        config.seeds = (0..runs).map(|_| rng.gen_range(1..100_000u64)).collect();
        info!("[System] Drawn run seeds: {:?}", config.seeds);
    }
    if let Some(name) = &args.attack {
        config.attack_type = AttackKind::parse(name)?;
    }
    if let Some(n) = args.byzantine {
        config.num_byzantine = n;
    }
    config.validate()
}

fn print_summary(config: &Config, logs: &[RunLog], summary: &PerformanceSummary) {
    println!("\n{}", "=== FedPG-BR Summary ===".purple().bold());
    println!(
        "Algorithm: {:?} | Workers: {} | Byzantine: {} ({:?})",
        config.algorithm, config.num_worker, config.num_byzantine, config.attack_type
    );
    for log in logs {
        let last = log.rounds.last();
        let ret = last.map(|r| r.mean_return).unwrap_or(0.0);
        let val = last.and_then(|r| r.val_return);
        println!(
            "  - run {:<3} seed {:<6}: {:>4} rounds, {:>6} trajectories, return {:>8.2}, validation {}",
            log.run,
            log.seed,
            log.rounds.len(),
            log.last_step(),
            ret,
            val.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string())
        );
    }
    if let (Some(m), Some(lo), Some(hi)) = (
        summary.training.mean.last(),
        summary.training.lower.last(),
        summary.training.upper.last(),
    ) {
        let line = format!("Final training return {:.2} (90% band {:.2} .. {:.2})", m, lo, hi);
        println!("{}", line.green().bold());
    }
}

fn train(config: &Config, load: Option<String>) -> Result<()> {
    let pool = WorkerPool::new(config.pool_threads(), config.worker_stack_size_mb)?;
    info!(
        "[System] {} run(s), {} workers on {} threads",
        config.seeds.len(),
        config.num_worker,
        pool.thread_count()
    );
    let resume = load.map(Checkpoint::load).transpose()?;

    let mut sinks: Vec<Box<dyn TelemetrySink>> = vec![Box::new(LogSink)];
    if let Some(path) = &config.telemetry_path {
        sinks.push(Box::new(JsonlSink::create(path)?));
    }

    let start = Instant::now();
    let logs = run_experiment(config, &pool, resume, &mut sinks)?;
    info!("[System] Training finished in {:.2?}", start.elapsed());

    let summary = PerformanceSummary::from_runs(&logs, config.max_trajectories, config.summary_points);
    if let Some(path) = &config.summary_path {
        summary.save_json(path)?;
        info!("[System] Performance summary written to {}", path);
    }
    print_summary(config, &logs, &summary);
    Ok(())
}

fn eval(config: &Config, load: &str) -> Result<()> {
    let result = evaluate_checkpoint(config, load)?;
    println!(
        "{} return {:.2}, episode length {:.1} over {} episodes",
        "[Eval]".cyan().bold(),
        result.mean_return,
        result.mean_length,
        config.val_size
    );
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let outcome = Config::load(&args.config)
        .and_then(|mut config| {
            apply_overrides(&mut config, &args)?;
            Ok(config)
        })
        .and_then(|config| match args.command.clone().unwrap_or(Commands::Train { load: None }) {
            Commands::Train { load } => train(&config, load),
            Commands::Eval { load } => eval(&config, &load),
        });

    if let Err(e) = outcome {
        error!("{}", e);
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
