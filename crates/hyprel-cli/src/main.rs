//! Hyprel CLI - hyper-relational link prediction from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Dataset statistics
//! hyprel stats train.csv
//!
//! # Train with a JSON config, validating on a held-out split
//! hyprel train --config config.json --train train.csv --valid valid.csv
//!
//! # Override the epoch count
//! hyprel train --config config.json --train train.csv --epochs 20
//!
//! # Keep entity ids stable across runs and show the top answers for
//! # the first three validation queries
//! hyprel train --config config.json --train train.csv --valid valid.csv \
//!     --vocab vocab.json --predictions 3
//! ```
//!
//! Logging honours `RUST_LOG` (default `info`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use candle_core::DType;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use clap::{Parser, Subcommand};
use hyprel_kge::{
    load_statements, Batch, Config, DatasetStats, Evaluator, HypRelModel, LinkPredictor,
    RankMetrics, SeededVarMap, StepLr, TailSampler, TrainingLoop, Vocabulary,
};
use hyprel_nn::{HyperRelGraph, Statement};
use indicatif::ProgressBar;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hyprel")]
#[command(about = "Hyper-relational knowledge graph link prediction", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show statistics about a statement file
    Stats {
        /// Input file (subject,relation,object[,qualifier_relation,qualifier_entity]*)
        input: PathBuf,
    },

    /// Train a model
    Train {
        /// JSON configuration
        #[arg(short, long)]
        config: PathBuf,

        /// Training statements
        #[arg(long)]
        train: PathBuf,

        /// Validation statements, ranked on evaluation epochs
        #[arg(long)]
        valid: Option<PathBuf>,

        /// Override TRAINING.EPOCHS
        #[arg(long)]
        epochs: Option<usize>,

        /// Show a per-epoch progress bar
        #[arg(long)]
        progress: bool,

        /// Vocabulary file; read if present, then rewritten with any new names
        #[arg(long)]
        vocab: Option<PathBuf>,

        /// Print the top answers for this many validation queries
        #[arg(long, default_value_t = 0)]
        predictions: usize,
    },
}

/// Options of the `train` command.
struct TrainArgs<'a> {
    config: &'a Path,
    train: &'a Path,
    valid: Option<&'a Path>,
    epochs: Option<usize>,
    progress: bool,
    vocab: Option<&'a Path>,
    predictions: usize,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Stats { input } => cmd_stats(&input),
        Commands::Train {
            config,
            train,
            valid,
            epochs,
            progress,
            vocab,
            predictions,
        } => cmd_train(TrainArgs {
            config: &config,
            train: &train,
            valid: valid.as_deref(),
            epochs,
            progress,
            vocab: vocab.as_deref(),
            predictions,
        }),
    }
}

fn load(path: &Path, vocab: &mut Vocabulary) -> Result<Vec<Statement>> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));

    let statements = load_statements(path, vocab)
        .with_context(|| format!("Failed to load {}", path.display()))?;

    pb.finish_and_clear();
    info!(
        path = %path.display(),
        statements = statements.len(),
        "loaded in {:.2?}",
        start.elapsed()
    );
    Ok(statements)
}

fn cmd_stats(input: &Path) -> Result<()> {
    let mut vocab = Vocabulary::new();
    let statements = load(input, &mut vocab)?;
    let stats = DatasetStats::compute(&statements, &vocab);

    println!("Hyper-Relational Dataset Statistics");
    println!("===================================");
    println!("Entities:       {}", stats.entities);
    println!("Relations:      {}", stats.relations);
    println!("Statements:     {}", stats.statements);
    println!("Qualified:      {}", stats.qualified_statements);
    println!("Qualifiers:     {}", stats.qualifiers);

    Ok(())
}

fn cmd_train(args: TrainArgs<'_>) -> Result<()> {
    let mut config = Config::from_path(args.config)
        .with_context(|| format!("Failed to read config {}", args.config.display()))?;
    if let Some(epochs) = args.epochs {
        config.training.epochs = epochs;
    }

    let mut vocab = match args.vocab {
        Some(path) if path.exists() => Vocabulary::load(path)
            .with_context(|| format!("Failed to read vocabulary {}", path.display()))?,
        _ => Vocabulary::new(),
    };
    let train = load(args.train, &mut vocab)?;
    let valid = match args.valid {
        Some(path) => load(path, &mut vocab)?,
        None => Vec::new(),
    };
    if let Some(path) = args.vocab {
        vocab
            .save(path)
            .with_context(|| format!("Failed to write vocabulary {}", path.display()))?;
    }
    let config = config.with_vocabulary_size(vocab.num_entities(), vocab.num_relations());

    let model_config = config.model_config().context("Invalid model configuration")?;
    let training = config
        .training_config()
        .context("Invalid training configuration")?
        .with_progress(args.progress);
    let qualifier_aware = training.qualifier_aware;
    let sampler_config = config.sampler_config().context("Invalid sampler configuration")?;
    let device = config.device()?;

    let (n, r) = (model_config.num_entities, model_config.num_relations);
    let graph = Arc::new(
        HyperRelGraph::from_statements(&train, n, r).context("Failed to build training graph")?,
    );
    info!(
        entities = n,
        relations = r,
        edges = graph.num_edges(),
        qualifiers = graph.num_qualifiers(),
        "built graph"
    );

    let params = SeededVarMap::new(config.training.seed);
    let model = HypRelModel::new(model_config, graph, params.var_builder(DType::F32, &device))?;

    let vars = params.all_vars();
    let mut optimizer = AdamW::new(
        vars.clone(),
        ParamsAdamW {
            lr: config.training.learning_rate,
            weight_decay: config.training.weight_decay,
            ..Default::default()
        },
    )?;

    let mut sampler = TailSampler::new(&train, n, r, sampler_config)
        .context("Failed to prepare training batches")?;
    info!(
        queries = sampler.num_queries(),
        aux_rows = sampler.num_aux_rows(),
        qualifier_aware,
        "prepared sampler"
    );

    let known: Vec<Statement> = train.iter().chain(&valid).cloned().collect();
    let mut evaluator = Evaluator::new(&valid, &known, n, r, config.max_qpairs, true);
    if !qualifier_aware {
        evaluator = evaluator.without_qualifiers();
    }

    let mut trainer = TrainingLoop::new(training);
    if let Some(step) = config.training.lr_step {
        trainer = trainer.with_scheduler(StepLr::new(step, config.training.lr_gamma));
    }

    let start = Instant::now();
    let history = trainer.run(&model, &mut optimizer, &vars, &mut sampler, || {
        if evaluator.num_queries() == 0 {
            return Ok(RankMetrics::default());
        }
        evaluator.evaluate(|batch| model.predict(batch))
    })?;

    println!();
    println!("Training finished in {:.2?}", start.elapsed());
    println!("Epochs run:     {}", history.epochs_run);
    println!("Stopped early:  {}", history.stopped_early);
    if let Some(loss) = history.train_loss.last() {
        println!("Final loss:     {loss:.5}");
    }
    if let (Some(mrr), Some(h1), Some(h10)) = (
        history.valid_mrr.last(),
        history.valid_hits_at_1.last(),
        history.valid_hits_at_10.last(),
    ) {
        println!("Valid MRR:      {mrr:.4}");
        println!("Valid Hits@1:   {h1:.4}");
        println!("Valid Hits@10:  {h10:.4}");
    }

    let shown = &valid[..args.predictions.min(valid.len())];
    if !shown.is_empty() {
        let max_qpairs = if qualifier_aware { config.max_qpairs } else { 0 };
        let scores = model.predict(&Batch::from_statements(shown, max_qpairs, n))?;
        println!();
        println!("Top predictions:");
        for (st, row) in shown.iter().zip(scores.chunks(n)) {
            println!(
                "  {} {} ? -> {}",
                vocab.entity_name(st.subject).unwrap_or("?"),
                vocab.relation_name(st.relation).unwrap_or("?"),
                top_answers(row, &vocab, 3).join(", ")
            );
        }
    }

    Ok(())
}

/// Highest-scoring entity names, padding excluded.
fn top_answers(scores: &[f32], vocab: &Vocabulary, k: usize) -> Vec<String> {
    let mut ranked: Vec<usize> = (1..scores.len()).collect();
    ranked.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    ranked
        .into_iter()
        .take(k)
        .map(|id| {
            let name = vocab.entity_name(id as u32).unwrap_or("?");
            format!("{name} ({:.3})", scores[id])
        })
        .collect()
}
