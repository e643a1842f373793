use std::{
    env, panic,
    path::{Path, PathBuf},
    process::ExitCode,
    thread,
};

use anyhow::{Context, bail};
use log::{error, info, warn};
use machine_learning::{
    arch::{Model, Sequential, activations::ActFn, layers::Layer, loss::CrossEntropy},
    dataset::Dataset,
    optimization::GradientDescentWithMomentum,
};
use orchestra::{
    DataLoader, DistributedContext, InitOptions, MetricReporter, OrchestraErr, Phase,
    ScheduleController, SessionConfig, Trainer, TrainerParts,
    reporting::{JsonLinesSink, LogSink},
    scaling,
};
use rand::{SeedableRng, rngs::StdRng};

const CLASSES: usize = 10;
const FEATURES: usize = 16;
const HIDDEN: usize = 64;
const SAMPLES_PER_CLASS: usize = 300;
const TRAIN_RATIO: f32 = 0.8;

const USAGE: &str = "usage: orchestra [config.json] [--metrics out.jsonl]";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    metrics: Option<PathBuf>,
}

impl Args {
    fn parse<I: Iterator<Item = String>>(mut args: I) -> anyhow::Result<Self> {
        let mut parsed = Args::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--metrics" => {
                    let path = args.next().context("--metrics needs a path")?;
                    parsed.metrics = Some(path.into());
                }
                "-h" | "--help" => bail!(USAGE),
                flag if flag.starts_with('-') => bail!("unknown flag {flag}\n{USAGE}"),
                path if parsed.config.is_none() => parsed.config = Some(path.into()),
                extra => bail!("unexpected argument {extra}\n{USAGE}"),
            }
        }

        Ok(parsed)
    }
}

fn run() -> anyhow::Result<f32> {
    let args = Args::parse(env::args().skip(1))?;

    let config = match &args.config {
        Some(path) => SessionConfig::from_path(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SessionConfig::default(),
    };

    let contexts = contexts(&config)?;
    train_ranks(&config, &contexts, args.metrics.as_deref())
}

/// The contexts this process trains with, one per rank it hosts.
///
/// `local://` groups can't span processes, so a job of more than one member is
/// hosted entirely by this process.
fn contexts(config: &SessionConfig) -> orchestra::Result<Vec<DistributedContext>> {
    if !config.distributed.enabled {
        return Ok(vec![DistributedContext::single()]);
    }

    let options = InitOptions::from_env()?.with_config(&config.distributed);
    if options.world_size > 1 {
        info!(world_size = options.world_size; "hosting every rank in this process");
        DistributedContext::init_local(options)
    } else {
        Ok(vec![DistributedContext::init(options)?])
    }
}

/// Trains every context on its own thread.
///
/// # Returns
/// The best test accuracy of the primary rank.
///
/// # Errors
/// The failure that brought the job down. Ranks released by a failing peer only
/// report a communication error, which is returned when no rank reports another.
fn train_ranks(
    config: &SessionConfig,
    contexts: &[DistributedContext],
    metrics: Option<&Path>,
) -> anyhow::Result<f32> {
    let results: Vec<anyhow::Result<f32>> = thread::scope(|s| {
        let handles: Vec<_> = contexts
            .iter()
            .map(|ctx| s.spawn(move || train(config, ctx, metrics)))
            .collect();

        handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|p| panic::resume_unwind(p)))
            .collect()
    });

    let mut best = None;
    let mut errors = Vec::new();
    for (rank, result) in results.into_iter().enumerate() {
        match result {
            Ok(accuracy) if rank == 0 => best = Some(accuracy),
            Ok(_) => {}
            Err(e) => errors.push((rank, e)),
        }
    }

    let lost = |e: &anyhow::Error| {
        matches!(
            e.downcast_ref::<OrchestraErr>(),
            Some(OrchestraErr::Communication(_))
        )
    };
    let cause = errors.iter().position(|(_, e)| !lost(e)).unwrap_or(0);
    if cause < errors.len() {
        let (_, e) = errors.swap_remove(cause);
        for (rank, other) in errors {
            warn!(rank = rank; "{other:#}");
        }
        return Err(e);
    }

    best.context("no test epoch was run")
}

fn train(
    config: &SessionConfig,
    ctx: &DistributedContext,
    metrics: Option<&Path>,
) -> anyhow::Result<f32> {
    let (rank, nodes) = (ctx.local_rank(), ctx.node_count());
    let mut rng = StdRng::seed_from_u64(config.seed);

    let (mut train, mut test) =
        Dataset::blobs(CLASSES, FEATURES, SAMPLES_PER_CLASS, 1.5, &mut rng)?.split(TRAIN_RATIO);
    if let Some(rows) = config.split_cap() {
        train = train.truncate(rows);
        test = test.truncate(rows);
    }

    let train = DataLoader::new(train.shard(rank, nodes), config.batch_size)
        .shuffled(config.seed.wrapping_add(rank as u64));
    let test = DataLoader::new(test.shard(rank, nodes), config.batch_size);

    let mut model = Sequential::new([
        Layer::dense((FEATURES, HIDDEN), Some(ActFn::relu())),
        Layer::norm(HIDDEN),
        Layer::dense((HIDDEN, CLASSES), None),
    ])?;
    model.init_params(&mut rng)?;

    let lr = scaling::effective_lr(config.base_lr, config.batch_size, nodes);
    if ctx.is_primary() {
        info!(base_lr = config.base_lr, lr = lr, node_count = nodes; "learning rate scaled");
    }

    let optimizer = GradientDescentWithMomentum::new(model.size(), lr, config.momentum)
        .with_weight_decay(config.weight_decay);
    let schedule =
        ScheduleController::multi_step(lr, config.milestones.iter().copied(), config.gamma);

    let mut reporter = MetricReporter::new().with_sink(LogSink);
    if let Some(path) = metrics.filter(|_| ctx.is_primary()) {
        let sink = JsonLinesSink::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        reporter.add_sink(Box::new(sink));
    }

    let parts = TrainerParts {
        model,
        optimizer,
        loss_fn: CrossEntropy::new(),
        schedule,
        reporter,
    };

    let ((), parts) = Trainer::scoped(parts, config, ctx, |trainer| {
        for _ in trainer.epoch_range(config.epochs)? {
            trainer.train(&train)?;
            trainer.test(&test)?;
        }
        Ok(())
    })?;

    parts
        .reporter
        .max(Phase::Test, "accuracy")
        .context("no test epoch was run")
}

fn main() -> ExitCode {
    env_logger::init();

    match run() {
        Ok(best) => {
            println!("best test accuracy: {best:.4}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<Args> {
        Args::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_config_and_metrics() {
        let args = parse(&["run.json", "--metrics", "out.jsonl"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("run.json")));
        assert_eq!(args.metrics, Some(PathBuf::from("out.jsonl")));
    }

    #[test]
    fn everything_is_optional() {
        let args = parse(&[]).unwrap();
        assert!(args.config.is_none() && args.metrics.is_none());
    }

    #[test]
    fn rejects_unknown_flags_and_extra_paths() {
        assert!(parse(&["--epochs", "3"]).is_err());
        assert!(parse(&["a.json", "b.json"]).is_err());
        assert!(parse(&["--metrics"]).is_err());
    }

    #[test]
    fn hosts_every_rank_of_a_local_job() {
        let mut config = SessionConfig {
            epochs: 1,
            batch_size: 64,
            milestones: vec![],
            debug: true,
            ..Default::default()
        };
        config.distributed.enabled = true;
        config.distributed.init_method = "local://cli".into();

        let options = InitOptions::new(0, 2).with_config(&config.distributed);
        let contexts = DistributedContext::init_local(options).unwrap();
        assert_eq!(contexts.len(), 2);
        assert!(contexts.iter().enumerate().all(|(r, c)| c.local_rank() == r));

        let best = train_ranks(&config, &contexts, None).unwrap();
        assert!((0.0..=1.0).contains(&best));
    }
}
