mod common;

use std::{io, sync::Arc, thread, time::Duration};

use comms::{Backend, CommsErr, LocalGroup, ProcessGroup};
use common::*;
use machine_learning::arch::{Model, layers::Layer};
use ndarray::Array2;
use orchestra::{
    DistributedContext, MetricReporter, OrchestraErr, Phase, Result, SessionConfig, StepFault,
    Trainer, reporting::ReportSink,
};
use parking_lot::Mutex;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Runs `f` once per rank of a fresh group, each on its own thread.
fn run_ranks<F, T>(world_size: usize, f: F) -> Vec<T>
where
    F: Fn(DistributedContext) -> T + Send + Sync,
    T: Send,
{
    let groups = LocalGroup::new_group(world_size, TIMEOUT);
    thread::scope(|s| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| {
                let f = &f;
                s.spawn(move || {
                    let group: Arc<dyn ProcessGroup> = Arc::new(group);
                    f(DistributedContext::from_group(Backend::Gloo, group))
                })
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

fn distributed() -> SessionConfig {
    let mut config = config();
    config.distributed.enabled = true;
    config
}

#[derive(Clone, Default)]
struct Shared(Arc<Mutex<Vec<(Phase, String, usize)>>>);

impl ReportSink for Shared {
    fn emit(&mut self, phase: Phase, name: &str, _: f32, epoch: usize) -> io::Result<()> {
        self.0.lock().push((phase, name.to_string(), epoch));
        Ok(())
    }
}

#[test]
fn ranks_agree_on_params_and_metrics() {
    let data = blobs(30);
    let config = SessionConfig {
        sync_normalization: true,
        ..distributed()
    };

    let results = run_ranks(3, |ctx| {
        let rank = ctx.local_rank();
        let train = loader(data.shard(rank, ctx.node_count()), 8);
        let test = loader(data.shard(rank, ctx.node_count()), 16);

        let parts = Trainer::scoped(
            parts(normalized(100 + rank as u64), constant(0.2)),
            &config,
            &ctx,
            |t| {
                assert!(t.is_distributed());
                for _ in t.epoch_range(3)? {
                    t.train(&train)?;
                    t.test(&test)?;
                }
                Ok(())
            },
        )
        .unwrap()
        .1;

        let metrics: Vec<Vec<f32>> = [Phase::Train, Phase::Test]
            .into_iter()
            .flat_map(|phase| {
                ["loss", "accuracy"].map(|name| {
                    parts
                        .reporter
                        .history(phase, name)
                        .collect::<Vec<f32>>()
                })
            })
            .collect();

        (parts.model.params().to_vec(), metrics)
    });

    let (params, metrics) = &results[0];
    assert_eq!(metrics[0].len(), 3);
    for (other_params, other_metrics) in &results[1..] {
        assert_eq!(params, other_params);
        assert_eq!(metrics, other_metrics);
    }
}

#[test]
fn distributed_run_matches_one_process_on_the_whole_data() {
    let data = blobs(31);
    let whole = loader(data.clone(), 16);

    let single = Trainer::scoped(
        parts(linear(31), constant(0.5)),
        &config(),
        &DistributedContext::single(),
        |t| t.train(&whole),
    )
    .unwrap()
    .1;

    // Rank r owns rows r, r + 2, ... so each of its batches of 8 pairs with a
    // batch of 16 on the single process.
    let results = run_ranks(2, |ctx| {
        let shard = loader(data.shard(ctx.local_rank(), 2), 8);
        Trainer::scoped(parts(linear(31), constant(0.5)), &distributed(), &ctx, |t| {
            t.train(&shard)
        })
        .unwrap()
        .1
        .model
    });

    for model in &results {
        assert_close(single.model.params(), model.params(), 1e-5);
    }
}

#[test]
fn only_the_primary_emits() {
    let data = blobs(32);
    let sink = Shared::default();

    run_ranks(2, |ctx| {
        let train = loader(data.shard(ctx.local_rank(), 2), 8);
        let mut parts = parts(linear(32), constant(0.1));
        parts.reporter = MetricReporter::new().with_sink(sink.clone());

        let parts = Trainer::scoped(parts, &distributed(), &ctx, |t| t.train(&train))
            .unwrap()
            .1;
        assert_eq!(parts.reporter.history(Phase::Train, "loss").count(), 1);
    });

    let emitted = sink.0.lock();
    let losses = emitted
        .iter()
        .filter(|(phase, name, _)| *phase == Phase::Train && name == "loss")
        .count();
    assert_eq!(losses, 1);
}

#[test]
fn failing_rank_releases_its_peers() {
    let good = batch(Array2::ones((2, FEATURES)), &[0, 1]);
    let mut bad = good.clone();
    bad.inputs[[0, 0]] = f32::NAN;

    let results: Vec<Result<()>> = run_ranks(2, |ctx| {
        let batches = if ctx.local_rank() == 1 {
            vec![bad.clone()]
        } else {
            vec![good.clone(), good.clone()]
        };

        Trainer::scoped(parts(linear(33), constant(0.1)), &distributed(), &ctx, |t| {
            t.train(&batches)
        })
        .map(|_| ())
    });

    assert!(matches!(
        results[0],
        Err(OrchestraErr::Communication(CommsErr::PeerLost { .. }))
    ));
    assert!(matches!(
        results[1],
        Err(OrchestraErr::TrainingStep {
            epoch: 0,
            batch: 0,
            fault: StepFault::NonFiniteLoss(_),
        })
    ));
}

#[test]
fn sync_normalization_is_ignored_without_a_group() {
    let data = loader(blobs(34), 8);
    let config = SessionConfig {
        sync_normalization: true,
        ..config()
    };

    let parts = Trainer::scoped(
        parts(normalized(34), constant(0.1)),
        &config,
        &DistributedContext::single(),
        |t| {
            assert!(!t.is_distributed());
            t.train(&data)
        },
    )
    .unwrap()
    .1;

    let norms = parts
        .model
        .layers()
        .iter()
        .filter(|l| matches!(l, Layer::Norm(n) if n.is_synced()))
        .count();
    assert_eq!(norms, 0);
}
