use std::iter;

use machine_learning::{
    MlErr, Precision,
    arch::{Model, loss::LossFn},
};
use ndarray::{ArrayView2, s};
use rayon::prelude::*;

use super::{
    metrics::{EpochStats, count_correct},
    session::Mode,
};
use crate::scaling::ScalingPolicy;

/// The settings every shard of a step runs with.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepSpec {
    pub precision: Precision,
    pub topk: usize,
    /// Backpropagate the loss multiplied by this scale, or don't backpropagate at all.
    pub loss_scale: Option<f32>,
}

/// Runs a forward pass over one shard, and a backward pass when asked to.
///
/// The backward pass is skipped when the loss is not finite, leaving `grad`
/// as it was.
fn run_shard<M, L>(
    model: &mut M,
    loss_fn: &L,
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
    spec: StepSpec,
    grad: &mut [f32],
) -> Result<EpochStats, MlErr>
where
    M: Model,
    L: LossFn + ?Sized,
{
    let pred = model.forward(x, spec.precision)?;
    let loss = loss_fn.loss(pred.view(), y);
    let (correct, correct_topk) = count_correct(pred.view(), y, spec.topk);

    if let Some(scale) = spec.loss_scale {
        if loss.is_finite() {
            let mut d = loss_fn.loss_prime(pred.view(), y);
            d.mapv_inplace(|v| v * scale);
            model.backward(d, grad)?;
        }
    }

    Ok(EpochStats {
        loss_sum: loss * x.nrows() as f32,
        samples: x.nrows(),
        correct,
        correct_topk,
    })
}

/// Runs one batch through the session's model(s).
///
/// When backpropagating, the batch gradient ends up in `grad`. In data
/// parallel mode it is the sample weighted sum of the shard gradients, which
/// equals the gradient of the whole batch.
pub(crate) fn run_batch<M, L>(
    mode: &mut Mode<M>,
    model: &mut M,
    loss_fn: &L,
    grad: &mut Vec<f32>,
    x: ArrayView2<f32>,
    y: ArrayView2<f32>,
    spec: StepSpec,
) -> Result<EpochStats, MlErr>
where
    M: Model,
    L: LossFn + ?Sized,
{
    let Mode::DataParallel { pool, replicas } = mode else {
        return run_shard(model, loss_fn, x, y, spec, grad);
    };

    let shards = ScalingPolicy::split_batch(x.nrows(), replicas.len() + 1);

    for (replica, _) in replicas.iter_mut().take(shards.len().saturating_sub(1)) {
        replica.params_mut().copy_from_slice(model.params());
    }

    let mut workers: Vec<(&mut M, &mut [f32])> = iter::once((&mut *model, grad.as_mut_slice()))
        .chain(replicas.iter_mut().map(|(m, g)| (m, g.as_mut_slice())))
        .collect();
    workers.truncate(shards.len());

    let outs: Vec<Result<EpochStats, MlErr>> = pool.install(|| {
        workers
            .into_par_iter()
            .zip(shards.par_iter())
            .map(|((m, g), rows)| {
                let x = x.slice(s![rows.clone(), ..]);
                let y = y.slice(s![rows.clone(), ..]);
                run_shard(m, loss_fn, x, y, spec, g)
            })
            .collect()
    });

    let mut total = EpochStats::default();
    let mut sizes = Vec::with_capacity(outs.len());
    for out in outs {
        let stats = out?;
        sizes.push(stats.samples);
        total.add(stats);
    }

    if spec.loss_scale.is_some() && total.loss().is_finite() && total.samples > 0 {
        let n = total.samples as f32;
        let w = sizes[0] as f32 / n;
        grad.iter_mut().for_each(|g| *g *= w);

        for ((_, g), &size) in replicas.iter().zip(&sizes[1..]) {
            let w = size as f32 / n;
            for (acc, v) in grad.iter_mut().zip(g) {
                *acc += w * v;
            }
        }
    }

    Ok(total)
}
