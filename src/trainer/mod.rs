mod epochs;
mod metrics;
mod prefetch;
mod scaler;
mod session;
mod step;

use std::{io, sync::Arc};

use comms::ProcessGroup;
use log::{debug, info, warn};
use machine_learning::{
    Precision,
    arch::{Model, loss::LossFn},
    optimization::Optimizer,
};
use rayon::ThreadPoolBuilder;

pub use epochs::EpochRange;

use self::{
    epochs::EpochCursor,
    metrics::EpochStats,
    scaler::LossScaler,
    session::{Mode, Session},
    step::StepSpec,
};
use crate::{
    OrchestraErr, Result, StepFault,
    config::SessionConfig,
    data::{Batch, DataProducer, Loaded},
    distributed::DistributedContext,
    reporting::{MetricReporter, Phase},
    schedule::ScheduleController,
};

/// Everything a session trains with, handed in at entry and back at exit.
pub struct TrainerParts<M, O, L> {
    pub model: M,
    pub optimizer: O,
    pub loss_fn: L,
    pub schedule: ScheduleController,
    pub reporter: MetricReporter,
}

/// A scoped training session.
///
/// Entering validates the configuration and acquires the execution mode;
/// `exit` releases it. A trainer dropped without `exit` (an error path) aborts
/// its distributed group so peers fail fast instead of waiting forever.
pub struct Trainer<M, O, L>
where
    M: Model + Clone,
    O: Optimizer,
    L: LossFn,
{
    model: M,
    optimizer: O,
    loss_fn: L,
    schedule: ScheduleController,
    reporter: MetricReporter,

    session: Session<M>,
    scaler: LossScaler,
    precision: Precision,
    topk: usize,
    prefetch_depth: Option<usize>,
    synced_norm: bool,
    grad: Vec<f32>,

    cursor: EpochCursor,
    range_issued: bool,
    train_passes: usize,
    test_passes: usize,
}

impl<M, O, L> Trainer<M, O, L>
where
    M: Model + Clone,
    O: Optimizer,
    L: LossFn,
{
    /// Opens a session.
    ///
    /// # Arguments
    /// * `parts` - The model, optimizer, loss, schedule and reporter to train with.
    /// * `config` - The session configuration.
    /// * `ctx` - This process' distributed context.
    ///
    /// # Errors
    /// `OrchestraErr::Configuration` before acquiring anything if the settings are
    /// invalid, or `OrchestraErr::Communication` if the group can't be entered.
    pub fn enter(
        parts: TrainerParts<M, O, L>,
        config: &SessionConfig,
        ctx: &DistributedContext,
    ) -> Result<Self> {
        config.validate()?;

        let TrainerParts {
            mut model,
            mut optimizer,
            loss_fn,
            schedule,
            mut reporter,
        } = parts;

        if config.distributed.enabled && !ctx.is_distributed() {
            return Err(OrchestraErr::Configuration(
                "distributed training needs an initialized distributed context".into(),
            ));
        }
        if config.topk > model.output_dim() {
            return Err(OrchestraErr::Configuration(format!(
                "topk {} exceeds the {} model outputs",
                config.topk,
                model.output_dim()
            )));
        }

        let mut synced_norm = false;
        let mode = match ctx.group() {
            Some(group) if config.distributed.enabled => {
                let group = Arc::clone(group);
                group.barrier()?;
                broadcast_params(&*group, &mut model)?;

                if config.sync_normalization {
                    let layers = model.sync_norm(Some(Arc::clone(&group)));
                    synced_norm = true;
                    info!(layers = layers; "normalization statistics synchronized");
                }

                reporter.set_emitting(group.is_primary());
                Mode::Distributed { group }
            }
            _ if config.data_parallel => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(config.replicas)
                    .thread_name(|i| format!("replica-{i}"))
                    .build()
                    .map_err(|e| OrchestraErr::Io(io::Error::other(e)))?;

                let replicas = (1..config.replicas)
                    .map(|_| (model.clone(), vec![0.; model.size()]))
                    .collect();

                Mode::DataParallel { pool, replicas }
            }
            _ => Mode::Single,
        };

        if config.sync_normalization && !synced_norm {
            warn!("sync_normalization only applies to distributed training, ignored");
        }

        let scaler = if config.mixed_precision {
            LossScaler::new(config.loss_scale.clone())
        } else {
            LossScaler::disabled()
        };

        optimizer.set_learning_rate(schedule.current_lr());

        let session = Session::new(mode);
        info!(
            mode = session.name(),
            node_count = ctx.node_count(),
            rank = ctx.local_rank(),
            mixed_precision = config.mixed_precision,
            params = model.size();
            "training session opened"
        );

        Ok(Self {
            grad: vec![0.; model.size()],
            model,
            optimizer,
            loss_fn,
            schedule,
            reporter,
            session,
            scaler,
            precision: if config.mixed_precision {
                Precision::Half
            } else {
                Precision::Full
            },
            topk: config.topk,
            prefetch_depth: config.non_blocking.then_some(config.prefetch_depth),
            synced_norm,
            cursor: EpochCursor::default(),
            range_issued: false,
            train_passes: 0,
            test_passes: 0,
        })
    }

    /// Runs `f` inside a session, releasing it on every path.
    ///
    /// # Returns
    /// What `f` returned, along with the parts the session trained.
    pub fn scoped<F, T>(
        parts: TrainerParts<M, O, L>,
        config: &SessionConfig,
        ctx: &DistributedContext,
        f: F,
    ) -> Result<(T, TrainerParts<M, O, L>)>
    where
        F: FnOnce(&mut Self) -> Result<T>,
    {
        let mut trainer = Self::enter(parts, config, ctx)?;
        let out = f(&mut trainer)?;
        let parts = trainer.exit()?;
        Ok((out, parts))
    }

    /// Closes the session cleanly: waits for every peer, then restores local
    /// normalization statistics.
    ///
    /// # Errors
    /// `OrchestraErr::Communication` if the exit barrier fails.
    pub fn exit(self) -> Result<TrainerParts<M, O, L>> {
        let Trainer {
            mut model,
            optimizer,
            loss_fn,
            schedule,
            reporter,
            mut session,
            synced_norm,
            ..
        } = self;

        session.release()?;
        if synced_norm {
            model.sync_norm(None);
        }
        info!(mode = session.name(); "training session closed");

        Ok(TrainerParts {
            model,
            optimizer,
            loss_fn,
            schedule,
            reporter,
        })
    }

    /// The epochs of the session, `0..epochs`.
    ///
    /// Consuming the range moves the session's epoch, which `train` and `test`
    /// record their metrics under. It runs no work by itself.
    ///
    /// # Errors
    /// `OrchestraErr::Configuration` if a range was already requested.
    pub fn epoch_range(&mut self, epochs: usize) -> Result<EpochRange> {
        if self.range_issued {
            return Err(OrchestraErr::Configuration(
                "epoch_range can only be requested once per session".into(),
            ));
        }

        self.range_issued = true;
        Ok(EpochRange::new(epochs, self.cursor.clone()))
    }

    /// Runs one optimization pass over `producer`, then advances the schedule.
    ///
    /// Records `loss`, `accuracy`, `accuracy_top{k}`, `lr` and, under mixed
    /// precision, `loss_scale` for the epoch under the `train` phase.
    ///
    /// # Errors
    /// `OrchestraErr::TrainingStep` on a batch that can't be loaded or is malformed, a non finite loss or
    /// (without mixed precision) a non finite gradient; `OrchestraErr::Communication`
    /// if a collective fails.
    pub fn train<P: DataProducer + ?Sized>(&mut self, producer: &P) -> Result<()> {
        let epoch = self.epoch(self.train_passes);
        let lr = self.optimizer.learning_rate();
        let skipped = self.scaler.skipped();
        self.set_training(true);

        let depth = self.prefetch_depth;
        let stats = prefetch::with_batches(producer, depth, |batches| {
            let mut stats = EpochStats::default();
            for (i, batch) in batches.enumerate() {
                let batch = loaded(batch, epoch, i)?;
                stats.add(self.step(&batch, epoch, i, true)?);
            }
            Ok::<_, OrchestraErr>(stats)
        })?;

        let stats = self.record_epoch(Phase::Train, epoch, stats)?;
        self.reporter.record(Phase::Train, "lr", lr, epoch)?;
        if self.scaler.is_enabled() {
            self.reporter
                .record(Phase::Train, "loss_scale", self.scaler.scale(), epoch)?;
        }

        self.train_passes += 1;
        self.schedule.advance();
        self.optimizer.set_learning_rate(self.schedule.current_lr());

        info!(
            epoch = epoch,
            loss = stats.loss(),
            accuracy = stats.accuracy(),
            lr = lr,
            skipped_steps = self.scaler.skipped() - skipped;
            "train pass done"
        );

        Ok(())
    }

    /// Runs one evaluation pass over `producer`. No gradients are computed and
    /// neither the parameters nor the schedule change.
    ///
    /// Records `loss`, `accuracy` and `accuracy_top{k}` under the `test` phase.
    ///
    /// # Errors
    /// Like `train`, minus gradient faults.
    pub fn test<P: DataProducer + ?Sized>(&mut self, producer: &P) -> Result<()> {
        let epoch = self.epoch(self.test_passes);
        self.set_training(false);

        let depth = self.prefetch_depth;
        let stats = prefetch::with_batches(producer, depth, |batches| {
            let mut stats = EpochStats::default();
            for (i, batch) in batches.enumerate() {
                let batch = loaded(batch, epoch, i)?;
                stats.add(self.step(&batch, epoch, i, false)?);
            }
            Ok::<_, OrchestraErr>(stats)
        })?;

        let stats = self.record_epoch(Phase::Test, epoch, stats)?;
        self.test_passes += 1;

        info!(
            epoch = epoch,
            loss = stats.loss(),
            accuracy = stats.accuracy();
            "test pass done"
        );

        Ok(())
    }

    /// Runs a single batch, stepping the optimizer when `training` unless the
    /// scaled gradient overflowed.
    fn step(
        &mut self,
        batch: &Batch,
        epoch: usize,
        index: usize,
        training: bool,
    ) -> Result<EpochStats> {
        let fault = |fault| OrchestraErr::TrainingStep {
            epoch,
            batch: index,
            fault,
        };

        self.check_batch(batch)
            .map_err(|msg| fault(StepFault::MalformedBatch(msg)))?;

        let scale = self.scaler.scale();
        let spec = StepSpec {
            precision: self.precision,
            topk: self.topk,
            loss_scale: training.then_some(scale),
        };

        let stats = step::run_batch(
            self.session.mode_mut(),
            &mut self.model,
            &self.loss_fn,
            &mut self.grad,
            batch.inputs.view(),
            batch.targets.view(),
            spec,
        )
        .map_err(|e| OrchestraErr::from_model(epoch, index, e))?;

        let loss = stats.loss();
        if !loss.is_finite() {
            return Err(fault(StepFault::NonFiniteLoss(loss)));
        }

        debug!(epoch = epoch, batch = index, rows = stats.samples, loss = loss; "batch done");

        if !training {
            return Ok(stats);
        }

        if let Some(group) = self.session.group() {
            group.all_reduce_mean(&mut self.grad)?;
        }

        let overflow = self.grad.iter().any(|&g| self.precision.overflows(g));
        if overflow && !self.scaler.is_enabled() {
            return Err(fault(StepFault::NonFiniteGradient));
        }
        if !self.scaler.update(overflow) {
            return Ok(stats);
        }

        if scale != 1.0 {
            let inv = 1.0 / scale;
            self.grad.iter_mut().for_each(|g| *g *= inv);
        }

        self.optimizer
            .update_params(&self.grad, self.model.params_mut())
            .map_err(|e| OrchestraErr::from_model(epoch, index, e))?;

        Ok(stats)
    }

    fn check_batch(&self, batch: &Batch) -> std::result::Result<(), String> {
        let (rows, cols) = batch.inputs.dim();
        let (target_rows, target_cols) = batch.targets.dim();

        if rows == 0 {
            return Err("empty batch".into());
        }
        if rows != target_rows {
            return Err(format!("{rows} input rows but {target_rows} target rows"));
        }
        if cols != self.model.input_dim() {
            return Err(format!(
                "inputs have {cols} features, the model takes {}",
                self.model.input_dim()
            ));
        }
        if target_cols != self.model.output_dim() {
            return Err(format!(
                "targets have {target_cols} columns, the model outputs {}",
                self.model.output_dim()
            ));
        }

        Ok(())
    }

    /// Aggregates the epoch across the group and records it.
    fn record_epoch(
        &mut self,
        phase: Phase,
        epoch: usize,
        mut stats: EpochStats,
    ) -> Result<EpochStats> {
        if let Some(group) = self.session.group() {
            stats.all_reduce(&**group)?;
        }

        self.reporter.record(phase, "loss", stats.loss(), epoch)?;
        self.reporter.record(phase, "accuracy", stats.accuracy(), epoch)?;
        if self.topk > 1 {
            let name = format!("accuracy_top{}", self.topk);
            self.reporter.record(phase, &name, stats.topk_accuracy(), epoch)?;
        }

        Ok(stats)
    }

    fn set_training(&mut self, training: bool) {
        self.model.set_training(training);
        if let Mode::DataParallel { replicas, .. } = self.session.mode_mut() {
            replicas.iter_mut().for_each(|(m, _)| m.set_training(training));
        }
    }

    /// The epoch a pass belongs to: the range's when one drives the session,
    /// otherwise the amount of passes already run.
    fn epoch(&self, passes: usize) -> usize {
        if self.range_issued {
            self.cursor.get()
        } else {
            passes
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn schedule(&self) -> &ScheduleController {
        &self.schedule
    }

    pub fn reporter(&self) -> &MetricReporter {
        &self.reporter
    }

    /// The current loss scale, 1 without mixed precision.
    pub fn loss_scale(&self) -> f32 {
        self.scaler.scale()
    }

    /// The amount of optimizer steps skipped because of gradient overflows.
    pub fn skipped_steps(&self) -> usize {
        self.scaler.skipped()
    }

    pub fn is_distributed(&self) -> bool {
        self.session.group().is_some()
    }
}

fn loaded(batch: Loaded, epoch: usize, batch_idx: usize) -> Result<Batch> {
    batch.map_err(|e| OrchestraErr::TrainingStep {
        epoch,
        batch: batch_idx,
        fault: StepFault::Data(e),
    })
}

/// Makes every member start from the primary's parameters.
fn broadcast_params<M: Model>(group: &dyn ProcessGroup, model: &mut M) -> comms::Result<()> {
    let mut buf = if group.is_primary() {
        model.params().to_vec()
    } else {
        vec![0.; model.size()]
    };

    group.all_reduce_sum(&mut buf)?;
    model.params_mut().copy_from_slice(&buf);
    debug!(rank = group.rank(), params = buf.len(); "parameters broadcast");
    Ok(())
}
