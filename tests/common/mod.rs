#![allow(dead_code)]

use machine_learning::{
    arch::{Model, Sequential, activations::ActFn, layers::Layer, loss::CrossEntropy},
    dataset::Dataset,
    optimization::GradientDescent,
};
use ndarray::Array2;
use orchestra::{
    Batch, DataLoader, MetricReporter, Policy, ScheduleController, SessionConfig, TrainerParts,
};
use rand::{SeedableRng, rngs::StdRng};

pub const FEATURES: usize = 4;
pub const CLASSES: usize = 3;

pub type Parts<M> = TrainerParts<M, GradientDescent, CrossEntropy>;

/// 16 samples per class, 48 in total.
pub fn blobs(seed: u64) -> Dataset {
    Dataset::blobs(CLASSES, FEATURES, 16, 0.3, &mut StdRng::seed_from_u64(seed)).unwrap()
}

pub fn loader(dataset: Dataset, batch_size: usize) -> DataLoader {
    DataLoader::new(dataset, batch_size)
}

pub fn linear(seed: u64) -> Sequential {
    let mut model = Sequential::new([Layer::dense((FEATURES, CLASSES), None)]).unwrap();
    model.init_params(&mut StdRng::seed_from_u64(seed)).unwrap();
    model
}

pub fn mlp(seed: u64) -> Sequential {
    let mut model = Sequential::new([
        Layer::dense((FEATURES, 8), Some(ActFn::sigmoid(1.))),
        Layer::dense((8, CLASSES), None),
    ])
    .unwrap();
    model.init_params(&mut StdRng::seed_from_u64(seed)).unwrap();
    model
}

pub fn normalized(seed: u64) -> Sequential {
    let mut model = Sequential::new([
        Layer::dense((FEATURES, 8), Some(ActFn::relu())),
        Layer::norm(8),
        Layer::dense((8, CLASSES), None),
    ])
    .unwrap();
    model.init_params(&mut StdRng::seed_from_u64(seed)).unwrap();
    model
}

pub fn parts<M: Model>(model: M, schedule: ScheduleController) -> Parts<M> {
    TrainerParts {
        model,
        optimizer: GradientDescent::new(schedule.current_lr()),
        loss_fn: CrossEntropy::new(),
        schedule,
        reporter: MetricReporter::new(),
    }
}

pub fn constant(lr: f32) -> ScheduleController {
    ScheduleController::new(Policy::Constant, lr)
}

pub fn config() -> SessionConfig {
    SessionConfig {
        epochs: 2,
        batch_size: 8,
        milestones: Vec::new(),
        non_blocking: false,
        topk: 1,
        ..SessionConfig::default()
    }
}

pub fn batch(inputs: Array2<f32>, labels: &[usize]) -> Batch {
    let mut targets = Array2::zeros((labels.len(), CLASSES));
    for (row, &label) in labels.iter().enumerate() {
        targets[[row, label]] = 1.;
    }
    Batch::new(inputs, targets)
}

pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "param {i}: {x} != {y}");
    }
}
