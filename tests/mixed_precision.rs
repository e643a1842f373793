mod common;

use common::*;
use machine_learning::arch::Model;
use ndarray::Array2;
use orchestra::{DistributedContext, LossScaleConfig, Phase, SessionConfig, Trainer};

fn mixed(loss_scale: LossScaleConfig) -> SessionConfig {
    SessionConfig {
        mixed_precision: true,
        loss_scale,
        ..config()
    }
}

#[test]
fn overflowing_step_is_skipped_and_the_scale_backs_off() {
    let max = 2f32.powi(24);
    let config = mixed(LossScaleConfig {
        initial: max,
        max,
        ..LossScaleConfig::default()
    });

    let model = linear(20);
    let before = model.params().to_vec();
    let batches = vec![batch(Array2::ones((2, FEATURES)), &[0, 0])];

    let mut trainer =
        Trainer::enter(parts(model, constant(0.1)), &config, &DistributedContext::single())
            .unwrap();
    trainer.train(&batches).unwrap();

    assert_eq!(trainer.skipped_steps(), 1);
    assert_eq!(trainer.loss_scale(), max / 2.);
    assert_eq!(trainer.model().params(), before.as_slice());
    assert_eq!(
        trainer.reporter().last(Phase::Train, "loss_scale"),
        Some(max / 2.)
    );
}

#[test]
fn scale_grows_after_stable_steps() {
    let config = mixed(LossScaleConfig {
        initial: 8.,
        growth_interval: 2,
        ..LossScaleConfig::default()
    });

    let model = linear(21);
    let before = model.params().to_vec();
    let batches = vec![batch(Array2::ones((2, FEATURES)), &[0, 1]); 4];

    let mut trainer =
        Trainer::enter(parts(model, constant(0.1)), &config, &DistributedContext::single())
            .unwrap();
    trainer.train(&batches).unwrap();

    assert_eq!(trainer.skipped_steps(), 0);
    assert_eq!(trainer.loss_scale(), 32.);
    assert_ne!(trainer.model().params(), before.as_slice());
}

#[test]
fn unscaled_steps_match_full_precision_closely() {
    let data = loader(blobs(22), 8);
    let ctx = DistributedContext::single();

    let run = |config: SessionConfig| {
        Trainer::scoped(parts(linear(22), constant(0.1)), &config, &ctx, |t| {
            t.train(&data)
        })
        .unwrap()
        .1
    };

    let full = run(config());
    let half = run(mixed(LossScaleConfig {
        initial: 1024.,
        ..LossScaleConfig::default()
    }));

    assert_close(full.model.params(), half.model.params(), 1e-2);
    assert_eq!(half.reporter.history(Phase::Train, "loss_scale").count(), 1);
}

#[test]
fn invalid_loss_scale_is_refused_only_with_mixed_precision() {
    let broken = LossScaleConfig {
        backoff_factor: 2.,
        ..LossScaleConfig::default()
    };
    let ctx = DistributedContext::single();

    let result = Trainer::enter(parts(linear(23), constant(0.1)), &mixed(broken.clone()), &ctx);
    assert!(matches!(
        result,
        Err(orchestra::OrchestraErr::Configuration(_))
    ));

    let config = SessionConfig {
        loss_scale: broken,
        ..config()
    };
    assert!(Trainer::enter(parts(linear(23), constant(0.1)), &config, &ctx).is_ok());
}
