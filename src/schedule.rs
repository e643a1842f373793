use log::debug;
use serde::{Deserialize, Serialize};

/// How the learning rate decays over epochs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Policy {
    /// Multiplies the rate by `gamma` when entering each milestone epoch.
    MultiStep { milestones: Vec<usize>, gamma: f32 },
    /// Multiplies the rate by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f32 },
    Constant,
}

impl Policy {
    fn decays_at(&self, epoch: usize) -> Option<f32> {
        match self {
            Policy::MultiStep { milestones, gamma } => {
                // A repeated milestone decays once per occurrence.
                let hits = milestones.iter().filter(|&&m| m == epoch).count();
                (hits > 0).then(|| gamma.powi(hits as i32))
            }
            Policy::Step { step_size, gamma } => {
                (*step_size > 0 && epoch % step_size == 0).then_some(*gamma)
            }
            Policy::Constant => None,
        }
    }
}

/// Tracks the epoch and the learning rate it dictates.
///
/// `advance` must be called exactly once per completed epoch; the controller
/// can't tell when that contract is broken.
#[derive(Debug, Clone)]
pub struct ScheduleController {
    policy: Policy,
    base_lr: f32,
    current_epoch: usize,
    current_lr: f32,
}

impl ScheduleController {
    pub fn new(policy: Policy, base_lr: f32) -> Self {
        Self {
            policy,
            base_lr,
            current_epoch: 0,
            current_lr: base_lr,
        }
    }

    pub fn multi_step<I>(base_lr: f32, milestones: I, gamma: f32) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut milestones: Vec<usize> = milestones.into_iter().collect();
        milestones.sort_unstable();
        Self::new(Policy::MultiStep { milestones, gamma }, base_lr)
    }

    /// Moves to the next epoch, decaying the rate if it is a milestone.
    pub fn advance(&mut self) {
        self.current_epoch += 1;

        if let Some(factor) = self.policy.decays_at(self.current_epoch) {
            self.current_lr *= factor;
            debug!(epoch = self.current_epoch, lr = self.current_lr; "learning rate decayed");
        }
    }

    pub fn current_lr(&self) -> f32 {
        self.current_lr
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }

    pub fn base_lr(&self) -> f32 {
        self.base_lr
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() <= 1e-6 * b.abs().max(1.)
    }

    #[test]
    fn starts_at_the_base_rate() {
        let schedule = ScheduleController::multi_step(0.4, [30, 60, 80], 0.1);
        assert_eq!(schedule.current_epoch(), 0);
        assert_eq!(schedule.current_lr(), 0.4);
    }

    #[test]
    fn decays_only_at_milestones() {
        let mut schedule = ScheduleController::multi_step(1.0, [2, 4], 0.1);
        let mut lrs = Vec::new();
        for _ in 0..5 {
            schedule.advance();
            lrs.push(schedule.current_lr());
        }

        let expected = [1.0, 0.1, 0.1, 0.01, 0.01];
        assert!(lrs.iter().zip(expected).all(|(&a, b)| approx(a, b)), "{lrs:?}");
    }

    #[test]
    fn rate_never_increases_with_gamma_below_one() {
        let mut schedule = ScheduleController::multi_step(0.1, [3, 1, 7], 0.5);
        let mut last = schedule.current_lr();
        for _ in 0..10 {
            schedule.advance();
            assert!(schedule.current_lr() <= last);
            last = schedule.current_lr();
        }
    }

    #[test]
    fn step_policy_decays_periodically() {
        let mut schedule = ScheduleController::new(
            Policy::Step {
                step_size: 2,
                gamma: 0.5,
            },
            1.0,
        );

        let lrs: Vec<f32> = (0..4)
            .map(|_| {
                schedule.advance();
                schedule.current_lr()
            })
            .collect();
        assert_eq!(lrs, vec![1.0, 0.5, 0.5, 0.25]);
    }

    #[test]
    fn constant_policy_keeps_the_rate() {
        let mut schedule = ScheduleController::new(Policy::Constant, 0.3);
        (0..10).for_each(|_| schedule.advance());
        assert_eq!(schedule.current_lr(), 0.3);
        assert_eq!(schedule.current_epoch(), 10);
    }
}
