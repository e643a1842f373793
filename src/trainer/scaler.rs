use log::debug;

use crate::config::LossScaleConfig;

#[derive(Debug, Clone)]
enum ScalerState {
    Disabled,
    Enabled {
        scale: f32,
        stable_steps: usize,
        config: LossScaleConfig,
    },
}

/// Dynamic loss scaling for reduced precision training.
///
/// The loss is multiplied by the scale before backpropagation so small
/// gradients survive the reduced precision. A step whose scaled gradient
/// overflows is skipped and the scale backs off; after `growth_interval`
/// stable steps in a row it grows again.
#[derive(Debug, Clone)]
pub(crate) struct LossScaler {
    state: ScalerState,
    skipped: usize,
}

impl LossScaler {
    pub fn disabled() -> Self {
        Self {
            state: ScalerState::Disabled,
            skipped: 0,
        }
    }

    /// Assumes a validated configuration.
    pub fn new(config: LossScaleConfig) -> Self {
        Self {
            state: ScalerState::Enabled {
                scale: config.initial,
                stable_steps: 0,
                config,
            },
            skipped: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.state, ScalerState::Enabled { .. })
    }

    pub fn scale(&self) -> f32 {
        match &self.state {
            ScalerState::Disabled => 1.0,
            ScalerState::Enabled { scale, .. } => *scale,
        }
    }

    /// The amount of steps skipped because of an overflow.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Accounts for a step.
    ///
    /// # Arguments
    /// * `overflow` - Whether the scaled gradient of the step overflowed.
    ///
    /// # Returns
    /// Whether the step should be applied.
    pub fn update(&mut self, overflow: bool) -> bool {
        let ScalerState::Enabled {
            scale,
            stable_steps,
            config,
        } = &mut self.state
        else {
            return !overflow;
        };

        if overflow {
            let from = *scale;
            *scale = (*scale * config.backoff_factor).max(config.min);
            *stable_steps = 0;
            self.skipped += 1;
            debug!(from = from, to = *scale; "gradient overflow, step skipped");
            return false;
        }

        *stable_steps += 1;
        if *stable_steps >= config.growth_interval {
            *scale = (*scale * config.growth_factor).min(config.max);
            *stable_steps = 0;
        }

        true
    }
}
