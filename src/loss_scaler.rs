//! Dynamic loss scaling for mixed-precision training. The scale doubles
//! after a window of stable steps and halves immediately on overflow, staying
//! inside configured bounds. The current scale feeds the gradient graph's
//! loss-scale input; the all-finite verdict also drives the optimizer's
//! update gate.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LossScaler {
    loss_scale: f32,
    up_scale_window: usize,
    min_loss_scale: f32,
    max_loss_scale: f32,
    stable_steps: usize,
}

impl Default for LossScaler {
    fn default() -> Self {
        Self::new(65536.0)
    }
}

impl LossScaler {
    pub fn new(initial_scale: f32) -> Self {
        Self {
            loss_scale: initial_scale,
            up_scale_window: 2000,
            min_loss_scale: 1.0,
            max_loss_scale: 16777216.0,
            stable_steps: 0,
        }
    }

    pub fn with_window(mut self, up_scale_window: usize) -> Self {
        self.up_scale_window = up_scale_window;
        self
    }

    pub fn with_bounds(mut self, min: f32, max: f32) -> Self {
        self.min_loss_scale = min;
        self.max_loss_scale = max;
        self
    }

    pub fn loss_scale(&self) -> f32 {
        self.loss_scale
    }

    /// Fold one step's all-finite verdict into the scale and return the
    /// value to use for the next step.
    pub fn update(&mut self, all_finite: bool) -> f32 {
        if all_finite {
            self.stable_steps += 1;
            if self.stable_steps >= self.up_scale_window {
                self.loss_scale = (self.loss_scale * 2.0).min(self.max_loss_scale);
                self.stable_steps = 0;
                log::debug!("loss scale raised to {}", self.loss_scale);
            }
        } else {
            self.loss_scale = (self.loss_scale / 2.0).max(self.min_loss_scale);
            self.stable_steps = 0;
            log::debug!("overflow detected, loss scale lowered to {}", self.loss_scale);
        }
        self.loss_scale
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_halves_immediately() {
        let mut scaler = LossScaler::new(1024.0);
        assert_eq!(scaler.update(false), 512.0);
        assert_eq!(scaler.update(false), 256.0);
    }

    #[test]
    fn stable_window_doubles() {
        let mut scaler = LossScaler::new(1024.0).with_window(3);
        assert_eq!(scaler.update(true), 1024.0);
        assert_eq!(scaler.update(true), 1024.0);
        assert_eq!(scaler.update(true), 2048.0);
        // Window restarts after a raise.
        assert_eq!(scaler.update(true), 2048.0);
    }

    #[test]
    fn scale_respects_bounds() {
        let mut scaler = LossScaler::new(2.0).with_bounds(1.0, 4.0).with_window(1);
        assert_eq!(scaler.update(false), 1.0);
        assert_eq!(scaler.update(false), 1.0);
        assert_eq!(scaler.update(true), 2.0);
        assert_eq!(scaler.update(true), 4.0);
        assert_eq!(scaler.update(true), 4.0);
    }
}
