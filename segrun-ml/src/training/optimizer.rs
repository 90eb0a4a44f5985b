//! Optimizer strategies and their selection from configuration.
//!
//! Optimizers update a flat parameter vector in place. State (moments, velocities,
//! slow weights) is sized lazily on the first step.

use crate::config::ExperimentConfig;
use crate::error::MlError;
use std::fmt;

/// Update rule over a flat parameter vector.
pub trait Optimizer: Send + fmt::Debug {
    fn name(&self) -> String;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
    fn step(&mut self, params: &mut [f32], grads: &[f32]);
}

const BETA_1: f64 = 0.9;
const BETA_2: f64 = 0.999;
const EPSILON: f64 = 1e-7;

fn ensure_len(state: &mut Vec<f64>, len: usize) {
    if state.len() != len {
        *state = vec![0.0; len];
    }
}

#[derive(Debug, Clone)]
pub struct Adam {
    lr: f64,
    t: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Optimizer for Adam {
    fn name(&self) -> String {
        "Adam".into()
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        ensure_len(&mut self.m, params.len());
        ensure_len(&mut self.v, params.len());
        self.t += 1;
        let bc1 = 1.0 - BETA_1.powi(self.t as i32);
        let bc2 = 1.0 - BETA_2.powi(self.t as i32);
        for (i, (p, &g)) in params.iter_mut().zip(grads).enumerate() {
            let g = g as f64;
            self.m[i] = BETA_1 * self.m[i] + (1.0 - BETA_1) * g;
            self.v[i] = BETA_2 * self.v[i] + (1.0 - BETA_2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            *p -= (self.lr * m_hat / (v_hat.sqrt() + EPSILON)) as f32;
        }
    }
}

/// SGD with momentum, optional Nesterov update and inverse-time decay of the rate.
#[derive(Debug, Clone)]
pub struct Sgd {
    lr: f64,
    pub decay: f64,
    pub momentum: f64,
    pub nesterov: bool,
    iterations: u64,
    velocity: Vec<f64>,
}

impl Sgd {
    pub const DEFAULT_LR: f64 = 0.01;
    pub const DEFAULT_DECAY: f64 = 1e-6;
    pub const DEFAULT_MOMENTUM: f64 = 0.9;

    pub fn new(lr: f64, decay: f64, momentum: f64, nesterov: bool) -> Self {
        Self {
            lr,
            decay,
            momentum,
            nesterov,
            iterations: 0,
            velocity: Vec::new(),
        }
    }
}

impl Default for Sgd {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_LR,
            Self::DEFAULT_DECAY,
            Self::DEFAULT_MOMENTUM,
            true,
        )
    }
}

impl Optimizer for Sgd {
    fn name(&self) -> String {
        "SGD".into()
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        ensure_len(&mut self.velocity, params.len());
        let lr_t = self.lr / (1.0 + self.decay * self.iterations as f64);
        self.iterations += 1;
        for (i, (p, &g)) in params.iter_mut().zip(grads).enumerate() {
            let g = g as f64;
            let v = self.momentum * self.velocity[i] - lr_t * g;
            self.velocity[i] = v;
            let delta = if self.nesterov {
                self.momentum * v - lr_t * g
            } else {
                v
            };
            *p += delta as f32;
        }
    }
}

/// Adam with variance rectification while the second-moment estimate is unreliable.
#[derive(Debug, Clone)]
pub struct RectifiedAdam {
    lr: f64,
    t: u64,
    m: Vec<f64>,
    v: Vec<f64>,
}

impl RectifiedAdam {
    /// Rectification applies once the SMA length exceeds this.
    pub const SMA_THRESHOLD: f64 = 5.0;

    pub fn new(lr: f64) -> Self {
        Self {
            lr,
            t: 0,
            m: Vec::new(),
            v: Vec::new(),
        }
    }
}

impl Optimizer for RectifiedAdam {
    fn name(&self) -> String {
        "RectifiedAdam".into()
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        ensure_len(&mut self.m, params.len());
        ensure_len(&mut self.v, params.len());
        self.t += 1;
        let t = self.t as i32;
        let beta2_t = BETA_2.powi(t);
        let sma_inf = 2.0 / (1.0 - BETA_2) - 1.0;
        let sma_t = sma_inf - 2.0 * self.t as f64 * beta2_t / (1.0 - beta2_t);
        let bc1 = 1.0 - BETA_1.powi(t);
        let bc2 = 1.0 - beta2_t;
        let rect = if sma_t > Self::SMA_THRESHOLD {
            Some(
                ((sma_t - 4.0) * (sma_t - 2.0) * sma_inf
                    / ((sma_inf - 4.0) * (sma_inf - 2.0) * sma_t))
                    .sqrt(),
            )
        } else {
            None
        };

        for (i, (p, &g)) in params.iter_mut().zip(grads).enumerate() {
            let g = g as f64;
            self.m[i] = BETA_1 * self.m[i] + (1.0 - BETA_1) * g;
            self.v[i] = BETA_2 * self.v[i] + (1.0 - BETA_2) * g * g;
            let m_hat = self.m[i] / bc1;
            let update = match rect {
                Some(r) => r * m_hat / ((self.v[i] / bc2).sqrt() + EPSILON),
                None => m_hat,
            };
            *p -= (self.lr * update) as f32;
        }
    }
}

/// Keeps slow weights beside an inner optimizer's fast weights and pulls them
/// together every `sync_period` steps.
#[derive(Debug)]
pub struct Lookahead {
    inner: Box<dyn Optimizer>,
    pub sync_period: u64,
    pub slow_step_size: f64,
    steps: u64,
    slow: Vec<f32>,
}

impl Lookahead {
    pub const DEFAULT_SYNC_PERIOD: u64 = 6;
    pub const DEFAULT_SLOW_STEP_SIZE: f64 = 0.5;

    pub fn new(inner: Box<dyn Optimizer>) -> Self {
        Self::with_params(
            inner,
            Self::DEFAULT_SYNC_PERIOD,
            Self::DEFAULT_SLOW_STEP_SIZE,
        )
    }

    pub fn with_params(inner: Box<dyn Optimizer>, sync_period: u64, slow_step_size: f64) -> Self {
        Self {
            inner,
            sync_period: sync_period.max(1),
            slow_step_size,
            steps: 0,
            slow: Vec::new(),
        }
    }

    pub fn inner(&self) -> &dyn Optimizer {
        self.inner.as_ref()
    }
}

impl Optimizer for Lookahead {
    fn name(&self) -> String {
        format!("Lookahead({})", self.inner.name())
    }

    fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.inner.set_learning_rate(lr);
    }

    fn step(&mut self, params: &mut [f32], grads: &[f32]) {
        if self.slow.len() != params.len() {
            self.slow = params.to_vec();
        }
        self.inner.step(params, grads);
        self.steps += 1;
        if self.steps % self.sync_period == 0 {
            let alpha = self.slow_step_size as f32;
            for (slow, fast) in self.slow.iter_mut().zip(params.iter_mut()) {
                *slow += alpha * (*fast - *slow);
                *fast = *slow;
            }
        }
    }
}

/// Map the configured optimizer name to a strategy, then apply the optional
/// lookahead wrapper.
///
/// An unset or unrecognized name is a [`MlError::Configuration`].
pub fn select_optimizer(config: &ExperimentConfig) -> Result<Box<dyn Optimizer>, MlError> {
    let base: Box<dyn Optimizer> = match config.optimizer.as_deref() {
        Some("adam") => Box::new(Adam::new(config.lr)),
        Some("sgd") => Box::new(Sgd::default()),
        Some("radam") => Box::new(RectifiedAdam::new(config.lr)),
        Some(other) => {
            return Err(MlError::configuration(format!(
                "unrecognized optimizer '{other}', expected one of adam, sgd, radam"
            )));
        }
        None => return Err(MlError::configuration("please specify an optimizer")),
    };

    let optimizer: Box<dyn Optimizer> = if config.lookahead {
        tracing::info!("Using lookahead with {}", base.name());
        Box::new(Lookahead::new(base))
    } else {
        base
    };
    tracing::info!(
        optimizer = %optimizer.name(),
        lr = optimizer.learning_rate(),
        "Selected optimizer"
    );
    Ok(optimizer)
}
