//! # Optimizers
//!
//! The optimizer names a run can ask for, built over candle's [`SGD`] and
//! [`AdamW`] plus a local [`Adam`] with L2 weight decay and the optional
//! AMSGrad correction.

use arbor_core::OptimizerKind;
use candle_core::backprop::GradStore;
use candle_core::{Result, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};

const BETA1: f64 = 0.9;
const EPS: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsAdam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
    /// Normalise by the running maximum of the second moment.
    pub amsgrad: bool,
}

impl Default for ParamsAdam {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: BETA1,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
            amsgrad: false,
        }
    }
}

#[derive(Debug)]
struct AdamVar {
    var: Var,
    first_moment: Tensor,
    second_moment: Tensor,
    max_second_moment: Tensor,
}

/// Adam with coupled weight decay, optionally AMSGrad.
#[derive(Debug)]
pub struct Adam {
    vars: Vec<AdamVar>,
    params: ParamsAdam,
    step_t: usize,
}

impl Adam {
    /// Running maximum of the second moment for each parameter.
    pub fn max_second_moments(&self) -> Vec<&Tensor> {
        self.vars.iter().map(|v| &v.max_second_moment).collect()
    }
}

impl Optimizer for Adam {
    type Config = ParamsAdam;

    fn new(vars: Vec<Var>, params: ParamsAdam) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let zeros = var.zeros_like()?;
                Ok(AdamVar {
                    first_moment: zeros.clone(),
                    second_moment: zeros.clone(),
                    max_second_moment: zeros,
                    var,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { vars, params, step_t: 0 })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step_t += 1;
        let ParamsAdam {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
            amsgrad,
        } = self.params;
        let correction1 = 1.0 - beta1.powi(self.step_t as i32);
        let correction2 = 1.0 - beta2.powi(self.step_t as i32);

        for state in &mut self.vars {
            let Some(grad) = grads.get(&state.var) else {
                continue;
            };
            let theta = state.var.as_tensor();
            let grad = if weight_decay > 0.0 {
                (grad + theta.affine(weight_decay, 0.0)?)?
            } else {
                grad.clone()
            };

            state.first_moment = (state.first_moment.affine(beta1, 0.0)? + grad.affine(1.0 - beta1, 0.0)?)?;
            state.second_moment = (state.second_moment.affine(beta2, 0.0)? + grad.sqr()?.affine(1.0 - beta2, 0.0)?)?;
            let second = if amsgrad {
                state.max_second_moment = state.max_second_moment.maximum(&state.second_moment)?;
                &state.max_second_moment
            } else {
                &state.second_moment
            };

            let m_hat = state.first_moment.affine(1.0 / correction1, 0.0)?;
            let denom = second.affine(1.0 / correction2, 0.0)?.sqrt()?.affine(1.0, eps)?;
            let update = (m_hat / denom)?.affine(lr, 0.0)?;
            state.var.set(&(theta - update)?)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}

/// The optimizer behind a trainer, selected by [`OptimizerKind`].
pub enum TrainerOptimizer {
    Sgd {
        inner: SGD,
        vars: Vec<Var>,
        weight_decay: f64,
    },
    Adam(Adam),
    AdamW(AdamW),
}

impl TrainerOptimizer {
    /// Betas are `(0.9, beta2)` and eps is `1e-6` for the Adam family.
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64, beta2: f64, weight_decay: f64) -> Result<Self> {
        let adam = |amsgrad| ParamsAdam {
            lr,
            beta1: BETA1,
            beta2,
            eps: EPS,
            weight_decay,
            amsgrad,
        };
        Ok(match kind {
            OptimizerKind::Sgd => TrainerOptimizer::Sgd {
                inner: SGD::new(vars.clone(), lr)?,
                vars,
                weight_decay,
            },
            OptimizerKind::Adam => TrainerOptimizer::Adam(Adam::new(vars, adam(false))?),
            OptimizerKind::AmsGrad => TrainerOptimizer::Adam(Adam::new(vars, adam(true))?),
            OptimizerKind::AdamW => TrainerOptimizer::AdamW(AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    beta1: BETA1,
                    beta2,
                    eps: EPS,
                    weight_decay,
                },
            )?),
        })
    }

    pub fn step(&mut self, grads: &mut GradStore) -> Result<()> {
        match self {
            TrainerOptimizer::Sgd {
                inner,
                vars,
                weight_decay,
            } => {
                if *weight_decay > 0.0 {
                    for var in vars.iter() {
                        if let Some(grad) = grads.get(var) {
                            let decayed = (grad + var.affine(*weight_decay, 0.0)?)?;
                            grads.insert(var, decayed);
                        }
                    }
                }
                inner.step(grads)
            }
            TrainerOptimizer::Adam(adam) => adam.step(grads),
            TrainerOptimizer::AdamW(adamw) => adamw.step(grads),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainerOptimizer::Sgd { inner, .. } => inner.learning_rate(),
            TrainerOptimizer::Adam(adam) => adam.learning_rate(),
            TrainerOptimizer::AdamW(adamw) => adamw.learning_rate(),
        }
    }
}

/// Global L2 norm of the gradients of `vars`.
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut total_norm_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            let norm_sq: f32 = grad.sqr()?.sum_all()?.to_scalar()?;
            total_norm_sq += f64::from(norm_sq);
        }
    }
    Ok(total_norm_sq.sqrt())
}

/// Rescales the gradients so their global norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total_norm = compute_grad_norm(grads, vars)?;
    if total_norm > max_norm {
        let clip_coef = max_norm / (total_norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.get(var) {
                let clipped = grad.affine(clip_coef, 0.0)?;
                grads.insert(var, clipped);
            }
        }
    }
    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn quadratic(x: &Var) -> Tensor {
        x.as_tensor().sqr().unwrap().sum_all().unwrap()
    }

    #[test]
    fn amsgrad_second_moment_never_decreases() {
        let x = Var::new(&[3.0f32, -2.0], &Device::Cpu).unwrap();
        let mut opt = Adam::new(
            vec![x.clone()],
            ParamsAdam {
                lr: 0.1,
                amsgrad: true,
                ..ParamsAdam::default()
            },
        )
        .unwrap();

        let mut previous = vec![0.0f32; 2];
        for _ in 0..20 {
            let grads = quadratic(&x).backward().unwrap();
            opt.step(&grads).unwrap();
            let current = opt.max_second_moments()[0].to_vec1::<f32>().unwrap();
            for (p, c) in previous.iter().zip(&current) {
                assert!(c >= p);
            }
            previous = current;
        }
    }

    #[test]
    fn every_kind_reduces_a_quadratic() {
        for kind in [
            OptimizerKind::Sgd,
            OptimizerKind::Adam,
            OptimizerKind::AdamW,
            OptimizerKind::AmsGrad,
        ] {
            let x = Var::new(&[1.5f32, -1.0], &Device::Cpu).unwrap();
            let mut opt = TrainerOptimizer::new(kind, vec![x.clone()], 0.05, 0.95, 0.0).unwrap();
            let start = quadratic(&x).to_scalar::<f32>().unwrap();
            for _ in 0..30 {
                let mut grads = quadratic(&x).backward().unwrap();
                opt.step(&mut grads).unwrap();
            }
            let end = quadratic(&x).to_scalar::<f32>().unwrap();
            assert!(end < start, "{kind} did not reduce the loss");
        }
    }

    #[test]
    fn clipping_bounds_the_global_norm() {
        let a = Var::new(&[30.0f32, 40.0], &Device::Cpu).unwrap();
        let b = Var::new(&[10.0f32], &Device::Cpu).unwrap();
        let loss = (quadratic(&a) + quadratic(&b)).unwrap();
        let mut grads = loss.backward().unwrap();
        let vars = vec![a, b];

        let before = clip_grad_norm(&mut grads, &vars, 1.0).unwrap();
        assert!(before > 1.0);
        let after = compute_grad_norm(&grads, &vars).unwrap();
        assert!(after <= 1.0 + 1e-4);

        // already within bound: untouched
        let again = clip_grad_norm(&mut grads, &vars, 5.0).unwrap();
        assert!((again - after).abs() < 1e-9);
    }
}
