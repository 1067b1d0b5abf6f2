//! Adam with checkpointable moments and dynamic loss scaling.

use crate::common::*;

#[derive(Debug, Clone)]
pub struct AdamInit {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamInit {
    /// Track every variable of `vs` that currently requires gradients.
    pub fn build(self, vs: &nn::VarStore) -> Result<Adam> {
        let Self {
            lr,
            beta1,
            beta2,
            eps,
        } = self;
        ensure!(lr > 0.0, "learning rate must be positive");
        ensure!(
            (0.0..1.0).contains(&beta1) && (0.0..1.0).contains(&beta2),
            "betas must lie in [0, 1)"
        );

        let params: Vec<_> = vs
            .variables()
            .into_iter()
            .filter(|(_, var)| var.requires_grad())
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, var)| {
                let exp_avg = var.zeros_like().detach();
                let exp_avg_sq = var.zeros_like().detach();
                AdamParam {
                    name,
                    var,
                    exp_avg,
                    exp_avg_sq,
                }
            })
            .collect();

        Ok(Adam {
            lr,
            beta1,
            beta2,
            eps,
            step: 0,
            params,
        })
    }
}

#[derive(Debug)]
struct AdamParam {
    name: String,
    var: Tensor,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

#[derive(Debug)]
pub struct Adam {
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    step: i64,
    params: Vec<AdamParam>,
}

impl Adam {
    pub fn step_count(&self) -> i64 {
        self.step
    }

    pub fn zero_grad(&mut self) {
        self.params
            .iter_mut()
            .for_each(|param| param.var.zero_grad());
    }

    /// Gradients of the tracked variables, skipping those without one.
    pub fn grads(&self) -> Vec<Tensor> {
        self.params
            .iter()
            .map(|param| param.var.grad())
            .filter(|grad| grad.defined())
            .collect()
    }

    pub fn step(&mut self) {
        let Self {
            lr,
            beta1,
            beta2,
            eps,
            ref mut step,
            ref mut params,
        } = *self;

        *step += 1;
        let bias_correction1 = 1.0 - beta1.powi(*step as i32);
        let bias_correction2 = 1.0 - beta2.powi(*step as i32);

        tch::no_grad(|| {
            for param in params.iter_mut() {
                let AdamParam {
                    var,
                    exp_avg,
                    exp_avg_sq,
                    ..
                } = param;

                let grad = var.grad();
                if !grad.defined() {
                    continue;
                }

                let new_avg = &*exp_avg * beta1 + &grad * (1.0 - beta1);
                let new_avg_sq = &*exp_avg_sq * beta2 + grad.square() * (1.0 - beta2);
                exp_avg.copy_(&new_avg);
                exp_avg_sq.copy_(&new_avg_sq);

                let denom = (new_avg_sq / bias_correction2).sqrt() + eps;
                let update = new_avg / bias_correction1 / denom * lr;
                let _ = var.g_sub_(&update);
            }
        });
    }

    /// Moments and step counter as named tensors, prefixed with `prefix`.
    pub fn state_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        let step = Tensor::of_slice(&[self.step]);
        let moments = self.params.iter().flat_map(|param| {
            [
                (
                    format!("{}.exp_avg.{}", prefix, param.name),
                    param.exp_avg.shallow_clone(),
                ),
                (
                    format!("{}.exp_avg_sq.{}", prefix, param.name),
                    param.exp_avg_sq.shallow_clone(),
                ),
            ]
        });
        iter::once((format!("{}.step", prefix), step))
            .chain(moments)
            .collect()
    }

    /// Restore the state written by [Adam::state_tensors].
    pub fn load_state_tensors(
        &mut self,
        prefix: &str,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<()> {
        let step_key = format!("{}.step", prefix);
        let step = tensors
            .get(&step_key)
            .ok_or_else(|| format_err!("missing optimizer entry '{}'", step_key))?;
        self.step = i64::from(step.get(0));

        tch::no_grad(|| -> Result<()> {
            for param in self.params.iter_mut() {
                for (kind, buffer) in [
                    ("exp_avg", &mut param.exp_avg),
                    ("exp_avg_sq", &mut param.exp_avg_sq),
                ] {
                    let key = format!("{}.{}.{}", prefix, kind, param.name);
                    let value = tensors
                        .get(&key)
                        .ok_or_else(|| format_err!("missing optimizer entry '{}'", key))?;
                    ensure!(
                        value.size() == buffer.size(),
                        "optimizer entry '{}' has shape {:?}, but expect {:?}",
                        key,
                        value.size(),
                        buffer.size()
                    );
                    buffer.copy_(value);
                }
            }
            Ok(())
        })
    }
}

#[derive(Debug, Clone)]
pub struct GradScalerInit {
    pub enabled: bool,
    pub init_scale: f64,
    pub growth_factor: f64,
    pub backoff_factor: f64,
    pub growth_interval: usize,
}

impl GradScalerInit {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            init_scale: 65536.0,
            growth_factor: 2.0,
            backoff_factor: 0.5,
            growth_interval: 2000,
        }
    }

    pub fn build(self) -> Result<GradScaler> {
        let Self {
            enabled,
            init_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
        } = self;
        ensure!(init_scale > 0.0, "init_scale must be positive");
        ensure!(growth_factor > 1.0, "growth_factor must be greater than 1");
        ensure!(
            backoff_factor > 0.0 && backoff_factor < 1.0,
            "backoff_factor must lie in (0, 1)"
        );
        ensure!(growth_interval > 0, "growth_interval must be positive");

        Ok(GradScaler {
            enabled,
            scale: init_scale,
            growth_factor,
            backoff_factor,
            growth_interval,
            growth_tracker: 0,
        })
    }
}

/// Dynamic loss scaling. An identity when disabled.
#[derive(Debug)]
pub struct GradScaler {
    enabled: bool,
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    growth_tracker: usize,
}

impl GradScaler {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn scale_loss(&self, loss: &Tensor) -> Tensor {
        if self.enabled {
            loss * self.scale
        } else {
            loss.shallow_clone()
        }
    }

    /// Unscale the gradients and step the optimizer unless any gradient
    /// overflowed. Returns whether the step was applied.
    pub fn step(&mut self, optimizer: &mut Adam) -> bool {
        if !self.enabled {
            optimizer.step();
            return true;
        }

        let inv_scale = 1.0 / self.scale;
        let finite = tch::no_grad(|| {
            optimizer
                .grads()
                .into_iter()
                .map(|mut grad| {
                    let unscaled = &grad * inv_scale;
                    grad.copy_(&unscaled);
                    bool::from(unscaled.isfinite().all())
                })
                .fold(true, |all_finite, finite| all_finite && finite)
        });

        if finite {
            optimizer.step();
        } else {
            warn!(
                "gradient overflow, skip optimizer step and reduce loss scale to {}",
                self.scale * self.backoff_factor
            );
        }
        self.update(!finite);
        finite
    }

    fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker == self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }
    }

    pub fn state_tensors(&self, prefix: &str) -> Vec<(String, Tensor)> {
        vec![
            (
                format!("{}.scale", prefix),
                Tensor::of_slice(&[self.scale]),
            ),
            (
                format!("{}.growth_tracker", prefix),
                Tensor::of_slice(&[self.growth_tracker as i64]),
            ),
        ]
    }

    pub fn load_state_tensors(
        &mut self,
        prefix: &str,
        tensors: &HashMap<String, Tensor>,
    ) -> Result<()> {
        let get = |name: &str| {
            let key = format!("{}.{}", prefix, name);
            tensors
                .get(&key)
                .ok_or_else(|| format_err!("missing scaler entry '{}'", key))
        };
        self.scale = f64::from(get("scale")?.get(0));
        self.growth_tracker = i64::from(get("growth_tracker")?.get(0)) as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quadratic_store() -> (nn::VarStore, Tensor) {
        let vs = nn::VarStore::new(Device::Cpu);
        let xs = vs.root().var("xs", &[3], nn::Init::Const(1.0));
        (vs, xs)
    }

    fn adam_init() -> AdamInit {
        AdamInit {
            lr: 0.1,
            beta1: 0.5,
            beta2: 0.9,
            eps: 1e-8,
        }
    }

    #[test]
    fn adam_minimizes_quadratic_test() -> Result<()> {
        let (vs, xs) = quadratic_store();
        let mut opt = adam_init().build(&vs)?;

        for _ in 0..200 {
            opt.zero_grad();
            xs.square().sum(Kind::Float).backward();
            opt.step();
        }
        assert_eq!(opt.step_count(), 200);
        assert!(f64::from(xs.abs().max()) < 0.05);
        Ok(())
    }

    #[test]
    fn adam_first_step_moves_by_lr_test() -> Result<()> {
        let (vs, xs) = quadratic_store();
        let mut opt = adam_init().build(&vs)?;
        opt.zero_grad();
        xs.sum(Kind::Float).backward();
        opt.step();
        // bias-corrected first update is lr * sign(grad)
        approx::assert_abs_diff_eq!(f64::from(xs.get(0)), 0.9, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn adam_state_restore_test() -> Result<()> {
        let (vs, xs) = quadratic_store();
        let mut opt = adam_init().build(&vs)?;
        opt.zero_grad();
        xs.square().sum(Kind::Float).backward();
        opt.step();

        let state: HashMap<_, _> = opt.state_tensors("d").into_iter().collect();
        assert!(state.contains_key("d.step"));
        assert!(state.contains_key("d.exp_avg.xs"));

        let (vs2, _) = quadratic_store();
        let mut opt2 = adam_init().build(&vs2)?;
        opt2.load_state_tensors("d", &state)?;
        assert_eq!(opt2.step_count(), 1);
        let restored: HashMap<_, _> = opt2.state_tensors("d").into_iter().collect();
        let diff = (&restored["d.exp_avg_sq.xs"] - &state["d.exp_avg_sq.xs"])
            .abs()
            .sum(Kind::Float);
        assert_eq!(f64::from(diff), 0.0);

        assert!(opt2.load_state_tensors("g", &state).is_err());
        Ok(())
    }

    #[test]
    fn scaler_skips_overflow_test() -> Result<()> {
        let (vs, xs) = quadratic_store();
        let mut opt = adam_init().build(&vs)?;
        let mut scaler = GradScalerInit::new(true).build()?;
        let before = xs.detach().copy();

        opt.zero_grad();
        let loss = (&xs * f64::INFINITY).sum(Kind::Float);
        scaler.scale_loss(&loss).backward();
        assert!(!scaler.step(&mut opt));

        // parameters and optimizer untouched, scale reduced
        let diff = f64::from((&xs - &before).abs().sum(Kind::Float));
        assert_eq!(diff, 0.0);
        assert_eq!(opt.step_count(), 0);
        assert_eq!(scaler.scale(), 32768.0);
        Ok(())
    }

    #[test]
    fn scaler_unscales_gradients_test() -> Result<()> {
        let (vs, xs) = quadratic_store();
        let mut opt = adam_init().build(&vs)?;
        let mut scaler = GradScalerInit {
            growth_interval: 1,
            ..GradScalerInit::new(true)
        }
        .build()?;

        opt.zero_grad();
        let loss = (&xs * 3.0).sum(Kind::Float);
        scaler.scale_loss(&loss).backward();
        assert!(scaler.step(&mut opt));

        approx::assert_abs_diff_eq!(f64::from(xs.grad().get(0)), 3.0, epsilon = 1e-6);
        assert_eq!(opt.step_count(), 1);
        assert_eq!(scaler.scale(), 131072.0);
        Ok(())
    }

    #[test]
    fn disabled_scaler_is_identity_test() -> Result<()> {
        let scaler = GradScalerInit::new(false).build()?;
        let loss = Tensor::from(2.0f32);
        assert_eq!(f64::from(scaler.scale_loss(&loss)), 2.0);
        Ok(())
    }
}
