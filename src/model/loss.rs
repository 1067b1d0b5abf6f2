use crate::{common::*, conditioning::observed_classes, config::AdvLoss};

const GRAD_NORM_EPS: f64 = 1e-12;
const LOG_EPS: f64 = 1e-8;

#[derive(Debug, Clone)]
pub struct WGanGpInit {
    /// Target gradient norm.
    pub constant: f64,
    pub lambda: f64,
}

impl WGanGpInit {
    pub fn build(self) -> Result<WGanGp> {
        let Self { constant, lambda } = self;
        ensure!(lambda > 0.0, "lambda must be positive, but get {}", lambda);

        Ok(WGanGp {
            c: constant,
            λ: lambda,
        })
    }
}

impl Default for WGanGpInit {
    fn default() -> Self {
        Self {
            constant: 1.0,
            lambda: 10.0,
        }
    }
}

/// Gradient penalty on random interpolates between real and fake samples.
#[derive(Debug)]
pub struct WGanGp {
    c: f64,
    λ: f64,
}

impl WGanGp {
    pub fn forward(
        &self,
        real: &Tensor,
        fake: &Tensor,
        discriminator: impl FnOnce(&Tensor) -> Result<Tensor>,
    ) -> Result<Tensor> {
        ensure!(fake.size() == real.size(), "real and fake differ in shape");
        ensure!(fake.kind() == real.kind(), "real and fake differ in kind");
        ensure!(fake.device() == real.device(), "real and fake differ in device");
        ensure!(fake.dim() > 0, "zero-dimension samples are not allowed");

        let Self { c, λ } = *self;
        let batch_size = fake.size()[0];

        let ratio = Tensor::rand(&[batch_size, 1], (fake.kind(), fake.device()))
            .expand(&[batch_size, fake.numel() as i64 / batch_size], false)
            .contiguous()
            .view(&*fake.size());
        let mix = (&ratio * real.detach() + (-&ratio + 1.0) * fake.detach())
            .set_requires_grad(true);

        let score = discriminator(&mix)?;
        let grad = &Tensor::run_backward(
            &[&score.sum(Kind::Float)], // outputs
            &[&mix],                    // inputs
            true,                       // keep_graph
            true,                       // create_graph
        )[0];
        let grad_norm = (grad
            .view([batch_size, -1])
            .pow_tensor_scalar(2)
            .sum_dim_intlist(&[1], false, Kind::Float)
            + GRAD_NORM_EPS)
            .sqrt();
        let penalty = (grad_norm - c).pow_tensor_scalar(2).mean(Kind::Float) * λ;

        Ok(penalty)
    }
}

/// Discriminator loss on real scores, to be minimized.
pub fn d_loss_real(kind: AdvLoss, scores: &Tensor) -> Tensor {
    match kind {
        AdvLoss::WGanGp => -scores.mean(Kind::Float),
        AdvLoss::Hinge => (-scores + 1.0).relu().mean(Kind::Float),
    }
}

/// Discriminator loss on fake scores, to be minimized.
pub fn d_loss_fake(kind: AdvLoss, scores: &Tensor) -> Tensor {
    match kind {
        AdvLoss::WGanGp => scores.mean(Kind::Float),
        AdvLoss::Hinge => (scores + 1.0).relu().mean(Kind::Float),
    }
}

/// Generator adversarial loss. Both formulations share it.
pub fn g_loss_fake(scores: &Tensor) -> Tensor {
    -scores.mean(Kind::Float)
}

/// Mean negative log probability of the observed class over observed pixels.
///
/// `probs` is `[B, n_classes, R, R]`, `pixel_maps` is `[B, n_classes, R, R]`
/// with the observation mask in channel 0. Returns zero when nothing is observed.
pub fn cond_penalty(probs: &Tensor, pixel_maps: &Tensor) -> Result<Tensor> {
    ensure!(
        probs.size() == pixel_maps.size(),
        "expect pixel maps of shape {:?}, but get {:?}",
        probs.size(),
        pixel_maps.size()
    );

    let classes = observed_classes(pixel_maps)?.unsqueeze(1);
    let mask = pixel_maps.narrow(1, 0, 1).gt(0.0).to_kind(Kind::Float);
    let nll = -(probs.gather(1, &classes, false) + LOG_EPS).log();
    let num_observed = mask.sum(Kind::Float).clamp_min(1.0);

    Ok((nll * &mask).sum(Kind::Float) / num_observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_penalty_test() -> Result<()> {
        let gp = WGanGpInit::default().build()?;
        let real = Tensor::rand(&[4, 2, 3, 3], FLOAT_CPU);
        let fake = Tensor::rand(&[4, 2, 3, 3], FLOAT_CPU);

        // a linear critic with unit gradient norm is not penalized
        let weight = Tensor::ones(&[2, 3, 3], FLOAT_CPU) / 18f64.sqrt();
        let penalty = gp.forward(&real, &fake, |xs| {
            Ok((xs * &weight).sum_dim_intlist(&[1, 2, 3], false, Kind::Float))
        })?;
        approx::assert_abs_diff_eq!(f64::from(penalty), 0.0, epsilon = 1e-5);

        // doubling the slope gives λ (2 - 1)² per sample
        let penalty = gp.forward(&real, &fake, |xs| {
            Ok((xs * &weight * 2.0).sum_dim_intlist(&[1, 2, 3], false, Kind::Float))
        })?;
        approx::assert_abs_diff_eq!(f64::from(penalty), 10.0, epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn adversarial_losses_test() {
        let scores = Tensor::of_slice(&[2.0f32, -0.5]);
        approx::assert_abs_diff_eq!(
            f64::from(d_loss_real(AdvLoss::WGanGp, &scores)),
            -0.75,
            epsilon = 1e-6
        );
        // relu(1 - 2) = 0, relu(1 + 0.5) = 1.5
        approx::assert_abs_diff_eq!(
            f64::from(d_loss_real(AdvLoss::Hinge, &scores)),
            0.75,
            epsilon = 1e-6
        );
        // relu(1 + 2) = 3, relu(1 - 0.5) = 0.5
        approx::assert_abs_diff_eq!(
            f64::from(d_loss_fake(AdvLoss::Hinge, &scores)),
            1.75,
            epsilon = 1e-6
        );
        approx::assert_abs_diff_eq!(f64::from(g_loss_fake(&scores)), -0.75, epsilon = 1e-6);
    }

    #[test]
    fn cond_penalty_test() -> Result<()> {
        // 3 classes on a 1x2 grid, both pixels observed with class 2 and class 0
        let pixel_maps = Tensor::of_slice(&[1.0f32, 1.0, 0.0, 0.0, 1.0, 0.0]).view([1, 3, 1, 2]);
        let probs = Tensor::of_slice(&[0.2f32, 0.5, 0.3, 0.3, 0.5, 0.2]).view([1, 3, 1, 2]);

        let penalty = f64::from(cond_penalty(&probs, &pixel_maps)?);
        let expect = -(0.5f64.ln() + 0.5f64.ln()) / 2.0;
        approx::assert_abs_diff_eq!(penalty, expect, epsilon = 1e-4);

        let empty = Tensor::zeros(&[1, 3, 1, 2], FLOAT_CPU);
        approx::assert_abs_diff_eq!(f64::from(cond_penalty(&probs, &empty)?), 0.0);
        Ok(())
    }
}
