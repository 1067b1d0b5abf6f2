use crate::common::*;

const POWER_ITERATION_EPS: f64 = 1e-12;

#[derive(Debug, Clone)]
pub struct SpectralNormConvInit {
    pub ksize: usize,
    pub stride: usize,
    pub padding: usize,
    pub transposed: bool,
    pub bias: bool,
    pub ws_init: nn::Init,
    pub bs_init: nn::Init,
}

impl SpectralNormConvInit {
    pub fn new(ksize: usize, stride: usize, padding: usize) -> Self {
        Self {
            ksize,
            stride,
            padding,
            transposed: false,
            bias: true,
            ws_init: nn::Init::KaimingUniform,
            bs_init: nn::Init::Const(0.0),
        }
    }

    pub fn transposed(ksize: usize, stride: usize, padding: usize) -> Self {
        Self {
            transposed: true,
            ..Self::new(ksize, stride, padding)
        }
    }

    pub fn build<'a>(
        self,
        path: impl Borrow<nn::Path<'a>>,
        in_dim: usize,
        out_dim: usize,
    ) -> Result<SpectralNormConv> {
        let path = path.borrow();
        let Self {
            ksize,
            stride,
            padding,
            transposed,
            bias,
            ws_init,
            bs_init,
        } = self;

        ensure!(ksize > 0 && stride > 0, "ksize and stride must be positive");
        ensure!(in_dim > 0 && out_dim > 0, "channel sizes must be positive");

        let in_dim = in_dim as i64;
        let out_dim = out_dim as i64;
        let ksize = ksize as i64;

        // transposed convolutions store weights as [in, out, k, k]
        let weight_size = if transposed {
            [in_dim, out_dim, ksize, ksize]
        } else {
            [out_dim, in_dim, ksize, ksize]
        };
        let height = weight_size[0];
        let width = weight_size[1..].iter().product::<i64>();

        let weight = path.var("weight_bar", &weight_size, ws_init);
        let bias = bias.then(|| path.var("bias", &[out_dim], bs_init));

        // power iteration state, stored with the parameters but never trained
        let mut u = path.zeros_no_train("weight_u", &[height]);
        let mut v = path.zeros_no_train("weight_v", &[width]);
        tch::no_grad(|| {
            let init_u = Tensor::randn(&[height], (Kind::Float, path.device()));
            let init_v = Tensor::randn(&[width], (Kind::Float, path.device()));
            u.copy_(&l2_normalize(&init_u));
            v.copy_(&l2_normalize(&init_v));
        });

        Ok(SpectralNormConv {
            stride: vec![stride as i64; 2],
            padding: vec![padding as i64; 2],
            dilation: vec![1; 2],
            output_padding: vec![0; 2],
            transposed,
            weight,
            bias,
            u,
            v,
        })
    }
}

/// 2D convolution whose weight is divided by its largest singular value on every call.
///
/// The singular value is estimated by one power iteration step starting from the
/// persisted vectors `u` and `v`, which are updated in place. Gradients flow
/// through the weight in `σ = uᵀ W v` but not through `u` and `v`.
#[derive(Debug)]
pub struct SpectralNormConv {
    stride: Vec<i64>,
    padding: Vec<i64>,
    dilation: Vec<i64>,
    output_padding: Vec<i64>,
    transposed: bool,
    weight: Tensor,
    bias: Option<Tensor>,
    u: Tensor,
    v: Tensor,
}

impl SpectralNormConv {
    /// Current estimate of the dominant left singular vector.
    pub fn u(&self) -> Tensor {
        self.u.detach().copy()
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Run one power iteration step and return the normalized weight.
    pub fn normalized_weight(&mut self) -> Tensor {
        let Self {
            ref weight,
            ref mut u,
            ref mut v,
            ..
        } = *self;

        let height = weight.size()[0];
        let matrix = weight.view([height, -1]);

        tch::no_grad(|| {
            let matrix = matrix.detach();
            let new_v = l2_normalize(&matrix.tr().mv(u));
            let new_u = l2_normalize(&matrix.mv(&new_v));
            v.copy_(&new_v);
            u.copy_(&new_u);
        });

        // owned copies, the next power iteration updates u and v in place
        let u = u.detach().copy();
        let v = v.detach().copy();
        let sigma = u.dot(&matrix.mv(&v));
        weight / sigma
    }

    pub fn forward(&mut self, input: &Tensor) -> Tensor {
        let weight = self.normalized_weight();
        let Self {
            ref stride,
            ref padding,
            ref dilation,
            ref output_padding,
            transposed,
            ref bias,
            ..
        } = *self;

        input.convolution(
            &weight,
            bias.as_ref(),
            stride,
            padding,
            dilation,
            transposed,
            output_padding,
            1,
        )
    }
}

fn l2_normalize(xs: &Tensor) -> Tensor {
    xs / (xs.norm() + POWER_ITERATION_EPS)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(lhs: &Tensor, rhs: &Tensor) -> f64 {
        let dot = f64::from(lhs.dot(rhs));
        dot / (f64::from(lhs.norm()) * f64::from(rhs.norm()))
    }

    #[test]
    fn power_iteration_converges_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = SpectralNormConvInit::new(4, 2, 1).build(&vs.root(), 6, 12)?;

        let input = Tensor::randn(&[2, 6, 16, 16], FLOAT_CPU);
        let mut prev = conv.u();
        let similarities: Vec<f64> = (0..100)
            .map(|_| {
                let _ = conv.forward(&input);
                let curr = conv.u();
                let sim = cosine(&prev, &curr);
                prev = curr;
                sim
            })
            .collect();

        let last = *similarities.last().unwrap();
        assert!(last > 0.999, "last similarity {}", last);
        Ok(())
    }

    #[test]
    fn normalized_weight_has_unit_spectral_norm_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = SpectralNormConvInit::transposed(4, 2, 1).build(&vs.root(), 8, 4)?;

        let weight = (0..200).map(|_| conv.normalized_weight()).last().unwrap();
        let matrix = weight.detach().view([8, -1]);

        // largest eigenvalue of W Wᵀ by plain power iteration
        let gram = matrix.matmul(&matrix.tr());
        let mut xs = Tensor::ones(&[8], FLOAT_CPU);
        for _ in 0..500 {
            xs = l2_normalize(&gram.mv(&xs));
        }
        let sigma_max = f64::from(gram.mv(&xs).norm()).sqrt();
        approx::assert_abs_diff_eq!(sigma_max, 1.0, epsilon = 1e-2);
        Ok(())
    }

    #[test]
    fn gradient_reaches_weight_but_not_state_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = SpectralNormConvInit::new(4, 2, 1).build(&vs.root(), 3, 5)?;

        let input = Tensor::randn(&[1, 3, 8, 8], FLOAT_CPU);
        let output = conv.forward(&input);
        assert_eq!(output.size(), vec![1, 5, 4, 4]);

        output.sum(Kind::Float).backward();
        assert!(conv.weight().grad().defined());
        assert!(!conv.u.requires_grad());
        assert!(!conv.v.requires_grad());
        Ok(())
    }

    #[test]
    fn backward_over_repeated_forwards_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = SpectralNormConvInit::new(4, 2, 1).build(&vs.root(), 3, 5)?;

        let lhs = conv.forward(&Tensor::randn(&[2, 3, 8, 8], FLOAT_CPU));
        let rhs = conv.forward(&Tensor::randn(&[2, 3, 8, 8], FLOAT_CPU));
        let third = conv.forward(&Tensor::randn(&[2, 3, 8, 8], FLOAT_CPU));

        (lhs.mean(Kind::Float) - rhs.mean(Kind::Float) + third.mean(Kind::Float))
            .f_backward()?;
        assert!(conv.weight().grad().defined());
        let grad_norm = f64::from(conv.weight().grad().norm());
        assert!(grad_norm.is_finite());
        Ok(())
    }

    #[test]
    fn transposed_upsamples_test() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut conv = SpectralNormConvInit::transposed(4, 2, 1).build(&vs.root(), 3, 5)?;
        let output = conv.forward(&Tensor::randn(&[2, 3, 8, 8], FLOAT_CPU));
        assert_eq!(output.size(), vec![2, 5, 16, 16]);
        Ok(())
    }
}
