use crate::{common::*, config::InitMethod};

const NORMAL_STD: f64 = 0.02;

/// Re-initialize every 4-D parameter of the store in place.
///
/// Spectral-norm power iteration vectors, biases and normalization parameters
/// are not 4-D and keep their initial values.
pub fn init_weights(vs: &nn::VarStore, method: InitMethod) -> Result<()> {
    if method == InitMethod::Default {
        return Ok(());
    }

    let mut variables: Vec<_> = vs.variables().into_iter().collect();
    variables.sort_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs));

    tch::no_grad(|| -> Result<()> {
        for (name, mut var) in variables {
            if var.dim() != 4 {
                continue;
            }
            let values = match method {
                InitMethod::Orthogonal => orthogonal(&var.size(), var.device())?,
                InitMethod::Glorot => glorot_uniform(&var.size(), var.device()),
                InitMethod::Normal => {
                    Tensor::randn(&var.size(), (Kind::Float, var.device())) * NORMAL_STD
                }
                InitMethod::Default => continue,
            };
            var.copy_(&values);
            debug!("initialized {} with {:?}", name, method);
        }
        Ok(())
    })
}

/// Orthogonal rows (or columns) over the weight flattened to `[size[0], rest]`.
fn orthogonal(size: &[i64], device: Device) -> Result<Tensor> {
    ensure!(!size.is_empty(), "cannot orthogonalize a scalar");
    let rows = size[0];
    let cols: i64 = size[1..].iter().product();

    let flat = Tensor::randn(&[rows, cols], (Kind::Float, device));
    let flat = if rows < cols { flat.tr() } else { flat };

    let (q, r) = flat.qr(true);
    // make the decomposition unique
    let sign = r.diagonal(0, 0, 1).sign();
    let q = q * sign.unsqueeze(0);
    let q = if rows < cols { q.tr() } else { q };

    Ok(q.contiguous().view(size))
}

fn glorot_uniform(size: &[i64], device: Device) -> Tensor {
    let receptive: i64 = size[2..].iter().product();
    let fan_out = size[0] * receptive;
    let fan_in = size[1] * receptive;
    let bound = (6.0 / (fan_in + fan_out) as f64).sqrt();
    Tensor::rand(size, (Kind::Float, device)) * (2.0 * bound) - bound
}
