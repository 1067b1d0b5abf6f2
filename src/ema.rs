//! Exponential moving average of generator weights.

use crate::common::*;

/// Shadow parameters blended from a source store after every generator step.
///
/// Trainable variables follow `shadow = decay * shadow + (1 - decay) * source`.
/// Non-trainable buffers (batch norm statistics, spectral norm vectors) are
/// copied verbatim.
#[derive(Debug)]
pub struct Ema {
    decay: f64,
    start_step: usize,
    initialized: bool,
    /// `(name, shadow, source, trainable)` sorted by name.
    pairs: Vec<(String, Tensor, Tensor, bool)>,
}

impl Ema {
    /// Pair up variables of equal name. Both stores must hold the same set of names.
    pub fn new(
        shadow: &nn::VarStore,
        source: &nn::VarStore,
        decay: f64,
        start_step: usize,
    ) -> Result<Self> {
        ensure!(
            (0.0..=1.0).contains(&decay),
            "EMA decay must lie in [0, 1], but get {}",
            decay
        );

        let shadow_vars = shadow.variables();
        let source_vars = source.variables();
        ensure!(
            shadow_vars.len() == source_vars.len(),
            "EMA store has {} variables, but the source has {}",
            shadow_vars.len(),
            source_vars.len()
        );

        let pairs: Vec<_> = source_vars
            .into_iter()
            .sorted_by(|(lhs, _), (rhs, _)| lhs.cmp(rhs))
            .map(|(name, source)| -> Result<_> {
                let shadow = shadow_vars
                    .get(&name)
                    .ok_or_else(|| format_err!("variable '{}' is missing in the EMA store", name))?
                    .shallow_clone();
                ensure!(
                    shadow.size() == source.size(),
                    "variable '{}' differs in shape",
                    name
                );
                let trainable = source.requires_grad();
                Ok((name, shadow, source, trainable))
            })
            .try_collect()?;

        Ok(Self {
            decay,
            start_step,
            initialized: false,
            pairs,
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Mark the shadow as holding valid weights, e.g. after loading a checkpoint.
    pub fn set_initialized(&mut self) {
        self.initialized = true;
    }

    /// Copy at the start step (or when never copied), blend afterwards.
    /// Does nothing before the start step.
    pub fn update(&mut self, step: usize) {
        if step < self.start_step {
            return;
        }

        let copy_all = step == self.start_step || !self.initialized;
        let decay = self.decay;

        tch::no_grad(|| {
            for (_, shadow, source, trainable) in self.pairs.iter_mut() {
                if copy_all || !*trainable {
                    shadow.copy_(source);
                } else {
                    let blended = &*shadow * decay + &*source * (1.0 - decay);
                    shadow.copy_(&blended);
                }
            }
        });
        self.initialized = true;
    }
}
