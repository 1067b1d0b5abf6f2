use super::{
    attention::{SelfAttention, SelfAttentionInit},
    block::{BlockLayout, BlockSpec},
    spectral_norm::{SpectralNormConv, SpectralNormConvInit},
};
use crate::{common::*, config::ModelConfig, error::ConfigError};

#[derive(Debug, Clone)]
pub struct GeneratorInit {
    pub model: ModelConfig,
    pub n_classes: usize,
    /// Channels of the pixel maps concatenated before every block after the
    /// first one, enabling the conditional mode.
    pub cond_channels: Option<usize>,
}

impl GeneratorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Generator> {
        let path = path.borrow();
        let Self {
            model,
            n_classes,
            cond_channels,
        } = self;
        ensure!(n_classes > 0, "n_classes must be positive");

        let layout = BlockLayout::generator(&model)?;
        let extra_channels = cond_channels.unwrap_or(0);

        let blocks: Vec<_> = layout
            .blocks
            .iter()
            .map(|spec| -> Result<_> {
                let BlockSpec {
                    index,
                    in_channels,
                    out_channels,
                    attention,
                    ..
                } = *spec;

                let (in_channels, conv_init) = if index == 1 {
                    (in_channels, SpectralNormConvInit::transposed(4, 1, 0))
                } else {
                    (
                        in_channels + extra_channels,
                        SpectralNormConvInit::transposed(4, 2, 1),
                    )
                };
                let block_path = path / format!("block_{}", index);
                let conv = conv_init.build(&block_path / "conv", in_channels, out_channels)?;
                let bn = nn::batch_norm2d(
                    &block_path / "bn",
                    out_channels as i64,
                    Default::default(),
                );
                let attention = attention
                    .then(|| {
                        SelfAttentionInit {
                            input_channels: out_channels,
                            qk_channels: model.attn_qk_dim,
                            full_values: model.full_values,
                        }
                        .build(path / format!("attn_{}", index))
                    })
                    .transpose()?;

                Ok(GeneratorBlock {
                    conv,
                    bn,
                    attention,
                })
            })
            .try_collect()?;

        let last_conv = nn::conv_transpose2d(
            path / "last_conv",
            (layout.last_channels + extra_channels) as i64,
            n_classes as i64,
            4,
            nn::ConvTransposeConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );

        Ok(Generator {
            z_dim: model.z_dim as i64,
            data_size: model.data_size as i64,
            conditional: cond_channels.is_some(),
            blocks,
            last_conv,
        })
    }
}

#[derive(Debug)]
struct GeneratorBlock {
    conv: SpectralNormConv,
    bn: nn::BatchNorm,
    attention: Option<SelfAttention>,
}

#[derive(Debug)]
pub struct Generator {
    z_dim: i64,
    data_size: i64,
    conditional: bool,
    blocks: Vec<GeneratorBlock>,
    last_conv: nn::ConvTranspose2D,
}

impl Generator {
    pub fn z_dim(&self) -> i64 {
        self.z_dim
    }

    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    pub fn num_attention(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| block.attention.is_some())
            .count()
    }

    /// Maps latent vectors `[B, z_dim]` to per-pixel class distributions
    /// `[B, n_classes, R, R]` and returns the attention maps in block order.
    pub fn forward_t(
        &mut self,
        z: &Tensor,
        pixel_maps: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let Self {
            z_dim,
            data_size,
            conditional,
            ref mut blocks,
            ref last_conv,
        } = *self;

        let pixel_maps = match (conditional, pixel_maps) {
            (true, None) => return Err(ConfigError::MissingConditioning.into()),
            (true, Some(maps)) => {
                let (_, _, height, width) = maps.size4()?;
                ensure!(
                    height == data_size && width == data_size,
                    "expect pixel maps of size {}, but get {}x{}",
                    data_size,
                    height,
                    width
                );
                Some(maps)
            }
            (false, _) => None,
        };

        let (batch_size, in_dim) = z.size2()?;
        ensure!(
            in_dim == z_dim,
            "expect latent size {}, but get {}",
            z_dim,
            in_dim
        );

        let mut attentions = vec![];
        let mut xs = z.view([batch_size, z_dim, 1, 1]);

        for (index, block) in blocks.iter_mut().enumerate() {
            let GeneratorBlock {
                conv,
                bn,
                attention,
            } = block;

            if index > 0 {
                xs = with_conditioning(&xs, pixel_maps)?;
            }
            xs = conv.forward(&xs);
            xs = bn.forward_t(&xs, train).relu();

            if let Some(attention) = attention {
                let (output, attn) = attention.forward(&xs)?;
                xs = output;
                attentions.push(attn);
            }
        }

        let xs = with_conditioning(&xs, pixel_maps)?;
        let probs = last_conv.forward(&xs).softmax(1, Kind::Float);

        Ok((probs, attentions))
    }
}

/// Concatenate the pixel maps, max-pooled to the feature resolution.
fn with_conditioning(xs: &Tensor, pixel_maps: Option<&Tensor>) -> Result<Tensor> {
    let pixel_maps = match pixel_maps {
        Some(maps) => maps,
        None => return Ok(xs.shallow_clone()),
    };
    let (_, _, height, width) = xs.size4()?;
    let (pooled, _) = pixel_maps.adaptive_max_pool2d(&[height, width]);
    Ok(Tensor::cat(&[xs, &pooled], 1))
}
