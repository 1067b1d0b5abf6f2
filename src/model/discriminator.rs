use super::{
    attention::{SelfAttention, SelfAttentionInit},
    block::{BlockLayout, BlockSpec},
    spectral_norm::{SpectralNormConv, SpectralNormConvInit},
};
use crate::{common::*, config::ModelConfig, error::ConfigError};

const LEAKY_SLOPE: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct DiscriminatorInit {
    pub model: ModelConfig,
    pub n_classes: usize,
    /// Channels of the pixel maps concatenated to the input, enabling the
    /// conditional mode.
    pub cond_channels: Option<usize>,
}

impl DiscriminatorInit {
    pub fn build<'a>(self, path: impl Borrow<nn::Path<'a>>) -> Result<Discriminator> {
        let path = path.borrow();
        let Self {
            model,
            n_classes,
            cond_channels,
        } = self;
        ensure!(n_classes > 0, "n_classes must be positive");

        let in_channels = n_classes + cond_channels.unwrap_or(0);
        let layout = BlockLayout::discriminator(&model, in_channels)?;

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

                let conv = SpectralNormConvInit::new(4, 2, 1).build(
                    &(path / format!("block_{}", index)) / "conv",
                    in_channels,
                    out_channels,
                )?;
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

                Ok(DiscriminatorBlock { conv, attention })
            })
            .try_collect()?;

        let last_conv = nn::conv2d(
            path / "last_conv",
            layout.last_channels as i64,
            1,
            4,
            Default::default(),
        );

        Ok(Discriminator {
            n_classes: n_classes as i64,
            data_size: model.data_size as i64,
            conditional: cond_channels.is_some(),
            blocks,
            last_conv,
        })
    }
}

#[derive(Debug)]
struct DiscriminatorBlock {
    conv: SpectralNormConv,
    attention: Option<SelfAttention>,
}

#[derive(Debug)]
pub struct Discriminator {
    n_classes: i64,
    data_size: i64,
    conditional: bool,
    blocks: Vec<DiscriminatorBlock>,
    last_conv: nn::Conv2D,
}

impl Discriminator {
    pub fn is_conditional(&self) -> bool {
        self.conditional
    }

    /// Scores class maps `[B, n_classes, R, R]` with a `[B]` tensor, keeping
    /// the batch axis when `B` is 1.
    pub fn forward(
        &mut self,
        input: &Tensor,
        pixel_maps: Option<&Tensor>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        let Self {
            n_classes,
            data_size,
            conditional,
            ref mut blocks,
            ref last_conv,
        } = *self;

        let (batch_size, channels, height, width) = input.size4()?;
        ensure!(
            channels == n_classes,
            "expect {} input channels, but get {}",
            n_classes,
            channels
        );
        ensure!(
            height == data_size && width == data_size,
            "expect inputs of size {}, but get {}x{}",
            data_size,
            height,
            width
        );

        let mut xs = match (conditional, pixel_maps) {
            (true, None) => return Err(ConfigError::MissingConditioning.into()),
            (true, Some(maps)) => {
                let (maps_batch, _, maps_height, maps_width) = maps.size4()?;
                ensure!(
                    maps_batch == batch_size,
                    "pixel maps and inputs differ in batch size"
                );
                ensure!(
                    maps_height == data_size && maps_width == data_size,
                    "expect pixel maps of size {}, but get {}x{}",
                    data_size,
                    maps_height,
                    maps_width
                );
                ensure!(
                    maps.device() == input.device(),
                    "pixel maps and inputs are on different devices"
                );
                Tensor::cat(&[input, maps], 1)
            }
            (false, _) => input.shallow_clone(),
        };

        let mut attentions = vec![];
        for DiscriminatorBlock { conv, attention } in blocks.iter_mut() {
            xs = conv.forward(&xs);
            xs = xs.maximum(&(&xs * LEAKY_SLOPE));

            if let Some(attention) = attention {
                let (output, attn) = attention.forward(&xs)?;
                xs = output;
                attentions.push(attn);
            }
        }

        let scores = last_conv.forward(&xs).view([batch_size]);
        Ok((scores, attentions))
    }
}
