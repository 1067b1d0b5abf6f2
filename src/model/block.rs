use crate::{common::*, config::ModelConfig, error::ConfigError};

/// Attention over more positions than this is likely to exhaust device memory.
const LARGE_ATTENTION_POSITIONS: usize = 64 * 64;

/// Shape record of one up/down-sampling block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSpec {
    /// 1-based position in the stack.
    pub index: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    /// Spatial size of the block output.
    pub resolution: usize,
    /// The block is followed by a self-attention layer.
    pub attention: bool,
}

/// Ordered block records of one network, the final convolution excluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    pub blocks: Vec<BlockSpec>,
    /// Channels entering the final convolution.
    pub last_channels: usize,
}

impl BlockLayout {
    pub fn num_attention(&self) -> usize {
        self.blocks.iter().filter(|block| block.attention).count()
    }

    /// Generator blocks: 1x1 latent to 4x4, then doubling the resolution.
    pub fn generator(config: &ModelConfig) -> Result<Self> {
        let num_blocks = config.num_blocks()?;
        let depth = num_blocks - 1;
        let mults = channel_mults(
            config.g_channels_mult.as_deref(),
            (0..depth).map(|index| 1 << (depth - 1 - index)),
            depth,
        )?;
        let attention = attention_flags(&config.attn_layer_num, num_blocks)?;

        let blocks: Vec<_> = izip!(0..depth, &mults, &attention)
            .map(|(index, &mult, &attention)| {
                let in_channels = match index {
                    0 => config.z_dim,
                    _ => config.g_conv_dim * mults[index - 1],
                };
                BlockSpec {
                    index: index + 1,
                    in_channels,
                    out_channels: config.g_conv_dim * mult,
                    resolution: 4 << index,
                    attention,
                }
            })
            .collect();

        Self::from_blocks(blocks)
    }

    /// Discriminator blocks: halving the resolution from the data size.
    pub fn discriminator(config: &ModelConfig, in_channels: usize) -> Result<Self> {
        let num_blocks = config.num_blocks()?;
        let depth = num_blocks - 1;
        let mults = channel_mults(
            config.d_channels_mult.as_deref(),
            (0..depth).map(|index| 1 << index),
            depth,
        )?;
        let attention = attention_flags(&config.attn_layer_num, num_blocks)?;

        let blocks: Vec<_> = izip!(0..depth, &mults, &attention)
            .map(|(index, &mult, &attention)| {
                let in_channels = match index {
                    0 => in_channels,
                    _ => config.d_conv_dim * mults[index - 1],
                };
                BlockSpec {
                    index: index + 1,
                    in_channels,
                    out_channels: config.d_conv_dim * mult,
                    resolution: config.data_size >> (index + 1),
                    attention,
                }
            })
            .collect();

        Self::from_blocks(blocks)
    }

    fn from_blocks(blocks: Vec<BlockSpec>) -> Result<Self> {
        ensure!(
            blocks.iter().all(|block| block.out_channels > 0),
            "every block must have at least one output channel"
        );

        blocks
            .iter()
            .filter(|block| block.attention)
            .filter(|block| block.resolution * block.resolution > LARGE_ATTENTION_POSITIONS)
            .for_each(|block| {
                let positions = block.resolution * block.resolution;
                warn!(
                    "attention after block {} spans {} positions, each sample allocates a {}x{} matrix",
                    block.index, positions, positions, positions
                );
            });

        let last_channels = blocks
            .last()
            .map(|block| block.out_channels)
            .ok_or_else(|| format_err!("at least one block is required"))?;

        Ok(Self {
            blocks,
            last_channels,
        })
    }
}

fn channel_mults(
    custom: Option<&[usize]>,
    default: impl Iterator<Item = usize>,
    depth: usize,
) -> Result<Vec<usize>> {
    match custom {
        Some(mults) => {
            ensure!(
                mults.len() == depth,
                "expect {} channel multipliers, but get {}",
                depth,
                mults.len()
            );
            Ok(mults.to_vec())
        }
        None => Ok(default.collect()),
    }
}

fn attention_flags(indices: &[usize], num_blocks: usize) -> Result<Vec<bool>, ConfigError> {
    let mut flags = vec![false; num_blocks - 1];
    for &index in indices {
        if !(1..num_blocks).contains(&index) {
            return Err(ConfigError::InvalidAttentionLayer { index, num_blocks });
        }
        flags[index - 1] = true;
    }
    Ok(flags)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_layout_test() -> Result<()> {
        let config = ModelConfig {
            data_size: 32,
            z_dim: 128,
            g_conv_dim: 64,
            ..Default::default()
        };
        let layout = BlockLayout::generator(&config)?;
        let shapes: Vec<_> = layout
            .blocks
            .iter()
            .map(|block| (block.in_channels, block.out_channels, block.resolution))
            .collect();
        assert_eq!(shapes, vec![(128, 256, 4), (256, 128, 8), (128, 64, 16)]);
        assert_eq!(layout.last_channels, 64);
        assert_eq!(layout.num_attention(), 1);
        assert!(layout.blocks[2].attention);
        Ok(())
    }

    #[test]
    fn discriminator_layout_test() -> Result<()> {
        let config = ModelConfig {
            data_size: 64,
            d_conv_dim: 32,
            attn_layer_num: vec![3, 4],
            ..Default::default()
        };
        let layout = BlockLayout::discriminator(&config, 4)?;
        let shapes: Vec<_> = layout
            .blocks
            .iter()
            .map(|block| (block.in_channels, block.out_channels, block.resolution))
            .collect();
        assert_eq!(
            shapes,
            vec![(4, 32, 32), (32, 64, 16), (64, 128, 8), (128, 256, 4)]
        );
        assert_eq!(layout.num_attention(), 2);
        Ok(())
    }

    #[test]
    fn custom_multipliers_test() -> Result<()> {
        let config = ModelConfig {
            data_size: 32,
            g_conv_dim: 8,
            g_channels_mult: Some(vec![4, 4, 1]),
            ..Default::default()
        };
        let layout = BlockLayout::generator(&config)?;
        assert_eq!(layout.blocks[1].out_channels, 32);

        let config = ModelConfig {
            g_channels_mult: Some(vec![1, 2]),
            ..config
        };
        assert!(BlockLayout::generator(&config).is_err());
        Ok(())
    }

    #[test]
    fn attention_index_out_of_range_test() {
        let config = ModelConfig {
            data_size: 32,
            attn_layer_num: vec![4],
            ..Default::default()
        };
        let err = BlockLayout::generator(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidAttentionLayer {
                index: 4,
                num_blocks: 4
            })
        ));
    }

    #[test]
    fn unsupported_resolution_test() {
        let config = ModelConfig {
            data_size: 100,
            ..Default::default()
        };
        let err = BlockLayout::discriminator(&config, 4).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::UnsupportedResolution(100))
        ));
    }
}
