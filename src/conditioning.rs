//! Sparse pixel observations used to condition the networks.
//!
//! A pixel map has shape `[B, n_classes, R, R]`. Channel 0 is the observation
//! mask; an observed pixel of class `c > 0` additionally sets channel `c`.
//! Unobserved pixels are zero across all channels.

use crate::{coloring, common::*, error::ConfigError};
use ndarray::Array4;
use rand::seq::index;

/// Number of observed pixels per map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PixelCount {
    Fixed(usize),
    /// Uniform in `[low, high)`, drawn once per batch.
    Range([usize; 2]),
}

impl PixelCount {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<usize, ConfigError> {
        match *self {
            Self::Fixed(count) => Ok(count),
            Self::Range([low, high]) => {
                if low >= high {
                    return Err(ConfigError::InvalidPixelCount(format!(
                        "empty range [{}, {})",
                        low, high
                    )));
                }
                Ok(rng.gen_range(low..high))
            }
        }
    }
}

/// Observation masks `[B, 1, R, R]` with exactly `count` ones per sample.
fn sample_masks<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    data_size: usize,
    count: usize,
) -> Result<(Vec<f32>, Vec<Vec<usize>>), ConfigError> {
    let positions = data_size * data_size;
    if count > positions {
        return Err(ConfigError::InvalidPixelCount(format!(
            "cannot observe {} pixels on a {}x{} grid",
            count, data_size, data_size
        )));
    }

    let mut masks = vec![0f32; batch_size * positions];
    let picked: Vec<Vec<usize>> = (0..batch_size)
        .map(|batch_index| {
            let picked = index::sample(rng, positions, count).into_vec();
            picked
                .iter()
                .for_each(|&pos| masks[batch_index * positions + pos] = 1.0);
            picked
        })
        .collect();
    Ok((masks, picked))
}

/// Random observations with uniformly drawn classes.
pub fn generate_pixel_maps<R: Rng + ?Sized>(
    rng: &mut R,
    batch_size: usize,
    n_classes: usize,
    n_pixels: &PixelCount,
    data_size: usize,
    device: Device,
) -> Result<Tensor> {
    ensure!(n_classes > 0, "n_classes must be positive");
    let count = n_pixels.sample(rng)?;
    let positions = data_size * data_size;
    let (_, picked) = sample_masks(rng, batch_size, data_size, count)?;

    let mut maps = vec![0f32; batch_size * n_classes * positions];
    for (batch_index, picked) in picked.iter().enumerate() {
        let base = batch_index * n_classes * positions;
        for &pos in picked {
            let class = rng.gen_range(0..n_classes);
            maps[base + class * positions + pos] = 1.0;
            maps[base + pos] = 1.0;
        }
    }

    let maps = Tensor::of_slice(&maps)
        .view([
            batch_size as i64,
            n_classes as i64,
            data_size as i64,
            data_size as i64,
        ])
        .to_device(device);
    Ok(maps)
}

/// Observations sampled from one-hot encoded real maps `[B, n_classes, R, R]`.
pub fn pixel_maps_from_data<R: Rng + ?Sized>(
    rng: &mut R,
    data: &Tensor,
    n_pixels: &PixelCount,
) -> Result<Tensor> {
    let (batch_size, _, height, width) = data.size4()?;
    ensure!(height == width, "expect square maps, but get {}x{}", height, width);

    let count = n_pixels.sample(rng)?;
    let (masks, _) = sample_masks(rng, batch_size as usize, height as usize, count)?;

    tch::no_grad(|| {
        let mask = Tensor::of_slice(&masks)
            .view([batch_size, 1, height, width])
            .to_device(data.device());
        let maps = data.detach() * &mask;
        let mut mask_channel = maps.narrow(1, 0, 1);
        mask_channel.copy_(&mask);
        Ok(maps)
    })
}

/// Class index of each pixel `[B, R, R]`: the set channel among `1..`, or 0
/// when only the mask channel is set. Unobserved pixels also map to 0.
pub fn observed_classes(pixel_maps: &Tensor) -> Result<Tensor> {
    let (batch_size, channels, height, width) = pixel_maps.size4()?;
    if channels == 1 {
        return Ok(Tensor::zeros(
            &[batch_size, height, width],
            (Kind::Int64, pixel_maps.device()),
        ));
    }

    let rest = pixel_maps.narrow(1, 1, channels - 1);
    let any_set = rest
        .sum_dim_intlist(&[1], false, Kind::Float)
        .gt(0.0)
        .to_kind(Kind::Int64);
    Ok((rest.argmax(1, false) + 1) * any_set)
}

/// Colorize `[B, n_classes, R, R]` pixel maps to `[B, R, R, 3]`, unobserved
/// pixels black.
pub fn colorize_pixel_maps(pixel_maps: &Tensor) -> Result<Array4<u8>> {
    let pixel_maps = pixel_maps.detach().to_device(Device::Cpu);
    let (_, n_classes, _, _) = pixel_maps.size4()?;

    let classes = observed_classes(&pixel_maps)?;
    let mut images = coloring::color_data(&classes, n_classes as usize)?;

    let mask = pixel_maps.select(1, 0).gt(0.0).flatten(0, -1);
    let mask = Vec::<bool>::from(&mask);
    for (mut pixel, &observed) in images.rows_mut().into_iter().zip(&mask) {
        if !observed {
            pixel.fill(0);
        }
    }

    Ok(images)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_count_test() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(PixelCount::Fixed(7).sample(&mut rng)?, 7);
        for _ in 0..20 {
            let count = PixelCount::Range([5, 8]).sample(&mut rng)?;
            assert!((5..8).contains(&count));
        }
        assert!(PixelCount::Range([3, 3]).sample(&mut rng).is_err());
        Ok(())
    }

    #[test]
    fn generate_pixel_maps_test() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(1);
        let (batch_size, n_classes, data_size, count) = (4, 5, 16, 10);
        let maps = generate_pixel_maps(
            &mut rng,
            batch_size,
            n_classes,
            &PixelCount::Fixed(count),
            data_size,
            Device::Cpu,
        )?;
        assert_eq!(maps.size(), vec![4, 5, 16, 16]);

        for batch_index in 0..batch_size as i64 {
            let sample = maps.get(batch_index);
            let mask = sample.get(0);
            assert_eq!(f64::from(mask.sum(Kind::Float)) as usize, count);

            // every nonzero coordinate is observed
            let nonzero = sample.abs().sum_dim_intlist(&[0], false, Kind::Float).gt(0.0);
            let observed = mask.gt(0.0);
            assert!(bool::from(nonzero.eq_tensor(&observed).all()));

            // one class per observed pixel besides the mask channel
            let set = sample.sum_dim_intlist(&[0], false, Kind::Float);
            let max = f64::from(set.max());
            assert!(max <= 2.0);
        }
        Ok(())
    }

    #[test]
    fn too_many_pixels_test() {
        let mut rng = StdRng::seed_from_u64(2);
        let err = generate_pixel_maps(&mut rng, 1, 3, &PixelCount::Fixed(17), 4, Device::Cpu)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::InvalidPixelCount(_))
        ));
    }

    #[test]
    fn pixel_maps_from_data_test() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        // every pixel is class 2
        let data = Tensor::zeros(&[2, 3, 8, 8], FLOAT_CPU);
        let _ = data.narrow(1, 2, 1).fill_(1.0);

        let maps = pixel_maps_from_data(&mut rng, &data, &PixelCount::Fixed(6))?;
        let mask = maps.select(1, 0);
        assert_eq!(f64::from(mask.sum(Kind::Float)), 12.0);
        assert_eq!(f64::from(maps.select(1, 2).sum(Kind::Float)), 12.0);
        assert_eq!(f64::from(maps.select(1, 1).sum(Kind::Float)), 0.0);

        let classes = observed_classes(&maps)?;
        let observed_sum = f64::from((classes * mask.to_kind(Kind::Int64)).sum(Kind::Float));
        assert_eq!(observed_sum, 24.0);
        Ok(())
    }

    #[test]
    fn colorize_pixel_maps_test() -> Result<()> {
        // 3 classes on a 1x3 grid: class 2, class 0, unobserved
        let maps = Tensor::of_slice(&[1.0f32, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0])
            .view([1, 3, 1, 3]);
        let images = colorize_pixel_maps(&maps)?;
        let colors = coloring::class_colors(3);

        assert_eq!(images.dim(), (1, 1, 3, 3));
        let pixel = |col: usize| {
            [
                images[[0, 0, col, 0]],
                images[[0, 0, col, 1]],
                images[[0, 0, col, 2]],
            ]
        };
        assert_eq!(pixel(0), colors[2]);
        assert_eq!(pixel(1), colors[0]);
        assert_eq!(pixel(2), [0, 0, 0]);
        Ok(())
    }
}
