//! Class-index to RGB conversion and image grids.

use crate::common::*;
use ndarray::{s, Array3, Array4, ArrayView3};
use palette::{FromColor, Hsv, Srgb};

/// One color per class with evenly spaced hues.
pub fn class_colors(n_classes: usize) -> Vec<[u8; 3]> {
    (0..n_classes)
        .map(|class| {
            let hue = 360.0 * class as f32 / n_classes as f32;
            let hsv: Hsv = Hsv::new(hue, 0.85, 0.95);
            let rgb: Srgb<u8> = Srgb::<f32>::from_color(hsv).into_format();
            [rgb.red, rgb.green, rgb.blue]
        })
        .collect()
}

/// Colorize class indices `[B, R, R]` (any integer kind) into `[B, R, R, 3]`.
pub fn color_data(classes: &Tensor, n_classes: usize) -> Result<Array4<u8>> {
    let (batch_size, height, width) = classes.size3()?;
    let indices: Vec<i64> = Vec::<i64>::from(&classes.to_kind(Kind::Int64).flatten(0, -1));
    let colors = class_colors(n_classes);

    let pixels: Vec<u8> = indices
        .iter()
        .map(|&index| -> Result<_> {
            let color = usize::try_from(index)
                .ok()
                .and_then(|index| colors.get(index))
                .ok_or_else(|| format_err!("class index {} out of range", index))?;
            Ok(*color)
        })
        .flatten_ok()
        .try_collect()?;

    let array = Array4::from_shape_vec(
        (batch_size as usize, height as usize, width as usize, 3),
        pixels,
    )?;
    Ok(array)
}

/// Tile `[B, H, W, 3]` images into a near-square `[rows * H, cols * W, 3]` grid.
pub fn image_grid(images: &Array4<u8>) -> Array3<u8> {
    let (batch_size, height, width, _) = images.dim();
    let cols = (batch_size as f64).sqrt().ceil().max(1.0) as usize;
    let rows = (batch_size + cols - 1) / cols;

    let mut grid = Array3::zeros((rows.max(1) * height, cols * width, 3));
    for (index, image) in images.outer_iter().enumerate() {
        let (row, col) = (index / cols, index % cols);
        grid.slice_mut(s![
            row * height..(row + 1) * height,
            col * width..(col + 1) * width,
            ..
        ])
        .assign(&image);
    }
    grid
}

/// Convert an `[H, W, 3]` image to a `[3, H, W]` u8 tensor.
fn to_chw_tensor(image: ArrayView3<u8>) -> Tensor {
    let (height, width, _) = image.dim();
    let data: Vec<u8> = image.iter().copied().collect();
    Tensor::of_slice(&data)
        .view([height as i64, width as i64, 3])
        .permute(&[2, 0, 1])
}

pub fn save_image_grid(images: &Array4<u8>, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let grid = image_grid(images);
    tch::vision::image::save(&to_chw_tensor(grid.view()), path)
        .with_context(|| format!("unable to write image '{}'", path.display()))?;
    Ok(())
}
