// panorama.rs - Single view to 360 degree equirectangular panorama
//
// The input covers `horizontal_fov` around azimuth 0. The remaining
// longitudes repeat the view mirrored, so every tile edge continues
// its neighbour; the wrap-around at +-pi is cross-faded. Rows outside the
// view fade from the nearest edge row to the mean colour of that band.

use image::{DynamicImage, RgbImage, imageops::FilterType};
use ndarray::{Array3, ArrayView3};

use crate::color::{self, Color};
use crate::config::GeneratorSettings;
use crate::error::{GenexError, Result};

/// Where the source view landed inside the panorama
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewPlacement {
    pub tile_width: usize,
    pub tile_height: usize,
    pub col_start: isize,
    pub row_start: usize,
}

pub fn generate_panorama(
    input: ArrayView3<u8>,
    settings: &GeneratorSettings,
) -> Result<(Array3<u8>, ViewPlacement)> {
    let h = settings.panorama_height.max(4);
    let w = h * 2;

    let fov = settings.horizontal_fov_deg.clamp(10.0, 360.0);
    let tile_width = ((fov / 360.0) * w as f32).round().max(1.0) as usize;

    let (in_h, in_w, _) = input.dim();
    let tile_height = ((tile_width as f32 * in_h as f32 / in_w as f32).round() as usize).clamp(1, h);

    let tile = resize(input, tile_width as u32, tile_height as u32)?;

    let placement = ViewPlacement {
        tile_width,
        tile_height,
        col_start: (w / 2) as isize - (tile_width / 2) as isize,
        row_start: (h - tile_height) / 2,
    };

    // Band colours for the regions above and below the view
    let band = (tile_height / 10).max(1);
    let top_mean = band_mean(&tile, 0..band);
    let bottom_mean = band_mean(&tile, tile_height - band..tile_height);

    let blend = ((settings.seam_blend.clamp(0.0, 1.0) * tile_width as f32).round() as usize).clamp(1, w);

    let mut pano = Array3::<u8>::zeros((h, w, 3));
    for y in 0..h {
        for x in 0..w {
            let mut c = sample_tiled(&tile, &placement, y, x as isize);

            // Cross-fade the back seam so column w-1 flows into column 0
            if x >= w - blend {
                let t = (x + 1 - (w - blend)) as f32 / blend as f32;
                let wrapped = sample_tiled(&tile, &placement, y, x as isize - w as isize);
                c = c.lerp(wrapped, smoothstep(t));
            }

            let c = vertical_fade(c, y, h, &placement, top_mean, bottom_mean);
            let rgb = c.to_rgb();
            for k in 0..3 {
                pano[[y, x, k]] = rgb[k];
            }
        }
    }

    tracing::debug!(
        width = w,
        height = h,
        tile_width,
        tile_height,
        "panorama synthesized"
    );

    Ok((pano, placement))
}

fn resize(input: ArrayView3<u8>, tw: u32, th: u32) -> Result<RgbImage> {
    let (h, w, _) = input.dim();
    let raw: Vec<u8> = input.iter().copied().collect();
    let img = RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| GenexError::InvalidImage("pixel buffer does not match its shape".into()))?;
    Ok(DynamicImage::ImageRgb8(img)
        .resize_exact(tw, th, FilterType::Lanczos3)
        .to_rgb8())
}

fn band_mean(tile: &RgbImage, rows: std::ops::Range<usize>) -> Color {
    let pixels: Vec<Color> = tile
        .enumerate_pixels()
        .filter(|(_, y, _)| rows.contains(&(*y as usize)))
        .map(|(_, _, p)| Color::from_rgb(p[0], p[1], p[2]))
        .collect();
    color::mean(&pixels)
}

/// Mirror-tiled lookup; `x` may lie outside [0, width)
fn sample_tiled(tile: &RgbImage, placement: &ViewPlacement, y: usize, x: isize) -> Color {
    let tw = placement.tile_width as isize;
    let u = x - placement.col_start;
    let k = u.div_euclid(tw);
    let local = u.rem_euclid(tw);
    let tx = if k.rem_euclid(2) == 0 { local } else { tw - 1 - local };

    let ty = y
        .saturating_sub(placement.row_start)
        .min(placement.tile_height - 1);

    let p = tile.get_pixel(tx as u32, ty as u32);
    Color::from_rgb(p[0], p[1], p[2])
}

fn vertical_fade(c: Color, y: usize, h: usize, placement: &ViewPlacement, top: Color, bottom: Color) -> Color {
    let start = placement.row_start;
    let end = placement.row_start + placement.tile_height;

    if y < start {
        let t = (start - y) as f32 / start as f32;
        c.lerp(top, smoothstep(t))
    } else if y >= end {
        let t = (y + 1 - end) as f32 / (h - end) as f32;
        c.lerp(bottom, smoothstep(t))
    } else {
        c
    }
}

fn smoothstep(t: f32) -> f32 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn gradient(h: usize, w: usize) -> Array3<u8> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| match c {
            0 => (x * 255 / w) as u8,
            1 => (y * 255 / h) as u8,
            _ => 128,
        })
    }

    #[test]
    fn panorama_is_twice_as_wide_as_tall() {
        let settings = GeneratorSettings { panorama_height: 32, ..Default::default() };
        let (pano, placement) = generate_panorama(gradient(40, 60).view(), &settings).unwrap();
        assert_eq!(pano.dim(), (32, 64, 3));
        assert_eq!(placement.tile_width, 16);
        assert!(placement.tile_height <= 32);
    }

    #[test]
    fn back_seam_is_continuous() {
        let settings = GeneratorSettings { panorama_height: 32, ..Default::default() };
        let (pano, _) = generate_panorama(gradient(40, 60).view(), &settings).unwrap();
        let (h, w, _) = pano.dim();
        for y in 0..h {
            for c in 0..3 {
                let a = pano[[y, w - 1, c]] as i32;
                let b = pano[[y, 0, c]] as i32;
                assert!((a - b).abs() <= 40, "row {y} channel {c}: {a} vs {b}");
            }
        }
    }

    #[test]
    fn centre_of_panorama_matches_centre_of_input() {
        let input = Array3::from_shape_fn((20, 20, 3), |(_, _, c)| [200u8, 30, 60][c]);
        let settings = GeneratorSettings { panorama_height: 32, ..Default::default() };
        let (pano, _) = generate_panorama(input.view(), &settings).unwrap();
        assert_eq!(pano[[16, 32, 0]], 200);
        assert_eq!(pano[[16, 32, 1]], 30);
        assert_eq!(pano[[16, 32, 2]], 60);
    }
}
