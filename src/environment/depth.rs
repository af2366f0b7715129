// depth.rs - Metric depth for an equirectangular panorama
//
// The room prior gives every pixel a depth: floor and ceiling planes plus
// a wall whose distance per azimuth follows the column's brightness and
// texture (dark, busy columns read as close). With a MiDaS-style ONNX model
// on disk, the window of the panorama that holds the input photo is run
// through it and its relative inverse depth, mapped into
// [min_depth, max_depth], replaces the prior inside that window.

use ndarray::{Array2, Array3, Array4};
use ort::session::Session;
use ort::value::Value;
use std::path::{Path, PathBuf};

use super::geometry::Equirect;
use super::panorama::ViewPlacement;
use crate::color::Color;
use crate::config::GeneratorSettings;

// ImageNet normalization constants
const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const STD: [f32; 3] = [0.229, 0.224, 0.225];

const MIDAS_SIZE: usize = 256;

#[derive(Clone, Debug, Default)]
pub struct DepthEstimator {
    model_path: Option<PathBuf>,
}

impl DepthEstimator {
    pub fn new(model_path: Option<PathBuf>) -> Self {
        Self { model_path }
    }

    pub fn estimate(
        &self,
        pano: &Array3<u8>,
        placement: &ViewPlacement,
        settings: &GeneratorSettings,
    ) -> Array2<f32> {
        let prior = room_prior(pano, placement, settings);
        let Some(path) = self.model_path.as_deref() else { return prior };
        match run_midas(path, model_input(pano, placement)) {
            Some(relative) => paste_view(prior, &relative_to_metric(&relative, settings), placement),
            None => prior,
        }
    }
}

/// The photo window of the panorama resampled to the model's square input,
/// ImageNet-normalised, NCHW. Columns wrap around the seam.
fn model_input(pano: &Array3<u8>, placement: &ViewPlacement) -> Array4<f32> {
    let (h, w, _) = pano.dim();
    let sy = placement.tile_height as f32 / MIDAS_SIZE as f32;
    let sx = placement.tile_width as f32 / MIDAS_SIZE as f32;

    Array4::from_shape_fn((1, 3, MIDAS_SIZE, MIDAS_SIZE), |(_, c, y, x)| {
        let py = placement.row_start as f32 + (y as f32 + 0.5) * sy - 0.5;
        let px = placement.col_start as f32 + (x as f32 + 0.5) * sx - 0.5;
        let v = bilinear(h, w, py, px, true, |r, q| pano[[r, q, c]] as f32);
        (v / 255.0 - MEAN[c]) / STD[c]
    })
}

/// Relative inverse depth in [0, 1] (1 = near) at the model's output size
fn run_midas(model_path: &Path, input: Array4<f32>) -> Option<Array2<f32>> {
    if !model_path.exists() {
        tracing::warn!(path = %model_path.display(), "depth model not found, using room prior");
        return None;
    }

    let Ok(builder) = Session::builder() else { return None };
    let Ok(mut session) = builder.commit_from_file(model_path) else {
        tracing::warn!(path = %model_path.display(), "depth model failed to load, using room prior");
        return None;
    };

    tracing::info!("running depth model");
    let Ok(input_val) = Value::from_array(input) else { return None };
    let input_name = session.inputs.first().map(|i| i.name.clone()).unwrap_or_else(|| "image".into());
    let Ok(outputs) = session.run(ort::inputs![input_name => input_val]) else {
        tracing::warn!("depth inference failed, using room prior");
        return None;
    };
    let Ok(arr) = outputs[0].try_extract_array::<f32>() else { return None };

    // Leading batch / channel axes are 1
    let &[.., oh, ow] = arr.shape() else { return None };
    let raw = Array2::from_shape_vec((oh, ow), arr.iter().copied().collect()).ok()?;
    let (lo, hi) = raw.fold((f32::MAX, f32::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = (hi - lo).max(1e-6);
    Some(raw.mapv(|v| (v - lo) / range))
}

/// Write `view` (the photo window's depth) over `depth`, resampled to the
/// window's size in panorama pixels
fn paste_view(mut depth: Array2<f32>, view: &Array2<f32>, placement: &ViewPlacement) -> Array2<f32> {
    let (h, w) = depth.dim();
    let (vh, vw) = view.dim();
    if vh == 0 || vw == 0 || placement.tile_height == 0 || placement.tile_width == 0 {
        return depth;
    }
    let sy = vh as f32 / placement.tile_height as f32;
    let sx = vw as f32 / placement.tile_width as f32;

    for ty in 0..placement.tile_height {
        let y = placement.row_start + ty;
        if y >= h {
            break;
        }
        let vy = (ty as f32 + 0.5) * sy - 0.5;
        for tx in 0..placement.tile_width {
            let x = (placement.col_start + tx as isize).rem_euclid(w as isize) as usize;
            let vx = (tx as f32 + 0.5) * sx - 0.5;
            depth[[y, x]] = bilinear(vh, vw, vy, vx, false, |r, q| view[[r, q]]);
        }
    }
    depth
}

/// Bilinear sample of an `h` x `w` grid at fractional (y, x). Rows clamp;
/// columns wrap when `wrap`, otherwise clamp.
fn bilinear(h: usize, w: usize, y: f32, x: f32, wrap: bool, at: impl Fn(usize, usize) -> f32) -> f32 {
    let y = y.clamp(0.0, (h - 1) as f32);
    let y0 = y.floor() as usize;
    let y1 = (y0 + 1).min(h - 1);
    let ty = y - y0 as f32;

    let (x0, x1, tx) = if wrap {
        let x = x.rem_euclid(w as f32);
        let x0 = x.floor() as usize % w;
        (x0, (x0 + 1) % w, x - x.floor())
    } else {
        let x = x.clamp(0.0, (w - 1) as f32);
        let x0 = x.floor() as usize;
        (x0, (x0 + 1).min(w - 1), x - x0 as f32)
    };

    let top = at(y0, x0) * (1.0 - tx) + at(y0, x1) * tx;
    let bottom = at(y1, x0) * (1.0 - tx) + at(y1, x1) * tx;
    top * (1.0 - ty) + bottom * ty
}

fn relative_to_metric(relative: &Array2<f32>, settings: &GeneratorSettings) -> Array2<f32> {
    let near = 1.0 / settings.min_depth;
    let far = 1.0 / settings.max_depth;
    relative.mapv(|r| {
        let inv = r.clamp(0.0, 1.0) * (near - far) + far;
        (1.0 / inv).clamp(settings.min_depth, settings.max_depth)
    })
}

/// Floor, ceiling and a per-azimuth wall
pub fn room_prior(pano: &Array3<u8>, placement: &ViewPlacement, settings: &GeneratorSettings) -> Array2<f32> {
    let (h, w, _) = pano.dim();
    let eq = Equirect::new(h, w);
    let walls = wall_distances(pano, placement, settings);

    let below = settings.camera_height.max(0.1);
    let above = (settings.ceiling_height - settings.camera_height).max(0.1);

    Array2::from_shape_fn((h, w), |(y, x)| {
        let theta = eq.elevation(y as f32);
        let r = walls[x];
        let cos_t = theta.cos().max(1e-4);

        let plane = if theta < 0.0 {
            Some(below / (-theta).sin())
        } else if theta > 0.0 {
            Some(above / theta.sin())
        } else {
            None
        };

        let d = match plane {
            Some(t) if t * cos_t < r => t,
            _ => r / cos_t,
        };
        d.clamp(settings.min_depth, settings.max_depth)
    })
}

/// Horizontal wall distance for every column, circularly smoothed
fn wall_distances(pano: &Array3<u8>, placement: &ViewPlacement, settings: &GeneratorSettings) -> Vec<f32> {
    let (h, w, _) = pano.dim();
    let rows = placement.row_start..(placement.row_start + placement.tile_height).min(h);
    let n = rows.len().max(1) as f32;

    let raw: Vec<f32> = (0..w)
        .map(|x| {
            let lum: Vec<f32> = rows
                .clone()
                .map(|y| Color::from_rgb(pano[[y, x, 0]], pano[[y, x, 1]], pano[[y, x, 2]]).luminance())
                .collect();
            let mean = lum.iter().sum::<f32>() / n;
            let var = lum.iter().map(|l| (l - mean) * (l - mean)).sum::<f32>() / n;
            let texture = (var.sqrt() * 4.0).min(1.0);

            let closeness = 0.6 * (1.0 - mean) + 0.4 * texture;
            settings.min_wall_distance
                + (settings.max_wall_distance - settings.min_wall_distance) * (1.0 - closeness)
        })
        .collect();

    let radius = (w / 64).max(1) as isize;
    let span = (2 * radius + 1) as f32;
    (0..w as isize)
        .map(|x| {
            (-radius..=radius)
                .map(|o| raw[(x + o).rem_euclid(w as isize) as usize])
                .sum::<f32>()
                / span
        })
        .collect()
}
