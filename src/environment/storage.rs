// storage.rs - Environment directory format
//
//   manifest.json    id, pose, array shapes
//   panorama.png     lossless RGB
//   depth.bin        "GXD1", u32 height, u32 width, f32 values (all little endian)
//   physics.json
//   navigation.json

use image::RgbImage;
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use super::navigation::NavigationMap;
use super::physics::PhysicsData;
use super::{Environment, Pose};
use crate::error::{GenexError, Result};

const DEPTH_MAGIC: &[u8; 4] = b"GXD1";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format_version: u32,
    id: String,
    pose: Pose,
    width: usize,
    height: usize,
}

pub fn save(env: &Environment, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    let (h, w, _) = env.panorama.dim();

    let manifest = Manifest {
        format_version: FORMAT_VERSION,
        id: env.id.clone(),
        pose: env.pose,
        width: w,
        height: h,
    };
    fs::write(dir.join("manifest.json"), serde_json::to_vec_pretty(&manifest)?)?;

    let raw: Vec<u8> = env.panorama.iter().copied().collect();
    let img = RgbImage::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| GenexError::Format("panorama buffer does not match its shape".into()))?;
    img.save(dir.join("panorama.png"))?;

    fs::write(dir.join("depth.bin"), encode_depth(&env.depth_map))?;
    fs::write(dir.join("physics.json"), serde_json::to_vec(&env.physics_data)?)?;
    fs::write(dir.join("navigation.json"), serde_json::to_vec(&env.navigation_map)?)?;

    tracing::info!(id = %env.id, path = %dir.display(), "environment saved");
    Ok(())
}

pub fn load(dir: &Path) -> Result<Environment> {
    if !dir.join("manifest.json").is_file() {
        return Err(GenexError::EnvironmentNotFound(dir.display().to_string()));
    }

    let manifest: Manifest = serde_json::from_slice(&fs::read(dir.join("manifest.json"))?)?;
    if manifest.format_version != FORMAT_VERSION {
        return Err(GenexError::Format(format!(
            "unsupported environment format version {}",
            manifest.format_version
        )));
    }

    if manifest.height == 0 || manifest.width != 2 * manifest.height {
        return Err(GenexError::Format(format!(
            "panorama must be twice as wide as tall, manifest says {}x{}",
            manifest.width, manifest.height
        )));
    }

    let img = image::open(dir.join("panorama.png"))?.to_rgb8();
    let (w, h) = img.dimensions();
    if (w as usize, h as usize) != (manifest.width, manifest.height) {
        return Err(GenexError::Format("panorama size differs from manifest".into()));
    }
    let panorama = Array3::from_shape_vec((h as usize, w as usize, 3), img.into_raw())
        .map_err(|e| GenexError::Format(e.to_string()))?;

    let depth_map = decode_depth(&fs::read(dir.join("depth.bin"))?)?;
    if depth_map.dim() != (manifest.height, manifest.width) {
        return Err(GenexError::Format("depth map size differs from manifest".into()));
    }

    let physics_data: PhysicsData = serde_json::from_slice(&fs::read(dir.join("physics.json"))?)?;
    let navigation_map: NavigationMap = serde_json::from_slice(&fs::read(dir.join("navigation.json"))?)?;
    check_grids(&physics_data, &navigation_map)?;

    tracing::debug!(id = %manifest.id, "environment loaded");
    Ok(Environment {
        id: manifest.id,
        pose: manifest.pose,
        panorama,
        depth_map,
        physics_data,
        navigation_map,
    })
}

/// Grids index by `frame`, so their buffers must agree with it
fn check_grids(physics: &PhysicsData, nav: &NavigationMap) -> Result<()> {
    let frame = nav.frame;
    if physics.collision_map.frame != frame {
        return Err(GenexError::Format("collision and navigation grids use different frames".into()));
    }
    if !(frame.cell_size.is_finite() && frame.cell_size > 0.0) || frame.width == 0 || frame.height == 0 {
        return Err(GenexError::Format(format!("invalid grid frame {frame:?}")));
    }
    let cells = frame
        .width
        .checked_mul(frame.height)
        .ok_or_else(|| GenexError::Format("grid frame is too large".into()))?;
    if physics.collision_map.cells.len() != cells {
        return Err(GenexError::Format(format!(
            "collision map holds {} cells, frame has {cells}",
            physics.collision_map.cells.len()
        )));
    }
    if nav.walkable.len() != cells {
        return Err(GenexError::Format(format!("walkable mask holds {} cells, frame has {cells}", nav.walkable.len())));
    }
    let inside = |c: [usize; 2]| c[0] < frame.width && c[1] < frame.height;
    if !inside(nav.spawn) || nav.regions.iter().any(|r| !inside(r.seed)) {
        return Err(GenexError::Format("navigation cell lies outside its grid".into()));
    }
    Ok(())
}

pub fn encode_depth(depth: &Array2<f32>) -> Vec<u8> {
    let (h, w) = depth.dim();
    let mut out = Vec::with_capacity(12 + h * w * 4);
    out.extend_from_slice(DEPTH_MAGIC);
    out.extend_from_slice(&(h as u32).to_le_bytes());
    out.extend_from_slice(&(w as u32).to_le_bytes());
    for v in depth.iter() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_depth(bytes: &[u8]) -> Result<Array2<f32>> {
    if bytes.len() < 12 || &bytes[..4] != DEPTH_MAGIC {
        return Err(GenexError::Format("depth file header is missing".into()));
    }
    let h = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let w = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;

    let body = &bytes[12..];
    let expected = h
        .checked_mul(w)
        .and_then(|n| n.checked_mul(4))
        .ok_or_else(|| GenexError::Format(format!("depth map of {h}x{w} is too large")))?;
    if body.len() != expected {
        return Err(GenexError::Format(format!("depth file holds {} bytes, expected {expected}", body.len())));
    }

    let values: Vec<f32> = body
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Array2::from_shape_vec((h, w), values).map_err(|e| GenexError::Format(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_codec_is_exact() {
        let depth = Array2::from_shape_fn((3, 5), |(y, x)| 0.1 + y as f32 * 1.37 + x as f32 / 3.0);
        let back = decode_depth(&encode_depth(&depth)).unwrap();
        assert_eq!(depth, back);
    }

    #[test]
    fn truncated_depth_is_rejected() {
        let depth = Array2::from_elem((2, 2), 1.0f32);
        let mut bytes = encode_depth(&depth);
        bytes.pop();
        assert!(matches!(decode_depth(&bytes), Err(GenexError::Format(_))));
        assert!(matches!(decode_depth(b"nope"), Err(GenexError::Format(_))));
    }

    fn saved_environment() -> (tempfile::TempDir, std::path::PathBuf) {
        let mut settings = crate::config::Settings::default();
        settings.generator.panorama_height = 32;
        settings.model_paths.depth_estimator = None;
        let img = Array3::from_shape_fn((24, 32, 3), |(y, x, c)| ((x * 7 + y * 3 + c * 50) % 256) as u8);
        let env = super::super::EnvironmentGenerator::new(&settings).generate_environment(img.view()).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(&env.id);
        save(&env, &dir).unwrap();
        (tmp, dir)
    }

    fn rewrite_json(path: &Path, edit: impl FnOnce(&mut serde_json::Value)) {
        let mut value: serde_json::Value = serde_json::from_slice(&fs::read(path).unwrap()).unwrap();
        edit(&mut value);
        fs::write(path, serde_json::to_vec(&value).unwrap()).unwrap();
    }

    #[test]
    fn short_walkable_mask_is_a_format_error() {
        let (_tmp, dir) = saved_environment();
        assert!(load(&dir).is_ok());
        rewrite_json(&dir.join("navigation.json"), |v| v["walkable"] = serde_json::json!([true, true, true]));
        assert!(matches!(load(&dir), Err(GenexError::Format(_))));
    }

    #[test]
    fn mismatched_grids_are_format_errors() {
        let (_tmp, dir) = saved_environment();
        rewrite_json(&dir.join("physics.json"), |v| {
            let cells = v["collision_map"]["cells"].as_array_mut().unwrap();
            cells.pop();
        });
        assert!(matches!(load(&dir), Err(GenexError::Format(_))));

        let (_tmp, dir) = saved_environment();
        rewrite_json(&dir.join("navigation.json"), |v| v["frame"]["cell_size"] = serde_json::json!(0.5));
        assert!(matches!(load(&dir), Err(GenexError::Format(_))));

        let (_tmp, dir) = saved_environment();
        rewrite_json(&dir.join("navigation.json"), |v| v["spawn"] = serde_json::json!([100000, 0]));
        assert!(matches!(load(&dir), Err(GenexError::Format(_))));
    }

    #[test]
    fn manifest_with_wrong_aspect_is_rejected() {
        let (_tmp, dir) = saved_environment();
        rewrite_json(&dir.join("manifest.json"), |v| v["width"] = serde_json::json!(40));
        assert!(matches!(load(&dir), Err(GenexError::Format(_))));
    }

    #[test]
    fn missing_directory_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, GenexError::EnvironmentNotFound(_)));
    }
}
