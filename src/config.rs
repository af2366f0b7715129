// config.rs - Runtime settings
//
// Precedence: defaults < TOML file (GENEX_CONFIG, default config/genex) < GENEX__* env vars.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub model_paths: ModelPaths,
    pub generator: GeneratorSettings,
    pub agent: AgentSettings,
    pub mapping: MappingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Directory served at `/`.
    pub ui_dir: PathBuf,
    /// Largest accepted request body, in megabytes.
    pub max_upload_mb: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            ui_dir: "ui".into(),
            max_upload_mb: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub environments_dir: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self { environments_dir: "environments".into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPaths {
    /// MiDaS-style ONNX depth model. Missing file means the geometric prior is used.
    pub depth_estimator: Option<PathBuf>,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self { depth_estimator: Some("models/depth_estimator.onnx".into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Panorama rows; width is always twice this.
    pub panorama_height: usize,
    pub horizontal_fov_deg: f32,
    /// Fraction of a tile width cross-faded at mirrored seams.
    pub seam_blend: f32,
    pub camera_height: f32,
    pub ceiling_height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
    pub min_wall_distance: f32,
    pub max_wall_distance: f32,
    pub material_clusters: usize,
    pub cell_size: f32,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            panorama_height: 128,
            horizontal_fov_deg: 90.0,
            seam_blend: 0.15,
            camera_height: 1.5,
            ceiling_height: 2.8,
            min_depth: 0.3,
            max_depth: 12.0,
            min_wall_distance: 2.0,
            max_wall_distance: 7.0,
            material_clusters: 6,
            cell_size: 0.25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    pub max_steps: usize,
    pub coverage_target: f32,
    pub step_length: f32,
    /// Candidate headings evaluated per step.
    pub headings: usize,
    /// Imagined steps per candidate heading.
    pub horizon: usize,
    pub rays: usize,
    pub sensor_range: f32,
    pub goal_tolerance: f32,
    pub explore_weight: f32,
    pub goal_weight: f32,
    pub turn_penalty: f32,
    pub seed: u32,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_steps: 200,
            coverage_target: 0.95,
            step_length: 0.5,
            headings: 16,
            horizon: 3,
            rays: 90,
            sensor_range: 4.0,
            goal_tolerance: 0.5,
            explore_weight: 1.0,
            goal_weight: 1.5,
            turn_penalty: 0.1,
            seed: 0xDEADBEEF,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingSettings {
    pub sample_stride: usize,
    pub voxel_size: f32,
    /// Horizontal radius around trajectory positions considered observed.
    pub observation_radius: f32,
    pub palette_size: usize,
}

impl Default for MappingSettings {
    fn default() -> Self {
        Self {
            sample_stride: 2,
            voxel_size: 0.2,
            observation_radius: 4.0,
            palette_size: 3,
        }
    }
}

impl Settings {
    /// Load settings from `GENEX_CONFIG` (or `config/genex`) and `GENEX__*` variables.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GENEX_CONFIG").unwrap_or_else(|_| "config/genex".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let builder = config::Config::builder();

        // config::File resolves the extension itself when given a stem.
        let builder = if path.exists() || path.with_extension("toml").exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("GENEX")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(built.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load_from(Path::new("does/not/exist")).unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.generator.panorama_height, 128);
        assert_eq!(settings.agent.headings, 16);
    }

    #[test]
    fn toml_file_overrides_selected_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("genex.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[generator]\npanorama_height = 64\n",
        )
        .unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.generator.panorama_height, 64);
        assert_eq!(settings.generator.cell_size, 0.25);
        assert_eq!(settings.mapping.voxel_size, 0.2);
    }
}
