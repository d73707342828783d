use crate::error::TerrainError;
use crate::noise_field::MAX_OCTAVES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    pub chunks: ChunkSettings,
    pub noise: FractalConfig,
    pub cells: CellSettings,
    pub render: RenderSettings,
    pub debug: DebugSettings,
}

/// Chunk streaming and heightmap bank parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkSettings {
    pub chunk_size: f32,
    /// Deadband factor; the origin shifts once the viewer is further than
    /// `chunk_size * threshold_multiplier / 2` from it on an axis.
    pub threshold_multiplier: f32,
    pub heightmap_slots: usize,
    /// Samples per heightmap edge, one sample per world unit.
    pub heightmap_resolution: usize,
    pub settle_delay_secs: f32,
    pub collision_size: usize,
    pub max_height: f32,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            chunk_size: 256.0,
            threshold_multiplier: 1.125,
            heightmap_slots: 4,
            heightmap_resolution: 768,
            settle_delay_secs: 1.0,
            collision_size: 8,
            max_height: 32.0,
        }
    }
}

impl ChunkSettings {
    pub fn threshold_distance(&self) -> f32 {
        self.chunk_size * self.threshold_multiplier / 2.0
    }
}

/// Fractal noise parameters. Two fields with equal configs sample identically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FractalConfig {
    pub seed: u32,
    pub frequency: f64,
    pub octaves: usize,
    pub lacunarity: f64,
    pub gain: f64,
    pub offset: [f64; 2],
}

impl Default for FractalConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            frequency: 0.01,
            octaves: 5,
            lacunarity: 1.7,
            gain: 0.5,
            offset: [0.0, 0.0],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellSettings {
    /// Edge length of one deformation cell in world units.
    pub cell_size: f32,
    /// Texels per edge of each cell's accumulation texture.
    pub texture_size: u32,
    pub capture_near: f32,
    pub capture_far: f32,
    /// Height of the top-down capture cameras above the viewer.
    pub capture_lift: f32,
    pub snow_height: f32,
}

impl Default for CellSettings {
    fn default() -> Self {
        Self {
            cell_size: 64.0,
            texture_size: 512,
            capture_near: 0.05,
            capture_far: 48.0,
            capture_lift: 8.0,
            snow_height: 0.3,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub max_tessellation_level: u32,
    pub near_tessellation_level: f32,
    pub far_tessellation_level: f32,
    pub tessellation_distance: f32,
    pub clear_color: [f64; 4],
    pub terrain_subdivisions: u32,
    pub terrain_size: f32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            max_tessellation_level: 8,
            near_tessellation_level: 8.0,
            far_tessellation_level: 1.0,
            tessellation_distance: 96.0,
            clear_color: [0.2, 0.2, 0.2, 1.0],
            terrain_subdivisions: 63,
            terrain_size: 192.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugSettings {
    pub patch_map_grid: usize,
    pub patch_map_path: Option<PathBuf>,
}

impl Default for DebugSettings {
    fn default() -> Self {
        Self {
            patch_map_grid: 64,
            patch_map_path: None,
        }
    }
}

impl TerrainConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TerrainError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: TerrainConfig = serde_json::from_str(&text)?;
        config.validate()?;
        log::info!("loaded terrain config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TerrainError> {
        let chunks = &self.chunks;
        if !(chunks.chunk_size > 0.0) {
            return Err(TerrainError::invalid_config("chunk_size must be positive"));
        }
        if !(chunks.threshold_multiplier > 1.0) {
            return Err(TerrainError::invalid_config(
                "threshold_multiplier must exceed 1 to keep a deadband",
            ));
        }
        if chunks.heightmap_slots < 2 {
            return Err(TerrainError::invalid_config(
                "heightmap_slots must be at least 2 so regeneration never touches the bound slot",
            ));
        }
        if chunks.heightmap_resolution == 0 || chunks.heightmap_resolution % 2 != 0 {
            return Err(TerrainError::invalid_config(
                "heightmap_resolution must be even and non-zero",
            ));
        }
        if chunks.settle_delay_secs < 0.0 {
            return Err(TerrainError::invalid_config("settle_delay_secs must not be negative"));
        }
        if chunks.collision_size == 0 {
            return Err(TerrainError::invalid_config("collision_size must be non-zero"));
        }

        if !(1..=MAX_OCTAVES).contains(&self.noise.octaves) {
            return Err(TerrainError::invalid_config(format!(
                "octaves must be within 1..={}",
                MAX_OCTAVES
            )));
        }

        let cells = &self.cells;
        if !(cells.cell_size > 0.0) || cells.texture_size == 0 || cells.texture_size % 8 != 0 {
            return Err(TerrainError::invalid_config(
                "cell_size must be positive and texture_size a non-zero multiple of 8",
            ));
        }
        if !(cells.capture_near >= 0.0 && cells.capture_near < cells.capture_far) {
            return Err(TerrainError::invalid_config("capture_near must be below capture_far"));
        }
        if !(cells.snow_height > 0.0) {
            return Err(TerrainError::invalid_config("snow_height must be positive"));
        }

        let render = &self.render;
        if render.max_tessellation_level == 0 || render.max_tessellation_level > 64 {
            return Err(TerrainError::invalid_config(
                "max_tessellation_level must be within 1..=64",
            ));
        }
        if render.terrain_subdivisions == 0 || !(render.terrain_size > 0.0) {
            return Err(TerrainError::invalid_config("terrain surface must have a size"));
        }
        if self.debug.patch_map_grid == 0 {
            return Err(TerrainError::invalid_config("patch_map_grid must be non-zero"));
        }
        Ok(())
    }
}
