use crate::{
    chunk_grid::GRID_CENTER,
    error::{TerrainError, TerrainResult},
};
use anyhow::Result;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// The step size of the lod 1 patches, which are stitched to the finest lod.
pub const SEAM_STEP: u32 = 2;

/// The parameters of the fractal noise used to displace the terrain.
///
/// These can be changed at runtime, which re-runs the height kernel for the current grid.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseConfig {
    /// The maximum height of the terrain.
    pub terrain_height: f32,
    /// The number of summed noise layers.
    pub octaves: u32,
    /// The horizontal scale of the first octave.
    pub scale: f32,
    /// The amplitude falloff between two octaves.
    pub persistence: f32,
    /// The frequency growth between two octaves.
    pub lacunarity: f32,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            terrain_height: 30.0,
            octaves: 4,
            scale: 300.0,
            persistence: 0.244,
            lacunarity: 10.0,
        }
    }
}

/// The configuration of the terrain.
///
/// The chunk size and the lod count determine the shape of the generated meshes
/// and are fixed once the [`LodTerrainPlugin`](crate::LodTerrainPlugin) is built.
#[derive(Clone, Debug, PartialEq, Resource, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainConfig {
    /// The side length of a single chunk in world units.
    pub chunk_size: u32,
    /// The number of generated levels of detail.
    pub lod_count: u32,
    pub noise: NoiseConfig,
    /// The minimum distance kept between a clamped viewer and the terrain surface.
    pub ground_clearance: f32,
}

impl Default for TerrainConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256,
            lod_count: 3,
            noise: default(),
            ground_clearance: 2.0,
        }
    }
}

impl TerrainConfig {
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let encoded = fs::read_to_string(path)?;
        let config: Self = ron::from_str(&encoded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let encoded = ron::ser::to_string_pretty(self, default())?;
        fs::write(path, encoded)?;
        Ok(())
    }

    /// Checks that the configuration describes a terrain that can be generated.
    pub fn validate(&self) -> TerrainResult<()> {
        // the outermost ring of the grid uses the lod equal to the grid center index
        let required_lods = GRID_CENTER + 1;

        if self.chunk_size == 0 {
            return Err(TerrainError::InvalidConfig(
                "the chunk size has to be positive".into(),
            ));
        }
        // the midpoints of a stitched lod 1 edge only meet the lod 0 vertices if its last
        // cell spans a full step
        if self.chunk_size % SEAM_STEP != 0 {
            return Err(TerrainError::InvalidConfig(format!(
                "the chunk size has to be a multiple of {SEAM_STEP}, but is {}",
                self.chunk_size
            )));
        }
        if self.lod_count < required_lods {
            return Err(TerrainError::InvalidConfig(format!(
                "the grid needs at least {required_lods} lods, but only {} are configured",
                self.lod_count
            )));
        }
        if self.lod_count > self.chunk_size {
            return Err(TerrainError::InvalidConfig(format!(
                "a step size of {} does not fit into a chunk of size {}",
                self.lod_count, self.chunk_size
            )));
        }

        let noise = &self.noise;

        if noise.octaves == 0 {
            return Err(TerrainError::InvalidConfig(
                "the noise needs at least one octave".into(),
            ));
        }
        if noise.scale <= 0.0 || noise.lacunarity <= 0.0 {
            return Err(TerrainError::InvalidConfig(
                "the noise scale and lacunarity have to be positive".into(),
            ));
        }

        Ok(())
    }
}
