//! This crate renders an endless procedural height-field terrain around a single viewer.
//!
//! # Background
//! The terrain is made of a 5x5 grid of square chunks that follows the viewer.
//! Chunks further away from the center are drawn with a coarser level of detail.
//! Every chunk draws one of a small set of precomputed mesh variants, which all live
//! in a single shared vertex and index buffer.
//!
//! ## Mesh variants
//! For each lod a base patch is generated and stitched along one of its edges,
//! so that it matches the coarser neighbour on the outside of the ring.
//! See the [`patch`] and [`mesh_buffer`] modules for more information.
//!
//! ## Heights
//! The vertices of the patches are flat. Whenever the grid recenters, a compute kernel
//! samples the height noise for every chunk and displaces a copy of its variant in a
//! per chunk vertex arena. The same kernel scatters instances of registered models on
//! the terrain, whose counts are read back asynchronously.
//! See the [`kernel`], [`feedback`] and [`render`] modules for more information.

pub mod chunk_grid;
pub mod config;
pub mod debug;
pub mod error;
pub mod feedback;
pub mod kernel;
pub mod mesh_buffer;
pub mod noise;
pub mod patch;
pub mod plugin;
pub mod render;
pub mod shaders;
pub mod util;

pub use crate::plugin::LodTerrainPlugin;

#[allow(missing_docs)]
pub mod prelude {
    #[doc(hidden)]
    pub use crate::{
        chunk_grid::{ChunkGrid, GroundConstraint, TerrainChunk, TerrainViewer},
        config::{NoiseConfig, TerrainConfig},
        debug::{DebugTerrain, TerrainDebugPlugin},
        error::{TerrainError, TerrainResult},
        feedback::ModelId,
        render::instancing::{InstancedModel, InstancedModels},
        LodTerrainPlugin,
    };
}
