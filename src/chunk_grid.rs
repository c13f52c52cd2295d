//! The viewer centered grid of terrain chunks.
//!
//! The terrain around the viewer is covered by a fixed 5x5 grid of chunks. The chunk containing
//! the viewer sits at the center of the grid and uses the finest lod, every ring around it uses
//! the next coarser one. Whenever the viewer crosses a chunk boundary, the grid is moved so that
//! the viewer's chunk becomes the center again.
//!
//! The lod and stitched edge of a grid cell only depend on its position inside the grid. Thus
//! every cell keeps its mesh variant and its region of the vertex arena forever, only its world
//! position changes.

use crate::{
    config::{NoiseConfig, TerrainConfig},
    debug::DebugTerrain,
    error::{TerrainError, TerrainResult},
    mesh_buffer::{MultiLodBuffers, TerrainVertex},
    patch::PatchEdge,
};
use bevy::prelude::*;
use itertools::{iproduct, Itertools};
use std::ops::Range;

pub const GRID_SIZE: u32 = 5;
pub const GRID_CENTER: u32 = GRID_SIZE / 2;
pub const CHUNK_COUNT: u32 = GRID_SIZE * GRID_SIZE;

/// The lod of a grid cell: its Chebyshev distance to the center cell.
pub fn chunk_lod(row: u32, column: u32) -> u32 {
    row.abs_diff(GRID_CENTER).max(column.abs_diff(GRID_CENTER))
}

/// The edge of a grid cell that has to be stitched to its finer neighbour.
///
/// A cell neighbouring a finer cell has to match its vertices along the shared edge. Only a single
/// edge is stitched per cell, chosen in the order top, right, bottom, left. In a 5x5 grid no cell
/// has more than one finer neighbour.
pub fn chunk_stitch_edge(row: u32, column: u32) -> Option<PatchEdge> {
    let lod = chunk_lod(row, column);
    let (row, column) = (row as i32, column as i32);

    [
        (PatchEdge::Top, row - 1, column),
        (PatchEdge::Right, row, column + 1),
        (PatchEdge::Bottom, row + 1, column),
        (PatchEdge::Left, row, column - 1),
    ]
    .into_iter()
    .find(|&(_, row, column)| {
        (0..GRID_SIZE as i32).contains(&row)
            && (0..GRID_SIZE as i32).contains(&column)
            && chunk_lod(row as u32, column as u32) < lod
    })
    .map(|(edge, _, _)| edge)
}

/// A range of the vertex arena owned by a single chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRegion {
    pub vertex_offset: u32,
    pub vertex_count: u32,
}

#[derive(Clone, Debug)]
pub struct TerrainChunk {
    pub row: u32,
    pub column: u32,
    pub lod: u32,
    pub edge: Option<PatchEdge>,
    pub step_size: u32,
    /// The world space position of the chunk's corner with the smallest coordinates.
    pub position: Vec2,
    /// The index of the mesh variant in [`MultiLodBuffers::variants`].
    pub variant: usize,
    pub region: ChunkRegion,
}

impl TerrainChunk {
    /// The index of the chunk inside the grid, in row major order.
    pub fn index(&self) -> u32 {
        self.row * GRID_SIZE + self.column
    }

    /// Converts a position relative to the chunk into a world position on the terrain surface.
    pub fn world_position(&self, local: Vec2, noise: &NoiseConfig) -> Vec3 {
        let xz = self.position + local;
        Vec3::new(xz.x, noise.height(xz), xz.y)
    }

    /// The terrain normal at a position relative to the chunk.
    pub fn normal(&self, local: Vec2, noise: &NoiseConfig) -> Vec3 {
        noise.normal(self.position + local)
    }
}

/// The parameters of the draw call of a single chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkDrawCall {
    pub chunk_index: u32,
    /// The range inside the shared index buffer.
    pub indices: Range<u32>,
    /// Moves the indices of the shared variant into the chunk's arena region.
    pub base_vertex: i32,
}

#[derive(Clone, Debug, Resource)]
pub struct ChunkGrid {
    chunk_size: u32,
    lod_count: u32,
    /// The noise the chunks are displaced with.
    noise: NoiseConfig,
    center: IVec2,
    chunks: Vec<TerrainChunk>,
    arena_vertex_count: u32,
    generation: u64,
}

impl ChunkGrid {
    /// Lays out the grid around the origin.
    pub fn new(chunk_size: u32, buffers: &MultiLodBuffers) -> TerrainResult<Self> {
        let mut arena_vertex_count = 0;

        let chunks = iproduct!(0..GRID_SIZE, 0..GRID_SIZE)
            .map(|(row, column)| {
                let lod = chunk_lod(row, column);
                let edge = chunk_stitch_edge(row, column);
                let variant = buffers.variant_index(lod, edge)?;
                let mesh = &buffers.variants[variant];

                let region = ChunkRegion {
                    vertex_offset: arena_vertex_count,
                    vertex_count: mesh.vertex_count,
                };
                arena_vertex_count += mesh.vertex_count;

                Ok(TerrainChunk {
                    row,
                    column,
                    lod,
                    edge,
                    step_size: mesh.step_size,
                    position: Vec2::ZERO,
                    variant,
                    region,
                })
            })
            .collect::<TerrainResult<Vec<_>>>()?;

        let mut grid = Self {
            chunk_size,
            lod_count: buffers.lod_count,
            noise: default(),
            center: IVec2::ZERO,
            chunks,
            arena_vertex_count,
            generation: 1,
        };
        grid.position_chunks();

        Ok(grid)
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn noise(&self) -> &NoiseConfig {
        &self.noise
    }

    /// The chunk coordinate of the center cell.
    pub fn center(&self) -> IVec2 {
        self.center
    }

    /// Increases every time the chunks have to be displaced again.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The number of vertices of all chunks combined.
    pub fn arena_vertex_count(&self) -> u32 {
        self.arena_vertex_count
    }

    pub fn chunks(&self) -> &[TerrainChunk] {
        &self.chunks
    }

    pub fn chunk(&self, row: u32, column: u32) -> TerrainResult<&TerrainChunk> {
        if row >= GRID_SIZE || column >= GRID_SIZE {
            return Err(TerrainError::ChunkOutOfRange {
                row,
                column,
                size: GRID_SIZE,
            });
        }

        Ok(&self.chunks[(row * GRID_SIZE + column) as usize])
    }

    /// The world position with terrain height of a point given relative to a grid cell.
    pub fn world_position_in_chunk(
        &self,
        row: u32,
        column: u32,
        local: Vec2,
        noise: &NoiseConfig,
    ) -> TerrainResult<Vec3> {
        Ok(self.chunk(row, column)?.world_position(local, noise))
    }

    /// The chunk coordinate containing the world position.
    pub fn viewer_chunk(&self, viewer: Vec3) -> IVec2 {
        (viewer.xz() / self.chunk_size as f32).floor().as_ivec2()
    }

    /// Recenters the grid on the viewer. Returns whether the chunks moved.
    pub fn update(&mut self, viewer: Vec3) -> bool {
        let center = self.viewer_chunk(viewer);

        if center == self.center {
            return false;
        }

        self.center = center;
        self.position_chunks();
        self.generation += 1;

        debug!(
            "recentered the terrain grid on chunk {center} (generation {})",
            self.generation
        );

        true
    }

    /// Requests the chunks to be displaced again, e.g. after the noise changed.
    pub fn invalidate(&mut self) {
        self.generation += 1;
    }

    /// Takes over the live-editable parts of the config. Returns whether the chunks have to be
    /// displaced again, which is only the case if the noise changed.
    pub fn apply_config(&mut self, config: &TerrainConfig) -> bool {
        if config.chunk_size != self.chunk_size {
            warn!(
                "the chunk size can not be changed at runtime, keeping {}",
                self.chunk_size
            );
        }
        if config.lod_count != self.lod_count {
            warn!(
                "the lod count can not be changed at runtime, keeping {}",
                self.lod_count
            );
        }

        if config.noise == self.noise {
            return false;
        }

        self.noise = config.noise;
        self.invalidate();

        true
    }

    fn position_chunks(&mut self) {
        let chunk_size = self.chunk_size as f32;
        let origin = (self.center - GRID_CENTER as i32).as_vec2() * chunk_size;

        for chunk in &mut self.chunks {
            chunk.position = origin + UVec2::new(chunk.column, chunk.row).as_vec2() * chunk_size;
        }
    }

    /// The initial contents of the vertex arena: the template vertices of each chunk's variant,
    /// in region order.
    pub fn arena_vertices(&self, buffers: &MultiLodBuffers) -> Vec<TerrainVertex> {
        self.chunks
            .iter()
            .flat_map(|chunk| buffers.variant_vertices(&buffers.variants[chunk.variant]))
            .copied()
            .collect_vec()
    }

    pub fn draw_calls<'a>(
        &'a self,
        buffers: &'a MultiLodBuffers,
    ) -> impl Iterator<Item = ChunkDrawCall> + 'a {
        self.chunks.iter().map(|chunk| {
            let variant = &buffers.variants[chunk.variant];

            ChunkDrawCall {
                chunk_index: chunk.index(),
                indices: variant.index_offset..variant.index_offset + variant.index_count,
                base_vertex: chunk.region.vertex_offset as i32 - variant.vertex_offset as i32,
            }
        })
    }
}

/// Marks the entity whose position the terrain grid follows.
#[derive(Clone, Copy, Component, Debug, Default)]
pub struct TerrainViewer {
    pub ground: GroundConstraint,
}

/// How a [`TerrainViewer`] is kept relative to the terrain surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum GroundConstraint {
    #[default]
    Free,
    /// Never dips below the ground clearance.
    Above,
    /// Stays exactly at the ground clearance, e.g. for a walking camera.
    Follow,
}

pub(crate) fn update_chunk_grid(
    config: Res<TerrainConfig>,
    debug: Option<Res<DebugTerrain>>,
    mut grid: ResMut<ChunkGrid>,
    viewers: Query<&GlobalTransform, With<TerrainViewer>>,
) {
    if config.is_changed() {
        grid.apply_config(&config);
    }

    if debug.is_some_and(|debug| debug.freeze) {
        return;
    }

    if let Some(viewer) = viewers.iter().next() {
        grid.update(viewer.translation());
    }
}

pub(crate) fn clamp_viewers_to_ground(
    config: Res<TerrainConfig>,
    mut viewers: Query<(&TerrainViewer, &mut Transform)>,
) {
    for (viewer, mut transform) in &mut viewers {
        let ground = config.noise.height(transform.translation.xz()) + config.ground_clearance;

        match viewer.ground {
            GroundConstraint::Free => {}
            GroundConstraint::Above => {
                if transform.translation.y < ground {
                    transform.translation.y = ground;
                }
            }
            GroundConstraint::Follow => transform.translation.y = ground,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::utils::HashSet;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn grid(chunk_size: u32) -> (ChunkGrid, MultiLodBuffers) {
        let buffers = MultiLodBuffers::generate(chunk_size, 3);
        let grid = ChunkGrid::new(chunk_size, &buffers).unwrap();
        (grid, buffers)
    }

    #[test]
    fn lods_form_rings() {
        let lods: HashSet<u32> = iproduct!(0..GRID_SIZE, 0..GRID_SIZE)
            .map(|(row, column)| chunk_lod(row, column))
            .collect();

        assert_eq!(lods, HashSet::from_iter([0, 1, 2]));
        assert_eq!(chunk_lod(2, 2), 0);
        for (row, column) in [(0, 0), (0, 4), (4, 0), (4, 4)] {
            assert_eq!(chunk_lod(row, column), 2);
        }
    }

    #[test]
    fn at_most_one_finer_neighbour() {
        for (row, column) in iproduct!(0..GRID_SIZE as i32, 0..GRID_SIZE as i32) {
            let lod = chunk_lod(row as u32, column as u32);

            let finer = [(-1, 0), (0, 1), (1, 0), (0, -1)]
                .into_iter()
                .map(|(dr, dc)| (row + dr, column + dc))
                .filter(|&(r, c)| (0..5).contains(&r) && (0..5).contains(&c))
                .filter(|&(r, c)| chunk_lod(r as u32, c as u32) < lod)
                .count();

            assert!(finer <= 1, "({row}, {column})");
            assert_eq!(
                finer == 1,
                chunk_stitch_edge(row as u32, column as u32).is_some()
            );
        }
    }

    #[test]
    fn stitch_edges_face_the_center() {
        assert_eq!(chunk_stitch_edge(2, 2), None);
        assert_eq!(chunk_stitch_edge(1, 1), None);
        assert_eq!(chunk_stitch_edge(0, 0), None);
        assert_eq!(chunk_stitch_edge(1, 2), Some(PatchEdge::Bottom));
        assert_eq!(chunk_stitch_edge(3, 2), Some(PatchEdge::Top));
        assert_eq!(chunk_stitch_edge(2, 1), Some(PatchEdge::Right));
        assert_eq!(chunk_stitch_edge(2, 3), Some(PatchEdge::Left));
        assert_eq!(chunk_stitch_edge(0, 1), Some(PatchEdge::Bottom));
        assert_eq!(chunk_stitch_edge(1, 4), Some(PatchEdge::Left));
    }

    #[test]
    fn viewer_chunk_and_grid_origin() {
        let (mut grid, _) = grid(256);

        assert!(grid.update(Vec3::new(300.0, 0.0, 10.0)));
        assert_eq!(grid.center(), IVec2::new(1, 0));
        assert_eq!(grid.chunk(0, 0).unwrap().position, Vec2::new(-256.0, -512.0));
        assert_eq!(grid.chunk(2, 2).unwrap().position, Vec2::new(256.0, 0.0));
        assert_eq!(grid.chunk(4, 3).unwrap().position, Vec2::new(512.0, 512.0));
    }

    #[test]
    fn negative_positions_round_down() {
        let (grid, _) = grid(256);

        assert_eq!(grid.viewer_chunk(Vec3::new(-1.0, 0.0, -256.5)), IVec2::new(-1, -2));
    }

    #[test]
    fn recomputes_only_when_crossing_a_chunk() {
        let (mut grid, _) = grid(256);
        grid.update(Vec3::new(10.0, 0.0, 10.0));

        let generation = grid.generation();
        let positions = grid.chunks().iter().map(|chunk| chunk.position).collect_vec();

        assert!(!grid.update(Vec3::new(250.0, 40.0, 10.0)));
        assert_eq!(grid.generation(), generation);
        assert!(grid
            .chunks()
            .iter()
            .zip(&positions)
            .all(|(chunk, &position)| chunk.position == position));

        assert!(grid.update(Vec3::new(256.0, 0.0, 10.0)));
        assert_eq!(grid.generation(), generation + 1);
        assert_eq!(grid.chunk(2, 2).unwrap().position, Vec2::new(256.0, 0.0));
    }

    #[test]
    fn viewer_is_always_inside_the_center_chunk() {
        let (mut grid, _) = grid(64);
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..1000 {
            let viewer = Vec3::new(
                rng.random_range(-5000.0..5000.0),
                rng.random_range(-10.0..100.0),
                rng.random_range(-5000.0..5000.0),
            );
            grid.update(viewer);

            let center = grid.chunk(2, 2).unwrap().position;
            assert!(viewer.x >= center.x && viewer.x < center.x + 64.0);
            assert!(viewer.z >= center.y && viewer.z < center.y + 64.0);
        }
    }

    #[test]
    fn out_of_range_chunks_are_rejected() {
        let (grid, _) = grid(16);

        assert_eq!(
            grid.chunk(5, 0).unwrap_err(),
            TerrainError::ChunkOutOfRange {
                row: 5,
                column: 0,
                size: 5
            }
        );
        assert!(grid.chunk(4, 4).is_ok());
    }

    #[test]
    fn too_few_lods_are_rejected() {
        let buffers = MultiLodBuffers::generate(16, 2);

        assert!(matches!(
            ChunkGrid::new(16, &buffers),
            Err(TerrainError::MissingVariant { lod: 2, .. })
        ));
    }

    #[test]
    fn regions_partition_the_arena() {
        let (grid, buffers) = grid(16);

        let mut offset = 0;
        for chunk in grid.chunks() {
            assert_eq!(chunk.region.vertex_offset, offset);
            assert_eq!(
                chunk.region.vertex_count,
                buffers.variants[chunk.variant].vertex_count
            );
            offset += chunk.region.vertex_count;
        }

        assert_eq!(offset, grid.arena_vertex_count());
        assert_eq!(grid.arena_vertices(&buffers).len() as u32, offset);
    }

    #[test]
    fn draw_calls_address_the_chunk_regions() {
        let (grid, buffers) = grid(16);
        let draw_calls = grid.draw_calls(&buffers).collect_vec();

        assert_eq!(draw_calls.len(), CHUNK_COUNT as usize);

        for (chunk, draw_call) in grid.chunks().iter().zip(&draw_calls) {
            let region = chunk.region.vertex_offset..chunk.region.vertex_offset + chunk.region.vertex_count;

            for index in draw_call.indices.clone() {
                let vertex = buffers.indices[index as usize] as i32 + draw_call.base_vertex;
                assert!(region.contains(&(vertex as u32)));
            }
        }
    }

    /// The x coordinates along the edge shared by the center chunk and the chunk above it.
    fn finest_seam(chunk_size: u32) -> (Vec<f32>, Vec<f32>) {
        let (mut grid, buffers) = grid(chunk_size);
        grid.update(Vec3::new(-40.0, 0.0, 100.0));

        let arena = grid.arena_vertices(&buffers);
        let world = |chunk: &TerrainChunk| {
            let start = chunk.region.vertex_offset as usize;
            arena[start..start + chunk.region.vertex_count as usize]
                .iter()
                .map(|vertex| chunk.position + Vec2::new(vertex.position[0], vertex.position[2]))
                .collect_vec()
        };

        let center = grid.chunk(2, 2).unwrap();
        let above = grid.chunk(1, 2).unwrap();
        let shared_z = center.position.y;

        let edge = |vertices: Vec<Vec2>| {
            vertices
                .into_iter()
                .filter(|vertex| vertex.y == shared_z)
                .map(|vertex| vertex.x)
                .sorted_by(|a, b| a.total_cmp(b))
                .collect_vec()
        };

        (edge(world(center)), edge(world(above)))
    }

    #[test]
    fn finest_seam_matches_in_world_space() {
        for chunk_size in [16, 254, 256] {
            let (center, above) = finest_seam(chunk_size);
            assert_eq!(center, above, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn odd_chunk_sizes_crack_the_finest_seam() {
        let (center, above) = finest_seam(255);

        // the stitched edge gains a vertex halfway into the last lod 0 cell
        assert!(above.contains(&(center[254] + 0.5)));
        assert_ne!(center, above);

        let config = TerrainConfig {
            chunk_size: 255,
            ..default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn only_noise_changes_invalidate_the_chunks() {
        let (mut grid, _) = grid(16);
        let mut config = TerrainConfig {
            chunk_size: 16,
            ..default()
        };

        assert!(!grid.apply_config(&config));
        let generation = grid.generation();

        config.ground_clearance = 10.0;
        assert!(!grid.apply_config(&config));
        assert_eq!(grid.generation(), generation);

        config.lod_count = 4;
        assert!(!grid.apply_config(&config));
        assert_eq!(grid.generation(), generation);

        config.noise.octaves = 6;
        assert!(grid.apply_config(&config));
        assert_eq!(grid.generation(), generation + 1);
        assert_eq!(grid.noise().octaves, 6);

        assert!(!grid.apply_config(&config));
        assert_eq!(grid.generation(), generation + 1);
    }

    #[test]
    fn world_position_uses_the_noise() {
        let (mut grid, _) = grid(16);
        grid.update(Vec3::new(20.0, 0.0, 20.0));
        let noise = NoiseConfig::default();

        let chunk = grid.chunk(2, 2).unwrap();
        let position = chunk.world_position(Vec2::new(3.0, 5.0), &noise);

        assert_eq!(position.xz(), Vec2::new(19.0, 21.0));
        assert_eq!(position.y, noise.height(Vec2::new(19.0, 21.0)));
        assert_eq!(
            grid.world_position_in_chunk(2, 2, Vec2::new(3.0, 5.0), &noise),
            Ok(position)
        );
        assert!(grid
            .world_position_in_chunk(2, 7, Vec2::ZERO, &noise)
            .is_err());
    }
}
