//! Square terrain patches at a single level of detail.
//!
//! A [`TerrainPatch`] is a set of rows of horizontal vertex positions. Its vertices lie on a regular
//! grid with a spacing of `lod + 1` units. Edges adjacent to a finer neighbour can be stitched,
//! which inserts the vertices the neighbour has on the shared edge, so that the two meshes meet
//! without cracks. [`triangulate_patch`] turns the rows into a triangle list.

use bevy::math::Vec2;
use derive_more::derive::Display;
use itertools::Itertools;

mod stitch;
mod triangulate;

pub use stitch::stitch_patch_edge;
pub use triangulate::{triangulate_patch, RowOffsets};

/// One of the four sides of a patch.
///
/// The top edge is the one at `z = 0` and the left edge is the one at `x = 0`.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum PatchEdge {
    #[display("left")]
    Left,
    #[display("top")]
    Top,
    #[display("right")]
    Right,
    #[display("bottom")]
    Bottom,
}

impl PatchEdge {
    pub const ALL: [PatchEdge; 4] = [
        PatchEdge::Left,
        PatchEdge::Top,
        PatchEdge::Right,
        PatchEdge::Bottom,
    ];

    pub fn is_side(self) -> bool {
        matches!(self, PatchEdge::Left | PatchEdge::Right)
    }
}

bitflags::bitflags! {
    /// The set of stitched edges of a patch.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct StitchedEdges: u32 {
        const NONE   = 0;
        const LEFT   = 1 << 0;
        const TOP    = 1 << 1;
        const RIGHT  = 1 << 2;
        const BOTTOM = 1 << 3;
    }
}

impl From<PatchEdge> for StitchedEdges {
    fn from(edge: PatchEdge) -> Self {
        match edge {
            PatchEdge::Left => StitchedEdges::LEFT,
            PatchEdge::Top => StitchedEdges::TOP,
            PatchEdge::Right => StitchedEdges::RIGHT,
            PatchEdge::Bottom => StitchedEdges::BOTTOM,
        }
    }
}

impl StitchedEdges {
    pub fn edges(self) -> impl Iterator<Item = PatchEdge> {
        PatchEdge::ALL
            .into_iter()
            .filter(move |&edge| self.contains(edge.into()))
    }
}

/// The state shared by the left and right edge.
///
/// The first of the two side edges to be stitched inserts a seam row between every pair of
/// grid rows. The second one only adds its boundary vertex to the existing seam rows.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SideSeams {
    #[default]
    None,
    RowsInserted,
}

#[derive(Clone, Debug)]
pub struct TerrainPatch {
    pub(crate) size: u32,
    pub(crate) lod: u32,
    pub(crate) rows: Vec<Vec<Vec2>>,
    pub(crate) stitched: StitchedEdges,
    pub(crate) side_seams: SideSeams,
}

impl TerrainPatch {
    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn lod(&self) -> u32 {
        self.lod
    }

    /// The distance between two neighbouring grid vertices.
    pub fn step_size(&self) -> u32 {
        self.lod + 1
    }

    pub fn stitched_edges(&self) -> StitchedEdges {
        self.stitched
    }

    pub fn side_seams(&self) -> SideSeams {
        self.side_seams
    }

    pub fn rows(&self) -> &[Vec<Vec2>] {
        &self.rows
    }

    pub fn vertex_count(&self) -> usize {
        self.rows.iter().map(Vec::len).sum()
    }

    /// All vertices in row major order, which is the order the triangle indices refer to.
    pub fn vertices(&self) -> impl Iterator<Item = Vec2> + '_ {
        self.rows.iter().flatten().copied()
    }

    /// The indices of the rows which belong to the regular grid.
    /// Seam rows inserted by stitching a side edge are skipped.
    pub(crate) fn grid_rows(&self) -> impl Iterator<Item = usize> {
        let stride = match self.side_seams {
            SideSeams::None => 1,
            SideSeams::RowsInserted => 2,
        };

        (0..self.rows.len()).step_by(stride)
    }
}

fn grid_coordinates(size: u32, step: u32) -> Vec<f32> {
    let mut coordinates = (0..=size).step_by(step as usize).collect_vec();

    // the last coordinate has to land exactly on the patch boundary
    if coordinates.last() != Some(&size) {
        coordinates.push(size);
    }

    coordinates.into_iter().map(|c| c as f32).collect()
}

/// Builds the regular vertex grid of a patch with the side length `size` at the given `lod`.
///
/// Rows and columns are spaced `lod + 1` units apart. If the last row or column does not land on
/// the boundary of the patch, one corrective row or column is appended at `size`.
pub fn generate_base_patch(size: u32, lod: u32) -> TerrainPatch {
    let coordinates = grid_coordinates(size, lod + 1);

    let rows = coordinates
        .iter()
        .map(|&z| coordinates.iter().map(|&x| Vec2::new(x, z)).collect())
        .collect();

    TerrainPatch {
        size,
        lod,
        rows,
        stitched: StitchedEdges::NONE,
        side_seams: SideSeams::None,
    }
}
