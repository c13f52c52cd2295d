//! Packing of every mesh variant into shared vertex and index buffers.

use crate::{
    error::{TerrainError, TerrainResult},
    patch::{triangulate_patch, PatchEdge, TerrainPatch},
};
use bevy::prelude::*;
use bytemuck::{Pod, Zeroable};
use itertools::iproduct;

/// The number of mesh variants generated per lod: one unstitched and one per stitched edge.
pub const VARIANTS_PER_LOD: u32 = 5;

/// A terrain vertex as it is stored on the GPU.
///
/// The height (`position.y`) and the normal are written by the height kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct TerrainVertex {
    pub position: [f32; 4],
    pub normal: [f32; 4],
}

impl TerrainVertex {
    pub fn flat(xz: Vec2) -> Self {
        Self {
            position: [xz.x, 0.0, xz.y, 1.0],
            normal: [0.0, 1.0, 0.0, 0.0],
        }
    }
}

/// The location of one mesh variant inside the shared buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MeshVariant {
    pub lod: u32,
    /// The stitched edge, if any.
    pub edge: Option<PatchEdge>,
    pub step_size: u32,
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub index_offset: u32,
    pub index_count: u32,
}

impl MeshVariant {
    pub(crate) fn slot(edge: Option<PatchEdge>) -> u32 {
        match edge {
            None => 0,
            Some(PatchEdge::Left) => 1,
            Some(PatchEdge::Top) => 2,
            Some(PatchEdge::Right) => 3,
            Some(PatchEdge::Bottom) => 4,
        }
    }
}

/// All lods and edge variants of a terrain chunk, packed into one vertex and one index buffer.
///
/// The indices are absolute, i.e. they already include the vertex offset of their variant.
#[derive(Clone, Debug, Resource)]
pub struct MultiLodBuffers {
    pub base_size: u32,
    pub lod_count: u32,
    pub variants: Vec<MeshVariant>,
    pub vertices: Vec<TerrainVertex>,
    pub indices: Vec<u32>,
}

impl MultiLodBuffers {
    pub fn generate(base_size: u32, lod_count: u32) -> Self {
        let mut variants = Vec::with_capacity((lod_count * VARIANTS_PER_LOD) as usize);
        let mut vertices = Vec::new();
        let mut indices = Vec::new();

        let edges = [None].into_iter().chain(PatchEdge::ALL.map(Some));

        for (lod, edge) in iproduct!(0..lod_count, edges) {
            let patch = match edge {
                None => TerrainPatch::with_stitched_edges(base_size, lod, default()),
                Some(edge) => TerrainPatch::with_stitched_edges(base_size, lod, edge.into()),
            };

            let vertex_offset = vertices.len() as u32;
            let index_offset = indices.len() as u32;
            let patch_indices = triangulate_patch(&patch);

            vertices.extend(patch.vertices().map(TerrainVertex::flat));
            indices.extend(patch_indices.iter().map(|&index| index + vertex_offset));

            variants.push(MeshVariant {
                lod,
                edge,
                step_size: patch.step_size(),
                vertex_offset,
                vertex_count: vertices.len() as u32 - vertex_offset,
                index_offset,
                index_count: indices.len() as u32 - index_offset,
            });
        }

        info!(
            "packed {} terrain mesh variants with {} vertices and {} indices",
            variants.len(),
            vertices.len(),
            indices.len()
        );

        Self {
            base_size,
            lod_count,
            variants,
            vertices,
            indices,
        }
    }

    pub fn variant_index(&self, lod: u32, edge: Option<PatchEdge>) -> TerrainResult<usize> {
        if lod >= self.lod_count {
            return Err(TerrainError::MissingVariant { lod, edge });
        }

        Ok((lod * VARIANTS_PER_LOD + MeshVariant::slot(edge)) as usize)
    }

    pub fn variant(&self, lod: u32, edge: Option<PatchEdge>) -> TerrainResult<&MeshVariant> {
        let index = self.variant_index(lod, edge)?;
        Ok(&self.variants[index])
    }

    /// The template vertices of a variant.
    pub fn variant_vertices(&self, variant: &MeshVariant) -> &[TerrainVertex] {
        let start = variant.vertex_offset as usize;
        &self.vertices[start..start + variant.vertex_count as usize]
    }
}
