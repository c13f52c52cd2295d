//! GPU side of the terrain.
//!
//! The packed mesh variants are uploaded once. Every chunk of the grid owns a region of the
//! vertex arena, which the [`height_kernel`] displaces whenever the grid moves. The terrain is
//! then drawn with one indexed draw per chunk, whose instance index selects the chunk's offset.

use crate::{
    chunk_grid::{ChunkDrawCall, ChunkGrid, TerrainChunk},
    config::NoiseConfig,
    debug::DebugTerrain,
    mesh_buffer::{MultiLodBuffers, TerrainVertex},
    shaders::TERRAIN_SHADER,
    util::StaticBuffer,
};
use bevy::{
    core_pipeline::core_3d::{Transparent3d, CORE_3D_DEPTH_FORMAT},
    ecs::system::{lifetimeless::SRes, SystemParamItem},
    image::BevyDefault,
    pbr::{MeshPipeline, MeshPipelineViewLayoutKey, SetMeshViewBindGroup},
    prelude::*,
    render::{
        render_phase::{
            DrawFunctions, PhaseItem, PhaseItemExtraIndex, RenderCommand, RenderCommandResult,
            SetItemPipeline, TrackedRenderPass, ViewSortedRenderPhases,
        },
        render_resource::{binding_types::storage_buffer_read_only_sized, *},
        renderer::RenderDevice,
        sync_world::MainEntity,
        view::{ExtractedView, ViewTarget},
        Extract,
    },
};
use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use std::mem;

pub mod height_kernel;
pub mod instancing;

/// The per chunk data read by the terrain vertex shader.
#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GpuChunk {
    pub position: [f32; 2],
    pub lod: u32,
    pub step_size: u32,
}

impl From<&TerrainChunk> for GpuChunk {
    fn from(chunk: &TerrainChunk) -> Self {
        Self {
            position: chunk.position.to_array(),
            lod: chunk.lod,
            step_size: chunk.step_size,
        }
    }
}

/// The state of the chunk grid as seen by the render world.
#[derive(Clone, Debug, Default, Resource)]
pub struct ExtractedChunkGrid {
    pub generation: u64,
    pub chunk_size: u32,
    pub chunks: Vec<TerrainChunk>,
    pub noise: NoiseConfig,
}

pub(crate) fn extract_chunk_grid(
    mut extracted: ResMut<ExtractedChunkGrid>,
    grid: Extract<Res<ChunkGrid>>,
) {
    if extracted.generation == grid.generation() {
        return;
    }

    extracted.generation = grid.generation();
    extracted.chunk_size = grid.chunk_size();
    extracted.chunks = grid.chunks().to_vec();
    extracted.noise = *grid.noise();
}

pub(crate) fn create_terrain_layout(device: &RenderDevice) -> BindGroupLayout {
    device.create_bind_group_layout(
        "terrain_layout",
        &BindGroupLayoutEntries::single(
            ShaderStages::VERTEX,
            storage_buffer_read_only_sized(false, None),
        ),
    )
}

/// The vertex arena, the shared index buffer and the chunk offsets.
#[derive(Resource)]
pub struct GpuTerrainBuffers {
    pub(crate) arena: StaticBuffer<TerrainVertex>,
    pub(crate) indices: StaticBuffer<u32>,
    pub(crate) chunks: StaticBuffer<GpuChunk>,
    pub(crate) arena_vertex_count: u32,
    draw_calls: Vec<ChunkDrawCall>,
    bind_group: BindGroup,
}

impl GpuTerrainBuffers {
    pub(crate) fn new(
        device: &RenderDevice,
        layout: &BindGroupLayout,
        buffers: &MultiLodBuffers,
        grid: &ChunkGrid,
    ) -> Self {
        let arena_vertices = grid.arena_vertices(buffers);
        let chunks = grid.chunks().iter().map(GpuChunk::from).collect_vec();

        let arena = StaticBuffer::create_slice(
            "terrain_vertex_arena",
            device,
            &arena_vertices,
            BufferUsages::STORAGE | BufferUsages::VERTEX | BufferUsages::COPY_DST,
        );
        let indices = StaticBuffer::create_slice(
            "terrain_indices",
            device,
            &buffers.indices,
            BufferUsages::INDEX,
        );
        let chunks = StaticBuffer::create_slice(
            "terrain_chunks",
            device,
            &chunks,
            BufferUsages::STORAGE | BufferUsages::COPY_DST,
        );

        let bind_group = device.create_bind_group(
            "terrain_bind_group",
            layout,
            &BindGroupEntries::single(&chunks),
        );

        info!(
            "created the terrain buffers: {} arena vertices, {} indices",
            arena_vertices.len(),
            buffers.indices.len()
        );

        Self {
            arena,
            indices,
            chunks,
            arena_vertex_count: grid.arena_vertex_count(),
            draw_calls: grid.draw_calls(buffers).collect_vec(),
            bind_group,
        }
    }

    pub fn arena_size(&self) -> BufferAddress {
        (self.arena_vertex_count as usize * mem::size_of::<TerrainVertex>()) as BufferAddress
    }
}

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    #[repr(transparent)]
    pub struct TerrainPipelineKey: u32 {
        const NONE               = 0;
        const HDR                = 1 << 0;
        const SHOW_LOD           = 1 << 1;
        const WIREFRAME          = 1 << 2;
        const MSAA_RESERVED_BITS = TerrainPipelineKey::MSAA_MASK_BITS << TerrainPipelineKey::MSAA_SHIFT_BITS;
    }
}

impl TerrainPipelineKey {
    const MSAA_MASK_BITS: u32 = 0b111111;
    const MSAA_SHIFT_BITS: u32 = 32 - 6;

    pub fn from_msaa_samples(msaa_samples: u32) -> Self {
        let msaa_bits = ((msaa_samples - 1) & Self::MSAA_MASK_BITS) << Self::MSAA_SHIFT_BITS;
        Self::from_bits_retain(msaa_bits)
    }

    pub fn from_hdr(hdr: bool) -> Self {
        match hdr {
            true => Self::HDR,
            false => Self::NONE,
        }
    }

    pub fn from_debug(debug: &DebugTerrain) -> Self {
        let mut key = Self::NONE;

        if debug.show_lod {
            key |= Self::SHOW_LOD;
        }
        if debug.wireframe {
            key |= Self::WIREFRAME;
        }

        key
    }

    pub fn msaa_samples(&self) -> u32 {
        ((self.bits() >> Self::MSAA_SHIFT_BITS) & Self::MSAA_MASK_BITS) + 1
    }

    pub fn target_format(&self) -> TextureFormat {
        match self.contains(Self::HDR) {
            true => ViewTarget::TEXTURE_FORMAT_HDR,
            false => TextureFormat::bevy_default(),
        }
    }

    pub fn polygon_mode(&self) -> PolygonMode {
        match self.contains(Self::WIREFRAME) {
            true => PolygonMode::Line,
            false => PolygonMode::Fill,
        }
    }

    pub fn shader_defs(&self) -> Vec<ShaderDefVal> {
        let mut shader_defs = Vec::new();

        if self.contains(Self::SHOW_LOD) {
            shader_defs.push("SHOW_LOD".into());
        }

        shader_defs
    }
}

/// The pipeline drawing the displaced terrain chunks.
#[derive(Resource)]
pub struct TerrainRenderPipeline {
    view_layout: BindGroupLayout,
    view_layout_multisampled: BindGroupLayout,
    pub(crate) terrain_layout: BindGroupLayout,
    shader: Handle<Shader>,
}

impl FromWorld for TerrainRenderPipeline {
    fn from_world(world: &mut World) -> Self {
        let device = world.resource::<RenderDevice>();
        let mesh_pipeline = world.resource::<MeshPipeline>();

        Self {
            view_layout: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::empty())
                .clone(),
            view_layout_multisampled: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::MULTISAMPLED)
                .clone(),
            terrain_layout: create_terrain_layout(device),
            shader: world.load_asset(TERRAIN_SHADER),
        }
    }
}

impl SpecializedRenderPipeline for TerrainRenderPipeline {
    type Key = TerrainPipelineKey;

    fn specialize(&self, key: Self::Key) -> RenderPipelineDescriptor {
        let shader_defs = key.shader_defs();

        let view_layout = match key.msaa_samples() {
            1 => self.view_layout.clone(),
            _ => self.view_layout_multisampled.clone(),
        };

        RenderPipelineDescriptor {
            label: Some("terrain_pipeline".into()),
            layout: vec![view_layout, self.terrain_layout.clone()],
            push_constant_ranges: default(),
            vertex: VertexState {
                shader: self.shader.clone(),
                entry_point: "vertex".into(),
                shader_defs: shader_defs.clone(),
                buffers: vec![VertexBufferLayout {
                    array_stride: mem::size_of::<TerrainVertex>() as BufferAddress,
                    step_mode: VertexStepMode::Vertex,
                    attributes: vec![
                        VertexAttribute {
                            format: VertexFormat::Float32x4,
                            offset: 0,
                            shader_location: 0,
                        },
                        VertexAttribute {
                            format: VertexFormat::Float32x4,
                            offset: 16,
                            shader_location: 1,
                        },
                    ],
                }],
            },
            primitive: PrimitiveState {
                front_face: FrontFace::Ccw,
                cull_mode: Some(Face::Back),
                unclipped_depth: false,
                polygon_mode: key.polygon_mode(),
                conservative: false,
                topology: PrimitiveTopology::TriangleList,
                strip_index_format: None,
            },
            fragment: Some(FragmentState {
                shader: self.shader.clone(),
                shader_defs,
                entry_point: "fragment".into(),
                targets: vec![Some(ColorTargetState {
                    format: key.target_format(),
                    blend: Some(BlendState::REPLACE),
                    write_mask: ColorWrites::ALL,
                })],
            }),
            depth_stencil: Some(DepthStencilState {
                format: CORE_3D_DEPTH_FORMAT,
                depth_write_enabled: true,
                depth_compare: CompareFunction::GreaterEqual,
                stencil: StencilState::default(),
                bias: DepthBiasState::default(),
            }),
            multisample: MultisampleState {
                count: key.msaa_samples(),
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            zero_initialize_workgroup_memory: false,
        }
    }
}

pub(crate) struct SetTerrainBindGroup<const I: usize>;

impl<const I: usize, P: PhaseItem> RenderCommand<P> for SetTerrainBindGroup<I> {
    type Param = SRes<GpuTerrainBuffers>;
    type ViewQuery = ();
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        _: &P,
        _: (),
        _: Option<()>,
        buffers: SystemParamItem<'w, '_, Self::Param>,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        pass.set_bind_group(I, &buffers.into_inner().bind_group, &[]);
        RenderCommandResult::Success
    }
}

/// Issues one indexed draw per chunk. The instance index is the chunk index.
pub(crate) struct DrawTerrainChunks;

impl<P: PhaseItem> RenderCommand<P> for DrawTerrainChunks {
    type Param = SRes<GpuTerrainBuffers>;
    type ViewQuery = ();
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        _: &P,
        _: (),
        _: Option<()>,
        buffers: SystemParamItem<'w, '_, Self::Param>,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        let buffers = buffers.into_inner();

        pass.set_vertex_buffer(0, buffers.arena.slice(..));
        pass.set_index_buffer(buffers.indices.slice(..), 0, IndexFormat::Uint32);

        for call in &buffers.draw_calls {
            pass.draw_indexed(
                call.indices.clone(),
                call.base_vertex,
                call.chunk_index..call.chunk_index + 1,
            );
        }

        RenderCommandResult::Success
    }
}

pub(crate) type DrawTerrain = (
    SetItemPipeline,
    SetMeshViewBindGroup<0>,
    SetTerrainBindGroup<1>,
    DrawTerrainChunks,
);

pub(crate) fn queue_terrain(
    draw_functions: Res<DrawFunctions<Transparent3d>>,
    debug: Option<Res<DebugTerrain>>,
    pipeline_cache: Res<PipelineCache>,
    terrain_pipeline: Res<TerrainRenderPipeline>,
    mut pipelines: ResMut<SpecializedRenderPipelines<TerrainRenderPipeline>>,
    mut phases: ResMut<ViewSortedRenderPhases<Transparent3d>>,
    views: Query<(Entity, &MainEntity, &ExtractedView, &Msaa)>,
) {
    let draw_function = draw_functions.read().id::<DrawTerrain>();

    for (render_view, &main_view, view, msaa) in &views {
        let Some(phase) = phases.get_mut(&render_view) else {
            continue;
        };

        let mut key = TerrainPipelineKey::from_msaa_samples(msaa.samples())
            | TerrainPipelineKey::from_hdr(view.hdr);

        if let Some(debug) = &debug {
            key |= TerrainPipelineKey::from_debug(debug);
        }

        let pipeline = pipelines.specialize(&pipeline_cache, &terrain_pipeline, key);

        phase.add(Transparent3d {
            // the terrain has no entity of its own
            entity: (render_view, main_view),
            draw_function,
            pipeline,
            // drawn before any transparent geometry
            distance: f32::NEG_INFINITY,
            batch_range: 0..1,
            extra_index: PhaseItemExtraIndex::NONE,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msaa_samples_survive_the_key() {
        for samples in [1, 2, 4, 8] {
            let key = TerrainPipelineKey::from_msaa_samples(samples)
                | TerrainPipelineKey::HDR
                | TerrainPipelineKey::SHOW_LOD;

            assert_eq!(key.msaa_samples(), samples);
            assert!(key.contains(TerrainPipelineKey::HDR));
        }
    }

    #[test]
    fn debug_flags_select_shader_defs() {
        let debug = DebugTerrain {
            show_lod: true,
            ..default()
        };
        let key = TerrainPipelineKey::from_debug(&debug);

        assert_eq!(key.polygon_mode(), PolygonMode::Fill);
        assert_eq!(key.shader_defs().len(), 1);
        assert_eq!(
            TerrainPipelineKey::NONE.target_format(),
            TextureFormat::bevy_default()
        );
    }

    #[test]
    fn gpu_chunks_follow_the_grid() {
        let buffers = MultiLodBuffers::generate(32, 3);
        let mut grid = ChunkGrid::new(32, &buffers).unwrap();
        grid.update(Vec3::new(100.0, 0.0, -10.0));

        let chunks = grid.chunks().iter().map(GpuChunk::from).collect_vec();

        assert_eq!(mem::size_of::<GpuChunk>(), 16);
        assert_eq!(chunks[12].position, [96.0, -32.0]);
        assert_eq!(chunks[12].lod, 0);
        assert_eq!(chunks[0].step_size, 3);
    }
}
