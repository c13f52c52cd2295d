use crate::{
    chunk_grid::{clamp_viewers_to_ground, update_chunk_grid, ChunkGrid},
    config::TerrainConfig,
    mesh_buffer::MultiLodBuffers,
    render::{
        extract_chunk_grid,
        height_kernel::{
            prepare_height_kernel, HeightKernelLabel, HeightKernelNode, HeightKernelPipeline,
            HeightKernelState,
        },
        instancing::{
            extract_instanced_models, poll_instance_feedback, prepare_instance_buffers,
            queue_instanced_models, start_counter_readback, DrawInstancedModels,
            ExtractedInstancedModels, GpuInstanceBuffers, InstancedModelPipeline, InstancedModels,
            ViewModelPipelines,
        },
        queue_terrain, DrawTerrain, ExtractedChunkGrid, GpuTerrainBuffers, TerrainRenderPipeline,
    },
    shaders::load_terrain_shaders,
};
use bevy::{
    core_pipeline::core_3d::Transparent3d,
    prelude::*,
    render::{
        graph::CameraDriverLabel, render_graph::RenderGraph, render_phase::AddRenderCommand,
        render_resource::*, renderer::RenderDevice, Render, RenderApp, RenderSet,
    },
};

/// The plugin for the lod terrain.
///
/// The chunk meshes are generated once when the plugin is built. The terrain follows the first
/// entity with a [`TerrainViewer`](crate::chunk_grid::TerrainViewer) component.
#[derive(Default)]
pub struct LodTerrainPlugin {
    pub config: TerrainConfig,
}

impl Plugin for LodTerrainPlugin {
    fn build(&self, app: &mut App) {
        if let Err(error) = self.config.validate() {
            error!("{error}");
            panic!("{error}");
        }

        let buffers = MultiLodBuffers::generate(self.config.chunk_size, self.config.lod_count);
        let grid = match ChunkGrid::new(self.config.chunk_size, &buffers) {
            Ok(grid) => grid,
            Err(error) => {
                error!("{error}");
                panic!("{error}");
            }
        };

        app.insert_resource(self.config.clone())
            .insert_resource(buffers)
            .insert_resource(grid)
            .init_resource::<InstancedModels>()
            .add_systems(
                Update,
                (clamp_viewers_to_ground, update_chunk_grid).chain(),
            );

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .add_render_command::<Transparent3d, DrawTerrain>()
            .add_render_command::<Transparent3d, DrawInstancedModels>()
            .init_resource::<ExtractedChunkGrid>()
            .init_resource::<ExtractedInstancedModels>()
            .init_resource::<HeightKernelState>()
            .init_resource::<ViewModelPipelines>()
            .init_resource::<SpecializedRenderPipelines<TerrainRenderPipeline>>()
            .init_resource::<SpecializedMeshPipelines<InstancedModelPipeline>>()
            .add_systems(
                ExtractSchedule,
                (extract_chunk_grid, extract_instanced_models),
            )
            .add_systems(
                Render,
                (
                    (queue_terrain, queue_instanced_models).in_set(RenderSet::QueueMeshes),
                    (
                        poll_instance_feedback,
                        prepare_instance_buffers,
                        prepare_height_kernel,
                    )
                        .chain()
                        .in_set(RenderSet::PrepareResources),
                    start_counter_readback.in_set(RenderSet::Cleanup),
                ),
            );
    }

    fn finish(&self, app: &mut App) {
        load_terrain_shaders(app);

        let buffers = app.world().resource::<MultiLodBuffers>().clone();
        let grid = app.world().resource::<ChunkGrid>().clone();

        let Some(render_app) = app.get_sub_app_mut(RenderApp) else {
            return;
        };

        render_app
            .init_resource::<TerrainRenderPipeline>()
            .init_resource::<HeightKernelPipeline>()
            .init_resource::<InstancedModelPipeline>();

        let world = render_app.world_mut();

        let (terrain_buffers, instance_buffers) = {
            let device = world.resource::<RenderDevice>();
            let terrain_layout = &world.resource::<TerrainRenderPipeline>().terrain_layout;
            let default_shader = &world.resource::<InstancedModelPipeline>().default_shader;

            (
                GpuTerrainBuffers::new(device, terrain_layout, &buffers, &grid),
                GpuInstanceBuffers::new(device, grid.arena_vertex_count(), &[], default_shader),
            )
        };

        world.insert_resource(terrain_buffers);
        world.insert_resource(instance_buffers);

        let mut render_graph = world.resource_mut::<RenderGraph>();
        render_graph.add_node(HeightKernelLabel, HeightKernelNode);
        render_graph.add_node_edge(HeightKernelLabel, CameraDriverLabel);
    }
}
