//! The compute pass displacing the vertex arena and scattering the model instances.

use crate::{
    config::NoiseConfig,
    error::{TerrainError, TerrainResult},
    kernel::{KernelCommand, KernelPlan},
    render::{instancing::GpuInstanceBuffers, ExtractedChunkGrid, GpuChunk, GpuTerrainBuffers},
    shaders::HEIGHT_KERNEL_SHADER,
};
use bevy::{
    prelude::*,
    render::{
        render_graph::{self, RenderLabel},
        render_resource::{
            binding_types::{storage_buffer_read_only_sized, storage_buffer_sized, uniform_buffer},
            *,
        },
        renderer::{RenderContext, RenderDevice, RenderQueue},
    },
};
use itertools::Itertools;

#[derive(Clone, Copy, Debug, Default, ShaderType)]
pub struct KernelParams {
    pub chunk_position: Vec2,
    pub chunk_size: f32,
    pub step_size: u32,
    pub chunk_index: u32,
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub model_count: u32,
    pub slot_size: u32,
}

#[derive(Clone, Copy, Debug, Default, ShaderType)]
pub struct NoiseUniform {
    pub terrain_height: f32,
    pub octaves: u32,
    pub scale: f32,
    pub persistence: f32,
    pub lacunarity: f32,
}

impl From<&NoiseConfig> for NoiseUniform {
    fn from(noise: &NoiseConfig) -> Self {
        Self {
            terrain_height: noise.terrain_height,
            octaves: noise.octaves,
            scale: noise.scale,
            persistence: noise.persistence,
            lacunarity: noise.lacunarity,
        }
    }
}

#[derive(Resource)]
pub struct HeightKernelPipeline {
    pub(crate) layout: BindGroupLayout,
    pipeline: CachedComputePipelineId,
}

impl FromWorld for HeightKernelPipeline {
    fn from_world(world: &mut World) -> Self {
        let device = world.resource::<RenderDevice>();
        let pipeline_cache = world.resource::<PipelineCache>();

        let layout = device.create_bind_group_layout(
            "height_kernel_layout",
            &BindGroupLayoutEntries::sequential(
                ShaderStages::COMPUTE,
                (
                    storage_buffer_sized(false, None), // vertex arena
                    uniform_buffer::<KernelParams>(true),
                    uniform_buffer::<NoiseUniform>(false),
                    storage_buffer_read_only_sized(false, None), // model slots
                    storage_buffer_sized(false, None),           // instances
                    storage_buffer_sized(false, None),           // counters
                ),
            ),
        );

        let pipeline = pipeline_cache.queue_compute_pipeline(ComputePipelineDescriptor {
            label: Some("height_kernel_pipeline".into()),
            layout: vec![layout.clone()],
            push_constant_ranges: default(),
            shader: world.load_asset(HEIGHT_KERNEL_SHADER),
            shader_defs: default(),
            entry_point: "displace".into(),
            zero_initialize_workgroup_memory: false,
        });

        Self { layout, pipeline }
    }
}

impl HeightKernelPipeline {
    /// Returns whether the kernel can be dispatched. A failed build is fatal.
    fn is_ready(&self, pipeline_cache: &PipelineCache) -> bool {
        match kernel_readiness(pipeline_cache.get_compute_pipeline_state(self.pipeline)) {
            Ok(ready) => ready,
            Err(error) => {
                error!("{error}");
                panic!("{error}");
            }
        }
    }
}

/// Whether a kernel pipeline in this state can be dispatched. Missing shaders are still loading,
/// any other pipeline error is returned.
fn kernel_readiness(state: &CachedPipelineState) -> TerrainResult<bool> {
    match state {
        CachedPipelineState::Ok(_) => Ok(true),
        CachedPipelineState::Err(
            PipelineCacheError::ShaderNotLoaded(_) | PipelineCacheError::ShaderImportNotYetAvailable,
        ) => Ok(false),
        CachedPipelineState::Err(error) => Err(TerrainError::KernelBuild(error.to_string())),
        _ => Ok(false),
    }
}

/// The dispatches of the current kernel cycle.
#[derive(Resource)]
pub struct HeightKernelState {
    /// The grid generation the vertex arena was last displaced for.
    pub(crate) dispatched_generation: u64,
    params: DynamicUniformBuffer<KernelParams>,
    noise: UniformBuffer<NoiseUniform>,
    plan: KernelPlan,
    /// The dynamic uniform offset of each dispatch, in plan order.
    offsets: Vec<u32>,
    bind_group: Option<BindGroup>,
    /// Whether the plan has to be executed this frame.
    run: bool,
}

impl Default for HeightKernelState {
    fn default() -> Self {
        Self {
            dispatched_generation: 0,
            params: default(),
            noise: UniformBuffer::from(NoiseUniform::default()),
            plan: default(),
            offsets: default(),
            bind_group: None,
            run: false,
        }
    }
}

impl HeightKernelState {
    pub fn is_running(&self) -> bool {
        self.run
    }
}

#[allow(clippy::too_many_arguments)]
pub(crate) fn prepare_height_kernel(
    device: Res<RenderDevice>,
    queue: Res<RenderQueue>,
    pipeline_cache: Res<PipelineCache>,
    kernel_pipeline: Res<HeightKernelPipeline>,
    grid: Res<ExtractedChunkGrid>,
    terrain: Res<GpuTerrainBuffers>,
    mut instances: ResMut<GpuInstanceBuffers>,
    mut state: ResMut<HeightKernelState>,
) {
    let state = &mut *state;
    state.run = false;

    if grid.generation == state.dispatched_generation
        || !kernel_pipeline.is_ready(&pipeline_cache)
    {
        return;
    }

    let chunks = grid.chunks.iter().map(GpuChunk::from).collect_vec();
    terrain.chunks.update_slice(&queue, &chunks);

    let plan = KernelPlan::new(&grid.chunks);
    let model_count = instances.feedback.models().len() as u32;
    let slot_size = instances.feedback.slot_size();

    state.params.clear();
    state.offsets = plan
        .dispatches()
        .map(|dispatch| {
            state.params.push(&KernelParams {
                chunk_position: dispatch.chunk_position,
                chunk_size: grid.chunk_size as f32,
                step_size: dispatch.step_size,
                chunk_index: dispatch.chunk_index,
                vertex_offset: dispatch.vertex_offset,
                vertex_count: dispatch.vertex_count,
                model_count,
                slot_size,
            })
        })
        .collect_vec();
    state.params.write_buffer(&device, &queue);

    state.noise.set(NoiseUniform::from(&grid.noise));
    state.noise.write_buffer(&device, &queue);

    let (Some(params), Some(noise)) = (state.params.binding(), state.noise.binding()) else {
        return;
    };

    state.bind_group = Some(device.create_bind_group(
        "height_kernel_bind_group",
        &kernel_pipeline.layout,
        &BindGroupEntries::sequential((
            &terrain.arena,
            params,
            noise,
            &instances.model_slots,
            &instances.instances,
            &instances.counters,
        )),
    ));

    if model_count > 0 {
        instances.arm_cycle(&device, &queue);
    }

    debug!(
        "dispatching the height kernel {} times for generation {}",
        plan.dispatch_count(),
        grid.generation
    );

    state.plan = plan;
    state.dispatched_generation = grid.generation;
    state.run = true;
}

#[derive(Debug, Hash, PartialEq, Eq, Clone, RenderLabel)]
pub struct HeightKernelLabel;

pub struct HeightKernelNode;

impl render_graph::Node for HeightKernelNode {
    fn run<'w>(
        &self,
        _graph: &mut render_graph::RenderGraphContext,
        context: &mut RenderContext<'w>,
        world: &'w World,
    ) -> Result<(), render_graph::NodeRunError> {
        let state = world.resource::<HeightKernelState>();
        let pipeline_cache = world.resource::<PipelineCache>();
        let kernel_pipeline = world.resource::<HeightKernelPipeline>();
        let instances = world.resource::<GpuInstanceBuffers>();

        if !state.run {
            return Ok(());
        }

        let Some(pipeline) = pipeline_cache.get_compute_pipeline(kernel_pipeline.pipeline) else {
            return Ok(());
        };
        let Some(bind_group) = &state.bind_group else {
            return Ok(());
        };

        let encoder = context.command_encoder();
        let mut offsets = state.offsets.iter();

        // Each dispatch gets its own pass, the pass boundaries order the writes to the arena.
        for command in state.plan.commands() {
            match command {
                KernelCommand::Dispatch(dispatch) => {
                    let Some(&offset) = offsets.next() else {
                        break;
                    };

                    let mut pass = encoder.begin_compute_pass(&ComputePassDescriptor {
                        label: Some("height_kernel_pass"),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(pipeline);
                    pass.set_bind_group(0, bind_group, &[offset]);
                    pass.dispatch_workgroups(dispatch.workgroups, 1, 1);
                }
                KernelCommand::ArmFence => instances.record_counter_copy(encoder),
                KernelCommand::BindChunk { .. } | KernelCommand::Barrier => {}
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noise_uniform_mirrors_the_config() {
        let noise = NoiseConfig {
            octaves: 6,
            lacunarity: 2.5,
            ..default()
        };
        let uniform = NoiseUniform::from(&noise);

        assert_eq!(uniform.octaves, 6);
        assert_eq!(uniform.lacunarity, 2.5);
        assert_eq!(uniform.terrain_height, noise.terrain_height);
    }

    #[test]
    fn loading_shaders_delay_the_kernel() {
        assert_eq!(kernel_readiness(&CachedPipelineState::Queued), Ok(false));
        assert_eq!(
            kernel_readiness(&CachedPipelineState::Err(
                PipelineCacheError::ShaderNotLoaded(AssetId::default())
            )),
            Ok(false)
        );
        assert_eq!(
            kernel_readiness(&CachedPipelineState::Err(
                PipelineCacheError::ShaderImportNotYetAvailable
            )),
            Ok(false)
        );
    }

    #[test]
    fn broken_kernel_is_a_build_error() {
        let state = CachedPipelineState::Err(PipelineCacheError::CreateShaderModule(
            "unknown identifier `hieght`".into(),
        ));

        assert!(matches!(
            kernel_readiness(&state),
            Err(TerrainError::KernelBuild(message)) if message.contains("hieght")
        ));
    }

    #[test]
    fn uniform_layouts_match_the_shader() {
        assert_eq!(KernelParams::min_size().get(), 40);
        assert_eq!(NoiseUniform::min_size().get(), 20);
    }
}
