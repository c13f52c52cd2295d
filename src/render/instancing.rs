//! Instanced models scattered across the terrain by the height kernel.
//!
//! The instance counts are read back with a staging buffer that is mapped asynchronously. The
//! render world polls the mapping once per frame and never waits for it.

use crate::{
    debug::DebugTerrain,
    feedback::{InstanceCounters, InstanceFeedback, InstancedDrawSink, ModelId, PollOutcome},
    render::{height_kernel::HeightKernelState, GpuTerrainBuffers, TerrainPipelineKey},
    shaders::INSTANCED_MODEL_SHADER,
    util::StaticBuffer,
};
use bevy::{
    core_pipeline::core_3d::{Transparent3d, CORE_3D_DEPTH_FORMAT},
    ecs::{
        entity::EntityHashMap,
        system::{lifetimeless::SRes, SystemParamItem},
    },
    pbr::{MeshPipeline, MeshPipelineViewLayoutKey, SetMeshViewBindGroup},
    prelude::*,
    render::{
        mesh::{
            allocator::MeshAllocator, MeshVertexBufferLayoutRef, RenderMesh, RenderMeshBufferInfo,
        },
        render_asset::RenderAssets,
        render_phase::{
            DrawFunctions, PhaseItem, PhaseItemExtraIndex, RenderCommand, RenderCommandResult,
            SetItemPipeline, TrackedRenderPass, ViewSortedRenderPhases,
        },
        render_resource::*,
        renderer::{RenderDevice, RenderQueue},
        sync_world::MainEntity,
        view::ExtractedView,
        Extract,
    },
    tasks::{futures_lite::future, AsyncComputeTaskPool, Task},
};
use bytemuck::{Pod, Zeroable};
use itertools::Itertools;
use std::{mem, ops::Range};

/// A model that is scattered across the terrain.
#[derive(Clone, Debug)]
pub struct InstancedModel {
    pub label: String,
    /// All meshes are drawn with the same instances. They have to share their vertex layout.
    pub meshes: Vec<Handle<Mesh>>,
    /// The probability of a finest lod vertex to spawn an instance.
    pub density: f32,
    /// Replaces the default model shader.
    pub shader: Option<Handle<Shader>>,
}

impl InstancedModel {
    pub fn new(label: impl Into<String>, mesh: Handle<Mesh>, density: f32) -> Self {
        Self {
            label: label.into(),
            meshes: vec![mesh],
            density,
            shader: None,
        }
    }

    pub fn with_mesh(mut self, mesh: Handle<Mesh>) -> Self {
        self.meshes.push(mesh);
        self
    }

    pub fn with_shader(mut self, shader: Handle<Shader>) -> Self {
        self.shader = Some(shader);
        self
    }
}

/// The registered instanced models, in slot order.
#[derive(Clone, Debug, Default, Resource)]
pub struct InstancedModels(Vec<InstancedModel>);

impl InstancedModels {
    pub fn add(&mut self, model: InstancedModel) -> ModelId {
        self.0.push(model);
        ModelId(self.0.len() as u32 - 1)
    }

    pub fn get(&self, model: ModelId) -> Option<&InstancedModel> {
        self.0.get(model.0 as usize)
    }

    pub fn set_shader(&mut self, model: ModelId, shader: Handle<Shader>) {
        if let Some(model) = self.0.get_mut(model.0 as usize) {
            model.shader = Some(shader);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &InstancedModel> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Default, Resource)]
pub struct ExtractedInstancedModels {
    models: Vec<InstancedModel>,
    changed: bool,
}

pub(crate) fn extract_instanced_models(
    mut extracted: ResMut<ExtractedInstancedModels>,
    models: Extract<Res<InstancedModels>>,
) {
    if models.is_changed() {
        extracted.models = models.0.clone();
        extracted.changed = true;
    }
}

/// An instance as written by the height kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct InstanceData {
    pub position: [f32; 3],
    pub scale: f32,
}

#[derive(Clone, Copy, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GpuModelSlot {
    pub base_offset: u32,
    pub density: f32,
}

/// Downloads the instance counters of the last kernel cycle.
#[derive(Default)]
pub struct GpuCounterReadback {
    staging: Option<StaticBuffer<u32>>,
    download: Option<Task<Option<Vec<u32>>>>,
    counts: Option<Vec<u32>>,
    reset_requested: bool,
}

impl GpuCounterReadback {
    fn prepare_staging(&mut self, device: &RenderDevice, size: BufferAddress) {
        self.download = None;
        self.counts = None;
        self.staging = Some(StaticBuffer::empty_sized(
            "instance_counter_staging_buffer",
            device,
            size,
            BufferUsages::COPY_DST | BufferUsages::MAP_READ,
        ));
    }

    fn start_download(&mut self) {
        let Some(staging) = self.staging.take() else {
            return;
        };

        self.download = Some(AsyncComputeTaskPool::get().spawn(async move {
            let (tx, rx) = async_channel::bounded(1);

            let buffer_slice = staging.slice(..);

            buffer_slice.map_async(MapMode::Read, move |result| {
                tx.try_send(result).ok();
            });

            if let Err(error) = rx.recv().await.ok()? {
                warn!("failed to read back the instance counters: {error}");
                return None;
            }

            let data = buffer_slice.get_mapped_range();
            let counts: Vec<u32> = bytemuck::cast_slice(&data[..]).to_vec();

            drop(data);
            staging.unmap();

            Some(counts)
        }));
    }
}

impl InstanceCounters for GpuCounterReadback {
    fn poll_fence(&mut self) -> bool {
        if self.counts.is_some() {
            return true;
        }

        let Some(download) = &mut self.download else {
            return false;
        };

        if let Some(counts) = future::block_on(future::poll_once(download)) {
            // a failed download never signals, the next cycle replaces it
            self.download = None;
            self.counts = counts;
        }

        self.counts.is_some()
    }

    fn read_counters(&mut self) -> Vec<u32> {
        self.counts.take().unwrap_or_default()
    }

    fn reset_counters(&mut self) {
        self.reset_requested = true;
    }
}

struct GpuInstancedModel {
    shader: Handle<Shader>,
    meshes: Vec<AssetId<Mesh>>,
}

/// The instance slots, the model table and the counters shared with the height kernel.
#[derive(Resource)]
pub struct GpuInstanceBuffers {
    pub(crate) feedback: InstanceFeedback<AssetId<Shader>>,
    models: Vec<GpuInstancedModel>,
    pub(crate) instances: StaticBuffer<InstanceData>,
    pub(crate) model_slots: StaticBuffer<GpuModelSlot>,
    pub(crate) counters: StaticBuffer<u32>,
    readback: GpuCounterReadback,
}

impl GpuInstanceBuffers {
    pub(crate) fn new(
        device: &RenderDevice,
        slot_size: u32,
        models: &[InstancedModel],
        default_shader: &Handle<Shader>,
    ) -> Self {
        let mut feedback = InstanceFeedback::new(slot_size);

        let models = models
            .iter()
            .map(|model| {
                let shader = model
                    .shader
                    .clone()
                    .unwrap_or_else(|| default_shader.clone());
                feedback.register_model(model.label.clone(), shader.id(), model.density);

                GpuInstancedModel {
                    shader,
                    meshes: model.meshes.iter().map(Handle::id).collect(),
                }
            })
            .collect_vec();

        let mut model_slots = feedback
            .models()
            .iter()
            .map(|model| GpuModelSlot {
                base_offset: model.base_offset,
                density: model.density,
            })
            .collect_vec();

        // bindings may not be empty
        let instance_count = feedback.instance_buffer_len().max(1);
        let slot_count = model_slots.len().max(1);
        model_slots.resize(slot_count, GpuModelSlot::default());

        let instances = StaticBuffer::empty_sized(
            "instance_buffer",
            device,
            (instance_count as usize * mem::size_of::<InstanceData>()) as BufferAddress,
            BufferUsages::STORAGE | BufferUsages::VERTEX,
        );
        let model_slots = StaticBuffer::create_slice(
            "model_slot_buffer",
            device,
            &model_slots,
            BufferUsages::STORAGE,
        );
        let counters = StaticBuffer::create_slice(
            "instance_counter_buffer",
            device,
            &vec![0; slot_count],
            BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        );

        info!(
            "created the instance buffers for {} models with {} instances each",
            models.len(),
            slot_size
        );

        Self {
            feedback,
            models,
            instances,
            model_slots,
            counters,
            readback: default(),
        }
    }

    fn counters_size(&self) -> BufferAddress {
        (self.models.len().max(1) * mem::size_of::<u32>()) as BufferAddress
    }

    /// Whether the models only differ in their shaders and meshes, which needs no new slots.
    fn has_slots_of(&self, models: &[InstancedModel]) -> bool {
        self.feedback.models().len() == models.len()
            && self
                .feedback
                .models()
                .iter()
                .zip(models)
                .all(|(slot, model)| slot.label == model.label && slot.density == model.density)
    }

    fn update_models(&mut self, models: &[InstancedModel], default_shader: &Handle<Shader>) {
        for (index, (gpu_model, model)) in self.models.iter_mut().zip(models).enumerate() {
            gpu_model.shader = model
                .shader
                .clone()
                .unwrap_or_else(|| default_shader.clone());
            gpu_model.meshes = model.meshes.iter().map(Handle::id).collect();

            self.feedback
                .set_program(ModelId(index as u32), gpu_model.shader.id());
        }
    }

    /// Starts a new counting cycle. Called right before the kernel is dispatched.
    pub(crate) fn arm_cycle(&mut self, device: &RenderDevice, queue: &RenderQueue) {
        self.feedback.arm_cycle(&mut self.readback);
        self.readback.prepare_staging(device, self.counters_size());
        self.write_counter_reset(queue);
    }

    fn write_counter_reset(&mut self, queue: &RenderQueue) {
        if mem::take(&mut self.readback.reset_requested) {
            self.counters
                .update_slice(queue, &vec![0; self.models.len().max(1)]);
        }
    }

    /// Copies the counters into the staging buffer, after the last kernel dispatch.
    pub(crate) fn record_counter_copy(&self, encoder: &mut CommandEncoder) {
        if let Some(staging) = &self.readback.staging {
            encoder.copy_buffer_to_buffer(&self.counters, 0, staging, 0, self.counters_size());
        }
    }
}

pub(crate) fn prepare_instance_buffers(
    device: Res<RenderDevice>,
    model_pipeline: Res<InstancedModelPipeline>,
    terrain: Res<GpuTerrainBuffers>,
    mut extracted: ResMut<ExtractedInstancedModels>,
    mut buffers: ResMut<GpuInstanceBuffers>,
    mut kernel: ResMut<HeightKernelState>,
) {
    if !mem::take(&mut extracted.changed) {
        return;
    }

    let default_shader = &model_pipeline.default_shader;

    if buffers.has_slots_of(&extracted.models) {
        buffers.update_models(&extracted.models, default_shader);
    } else {
        *buffers = GpuInstanceBuffers::new(
            &device,
            terrain.arena_vertex_count,
            &extracted.models,
            default_shader,
        );

        // the new slots have to be filled
        kernel.dispatched_generation = 0;
    }
}

pub(crate) fn poll_instance_feedback(
    queue: Res<RenderQueue>,
    mut buffers: ResMut<GpuInstanceBuffers>,
) {
    let buffers = &mut *buffers;

    if buffers.feedback.poll_and_maybe_swap(&mut buffers.readback) == PollOutcome::Swapped {
        debug!(
            "swapped in the instance counts {:?}",
            buffers
                .feedback
                .models()
                .iter()
                .map(|model| model.instance_count)
                .collect_vec()
        );
    }

    buffers.write_counter_reset(&queue);
}

pub(crate) fn start_counter_readback(
    kernel: Res<HeightKernelState>,
    mut buffers: ResMut<GpuInstanceBuffers>,
) {
    if kernel.is_running() {
        buffers.readback.start_download();
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct InstancedModelKey {
    pub shader: Handle<Shader>,
    pub flags: TerrainPipelineKey,
    pub topology: PrimitiveTopology,
}

#[derive(Resource)]
pub struct InstancedModelPipeline {
    view_layout: BindGroupLayout,
    view_layout_multisampled: BindGroupLayout,
    pub(crate) default_shader: Handle<Shader>,
}

impl FromWorld for InstancedModelPipeline {
    fn from_world(world: &mut World) -> Self {
        let mesh_pipeline = world.resource::<MeshPipeline>();

        Self {
            view_layout: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::empty())
                .clone(),
            view_layout_multisampled: mesh_pipeline
                .get_view_layout(MeshPipelineViewLayoutKey::MULTISAMPLED)
                .clone(),
            default_shader: world.load_asset(INSTANCED_MODEL_SHADER),
        }
    }
}

impl SpecializedMeshPipeline for InstancedModelPipeline {
    type Key = InstancedModelKey;

    fn specialize(
        &self,
        key: Self::Key,
        layout: &MeshVertexBufferLayoutRef,
    ) -> Result<RenderPipelineDescriptor, SpecializedMeshPipelineError> {
        let mesh_layout = layout.0.get_layout(&[
            Mesh::ATTRIBUTE_POSITION.at_shader_location(0),
            Mesh::ATTRIBUTE_NORMAL.at_shader_location(1),
        ])?;

        let instance_layout = VertexBufferLayout {
            array_stride: mem::size_of::<InstanceData>() as BufferAddress,
            step_mode: VertexStepMode::Instance,
            attributes: vec![VertexAttribute {
                format: VertexFormat::Float32x4,
                offset: 0,
                shader_location: 2,
            }],
        };

        let view_layout = match key.flags.msaa_samples() {
            1 => self.view_layout.clone(),
            _ => self.view_layout_multisampled.clone(),
        };

        Ok(RenderPipelineDescriptor {
            label: Some("instanced_model_pipeline".into()),
            layout: vec![view_layout],
            push_constant_ranges: default(),
            vertex: VertexState {
                shader: key.shader.clone(),
                entry_point: "vertex".into(),
                shader_defs: default(),
                buffers: vec![mesh_layout, instance_layout],
            },
            primitive: PrimitiveState {
                front_face: FrontFace::Ccw,
                cull_mode: Some(Face::Back),
                unclipped_depth: false,
                polygon_mode: key.flags.polygon_mode(),
                conservative: false,
                topology: key.topology,
                strip_index_format: None,
            },
            fragment: Some(FragmentState {
                shader: key.shader,
                shader_defs: default(),
                entry_point: "fragment".into(),
                targets: vec![Some(ColorTargetState {
                    format: key.flags.target_format(),
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
                count: key.flags.msaa_samples(),
                mask: !0,
                alpha_to_coverage_enabled: false,
            },
            zero_initialize_workgroup_memory: false,
        })
    }
}

/// The specialized pipeline of every model, per view.
#[derive(Default, Deref, DerefMut, Resource)]
pub struct ViewModelPipelines(EntityHashMap<Vec<Option<CachedRenderPipelineId>>>);

#[allow(clippy::too_many_arguments)]
pub(crate) fn queue_instanced_models(
    draw_functions: Res<DrawFunctions<Transparent3d>>,
    debug: Option<Res<DebugTerrain>>,
    pipeline_cache: Res<PipelineCache>,
    model_pipeline: Res<InstancedModelPipeline>,
    mut pipelines: ResMut<SpecializedMeshPipelines<InstancedModelPipeline>>,
    meshes: Res<RenderAssets<RenderMesh>>,
    buffers: Res<GpuInstanceBuffers>,
    mut view_pipelines: ResMut<ViewModelPipelines>,
    mut phases: ResMut<ViewSortedRenderPhases<Transparent3d>>,
    views: Query<(Entity, &MainEntity, &ExtractedView, &Msaa)>,
) {
    view_pipelines.clear();

    if buffers.models.is_empty() {
        return;
    }

    let draw_function = draw_functions.read().id::<DrawInstancedModels>();

    for (render_view, &main_view, view, msaa) in &views {
        let Some(phase) = phases.get_mut(&render_view) else {
            continue;
        };

        let mut flags = TerrainPipelineKey::from_msaa_samples(msaa.samples())
            | TerrainPipelineKey::from_hdr(view.hdr);

        if let Some(debug) = &debug {
            flags |= TerrainPipelineKey::from_debug(debug) & TerrainPipelineKey::WIREFRAME;
        }

        let model_pipelines = buffers
            .models
            .iter()
            .map(|model| {
                let mesh = meshes.get(*model.meshes.first()?)?;

                let key = InstancedModelKey {
                    shader: model.shader.clone(),
                    flags,
                    topology: mesh.primitive_topology(),
                };

                match pipelines.specialize(&pipeline_cache, &model_pipeline, key, &mesh.layout) {
                    Ok(pipeline) => Some(pipeline),
                    Err(error) => {
                        warn_once!("failed to specialize an instanced model: {error}");
                        None
                    }
                }
            })
            .collect_vec();

        let Some(&pipeline) = model_pipelines.iter().flatten().next() else {
            continue;
        };

        view_pipelines.insert(render_view, model_pipelines);

        phase.add(Transparent3d {
            entity: (render_view, main_view),
            draw_function,
            pipeline,
            distance: 0.0,
            batch_range: 0..1,
            extra_index: PhaseItemExtraIndex::NONE,
        });
    }
}

/// Draws the models through a render pass.
struct PassDrawSink<'a, 'w> {
    pass: &'a mut TrackedRenderPass<'w>,
    pipeline_cache: &'w PipelineCache,
    meshes: &'w RenderAssets<RenderMesh>,
    mesh_allocator: &'w MeshAllocator,
    buffers: &'w GpuInstanceBuffers,
    pipelines: &'w [Option<CachedRenderPipelineId>],
}

impl PassDrawSink<'_, '_> {
    fn set_model_pipeline(&mut self, model: usize) -> bool {
        let pipeline_cache = self.pipeline_cache;
        let pipeline = self
            .pipelines
            .get(model)
            .copied()
            .flatten()
            .and_then(|id| pipeline_cache.get_render_pipeline(id));

        match pipeline {
            Some(pipeline) => {
                self.pass.set_render_pipeline(pipeline);
                true
            }
            None => false,
        }
    }
}

impl InstancedDrawSink<AssetId<Shader>> for PassDrawSink<'_, '_> {
    fn use_program(&mut self, model: ModelId, program: &AssetId<Shader>) -> bool {
        let uses_program = self
            .buffers
            .models
            .get(model.0 as usize)
            .is_some_and(|gpu_model| gpu_model.shader.id() == *program);

        uses_program && self.set_model_pipeline(model.0 as usize)
    }

    fn draw_model(&mut self, model: ModelId, instances: Range<u32>) {
        // models sharing a shader may still differ in their vertex layout
        if !self.set_model_pipeline(model.0 as usize) {
            return;
        }

        let Some(gpu_model) = self.buffers.models.get(model.0 as usize) else {
            return;
        };

        let (meshes, mesh_allocator) = (self.meshes, self.mesh_allocator);

        for mesh in &gpu_model.meshes {
            let Some(gpu_mesh) = meshes.get(*mesh) else {
                continue;
            };
            let Some(vertex_slice) = mesh_allocator.mesh_vertex_slice(mesh) else {
                continue;
            };

            self.pass.set_vertex_buffer(0, vertex_slice.buffer.slice(..));
            self.pass
                .set_vertex_buffer(1, self.buffers.instances.slice(..));

            match &gpu_mesh.buffer_info {
                RenderMeshBufferInfo::Indexed {
                    index_format,
                    count,
                } => {
                    let Some(index_slice) = mesh_allocator.mesh_index_slice(mesh) else {
                        continue;
                    };

                    self.pass
                        .set_index_buffer(index_slice.buffer.slice(..), 0, *index_format);
                    self.pass.draw_indexed(
                        index_slice.range.start..index_slice.range.start + count,
                        vertex_slice.range.start as i32,
                        instances.clone(),
                    );
                }
                RenderMeshBufferInfo::NonIndexed => {
                    self.pass.draw(vertex_slice.range, instances.clone());
                }
            }
        }
    }
}

pub(crate) struct DrawInstancedModelsCommand;

impl<P: PhaseItem> RenderCommand<P> for DrawInstancedModelsCommand {
    type Param = (
        SRes<GpuInstanceBuffers>,
        SRes<ViewModelPipelines>,
        SRes<PipelineCache>,
        SRes<RenderAssets<RenderMesh>>,
        SRes<MeshAllocator>,
    );
    type ViewQuery = Entity;
    type ItemQuery = ();

    #[inline]
    fn render<'w>(
        _: &P,
        view: Entity,
        _: Option<()>,
        (buffers, view_pipelines, pipeline_cache, meshes, mesh_allocator): SystemParamItem<
            'w,
            '_,
            Self::Param,
        >,
        pass: &mut TrackedRenderPass<'w>,
    ) -> RenderCommandResult {
        let buffers = buffers.into_inner();

        let Some(pipelines) = view_pipelines.into_inner().get(&view) else {
            return RenderCommandResult::Skip;
        };

        let mut sink = PassDrawSink {
            pass,
            pipeline_cache: pipeline_cache.into_inner(),
            meshes: meshes.into_inner(),
            mesh_allocator: mesh_allocator.into_inner(),
            buffers,
            pipelines,
        };

        buffers.feedback.issue_draw_calls(&mut sink);

        RenderCommandResult::Success
    }
}

pub(crate) type DrawInstancedModels = (
    SetItemPipeline,
    SetMeshViewBindGroup<0>,
    DrawInstancedModelsCommand,
);
