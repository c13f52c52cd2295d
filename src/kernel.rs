//! Planning of the height kernel dispatches.
//!
//! The kernel displaces the vertices of every chunk in batches. Each batch is dispatched on its
//! own and separated from its neighbours by a full memory barrier, so that no dispatch observes
//! a partially written vertex arena. After the last chunk the instance count fence is armed.

use crate::chunk_grid::TerrainChunk;
use bevy::math::Vec2;

/// The number of threads per workgroup of the height kernel.
pub const WORKGROUP_SIZE: u32 = 256;
/// The maximum number of vertices displaced by a single dispatch.
pub const VERTICES_PER_DISPATCH: u32 = 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct KernelDispatch {
    pub chunk_index: u32,
    pub chunk_position: Vec2,
    pub step_size: u32,
    /// The first vertex of the batch inside the vertex arena.
    pub vertex_offset: u32,
    pub vertex_count: u32,
    pub workgroups: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum KernelCommand {
    /// Sets the world offset and the step size of the following dispatches.
    BindChunk {
        chunk_index: u32,
        position: Vec2,
        step_size: u32,
    },
    /// All previous writes have to be visible to all following commands.
    Barrier,
    Dispatch(KernelDispatch),
    /// Marks the end of the cycle, after which the instance counters can be read back.
    ArmFence,
}

#[derive(Clone, Debug, Default)]
pub struct KernelPlan {
    commands: Vec<KernelCommand>,
}

impl KernelPlan {
    pub fn new(chunks: &[TerrainChunk]) -> Self {
        let mut commands = Vec::new();

        for chunk in chunks {
            commands.push(KernelCommand::BindChunk {
                chunk_index: chunk.index(),
                position: chunk.position,
                step_size: chunk.step_size,
            });

            let region = chunk.region;
            let mut start = 0;

            while start < region.vertex_count {
                let vertex_count = VERTICES_PER_DISPATCH.min(region.vertex_count - start);

                commands.push(KernelCommand::Barrier);
                commands.push(KernelCommand::Dispatch(KernelDispatch {
                    chunk_index: chunk.index(),
                    chunk_position: chunk.position,
                    step_size: chunk.step_size,
                    vertex_offset: region.vertex_offset + start,
                    vertex_count,
                    workgroups: vertex_count.div_ceil(WORKGROUP_SIZE),
                }));
                commands.push(KernelCommand::Barrier);

                start += vertex_count;
            }
        }

        commands.push(KernelCommand::ArmFence);

        Self { commands }
    }

    pub fn commands(&self) -> &[KernelCommand] {
        &self.commands
    }

    pub fn dispatches(&self) -> impl Iterator<Item = &KernelDispatch> {
        self.commands.iter().filter_map(|command| match command {
            KernelCommand::Dispatch(dispatch) => Some(dispatch),
            _ => None,
        })
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatches().count()
    }
}
