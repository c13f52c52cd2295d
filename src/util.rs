use bevy::render::{
    render_resource::*,
    renderer::{RenderDevice, RenderQueue},
};
use bytemuck::Pod;
use std::{marker::PhantomData, ops::Deref};

/// A GPU buffer with a fixed size, typed by the data it is created from.
pub struct StaticBuffer<T> {
    buffer: Buffer,
    marker: PhantomData<T>,
}

impl<T> StaticBuffer<T> {
    pub fn empty_sized<'a>(
        label: impl Into<Option<&'a str>>,
        device: &RenderDevice,
        size: BufferAddress,
        usage: BufferUsages,
    ) -> Self {
        let buffer = device.create_buffer(&BufferDescriptor {
            label: label.into(),
            size,
            usage,
            mapped_at_creation: false,
        });

        Self {
            buffer,
            marker: PhantomData,
        }
    }

    pub fn update_bytes(&self, queue: &RenderQueue, bytes: &[u8]) {
        queue.write_buffer(&self.buffer, 0, bytes);
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }
}

impl<T: Pod> StaticBuffer<T> {
    pub fn create_slice<'a>(
        label: impl Into<Option<&'a str>>,
        device: &RenderDevice,
        values: &[T],
        usage: BufferUsages,
    ) -> Self {
        let buffer = device.create_buffer_with_data(&BufferInitDescriptor {
            label: label.into(),
            usage,
            contents: bytemuck::cast_slice(values),
        });

        Self {
            buffer,
            marker: PhantomData,
        }
    }

    pub fn update_slice(&self, queue: &RenderQueue, values: &[T]) {
        queue.write_buffer(&self.buffer, 0, bytemuck::cast_slice(values));
    }
}

impl<T> Deref for StaticBuffer<T> {
    type Target = Buffer;

    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<'a, T> IntoBinding<'a> for &'a StaticBuffer<T> {
    #[inline]
    fn into_binding(self) -> BindingResource<'a> {
        self.buffer.as_entire_binding()
    }
}
