//! Renderer: drawable bound to a material
//!
//! A renderer is one mesh plus the material that draws it. The GPU buffers
//! are immutable after creation; the draw range and material binding can
//! change, and any such change forces re-recording of the command buffers
//! that reference this renderer.

use slotmap::new_key_type;

use crate::render::graphics::material::{Invalidate, MaterialKey};
use crate::render::vulkan::buffer::{IndexBuffer, VertexBuffer};

new_key_type! {
    /// Arena key for renderers
    pub struct RendererKey;
}

/// Mesh geometry with a material binding and a draw range
pub struct Renderer {
    vertex_buffer: VertexBuffer,
    index_buffer: IndexBuffer,
    first_index: u32,
    index_count: u32,
    material: Option<MaterialKey>,
}

impl Renderer {
    /// Create a renderer drawing the full index range with no material
    pub(crate) fn new(vertex_buffer: VertexBuffer, index_buffer: IndexBuffer) -> Self {
        let index_count = index_buffer.index_count();
        Self {
            vertex_buffer,
            index_buffer,
            first_index: 0,
            index_count,
            material: None,
        }
    }

    /// Bind the material used to draw this mesh
    pub fn set_material(&mut self, material: Option<MaterialKey>) -> Invalidate {
        if self.material == material {
            return Invalidate::None;
        }
        self.material = material;
        Invalidate::Commands
    }

    /// Restrict drawing to a sub-range of the index buffer.
    ///
    /// The range is clamped to the buffer; a draw past the end is a recorded
    /// command the GPU would fault on.
    pub fn set_draw_range(&mut self, first_index: u32, index_count: u32) -> Invalidate {
        let total = self.index_buffer.index_count();
        let first = first_index.min(total);
        let count = index_count.min(total - first);
        if self.first_index == first && self.index_count == count {
            return Invalidate::None;
        }
        self.first_index = first;
        self.index_count = count;
        Invalidate::Commands
    }

    /// Bound material, if any
    pub fn material(&self) -> Option<MaterialKey> {
        self.material
    }

    /// Vertex buffer to bind
    pub fn vertex_buffer(&self) -> &VertexBuffer {
        &self.vertex_buffer
    }

    /// Index buffer to bind
    pub fn index_buffer(&self) -> &IndexBuffer {
        &self.index_buffer
    }

    /// First index of the draw range
    pub fn first_index(&self) -> u32 {
        self.first_index
    }

    /// Number of indices drawn
    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}
