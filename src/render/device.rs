use super::*;

/// Explicit, handle-based GPU API.
///
/// Every resource is created by a call that returns a [`Rid`] and lives until
/// [`RenderDevice::free`]. There is no reference counting: freeing a resource
/// that something else still uses is a caller bug. Dependent handles (a
/// pipeline built from a shader, a uniform set built against a shader) must be
/// freed before the handle they depend on.
///
/// Draw and compute lists record commands between `begin` and `end`; the work
/// is submitted at `end`, in call order. Only one list of each kind may be
/// open at a time.
pub trait RenderDevice {
    /// Creates a texture, optionally filled with one byte slice per mip.
    fn texture_create(&mut self, desc: &TextureDesc, data: &[Vec<u8>]) -> Result<Rid, DeviceError>;
    /// Replaces one full mip level. Requires [`TextureUsage::CAN_UPDATE`].
    fn texture_update(&mut self, texture: Rid, mip: u32, data: &[u8]) -> Result<(), DeviceError>;
    /// Reads one mip level back, tightly packed. Requires
    /// [`TextureUsage::CAN_COPY_FROM`].
    fn texture_get_data(&mut self, texture: Rid, mip: u32) -> Result<Vec<u8>, DeviceError>;
    fn texture_desc(&self, texture: Rid) -> Result<TextureDesc, DeviceError>;

    fn buffer_create(&mut self, kind: BufferKind, size: u64, data: Option<&[u8]>) -> Result<Rid, DeviceError>;
    fn buffer_update(&mut self, buffer: Rid, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Groups one buffer per attribute; `buffers[i]` feeds location `i`.
    fn vertex_array_create(&mut self, vertex_count: u32, buffers: &[Rid]) -> Result<Rid, DeviceError>;
    fn index_array_create(&mut self, index_buffer: Rid, index_count: u32) -> Result<Rid, DeviceError>;

    fn shader_create(&mut self, desc: &ShaderDesc) -> Result<Rid, DeviceError>;
    fn framebuffer_create(&mut self, attachments: &[Rid]) -> Result<Rid, DeviceError>;
    fn render_pipeline_create(
        &mut self,
        shader: Rid,
        framebuffer: Rid,
        attributes: &[VertexAttribute],
        state: &PipelineState,
    ) -> Result<Rid, DeviceError>;
    fn compute_pipeline_create(&mut self, shader: Rid) -> Result<Rid, DeviceError>;
    /// Binds resources for set `set` of `shader`. Every binding the shader
    /// declares must be provided exactly once with a matching kind.
    fn uniform_set_create(&mut self, uniforms: &[Uniform], shader: Rid, set: u32) -> Result<Rid, DeviceError>;

    fn draw_list_begin(&mut self, framebuffer: Rid, clear: ClearValues) -> Result<DrawListId, DeviceError>;
    fn draw_list_bind_render_pipeline(&mut self, list: DrawListId, pipeline: Rid) -> Result<(), DeviceError>;
    fn draw_list_bind_uniform_set(&mut self, list: DrawListId, uniform_set: Rid, set: u32) -> Result<(), DeviceError>;
    fn draw_list_bind_vertex_array(&mut self, list: DrawListId, vertex_array: Rid) -> Result<(), DeviceError>;
    fn draw_list_bind_index_array(&mut self, list: DrawListId, index_array: Rid) -> Result<(), DeviceError>;
    /// Draws the bound arrays. With a patch pipeline each index triple is one
    /// patch.
    fn draw_list_draw(&mut self, list: DrawListId, use_indices: bool, instances: u32) -> Result<(), DeviceError>;
    fn draw_list_end(&mut self, list: DrawListId) -> Result<(), DeviceError>;

    fn compute_list_begin(&mut self) -> Result<ComputeListId, DeviceError>;
    fn compute_list_bind_compute_pipeline(&mut self, list: ComputeListId, pipeline: Rid) -> Result<(), DeviceError>;
    fn compute_list_bind_uniform_set(&mut self, list: ComputeListId, uniform_set: Rid, set: u32) -> Result<(), DeviceError>;
    fn compute_list_dispatch(&mut self, list: ComputeListId, x: u32, y: u32, z: u32) -> Result<(), DeviceError>;
    fn compute_list_end(&mut self, list: ComputeListId) -> Result<(), DeviceError>;

    fn free(&mut self, rid: Rid) -> Result<(), DeviceError>;
    fn is_valid(&self, rid: Rid) -> bool;
}

/// Frees `rid` if it is live, logging instead of failing. Used on teardown
/// paths that must not stop halfway.
pub fn free_if_valid(device: &mut dyn RenderDevice, rid: Rid) {
    if rid.is_invalid() || !device.is_valid(rid) {
        return;
    }
    if let Err(err) = device.free(rid) {
        log::warn!("failed to free {:?}: {}", rid, err);
    }
}
