use super::*;
use wgpu::util::DeviceExt;

const PATCH_GROUP_ID: u32 = 1;
const PATCH_POSITIONS_IDX: u32 = 0;
const PATCH_NORMALS_IDX: u32 = 1;
const PATCH_UVS_IDX: u32 = 2;
const PATCH_INDICES_IDX: u32 = 3;

struct TextureEntry {
    desc: TextureDesc,
    texture: wgpu::Texture,
    /// Every mip; used for sampling.
    view: wgpu::TextureView,
    /// Mip 0 only; used for attachments and storage writes.
    base_view: wgpu::TextureView,
}

struct BufferEntry {
    kind: BufferKind,
    buffer: wgpu::Buffer,
    size: u64,
}

struct VertexArrayEntry {
    vertex_count: u32,
    buffers: Vec<Rid>,
}

struct IndexArrayEntry {
    buffer: Rid,
    count: u32,
}

struct ShaderEntry {
    desc: ShaderDesc,
    module: wgpu::ShaderModule,
    layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

struct FramebufferEntry {
    colors: Vec<Rid>,
    depth: Option<Rid>,
    color_formats: Vec<wgpu::TextureFormat>,
}

struct RenderPipelineEntry {
    pipeline: wgpu::RenderPipeline,
    attributes: Vec<VertexAttribute>,
    /// `Some(max_level)` for patch pipelines.
    patch_level: Option<u32>,
}

enum Entry {
    Texture(TextureEntry),
    Buffer(BufferEntry),
    VertexArray(VertexArrayEntry),
    IndexArray(IndexArrayEntry),
    Shader(ShaderEntry),
    Framebuffer(FramebufferEntry),
    RenderPipeline(RenderPipelineEntry),
    ComputePipeline(wgpu::ComputePipeline),
    UniformSet(wgpu::BindGroup),
}

impl Entry {
    fn kind(&self) -> &'static str {
        match self {
            Self::Texture(_) => "texture",
            Self::Buffer(_) => "buffer",
            Self::VertexArray(_) => "vertex array",
            Self::IndexArray(_) => "index array",
            Self::Shader(_) => "shader",
            Self::Framebuffer(_) => "framebuffer",
            Self::RenderPipeline(_) => "render pipeline",
            Self::ComputePipeline(_) => "compute pipeline",
            Self::UniformSet(_) => "uniform set",
        }
    }
}

#[derive(Copy, Clone)]
enum DrawCommand {
    Pipeline(Rid),
    UniformSet(Rid, u32),
    VertexArray(Rid),
    IndexArray(Rid),
    Draw { use_indices: bool, instances: u32 },
}

struct OpenDrawList {
    id: u64,
    framebuffer: Rid,
    clear: ClearValues,
    pipeline: Option<Rid>,
    vertex_array: Option<Rid>,
    index_array: Option<Rid>,
    commands: Vec<DrawCommand>,
}

#[derive(Copy, Clone)]
enum ComputeCommand {
    Pipeline(Rid),
    UniformSet(Rid, u32),
    Dispatch(u32, u32, u32),
}

struct OpenComputeList {
    id: u64,
    commands: Vec<ComputeCommand>,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

fn wgpu_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(TextureUsage::SAMPLING) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(TextureUsage::STORAGE) {
        out |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if usage.intersects(TextureUsage::COLOR_ATTACHMENT | TextureUsage::DEPTH_ATTACHMENT) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if usage.contains(TextureUsage::CAN_UPDATE) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    if usage.contains(TextureUsage::CAN_COPY_FROM) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    out
}

fn wgpu_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
    }
}

fn wgpu_compare(op: Option<CompareOp>) -> wgpu::CompareFunction {
    match op {
        Some(CompareOp::Less) => wgpu::CompareFunction::Less,
        Some(CompareOp::LessOrEqual) => wgpu::CompareFunction::LessEqual,
        Some(CompareOp::Always) | None => wgpu::CompareFunction::Always,
    }
}

fn wgpu_cull(cull: CullMode) -> Option<wgpu::Face> {
    match cull {
        CullMode::None => None,
        CullMode::Front => Some(wgpu::Face::Front),
        CullMode::Back => Some(wgpu::Face::Back),
    }
}

fn wgpu_blend(blend: BlendMode) -> wgpu::BlendState {
    match blend {
        BlendMode::Replace => wgpu::BlendState::REPLACE,
        BlendMode::Alpha => wgpu::BlendState::ALPHA_BLENDING,
    }
}

fn layout_entry(decl: &BindingDecl, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    let ty = match decl.kind {
        BindingKind::UniformBuffer => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingKind::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::DepthTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        BindingKind::StorageTexture(format) => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu_format(format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    };
    wgpu::BindGroupLayoutEntry {
        binding: decl.binding,
        visibility,
        ty,
        count: None,
    }
}

fn patch_storage_entry(binding: u32) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::VERTEX,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: true },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

/// [`RenderDevice`] on top of wgpu.
///
/// wgpu has no tessellation stages, so patch pipelines run the
/// tessellation-evaluation source as the vertex entry point. Each patch is
/// one instance; its vertices walk a barycentric lattice at the pipeline's
/// maximum level and read their control points from the bound vertex and
/// index buffers through a second bind group (group 1).
pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    next: u64,
    entries: HashMap<Rid, Entry>,
    patch_layout: wgpu::BindGroupLayout,
    patch_groups: HashMap<(Rid, Rid), wgpu::BindGroup>,
    open_draw: Option<OpenDrawList>,
    open_compute: Option<OpenComputeList>,
}

impl WgpuDevice {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        let patch_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Patch Control Point Bind Group Layout"),
            entries: &[
                patch_storage_entry(PATCH_POSITIONS_IDX),
                patch_storage_entry(PATCH_NORMALS_IDX),
                patch_storage_entry(PATCH_UVS_IDX),
                patch_storage_entry(PATCH_INDICES_IDX),
            ],
        });
        Self {
            device,
            queue,
            next: 0,
            entries: HashMap::new(),
            patch_layout,
            patch_groups: HashMap::new(),
            open_draw: None,
            open_compute: None,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Full-mip view of a texture, for passes outside the device (the
    /// swapchain blit).
    pub fn texture_view(&self, texture: Rid) -> Option<&wgpu::TextureView> {
        match self.entries.get(&texture) {
            Some(Entry::Texture(entry)) => Some(&entry.view),
            _ => None,
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    fn insert(&mut self, entry: Entry) -> Rid {
        let rid = Rid(self.next_id());
        self.entries.insert(rid, entry);
        rid
    }

    fn entry(&self, rid: Rid) -> Result<&Entry, DeviceError> {
        self.entries.get(&rid).ok_or(DeviceError::UnknownHandle(rid))
    }

    /// Runs `make` inside a validation error scope.
    fn validated<T>(&self, make: impl FnOnce(&wgpu::Device) -> T) -> Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = make(&self.device);
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    fn texture(&self, rid: Rid) -> Result<&TextureEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::Texture(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "texture")),
        }
    }

    fn buffer(&self, rid: Rid) -> Result<&BufferEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::Buffer(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "buffer")),
        }
    }

    fn vertex_array(&self, rid: Rid) -> Result<&VertexArrayEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::VertexArray(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "vertex array")),
        }
    }

    fn index_array(&self, rid: Rid) -> Result<&IndexArrayEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::IndexArray(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "index array")),
        }
    }

    fn shader(&self, rid: Rid) -> Result<&ShaderEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::Shader(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "shader")),
        }
    }

    fn framebuffer(&self, rid: Rid) -> Result<&FramebufferEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::Framebuffer(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "framebuffer")),
        }
    }

    fn render_pipeline(&self, rid: Rid) -> Result<&RenderPipelineEntry, DeviceError> {
        match self.entry(rid)? {
            Entry::RenderPipeline(entry) => Ok(entry),
            other => Err(wrong_kind(rid, other, "render pipeline")),
        }
    }

    fn compute_pipeline(&self, rid: Rid) -> Result<&wgpu::ComputePipeline, DeviceError> {
        match self.entry(rid)? {
            Entry::ComputePipeline(pipeline) => Ok(pipeline),
            other => Err(wrong_kind(rid, other, "compute pipeline")),
        }
    }

    fn uniform_set(&self, rid: Rid) -> Result<&wgpu::BindGroup, DeviceError> {
        match self.entry(rid)? {
            Entry::UniformSet(group) => Ok(group),
            other => Err(wrong_kind(rid, other, "uniform set")),
        }
    }

    fn open_draw(&mut self, list: DrawListId) -> Result<&mut OpenDrawList, DeviceError> {
        match &mut self.open_draw {
            Some(open) if open.id == list.0 => Ok(open),
            _ => Err(DeviceError::InvalidUsage(format!("draw list {} is not open", list.0))),
        }
    }

    fn open_compute(&mut self, list: ComputeListId) -> Result<&mut OpenComputeList, DeviceError> {
        match &mut self.open_compute {
            Some(open) if open.id == list.0 => Ok(open),
            _ => Err(DeviceError::InvalidUsage(format!("compute list {} is not open", list.0))),
        }
    }

    fn ensure_patch_group(&mut self, vertex_array: Rid, index_array: Rid) -> Result<(), DeviceError> {
        if self.patch_groups.contains_key(&(vertex_array, index_array)) {
            return Ok(());
        }
        let buffers = &self.vertex_array(vertex_array)?.buffers;
        if buffers.len() < 3 {
            return Err(DeviceError::InvalidUsage(
                "patch pipelines need position, normal and uv buffers".into(),
            ));
        }
        let positions = &self.buffer(buffers[0])?.buffer;
        let normals = &self.buffer(buffers[1])?.buffer;
        let uvs = &self.buffer(buffers[2])?.buffer;
        let indices = &self.buffer(self.index_array(index_array)?.buffer)?.buffer;
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Patch Control Point Bind Group"),
            layout: &self.patch_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: PATCH_POSITIONS_IDX,
                    resource: positions.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: PATCH_NORMALS_IDX,
                    resource: normals.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: PATCH_UVS_IDX,
                    resource: uvs.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: PATCH_INDICES_IDX,
                    resource: indices.as_entire_binding(),
                },
            ],
        });
        self.patch_groups.insert((vertex_array, index_array), group);
        Ok(())
    }

    fn submit_draw_list(&mut self, list: OpenDrawList) -> Result<(), DeviceError> {
        // Patch bind groups need `&mut self`, so build them before the pass
        // borrows the entries.
        let (mut pipeline, mut vertex_array, mut index_array) = (None, None, None);
        for command in &list.commands {
            match *command {
                DrawCommand::Pipeline(rid) => pipeline = Some(rid),
                DrawCommand::VertexArray(rid) => vertex_array = Some(rid),
                DrawCommand::IndexArray(rid) => index_array = Some(rid),
                DrawCommand::Draw { .. } => {
                    if let (Some(p), Some(va), Some(ia)) = (pipeline, vertex_array, index_array) {
                        if self.render_pipeline(p)?.patch_level.is_some() {
                            self.ensure_patch_group(va, ia)?;
                        }
                    }
                }
                DrawCommand::UniformSet(..) => {}
            }
        }

        let framebuffer = self.framebuffer(list.framebuffer)?;
        let color_load = match list.clear.color {
            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
            None => wgpu::LoadOp::Load,
        };
        let mut color_attachments = Vec::with_capacity(framebuffer.colors.len());
        for &color in &framebuffer.colors {
            color_attachments.push(Some(wgpu::RenderPassColorAttachment {
                view: &self.texture(color)?.base_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            }));
        }
        let depth_stencil_attachment = match framebuffer.depth {
            Some(depth) => Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.texture(depth)?.base_view,
                depth_ops: Some(wgpu::Operations {
                    load: list.clear.depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            None => None,
        };

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Draw List Encoder"),
        });
        {
            let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Draw List"),
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            let mut bound: Option<&RenderPipelineEntry> = None;
            let (mut vertex_array, mut index_array) = (None, None);
            for command in &list.commands {
                match *command {
                    DrawCommand::Pipeline(rid) => {
                        let entry = self.render_pipeline(rid)?;
                        rpass.set_pipeline(&entry.pipeline);
                        bound = Some(entry);
                    }
                    DrawCommand::UniformSet(rid, set) => {
                        rpass.set_bind_group(set, self.uniform_set(rid)?, &[]);
                    }
                    DrawCommand::VertexArray(rid) => vertex_array = Some(rid),
                    DrawCommand::IndexArray(rid) => index_array = Some(rid),
                    DrawCommand::Draw { use_indices, instances } => {
                        let (Some(pipeline), Some(va)) = (bound, vertex_array) else {
                            return Err(DeviceError::InvalidUsage("draw without pipeline or vertex array".into()));
                        };
                        let vertices = self.vertex_array(va)?;
                        match pipeline.patch_level {
                            Some(level) => {
                                let ia = index_array
                                    .ok_or_else(|| DeviceError::InvalidUsage("patch draw needs an index array".into()))?;
                                let group = self
                                    .patch_groups
                                    .get(&(va, ia))
                                    .ok_or_else(|| DeviceError::InvalidUsage("patch bind group missing".into()))?;
                                rpass.set_bind_group(PATCH_GROUP_ID, group, &[]);
                                let patches = self.index_array(ia)?.count / 3;
                                rpass.draw(0..3 * level * level, 0..patches);
                            }
                            None => {
                                for (slot, attribute) in pipeline.attributes.iter().enumerate() {
                                    let buffer = vertices.buffers.get(attribute.location as usize).ok_or_else(|| {
                                        DeviceError::InvalidUsage(format!(
                                            "vertex array has no buffer for location {}",
                                            attribute.location
                                        ))
                                    })?;
                                    rpass.set_vertex_buffer(slot as u32, self.buffer(*buffer)?.buffer.slice(..));
                                }
                                if use_indices {
                                    let ia = index_array
                                        .ok_or_else(|| DeviceError::InvalidUsage("no index array bound".into()))?;
                                    let indices = self.index_array(ia)?;
                                    rpass.set_index_buffer(
                                        self.buffer(indices.buffer)?.buffer.slice(..),
                                        wgpu::IndexFormat::Uint32,
                                    );
                                    rpass.draw_indexed(0..indices.count, 0, 0..instances);
                                } else {
                                    rpass.draw(0..vertices.vertex_count, 0..instances);
                                }
                            }
                        }
                    }
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn submit_compute_list(&mut self, list: OpenComputeList) -> Result<(), DeviceError> {
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Compute List Encoder"),
        });
        {
            let mut cpass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Compute List"),
                timestamp_writes: None,
            });
            for command in &list.commands {
                match *command {
                    ComputeCommand::Pipeline(rid) => cpass.set_pipeline(self.compute_pipeline(rid)?),
                    ComputeCommand::UniformSet(rid, set) => cpass.set_bind_group(set, self.uniform_set(rid)?, &[]),
                    ComputeCommand::Dispatch(x, y, z) => cpass.dispatch_workgroups(x, y, z),
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }
}

fn wrong_kind(rid: Rid, found: &Entry, expected: &str) -> DeviceError {
    DeviceError::InvalidUsage(format!("{:?} is a {}, expected a {}", rid, found.kind(), expected))
}

impl RenderDevice for WgpuDevice {
    fn texture_create(&mut self, desc: &TextureDesc, data: &[Vec<u8>]) -> Result<Rid, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.mipmaps == 0 {
            return Err(DeviceError::InvalidUsage("empty texture".into()));
        }
        if desc.format.is_depth() && (desc.usage.intersects(TextureUsage::CAN_UPDATE | TextureUsage::STORAGE) || !data.is_empty()) {
            return Err(DeviceError::InvalidFormat(format!(
                "{} cannot be uploaded to or used as storage",
                desc.format.label()
            )));
        }
        if data.len() > desc.mipmaps as usize {
            return Err(DeviceError::InvalidUsage("more mip data than mip levels".into()));
        }
        for (mip, bytes) in data.iter().enumerate() {
            if bytes.len() != desc.mip_bytes(mip as u32) {
                return Err(DeviceError::InvalidUsage(format!(
                    "mip {} expects {} bytes, got {}",
                    mip,
                    desc.mip_bytes(mip as u32),
                    bytes.len()
                )));
            }
        }

        let mut usage = wgpu_texture_usage(desc.usage);
        if !data.is_empty() {
            usage |= wgpu::TextureUsages::COPY_DST;
        }
        let texture = self
            .validated(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(desc.format.label()),
                    size: wgpu::Extent3d {
                        width: desc.width,
                        height: desc.height,
                        depth_or_array_layers: 1,
                    },
                    mip_level_count: desc.mipmaps,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: wgpu_format(desc.format),
                    usage,
                    view_formats: &[],
                })
            })
            .map_err(DeviceError::InvalidFormat)?;
        for (mip, bytes) in data.iter().enumerate() {
            write_mip(&self.queue, &texture, desc, mip as u32, bytes);
        }
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let base_view = texture.create_view(&wgpu::TextureViewDescriptor {
            base_mip_level: 0,
            mip_level_count: Some(1),
            ..Default::default()
        });
        Ok(self.insert(Entry::Texture(TextureEntry {
            desc: *desc,
            texture,
            view,
            base_view,
        })))
    }

    fn texture_update(&mut self, texture: Rid, mip: u32, data: &[u8]) -> Result<(), DeviceError> {
        let entry = self.texture(texture)?;
        if !entry.desc.usage.contains(TextureUsage::CAN_UPDATE) {
            return Err(DeviceError::InvalidUsage("texture lacks CAN_UPDATE".into()));
        }
        if mip >= entry.desc.mipmaps || data.len() != entry.desc.mip_bytes(mip) {
            return Err(DeviceError::InvalidUsage("texture update size mismatch".into()));
        }
        write_mip(&self.queue, &entry.texture, &entry.desc, mip, data);
        Ok(())
    }

    fn texture_get_data(&mut self, texture: Rid, mip: u32) -> Result<Vec<u8>, DeviceError> {
        let entry = self.texture(texture)?;
        if !entry.desc.usage.contains(TextureUsage::CAN_COPY_FROM) {
            return Err(DeviceError::Readback(format!("{:?} cannot be read back", texture)));
        }
        if mip >= entry.desc.mipmaps {
            return Err(DeviceError::Readback(format!("no mip {}", mip)));
        }
        let (width, height) = entry.desc.mip_size(mip);
        let row_bytes = width * entry.desc.format.bytes_per_texel();
        let padded_row = row_bytes.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded_row as u64 * height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Readback Encoder"),
        });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: mip,
                origin: wgpu::Origin3d::ZERO,
                aspect: if entry.desc.format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        let _ = self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|err| DeviceError::Readback(err.to_string()))?
            .map_err(|err| DeviceError::Readback(err.to_string()))?;

        let mut bytes = Vec::with_capacity((row_bytes * height) as usize);
        {
            let mapped = slice.get_mapped_range();
            for row in mapped.chunks(padded_row as usize) {
                bytes.extend_from_slice(&row[..row_bytes as usize]);
            }
        }
        staging.unmap();
        Ok(bytes)
    }

    fn texture_desc(&self, texture: Rid) -> Result<TextureDesc, DeviceError> {
        Ok(self.texture(texture)?.desc)
    }

    fn buffer_create(&mut self, kind: BufferKind, size: u64, data: Option<&[u8]>) -> Result<Rid, DeviceError> {
        if size == 0 {
            return Err(DeviceError::InvalidUsage("empty buffer".into()));
        }
        let usage = match kind {
            BufferKind::Vertex => wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::STORAGE,
            BufferKind::Index => wgpu::BufferUsages::INDEX | wgpu::BufferUsages::STORAGE,
            BufferKind::Uniform => wgpu::BufferUsages::UNIFORM,
        } | wgpu::BufferUsages::COPY_DST;
        let buffer = match data {
            Some(bytes) if bytes.len() as u64 != size => {
                return Err(DeviceError::InvalidUsage("buffer data size mismatch".into()))
            }
            Some(bytes) => self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: None,
                contents: bytes,
                usage,
            }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            }),
        };
        Ok(self.insert(Entry::Buffer(BufferEntry { kind, buffer, size })))
    }

    fn buffer_update(&mut self, buffer: Rid, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let entry = self.buffer(buffer)?;
        if offset + data.len() as u64 > entry.size {
            return Err(DeviceError::InvalidUsage("buffer update out of range".into()));
        }
        self.queue.write_buffer(&entry.buffer, offset, data);
        Ok(())
    }

    fn vertex_array_create(&mut self, vertex_count: u32, buffers: &[Rid]) -> Result<Rid, DeviceError> {
        for &buffer in buffers {
            if self.buffer(buffer)?.kind != BufferKind::Vertex {
                return Err(DeviceError::InvalidUsage(format!("{:?} is not a vertex buffer", buffer)));
            }
        }
        Ok(self.insert(Entry::VertexArray(VertexArrayEntry {
            vertex_count,
            buffers: buffers.to_vec(),
        })))
    }

    fn index_array_create(&mut self, index_buffer: Rid, index_count: u32) -> Result<Rid, DeviceError> {
        let entry = self.buffer(index_buffer)?;
        if entry.kind != BufferKind::Index || index_count as u64 * 4 > entry.size {
            return Err(DeviceError::InvalidUsage(format!(
                "{:?} cannot hold {} indices",
                index_buffer, index_count
            )));
        }
        Ok(self.insert(Entry::IndexArray(IndexArrayEntry {
            buffer: index_buffer,
            count: index_count,
        })))
    }

    fn shader_create(&mut self, desc: &ShaderDesc) -> Result<Rid, DeviceError> {
        let (source, visibility) = match &desc.source {
            ShaderSource::Tessellated {
                vertex,
                tess_control,
                tess_eval,
                fragment,
            } => (
                [PATCH_PRELUDE_WGSL, vertex.as_str(), tess_control.as_str(), tess_eval.as_str(), fragment.as_str()].join("\n"),
                wgpu::ShaderStages::VERTEX_FRAGMENT,
            ),
            ShaderSource::Raster { vertex, fragment } => (
                match fragment {
                    Some(fragment) => format!("{}\n{}", vertex, fragment),
                    None => vertex.clone(),
                },
                wgpu::ShaderStages::VERTEX_FRAGMENT,
            ),
            ShaderSource::Compute { compute } => (compute.clone(), wgpu::ShaderStages::COMPUTE),
        };
        let module = self
            .validated(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&desc.label),
                    source: wgpu::ShaderSource::Wgsl(source.into()),
                })
            })
            .map_err(|err| DeviceError::ShaderCompile(format!("{}: {}", desc.label, err)))?;

        let entries: Vec<wgpu::BindGroupLayoutEntry> =
            desc.bindings.iter().map(|decl| layout_entry(decl, visibility)).collect();
        let (layout, pipeline_layout) = self
            .validated(|device| {
                let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&desc.label),
                    entries: &entries,
                });
                let mut groups = vec![&layout];
                if desc.is_tessellated() {
                    groups.push(&self.patch_layout);
                }
                let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                    label: Some(&desc.label),
                    bind_group_layouts: &groups,
                    push_constant_ranges: &[],
                });
                (layout, pipeline_layout)
            })
            .map_err(|err| DeviceError::ShaderCompile(format!("{}: {}", desc.label, err)))?;
        log::debug!("compiled shader '{}' ({} bindings)", desc.label, desc.bindings.len());
        Ok(self.insert(Entry::Shader(ShaderEntry {
            desc: desc.clone(),
            module,
            layout,
            pipeline_layout,
        })))
    }

    fn framebuffer_create(&mut self, attachments: &[Rid]) -> Result<Rid, DeviceError> {
        let mut colors = Vec::new();
        let mut color_formats = Vec::new();
        let mut depth = None;
        let mut size = None;
        for &attachment in attachments {
            let desc = self.texture(attachment)?.desc;
            if *size.get_or_insert((desc.width, desc.height)) != (desc.width, desc.height) {
                return Err(DeviceError::InvalidFormat("attachments differ in size".into()));
            }
            if desc.format.is_depth() {
                if !desc.usage.contains(TextureUsage::DEPTH_ATTACHMENT) || depth.replace(attachment).is_some() {
                    return Err(DeviceError::InvalidFormat(format!("{:?} is not a usable depth attachment", attachment)));
                }
            } else {
                if !desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
                    return Err(DeviceError::InvalidFormat(format!("{:?} is not an attachment", attachment)));
                }
                colors.push(attachment);
                color_formats.push(wgpu_format(desc.format));
            }
        }
        Ok(self.insert(Entry::Framebuffer(FramebufferEntry {
            colors,
            depth,
            color_formats,
        })))
    }

    fn render_pipeline_create(
        &mut self,
        shader: Rid,
        framebuffer: Rid,
        attributes: &[VertexAttribute],
        state: &PipelineState,
    ) -> Result<Rid, DeviceError> {
        let shader_entry = self.shader(shader)?;
        let framebuffer = self.framebuffer(framebuffer)?;
        let patch_level = match (state.primitive, shader_entry.desc.is_tessellated()) {
            (Primitive::Triangles, false) => None,
            (Primitive::Patches { control_points: 3, max_level }, true) if max_level > 0 => Some(max_level),
            _ => {
                return Err(DeviceError::PipelineCreate(format!(
                    "{}: primitive {:?} does not fit the shader",
                    shader_entry.desc.label, state.primitive
                )))
            }
        };
        let has_fragment = match &shader_entry.desc.source {
            ShaderSource::Raster { fragment, .. } => fragment.is_some(),
            _ => true,
        };

        let attribute_layouts: Vec<[wgpu::VertexAttribute; 1]> = attributes
            .iter()
            .map(|attribute| {
                [wgpu::VertexAttribute {
                    format: wgpu_vertex_format(attribute.format),
                    offset: 0,
                    shader_location: attribute.location,
                }]
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = if patch_level.is_some() {
            Vec::new()
        } else {
            attributes
                .iter()
                .zip(&attribute_layouts)
                .map(|(attribute, layout)| wgpu::VertexBufferLayout {
                    array_stride: attribute.format.size(),
                    step_mode: wgpu::VertexStepMode::Vertex,
                    attributes: layout,
                })
                .collect()
        };
        let targets: Vec<Option<wgpu::ColorTargetState>> = framebuffer
            .color_formats
            .iter()
            .map(|&format| {
                Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu_blend(state.blend)),
                    write_mask: wgpu::ColorWrites::ALL,
                })
            })
            .collect();
        let constants: HashMap<String, f64> = patch_level
            .map(|level| ("PATCH_MAX_LEVEL".to_string(), level as f64))
            .into_iter()
            .collect();
        let compilation_options = wgpu::PipelineCompilationOptions {
            constants: &constants,
            ..Default::default()
        };

        let pipeline = self
            .validated(|device| {
                device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&shader_entry.desc.label),
                    layout: Some(&shader_entry.pipeline_layout),
                    vertex: wgpu::VertexState {
                        module: &shader_entry.module,
                        entry_point: Some(if patch_level.is_some() { "tess_eval" } else { "vertex_main" }),
                        compilation_options: compilation_options.clone(),
                        buffers: &buffers,
                    },
                    fragment: has_fragment.then(|| wgpu::FragmentState {
                        module: &shader_entry.module,
                        entry_point: Some("fragment_main"),
                        compilation_options: compilation_options.clone(),
                        targets: &targets,
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: wgpu::PrimitiveTopology::TriangleList,
                        strip_index_format: None,
                        front_face: wgpu::FrontFace::Ccw,
                        cull_mode: wgpu_cull(state.cull),
                        unclipped_depth: false,
                        polygon_mode: wgpu::PolygonMode::Fill,
                        conservative: false,
                    },
                    depth_stencil: framebuffer.depth.map(|_| wgpu::DepthStencilState {
                        format: wgpu::TextureFormat::Depth32Float,
                        depth_write_enabled: state.depth_write,
                        depth_compare: wgpu_compare(state.depth_test),
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                })
            })
            .map_err(DeviceError::PipelineCreate)?;
        Ok(self.insert(Entry::RenderPipeline(RenderPipelineEntry {
            pipeline,
            attributes: attributes.to_vec(),
            patch_level,
        })))
    }

    fn compute_pipeline_create(&mut self, shader: Rid) -> Result<Rid, DeviceError> {
        let shader_entry = self.shader(shader)?;
        if !matches!(shader_entry.desc.source, ShaderSource::Compute { .. }) {
            return Err(DeviceError::PipelineCreate(format!("{} is not a compute shader", shader_entry.desc.label)));
        }
        let pipeline = self
            .validated(|device| {
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&shader_entry.desc.label),
                    layout: Some(&shader_entry.pipeline_layout),
                    module: &shader_entry.module,
                    entry_point: Some("compute_main"),
                    compilation_options: Default::default(),
                    cache: None,
                })
            })
            .map_err(DeviceError::PipelineCreate)?;
        Ok(self.insert(Entry::ComputePipeline(pipeline)))
    }

    fn uniform_set_create(&mut self, uniforms: &[Uniform], shader: Rid, set: u32) -> Result<Rid, DeviceError> {
        if set != 0 {
            return Err(DeviceError::InvalidUsage("only set 0 is user-bindable".into()));
        }
        let shader_entry = self.shader(shader)?;
        if shader_entry.desc.bindings.len() != uniforms.len() {
            return Err(DeviceError::InvalidUsage(format!(
                "shader declares {} bindings, got {}",
                shader_entry.desc.bindings.len(),
                uniforms.len()
            )));
        }
        let mut entries = Vec::with_capacity(uniforms.len());
        for decl in &shader_entry.desc.bindings {
            let uniform = uniforms
                .iter()
                .find(|u| u.binding() == decl.binding)
                .ok_or_else(|| DeviceError::InvalidUsage(format!("binding {} missing", decl.binding)))?;
            let resource = match (decl.kind, uniform) {
                (BindingKind::UniformBuffer, Uniform::Buffer { buffer, .. }) => {
                    self.buffer(*buffer)?.buffer.as_entire_binding()
                }
                (BindingKind::Texture | BindingKind::DepthTexture, Uniform::Texture { texture, .. }) => {
                    wgpu::BindingResource::TextureView(&self.texture(*texture)?.view)
                }
                (BindingKind::StorageTexture(_), Uniform::StorageTexture { texture, .. }) => {
                    wgpu::BindingResource::TextureView(&self.texture(*texture)?.base_view)
                }
                _ => return Err(DeviceError::InvalidUsage(format!("binding {} has the wrong kind", decl.binding))),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: decl.binding,
                resource,
            });
        }
        let group = self
            .validated(|device| {
                device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(&shader_entry.desc.label),
                    layout: &shader_entry.layout,
                    entries: &entries,
                })
            })
            .map_err(DeviceError::InvalidUsage)?;
        Ok(self.insert(Entry::UniformSet(group)))
    }

    fn draw_list_begin(&mut self, framebuffer: Rid, clear: ClearValues) -> Result<DrawListId, DeviceError> {
        self.framebuffer(framebuffer)?;
        if self.open_draw.is_some() {
            return Err(DeviceError::InvalidUsage("draw list already open".into()));
        }
        let id = self.next_id();
        self.open_draw = Some(OpenDrawList {
            id,
            framebuffer,
            clear,
            pipeline: None,
            vertex_array: None,
            index_array: None,
            commands: Vec::new(),
        });
        Ok(DrawListId(id))
    }

    fn draw_list_bind_render_pipeline(&mut self, list: DrawListId, pipeline: Rid) -> Result<(), DeviceError> {
        self.render_pipeline(pipeline)?;
        let open = self.open_draw(list)?;
        open.pipeline = Some(pipeline);
        open.commands.push(DrawCommand::Pipeline(pipeline));
        Ok(())
    }

    fn draw_list_bind_uniform_set(&mut self, list: DrawListId, uniform_set: Rid, set: u32) -> Result<(), DeviceError> {
        self.uniform_set(uniform_set)?;
        self.open_draw(list)?.commands.push(DrawCommand::UniformSet(uniform_set, set));
        Ok(())
    }

    fn draw_list_bind_vertex_array(&mut self, list: DrawListId, vertex_array: Rid) -> Result<(), DeviceError> {
        self.vertex_array(vertex_array)?;
        let open = self.open_draw(list)?;
        open.vertex_array = Some(vertex_array);
        open.commands.push(DrawCommand::VertexArray(vertex_array));
        Ok(())
    }

    fn draw_list_bind_index_array(&mut self, list: DrawListId, index_array: Rid) -> Result<(), DeviceError> {
        self.index_array(index_array)?;
        let open = self.open_draw(list)?;
        open.index_array = Some(index_array);
        open.commands.push(DrawCommand::IndexArray(index_array));
        Ok(())
    }

    fn draw_list_draw(&mut self, list: DrawListId, use_indices: bool, instances: u32) -> Result<(), DeviceError> {
        let (pipeline, vertex_array, index_array) = {
            let open = self.open_draw(list)?;
            (open.pipeline, open.vertex_array, open.index_array)
        };
        let pipeline = pipeline.ok_or_else(|| DeviceError::InvalidUsage("no pipeline bound".into()))?;
        vertex_array.ok_or_else(|| DeviceError::InvalidUsage("no vertex array bound".into()))?;
        if self.render_pipeline(pipeline)?.patch_level.is_some() && (!use_indices || instances != 1) {
            return Err(DeviceError::InvalidUsage("patch draws are indexed and single-instance".into()));
        }
        if use_indices && index_array.is_none() {
            return Err(DeviceError::InvalidUsage("no index array bound".into()));
        }
        self.open_draw(list)?
            .commands
            .push(DrawCommand::Draw { use_indices, instances });
        Ok(())
    }

    fn draw_list_end(&mut self, list: DrawListId) -> Result<(), DeviceError> {
        self.open_draw(list)?;
        match self.open_draw.take() {
            Some(open) => self.submit_draw_list(open),
            None => Err(DeviceError::InvalidUsage(format!("draw list {} is not open", list.0))),
        }
    }

    fn compute_list_begin(&mut self) -> Result<ComputeListId, DeviceError> {
        if self.open_compute.is_some() {
            return Err(DeviceError::InvalidUsage("compute list already open".into()));
        }
        let id = self.next_id();
        self.open_compute = Some(OpenComputeList {
            id,
            commands: Vec::new(),
        });
        Ok(ComputeListId(id))
    }

    fn compute_list_bind_compute_pipeline(&mut self, list: ComputeListId, pipeline: Rid) -> Result<(), DeviceError> {
        self.compute_pipeline(pipeline)?;
        self.open_compute(list)?.commands.push(ComputeCommand::Pipeline(pipeline));
        Ok(())
    }

    fn compute_list_bind_uniform_set(&mut self, list: ComputeListId, uniform_set: Rid, set: u32) -> Result<(), DeviceError> {
        self.uniform_set(uniform_set)?;
        self.open_compute(list)?
            .commands
            .push(ComputeCommand::UniformSet(uniform_set, set));
        Ok(())
    }

    fn compute_list_dispatch(&mut self, list: ComputeListId, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        self.open_compute(list)?.commands.push(ComputeCommand::Dispatch(x, y, z));
        Ok(())
    }

    fn compute_list_end(&mut self, list: ComputeListId) -> Result<(), DeviceError> {
        self.open_compute(list)?;
        match self.open_compute.take() {
            Some(open) => self.submit_compute_list(open),
            None => Err(DeviceError::InvalidUsage(format!("compute list {} is not open", list.0))),
        }
    }

    fn free(&mut self, rid: Rid) -> Result<(), DeviceError> {
        let entry = self.entries.remove(&rid).ok_or(DeviceError::UnknownHandle(rid))?;
        match entry {
            Entry::VertexArray(_) | Entry::IndexArray(_) => {
                self.patch_groups.retain(|&(va, ia), _| va != rid && ia != rid);
            }
            Entry::Texture(entry) => entry.texture.destroy(),
            _ => {}
        }
        Ok(())
    }

    fn is_valid(&self, rid: Rid) -> bool {
        self.entries.contains_key(&rid)
    }
}

fn write_mip(queue: &wgpu::Queue, texture: &wgpu::Texture, desc: &TextureDesc, mip: u32, data: &[u8]) {
    let (width, height) = desc.mip_size(mip);
    queue.write_texture(
        wgpu::ImageCopyTexture {
            texture,
            mip_level: mip,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        data,
        wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * desc.format.bytes_per_texel()),
            rows_per_image: Some(height),
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
}
