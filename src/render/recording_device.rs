use super::*;

#[derive(Clone, Debug)]
pub(crate) enum Resource {
    Texture { desc: TextureDesc, mips: Vec<Vec<u8>> },
    Buffer { kind: BufferKind, data: Vec<u8> },
    VertexArray { buffers: Vec<Rid> },
    IndexArray { buffer: Rid, count: u32 },
    Shader(ShaderDesc),
    Framebuffer(Vec<Rid>),
    RenderPipeline { shader: Rid, state: PipelineState },
    ComputePipeline { shader: Rid },
    UniformSet { uniforms: Vec<Uniform> },
}

impl Resource {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Texture { .. } => "texture",
            Self::Buffer { .. } => "buffer",
            Self::VertexArray { .. } => "vertex_array",
            Self::IndexArray { .. } => "index_array",
            Self::Shader(_) => "shader",
            Self::Framebuffer(_) => "framebuffer",
            Self::RenderPipeline { .. } => "render_pipeline",
            Self::ComputePipeline { .. } => "compute_pipeline",
            Self::UniformSet { .. } => "uniform_set",
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedDraw {
    pub framebuffer: Rid,
    pub clear: ClearValues,
    pub pipeline: Rid,
    pub uniform_set: Rid,
    pub uniforms: Vec<Uniform>,
    pub vertex_array: Rid,
    pub index_array: Rid,
    pub instances: u32,
}

#[derive(Clone, Debug)]
pub(crate) struct RecordedDispatch {
    pub pipeline: Rid,
    pub uniforms: Vec<Uniform>,
    pub groups: [u32; 3],
}

#[derive(Default)]
struct OpenDraw {
    id: u64,
    framebuffer: Rid,
    clear: ClearValues,
    pipeline: Rid,
    uniform_set: Rid,
    vertex_array: Rid,
    index_array: Rid,
}

#[derive(Default)]
struct OpenCompute {
    id: u64,
    pipeline: Rid,
    uniform_set: Rid,
}

/// In-memory [`RenderDevice`] that validates handles and bindings, records
/// draws and dispatches, and keeps texture/buffer contents for inspection.
#[derive(Default)]
pub(crate) struct RecordingDevice {
    next: u64,
    resources: HashMap<Rid, Resource>,
    open_draw: Option<OpenDraw>,
    open_compute: Option<OpenCompute>,
    pub draws: Vec<RecordedDraw>,
    pub dispatches: Vec<RecordedDispatch>,
    pub ended_draw_lists: usize,
    pub freed: Vec<Rid>,
    /// Shaders whose label contains this string fail to compile.
    pub fail_shader: Option<String>,
}

impl RecordingDevice {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, resource: Resource) -> Rid {
        self.next += 1;
        let rid = Rid(self.next);
        self.resources.insert(rid, resource);
        rid
    }

    fn get(&self, rid: Rid) -> Result<&Resource, DeviceError> {
        self.resources.get(&rid).ok_or(DeviceError::UnknownHandle(rid))
    }

    fn expect_kind(&self, rid: Rid, kind: &str) -> Result<&Resource, DeviceError> {
        let resource = self.get(rid)?;
        if resource.kind() != kind {
            return Err(DeviceError::InvalidUsage(format!(
                "{:?} is a {}, expected a {}",
                rid,
                resource.kind(),
                kind
            )));
        }
        Ok(resource)
    }

    pub(crate) fn live_count(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn live_of_kind(&self, kind: &str) -> usize {
        self.resources.values().filter(|r| r.kind() == kind).count()
    }

    pub(crate) fn resource(&self, rid: Rid) -> Option<&Resource> {
        self.resources.get(&rid)
    }

    pub(crate) fn buffer_data(&self, rid: Rid) -> &[u8] {
        match self.resources.get(&rid) {
            Some(Resource::Buffer { data, .. }) => data,
            _ => panic!("{:?} is not a live buffer", rid),
        }
    }

    pub(crate) fn texture_data(&self, rid: Rid, mip: usize) -> &[u8] {
        match self.resources.get(&rid) {
            Some(Resource::Texture { mips, .. }) => &mips[mip],
            _ => panic!("{:?} is not a live texture", rid),
        }
    }

    /// Direct write used by tests to stand in for GPU-side results.
    pub(crate) fn poke_texture(&mut self, rid: Rid, data: Vec<u8>) {
        if let Some(Resource::Texture { mips, .. }) = self.resources.get_mut(&rid) {
            mips[0] = data;
        }
    }

    fn uniforms_of(&self, set: Rid) -> Vec<Uniform> {
        match self.resources.get(&set) {
            Some(Resource::UniformSet { uniforms }) => uniforms.clone(),
            _ => Vec::new(),
        }
    }
}

impl RenderDevice for RecordingDevice {
    fn texture_create(&mut self, desc: &TextureDesc, data: &[Vec<u8>]) -> Result<Rid, DeviceError> {
        if desc.width == 0 || desc.height == 0 || desc.mipmaps == 0 {
            return Err(DeviceError::InvalidUsage("empty texture".into()));
        }
        if desc.format.is_depth() && desc.usage.intersects(TextureUsage::CAN_UPDATE | TextureUsage::STORAGE) {
            return Err(DeviceError::InvalidFormat(format!(
                "{} cannot be updated or used as storage",
                desc.format.label()
            )));
        }
        let mut mips = Vec::new();
        for mip in 0..desc.mipmaps {
            let expected = desc.mip_bytes(mip);
            match data.get(mip as usize) {
                Some(bytes) if bytes.len() != expected => {
                    return Err(DeviceError::InvalidUsage(format!(
                        "mip {} expects {} bytes, got {}",
                        mip,
                        expected,
                        bytes.len()
                    )))
                }
                Some(bytes) => mips.push(bytes.clone()),
                None => mips.push(vec![0; expected]),
            }
        }
        Ok(self.insert(Resource::Texture { desc: *desc, mips }))
    }

    fn texture_update(&mut self, texture: Rid, mip: u32, data: &[u8]) -> Result<(), DeviceError> {
        match self.resources.get_mut(&texture) {
            Some(Resource::Texture { desc, mips }) => {
                if !desc.usage.contains(TextureUsage::CAN_UPDATE) {
                    return Err(DeviceError::InvalidUsage("texture lacks CAN_UPDATE".into()));
                }
                if mip >= desc.mipmaps || data.len() != desc.mip_bytes(mip) {
                    return Err(DeviceError::InvalidUsage("texture update size mismatch".into()));
                }
                mips[mip as usize] = data.to_vec();
                Ok(())
            }
            _ => Err(DeviceError::UnknownHandle(texture)),
        }
    }

    fn texture_get_data(&mut self, texture: Rid, mip: u32) -> Result<Vec<u8>, DeviceError> {
        match self.get(texture)? {
            Resource::Texture { desc, mips } if desc.usage.contains(TextureUsage::CAN_COPY_FROM) => mips
                .get(mip as usize)
                .cloned()
                .ok_or_else(|| DeviceError::Readback(format!("no mip {}", mip))),
            _ => Err(DeviceError::Readback(format!("{:?} cannot be read back", texture))),
        }
    }

    fn texture_desc(&self, texture: Rid) -> Result<TextureDesc, DeviceError> {
        match self.expect_kind(texture, "texture")? {
            Resource::Texture { desc, .. } => Ok(*desc),
            _ => Err(DeviceError::UnknownHandle(texture)),
        }
    }

    fn buffer_create(&mut self, kind: BufferKind, size: u64, data: Option<&[u8]>) -> Result<Rid, DeviceError> {
        let data = match data {
            Some(bytes) if bytes.len() as u64 != size => {
                return Err(DeviceError::InvalidUsage("buffer data size mismatch".into()))
            }
            Some(bytes) => bytes.to_vec(),
            None => vec![0; size as usize],
        };
        Ok(self.insert(Resource::Buffer { kind, data }))
    }

    fn buffer_update(&mut self, buffer: Rid, offset: u64, bytes: &[u8]) -> Result<(), DeviceError> {
        match self.resources.get_mut(&buffer) {
            Some(Resource::Buffer { data, .. }) => {
                let start = offset as usize;
                let end = start + bytes.len();
                if end > data.len() {
                    return Err(DeviceError::InvalidUsage("buffer update out of range".into()));
                }
                data[start..end].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(DeviceError::UnknownHandle(buffer)),
        }
    }

    fn vertex_array_create(&mut self, _vertex_count: u32, buffers: &[Rid]) -> Result<Rid, DeviceError> {
        for &buffer in buffers {
            self.expect_kind(buffer, "buffer")?;
        }
        Ok(self.insert(Resource::VertexArray {
            buffers: buffers.to_vec(),
        }))
    }

    fn index_array_create(&mut self, index_buffer: Rid, index_count: u32) -> Result<Rid, DeviceError> {
        self.expect_kind(index_buffer, "buffer")?;
        Ok(self.insert(Resource::IndexArray {
            buffer: index_buffer,
            count: index_count,
        }))
    }

    fn shader_create(&mut self, desc: &ShaderDesc) -> Result<Rid, DeviceError> {
        if let Some(pattern) = &self.fail_shader {
            if desc.label.contains(pattern.as_str()) {
                return Err(DeviceError::ShaderCompile(format!("{}: forced failure", desc.label)));
            }
        }
        let empty = match &desc.source {
            ShaderSource::Tessellated {
                vertex,
                tess_control,
                tess_eval,
                fragment,
            } => [vertex, tess_control, tess_eval, fragment].iter().any(|s| s.trim().is_empty()),
            ShaderSource::Raster { vertex, .. } => vertex.trim().is_empty(),
            ShaderSource::Compute { compute } => compute.trim().is_empty(),
        };
        if empty {
            return Err(DeviceError::ShaderCompile(format!("{}: empty stage", desc.label)));
        }
        Ok(self.insert(Resource::Shader(desc.clone())))
    }

    fn framebuffer_create(&mut self, attachments: &[Rid]) -> Result<Rid, DeviceError> {
        for &attachment in attachments {
            let desc = self.texture_desc(attachment)?;
            let needed = if desc.format.is_depth() {
                TextureUsage::DEPTH_ATTACHMENT
            } else {
                TextureUsage::COLOR_ATTACHMENT
            };
            if !desc.usage.contains(needed) {
                return Err(DeviceError::InvalidFormat(format!("{:?} is not an attachment", attachment)));
            }
        }
        Ok(self.insert(Resource::Framebuffer(attachments.to_vec())))
    }

    fn render_pipeline_create(
        &mut self,
        shader: Rid,
        framebuffer: Rid,
        _attributes: &[VertexAttribute],
        state: &PipelineState,
    ) -> Result<Rid, DeviceError> {
        let tessellated = match self.expect_kind(shader, "shader")? {
            Resource::Shader(desc) => desc.is_tessellated(),
            _ => false,
        };
        self.expect_kind(framebuffer, "framebuffer")?;
        if tessellated != matches!(state.primitive, Primitive::Patches { .. }) {
            return Err(DeviceError::PipelineCreate(
                "patch primitives require a tessellated shader".into(),
            ));
        }
        Ok(self.insert(Resource::RenderPipeline { shader, state: *state }))
    }

    fn compute_pipeline_create(&mut self, shader: Rid) -> Result<Rid, DeviceError> {
        let is_compute = matches!(
            self.expect_kind(shader, "shader")?,
            Resource::Shader(ShaderDesc {
                source: ShaderSource::Compute { .. },
                ..
            })
        );
        if !is_compute {
            return Err(DeviceError::PipelineCreate("not a compute shader".into()));
        }
        Ok(self.insert(Resource::ComputePipeline { shader }))
    }

    fn uniform_set_create(&mut self, uniforms: &[Uniform], shader: Rid, set: u32) -> Result<Rid, DeviceError> {
        if set != 0 {
            return Err(DeviceError::InvalidUsage("only set 0 is user-bindable".into()));
        }
        let bindings = match self.expect_kind(shader, "shader")? {
            Resource::Shader(desc) => desc.bindings.clone(),
            _ => Vec::new(),
        };
        if bindings.len() != uniforms.len() {
            return Err(DeviceError::InvalidUsage(format!(
                "shader declares {} bindings, got {}",
                bindings.len(),
                uniforms.len()
            )));
        }
        for decl in &bindings {
            let uniform = uniforms
                .iter()
                .find(|u| u.binding() == decl.binding)
                .ok_or_else(|| DeviceError::InvalidUsage(format!("binding {} missing", decl.binding)))?;
            let matches = match (decl.kind, uniform) {
                (BindingKind::UniformBuffer, Uniform::Buffer { buffer, .. }) => {
                    matches!(self.get(*buffer)?, Resource::Buffer { kind: BufferKind::Uniform, .. })
                }
                (BindingKind::Texture, Uniform::Texture { texture, .. }) => {
                    !self.texture_desc(*texture)?.format.is_depth()
                }
                (BindingKind::DepthTexture, Uniform::Texture { texture, .. }) => {
                    self.texture_desc(*texture)?.format.is_depth()
                }
                (BindingKind::StorageTexture(format), Uniform::StorageTexture { texture, .. }) => {
                    let desc = self.texture_desc(*texture)?;
                    desc.format == format && desc.usage.contains(TextureUsage::STORAGE)
                }
                _ => false,
            };
            if !matches {
                return Err(DeviceError::InvalidUsage(format!("binding {} has the wrong kind", decl.binding)));
            }
        }
        for written in uniforms.iter().filter(|u| matches!(u, Uniform::StorageTexture { .. })) {
            if uniforms
                .iter()
                .any(|u| matches!(u, Uniform::Texture { .. }) && u.resource() == written.resource())
            {
                return Err(DeviceError::InvalidUsage(format!(
                    "{:?} is both read and written in one set",
                    written.resource()
                )));
            }
        }
        Ok(self.insert(Resource::UniformSet {
            uniforms: uniforms.to_vec(),
        }))
    }

    fn draw_list_begin(&mut self, framebuffer: Rid, clear: ClearValues) -> Result<DrawListId, DeviceError> {
        self.expect_kind(framebuffer, "framebuffer")?;
        if self.open_draw.is_some() {
            return Err(DeviceError::InvalidUsage("draw list already open".into()));
        }
        self.next += 1;
        self.open_draw = Some(OpenDraw {
            id: self.next,
            framebuffer,
            clear,
            ..Default::default()
        });
        Ok(DrawListId(self.next))
    }

    fn draw_list_bind_render_pipeline(&mut self, list: DrawListId, pipeline: Rid) -> Result<(), DeviceError> {
        self.expect_kind(pipeline, "render_pipeline")?;
        open_draw(&mut self.open_draw, list)?.pipeline = pipeline;
        Ok(())
    }

    fn draw_list_bind_uniform_set(&mut self, list: DrawListId, uniform_set: Rid, _set: u32) -> Result<(), DeviceError> {
        self.expect_kind(uniform_set, "uniform_set")?;
        open_draw(&mut self.open_draw, list)?.uniform_set = uniform_set;
        Ok(())
    }

    fn draw_list_bind_vertex_array(&mut self, list: DrawListId, vertex_array: Rid) -> Result<(), DeviceError> {
        self.expect_kind(vertex_array, "vertex_array")?;
        open_draw(&mut self.open_draw, list)?.vertex_array = vertex_array;
        Ok(())
    }

    fn draw_list_bind_index_array(&mut self, list: DrawListId, index_array: Rid) -> Result<(), DeviceError> {
        self.expect_kind(index_array, "index_array")?;
        open_draw(&mut self.open_draw, list)?.index_array = index_array;
        Ok(())
    }

    fn draw_list_draw(&mut self, list: DrawListId, use_indices: bool, instances: u32) -> Result<(), DeviceError> {
        let open = open_draw(&mut self.open_draw, list)?;
        let (framebuffer, clear, pipeline, uniform_set, vertex_array, index_array) = (
            open.framebuffer,
            open.clear,
            open.pipeline,
            open.uniform_set,
            open.vertex_array,
            open.index_array,
        );
        for (rid, what) in [(pipeline, "pipeline"), (uniform_set, "uniform set"), (vertex_array, "vertex array")] {
            if !self.resources.contains_key(&rid) {
                return Err(DeviceError::InvalidUsage(format!("no {} bound", what)));
            }
        }
        if use_indices && !self.resources.contains_key(&index_array) {
            return Err(DeviceError::InvalidUsage("no index array bound".into()));
        }
        let uniforms = self.uniforms_of(uniform_set);
        self.draws.push(RecordedDraw {
            framebuffer,
            clear,
            pipeline,
            uniform_set,
            uniforms,
            vertex_array,
            index_array,
            instances,
        });
        Ok(())
    }

    fn draw_list_end(&mut self, list: DrawListId) -> Result<(), DeviceError> {
        open_draw(&mut self.open_draw, list)?;
        self.open_draw = None;
        self.ended_draw_lists += 1;
        Ok(())
    }

    fn compute_list_begin(&mut self) -> Result<ComputeListId, DeviceError> {
        if self.open_compute.is_some() {
            return Err(DeviceError::InvalidUsage("compute list already open".into()));
        }
        self.next += 1;
        self.open_compute = Some(OpenCompute {
            id: self.next,
            ..Default::default()
        });
        Ok(ComputeListId(self.next))
    }

    fn compute_list_bind_compute_pipeline(&mut self, list: ComputeListId, pipeline: Rid) -> Result<(), DeviceError> {
        self.expect_kind(pipeline, "compute_pipeline")?;
        open_compute(&mut self.open_compute, list)?.pipeline = pipeline;
        Ok(())
    }

    fn compute_list_bind_uniform_set(&mut self, list: ComputeListId, uniform_set: Rid, _set: u32) -> Result<(), DeviceError> {
        self.expect_kind(uniform_set, "uniform_set")?;
        open_compute(&mut self.open_compute, list)?.uniform_set = uniform_set;
        Ok(())
    }

    fn compute_list_dispatch(&mut self, list: ComputeListId, x: u32, y: u32, z: u32) -> Result<(), DeviceError> {
        let open = open_compute(&mut self.open_compute, list)?;
        let (pipeline, uniform_set) = (open.pipeline, open.uniform_set);
        if !self.resources.contains_key(&pipeline) || !self.resources.contains_key(&uniform_set) {
            return Err(DeviceError::InvalidUsage("dispatch without pipeline or uniform set".into()));
        }
        let uniforms = self.uniforms_of(uniform_set);
        self.dispatches.push(RecordedDispatch {
            pipeline,
            uniforms,
            groups: [x, y, z],
        });
        Ok(())
    }

    fn compute_list_end(&mut self, list: ComputeListId) -> Result<(), DeviceError> {
        open_compute(&mut self.open_compute, list)?;
        self.open_compute = None;
        Ok(())
    }

    fn free(&mut self, rid: Rid) -> Result<(), DeviceError> {
        self.resources
            .remove(&rid)
            .ok_or(DeviceError::UnknownHandle(rid))?;
        self.freed.push(rid);
        Ok(())
    }

    fn is_valid(&self, rid: Rid) -> bool {
        self.resources.contains_key(&rid)
    }
}

fn open_draw(open: &mut Option<OpenDraw>, list: DrawListId) -> Result<&mut OpenDraw, DeviceError> {
    match open {
        Some(draw) if draw.id == list.0 => Ok(draw),
        _ => Err(DeviceError::InvalidUsage(format!("draw list {:?} is not open", list))),
    }
}

fn open_compute(open: &mut Option<OpenCompute>, list: ComputeListId) -> Result<&mut OpenCompute, DeviceError> {
    match open {
        Some(compute) if compute.id == list.0 => Ok(compute),
        _ => Err(DeviceError::InvalidUsage(format!("compute list {:?} is not open", list))),
    }
}
