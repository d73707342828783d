use super::*;
use crate::cell_grid::{ToroidalMap, CELL_COUNT};
use crate::config::{CellSettings, RenderSettings};
use crate::geometry::{DeformableSurface, GeometryRegistry};
use crate::matrix_operations::{flatten_matrix_for_wgpu, Camera};
use crate::terrain::HeightTextureRef;
use cgmath::Matrix4;

const CAMERA_BINDING: u32 = 0;
const MODEL_BINDING: u32 = 1;
const PARAMS_BINDING: u32 = 2;
const HEIGHTMAP_BINDING: u32 = 3;
const DISPLACEMENT_BINDING_BASE: u32 = 4;

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
pub struct CameraUniform {
    view: [[f32; 4]; 4],
    projection: [[f32; 4]; 4],
    position: [f32; 4],
}

impl CameraUniform {
    pub fn from_camera(camera: &Camera) -> Self {
        Self {
            view: flatten_matrix_for_wgpu(camera.view),
            projection: flatten_matrix_for_wgpu(camera.projection),
            position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
        }
    }
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
struct ModelUniform {
    model: [[f32; 4]; 4],
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
pub struct TerrainParamsUniform {
    chunk_origin: [f32; 2],
    heightmap_half: f32,
    max_height: f32,
    active_cell: [i32; 2],
    cell_size: f32,
    snow_height: f32,
    camera_position: [f32; 4],
    tess_level_near: f32,
    tess_level_far: f32,
    tess_distance: f32,
    tess_level_max: f32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BackendState {
    Uninitialized,
    Initialized,
    CleanedUp,
}

impl BackendState {
    fn label(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::CleanedUp => "cleaned up",
        }
    }
}

struct SurfaceBuffers {
    vertex_buffers: [Rid; 3],
    index_buffer: Rid,
    vertex_array: Rid,
    index_array: Rid,
    model_buffer: Rid,
    transform: Matrix4<f32>,
}

impl SurfaceBuffers {
    fn free(&self, device: &mut dyn RenderDevice) {
        for rid in [self.vertex_array, self.index_array, self.model_buffer, self.index_buffer]
            .into_iter()
            .chain(self.vertex_buffers)
        {
            free_if_valid(device, rid);
        }
    }
}

struct Live {
    shader: Rid,
    pipeline: Rid,
    framebuffer: Rid,
    color_target: Rid,
    depth_target: Rid,
    color_format: TextureFormat,
    camera_buffer: Rid,
    params_buffer: Rid,
    surfaces: Vec<SurfaceBuffers>,
    height: Option<(Rid, HeightTextureRef)>,
    displacement: Option<([Rid; CELL_COUNT], ToroidalMap)>,
}

enum Lifecycle {
    Uninitialized,
    Initialized(Box<Live>),
    CleanedUp,
}

impl Lifecycle {
    fn state(&self) -> BackendState {
        match self {
            Self::Uninitialized => BackendState::Uninitialized,
            Self::Initialized(_) => BackendState::Initialized,
            Self::CleanedUp => BackendState::CleanedUp,
        }
    }
}

pub(crate) fn terrain_shader_desc() -> ShaderDesc {
    let mut bindings = vec![
        BindingDecl::new(CAMERA_BINDING, BindingKind::UniformBuffer),
        BindingDecl::new(MODEL_BINDING, BindingKind::UniformBuffer),
        BindingDecl::new(PARAMS_BINDING, BindingKind::UniformBuffer),
        BindingDecl::new(HEIGHTMAP_BINDING, BindingKind::Texture),
    ];
    bindings.extend(
        (0..CELL_COUNT as u32).map(|i| BindingDecl::new(DISPLACEMENT_BINDING_BASE + i, BindingKind::Texture)),
    );
    ShaderDesc {
        label: "terrain".into(),
        source: ShaderSource::Tessellated {
            vertex: TERRAIN_VERTEX_WGSL.into(),
            tess_control: TERRAIN_TESS_CONTROL_WGSL.into(),
            tess_eval: TERRAIN_TESS_EVAL_WGSL.into(),
            fragment: TERRAIN_FRAGMENT_WGSL.into(),
        },
        bindings,
    }
}

/// Draws deformable terrain surfaces as tessellated patches displaced by the
/// heightmap and the nine deformation cell textures.
///
/// Lifecycle is `Uninitialized -> Initialized -> CleanedUp`; everything but
/// [`Self::cleanup`] fails with [`TerrainError::InvalidState`] outside the
/// state it needs.
pub struct TerrainRenderBackend {
    lifecycle: Lifecycle,
    render: RenderSettings,
    cells: CellSettings,
    max_height: f32,
}

impl TerrainRenderBackend {
    pub fn new(render: &RenderSettings, cells: &CellSettings, max_height: f32) -> Self {
        Self {
            lifecycle: Lifecycle::Uninitialized,
            render: render.clone(),
            cells: cells.clone(),
            max_height,
        }
    }

    pub fn state(&self) -> BackendState {
        self.lifecycle.state()
    }

    fn invalid_state(&self, operation: &'static str) -> TerrainError {
        TerrainError::InvalidState {
            operation,
            state: self.state().label(),
        }
    }

    fn live(&self, operation: &'static str) -> Result<&Live, TerrainError> {
        match &self.lifecycle {
            Lifecycle::Initialized(live) => Ok(&**live),
            _ => Err(self.invalid_state(operation)),
        }
    }

    fn live_mut(&mut self, operation: &'static str) -> Result<&mut Live, TerrainError> {
        let state = self.state().label();
        match &mut self.lifecycle {
            Lifecycle::Initialized(live) => Ok(&mut **live),
            _ => Err(TerrainError::InvalidState { operation, state }),
        }
    }

    fn pipeline_state(&self) -> PipelineState {
        PipelineState {
            primitive: Primitive::Patches {
                control_points: 3,
                max_level: self.render.max_tessellation_level,
            },
            cull: CullMode::None,
            depth_test: Some(CompareOp::Less),
            depth_write: true,
            blend: BlendMode::Replace,
        }
    }

    /// Compiles the pipeline against the given targets and allocates the
    /// shared uniform buffers. On failure everything created so far is freed
    /// and the backend stays uninitialized.
    pub fn initialize(
        &mut self,
        device: &mut dyn RenderDevice,
        color_target: Rid,
        depth_target: Rid,
    ) -> Result<(), TerrainError> {
        if self.state() != BackendState::Uninitialized {
            return Err(self.invalid_state("initialize"));
        }
        let mut created = Vec::new();
        match self.create_live(device, color_target, depth_target, &mut created) {
            Ok(live) => {
                log::info!(
                    "terrain backend initialized (max tessellation level {})",
                    self.render.max_tessellation_level
                );
                self.lifecycle = Lifecycle::Initialized(Box::new(live));
                Ok(())
            }
            Err(err) => {
                for rid in created.into_iter().rev() {
                    free_if_valid(device, rid);
                }
                log::error!("terrain backend initialization failed: {}", err);
                Err(err)
            }
        }
    }

    fn create_live(
        &self,
        device: &mut dyn RenderDevice,
        color_target: Rid,
        depth_target: Rid,
        created: &mut Vec<Rid>,
    ) -> Result<Live, TerrainError> {
        let color_format = validate_targets(device, color_target, depth_target)?;

        let shader = device.shader_create(&terrain_shader_desc())?;
        created.push(shader);
        let framebuffer = device.framebuffer_create(&[color_target, depth_target])?;
        created.push(framebuffer);
        let pipeline =
            device.render_pipeline_create(shader, framebuffer, &POSITION_NORMAL_UV, &self.pipeline_state())?;
        created.push(pipeline);

        let camera_buffer = device.buffer_create(
            BufferKind::Uniform,
            std::mem::size_of::<CameraUniform>() as u64,
            Some(bytemuck::bytes_of(&CameraUniform::default())),
        )?;
        created.push(camera_buffer);
        let params_buffer = device.buffer_create(
            BufferKind::Uniform,
            std::mem::size_of::<TerrainParamsUniform>() as u64,
            Some(bytemuck::bytes_of(&TerrainParamsUniform::default())),
        )?;
        created.push(params_buffer);

        Ok(Live {
            shader,
            pipeline,
            framebuffer,
            color_target,
            depth_target,
            color_format,
            camera_buffer,
            params_buffer,
            surfaces: Vec::new(),
            height: None,
            displacement: None,
        })
    }

    /// Replaces the drawn surfaces. Only the first sub-surface of each mesh is
    /// uploaded.
    pub fn load_surfaces(
        &mut self,
        device: &mut dyn RenderDevice,
        surfaces: &[DeformableSurface],
    ) -> Result<(), TerrainError> {
        let live = self.live_mut("load_surfaces")?;
        for old in live.surfaces.drain(..) {
            old.free(device);
        }
        for (i, surface) in surfaces.iter().enumerate() {
            let mut created = Vec::new();
            match upload_surface(device, surface, &mut created) {
                Ok(buffers) => live.surfaces.push(buffers),
                Err(err) => {
                    for rid in created.into_iter().rev() {
                        free_if_valid(device, rid);
                    }
                    log::error!("failed to upload terrain surface {}: {}", i, err);
                    return Err(err);
                }
            }
        }
        log::info!("loaded {} terrain surfaces", live.surfaces.len());
        Ok(())
    }

    pub fn set_surface_transforms(&mut self, transforms: &[Matrix4<f32>]) -> Result<(), TerrainError> {
        let live = self.live_mut("set_surface_transforms")?;
        if transforms.len() != live.surfaces.len() {
            return Err(TerrainError::SurfaceCountMismatch {
                expected: live.surfaces.len(),
                actual: transforms.len(),
            });
        }
        for (surface, transform) in live.surfaces.iter_mut().zip(transforms) {
            surface.transform = *transform;
        }
        Ok(())
    }

    /// Re-uploads when the registry is stale, otherwise only refreshes
    /// transforms. Returns whether surfaces were reloaded.
    pub fn sync_surfaces(
        &mut self,
        device: &mut dyn RenderDevice,
        registry: &mut dyn GeometryRegistry,
    ) -> Result<bool, TerrainError> {
        if registry.is_stale() {
            self.load_surfaces(device, &registry.deformable_surfaces())?;
            registry.mark_synced();
            return Ok(true);
        }
        self.set_surface_transforms(&registry.transforms())?;
        Ok(false)
    }

    pub fn update_displacement(
        &mut self,
        textures: [Rid; CELL_COUNT],
        map: ToroidalMap,
    ) -> Result<(), TerrainError> {
        self.live_mut("update_displacement")?.displacement = Some((textures, map));
        Ok(())
    }

    pub fn update_height(&mut self, texture: Rid, height: HeightTextureRef) -> Result<(), TerrainError> {
        self.live_mut("update_height")?.height = Some((texture, height));
        Ok(())
    }

    fn params(&self, camera: &Camera, height: &HeightTextureRef, map: &ToroidalMap) -> TerrainParamsUniform {
        TerrainParamsUniform {
            chunk_origin: [height.origin.x, height.origin.y],
            heightmap_half: height.half_extent,
            max_height: self.max_height,
            active_cell: [map.active_coord.x, map.active_coord.y],
            cell_size: map.cell_size,
            snow_height: self.cells.snow_height,
            camera_position: [camera.position.x, camera.position.y, camera.position.z, 1.0],
            tess_level_near: self.render.near_tessellation_level,
            tess_level_far: self.render.far_tessellation_level,
            tess_distance: self.render.tessellation_distance,
            tess_level_max: self.render.max_tessellation_level as f32,
        }
    }

    /// Draws every loaded surface into the framebuffer. Each surface gets its
    /// own uniform set, created here and freed once its draw list has ended.
    pub fn draw(&mut self, device: &mut dyn RenderDevice, camera: &Camera) -> Result<(), TerrainError> {
        let live = self.live("draw")?;
        let (height_texture, height) = live
            .height
            .ok_or(TerrainError::MissingBinding("height texture"))?;
        let (displacement, map) = live
            .displacement
            .ok_or(TerrainError::MissingBinding("displacement textures"))?;

        device.buffer_update(live.camera_buffer, 0, bytemuck::bytes_of(&CameraUniform::from_camera(camera)))?;
        let params = self.params(camera, &height, &map);
        device.buffer_update(live.params_buffer, 0, bytemuck::bytes_of(&params))?;

        let clear = ClearValues::all(self.render.clear_color, 1.0);
        if live.surfaces.is_empty() {
            let list = device.draw_list_begin(live.framebuffer, clear)?;
            device.draw_list_end(list)?;
            return Ok(());
        }

        for (i, surface) in live.surfaces.iter().enumerate() {
            let model = ModelUniform {
                model: flatten_matrix_for_wgpu(surface.transform),
            };
            device.buffer_update(surface.model_buffer, 0, bytemuck::bytes_of(&model))?;

            let mut uniforms = vec![
                Uniform::Buffer {
                    binding: CAMERA_BINDING,
                    buffer: live.camera_buffer,
                },
                Uniform::Buffer {
                    binding: MODEL_BINDING,
                    buffer: surface.model_buffer,
                },
                Uniform::Buffer {
                    binding: PARAMS_BINDING,
                    buffer: live.params_buffer,
                },
                Uniform::Texture {
                    binding: HEIGHTMAP_BINDING,
                    texture: height_texture,
                },
            ];
            uniforms.extend(displacement.iter().enumerate().map(|(slot, &texture)| Uniform::Texture {
                binding: DISPLACEMENT_BINDING_BASE + slot as u32,
                texture,
            }));
            let uniform_set = device.uniform_set_create(&uniforms, live.shader, 0)?;

            let clear = if i == 0 { clear } else { ClearValues::load() };
            let drawn = record_surface(device, live, surface, uniform_set, clear);
            let freed = device.free(uniform_set);
            drawn?;
            freed?;
        }
        Ok(())
    }

    /// Rebuilds the framebuffer for new targets. Returns `false` when the
    /// targets are the ones already bound.
    pub fn resize(
        &mut self,
        device: &mut dyn RenderDevice,
        color_target: Rid,
        depth_target: Rid,
    ) -> Result<bool, TerrainError> {
        let state = self.pipeline_state();
        let live = self.live_mut("resize")?;
        if live.color_target == color_target && live.depth_target == depth_target {
            return Ok(false);
        }
        let color_format = validate_targets(device, color_target, depth_target)?;
        let framebuffer = device.framebuffer_create(&[color_target, depth_target])?;
        let pipeline = if color_format != live.color_format {
            match device.render_pipeline_create(live.shader, framebuffer, &POSITION_NORMAL_UV, &state) {
                Ok(pipeline) => Some(pipeline),
                Err(err) => {
                    free_if_valid(device, framebuffer);
                    return Err(err.into());
                }
            }
        } else {
            None
        };
        if let Some(pipeline) = pipeline {
            free_if_valid(device, live.pipeline);
            live.pipeline = pipeline;
        }
        free_if_valid(device, live.framebuffer);
        live.framebuffer = framebuffer;
        live.color_target = color_target;
        live.depth_target = depth_target;
        live.color_format = color_format;
        log::debug!("terrain backend framebuffer rebuilt");
        Ok(true)
    }

    /// Releases everything the backend created. Valid from any state.
    pub fn cleanup(&mut self, device: &mut dyn RenderDevice) {
        match std::mem::replace(&mut self.lifecycle, Lifecycle::CleanedUp) {
            Lifecycle::Initialized(live) => {
                for surface in &live.surfaces {
                    surface.free(device);
                }
                for rid in [
                    live.pipeline,
                    live.framebuffer,
                    live.shader,
                    live.camera_buffer,
                    live.params_buffer,
                ] {
                    free_if_valid(device, rid);
                }
                log::info!("terrain backend cleaned up");
            }
            Lifecycle::Uninitialized => log::debug!("terrain backend cleaned up before initialization"),
            Lifecycle::CleanedUp => {}
        }
    }
}

fn record_surface(
    device: &mut dyn RenderDevice,
    live: &Live,
    surface: &SurfaceBuffers,
    uniform_set: Rid,
    clear: ClearValues,
) -> Result<(), DeviceError> {
    let list = device.draw_list_begin(live.framebuffer, clear)?;
    device.draw_list_bind_render_pipeline(list, live.pipeline)?;
    device.draw_list_bind_uniform_set(list, uniform_set, 0)?;
    device.draw_list_bind_vertex_array(list, surface.vertex_array)?;
    device.draw_list_bind_index_array(list, surface.index_array)?;
    device.draw_list_draw(list, true, 1)?;
    device.draw_list_end(list)
}

fn validate_targets(
    device: &dyn RenderDevice,
    color_target: Rid,
    depth_target: Rid,
) -> Result<TextureFormat, TerrainError> {
    let color = device.texture_desc(color_target)?;
    let depth = device.texture_desc(depth_target)?;
    if color.format.is_depth() || !color.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
        return Err(DeviceError::InvalidFormat(format!(
            "colour target must be a colour attachment, got {}",
            color.format.label()
        ))
        .into());
    }
    if depth.format != TextureFormat::Depth32Float || !depth.usage.contains(TextureUsage::DEPTH_ATTACHMENT) {
        return Err(DeviceError::InvalidFormat(format!(
            "depth target must be a depth32float attachment, got {}",
            depth.format.label()
        ))
        .into());
    }
    if (color.width, color.height) != (depth.width, depth.height) {
        return Err(DeviceError::InvalidFormat("colour and depth targets differ in size".into()).into());
    }
    Ok(color.format)
}

fn upload_surface(
    device: &mut dyn RenderDevice,
    surface: &DeformableSurface,
    created: &mut Vec<Rid>,
) -> Result<SurfaceBuffers, TerrainError> {
    let arrays = surface
        .mesh
        .surfaces
        .first()
        .ok_or_else(|| DeviceError::InvalidUsage("mesh has no surfaces".into()))?;
    if surface.mesh.surfaces.len() > 1 {
        log::warn!(
            "mesh has {} sub-surfaces; only the first is drawn",
            surface.mesh.surfaces.len()
        );
    }
    if !arrays.is_consistent() || arrays.indices.is_empty() {
        return Err(DeviceError::InvalidUsage("inconsistent surface arrays".into()).into());
    }

    let mut vertex_buffer = |bytes: &[u8]| -> Result<Rid, TerrainError> {
        let rid = device.buffer_create(BufferKind::Vertex, bytes.len() as u64, Some(bytes))?;
        created.push(rid);
        Ok(rid)
    };
    let vertex_buffers = [
        vertex_buffer(bytemuck::cast_slice(&arrays.positions))?,
        vertex_buffer(bytemuck::cast_slice(&arrays.normals))?,
        vertex_buffer(bytemuck::cast_slice(&arrays.uvs))?,
    ];
    let index_bytes: &[u8] = bytemuck::cast_slice(&arrays.indices);
    let index_buffer = device.buffer_create(BufferKind::Index, index_bytes.len() as u64, Some(index_bytes))?;
    created.push(index_buffer);
    let vertex_array = device.vertex_array_create(arrays.vertex_count() as u32, &vertex_buffers)?;
    created.push(vertex_array);
    let index_array = device.index_array_create(index_buffer, arrays.indices.len() as u32)?;
    created.push(index_array);
    let model = ModelUniform {
        model: flatten_matrix_for_wgpu(surface.transform),
    };
    let model_buffer = device.buffer_create(
        BufferKind::Uniform,
        std::mem::size_of::<ModelUniform>() as u64,
        Some(bytemuck::bytes_of(&model)),
    )?;
    created.push(model_buffer);

    Ok(SurfaceBuffers {
        vertex_buffers,
        index_buffer,
        vertex_array,
        index_array,
        model_buffer,
        transform: surface.transform,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{MeshData, SurfaceArrays, SurfaceRegistry};
    use crate::render::recording_device::{RecordingDevice, Resource};
    use cgmath::{Point3, Vector2, Vector3};
    use std::sync::Arc;

    fn targets(device: &mut RecordingDevice, size: u32) -> (Rid, Rid) {
        let color = device
            .texture_create(
                &TextureDesc::new_2d(
                    size,
                    size,
                    TextureFormat::Rgba8UnormSrgb,
                    TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLING,
                ),
                &[],
            )
            .unwrap();
        let depth = device
            .texture_create(
                &TextureDesc::new_2d(size, size, TextureFormat::Depth32Float, TextureUsage::DEPTH_ATTACHMENT),
                &[],
            )
            .unwrap();
        (color, depth)
    }

    fn bindings(device: &mut RecordingDevice) -> (Rid, [Rid; CELL_COUNT]) {
        let desc = TextureDesc::new_2d(8, 8, TextureFormat::R32Float, TextureUsage::SAMPLING);
        let height = device.texture_create(&desc, &[]).unwrap();
        let displacement = std::array::from_fn(|_| device.texture_create(&desc, &[]).unwrap());
        (height, displacement)
    }

    fn backend() -> TerrainRenderBackend {
        TerrainRenderBackend::new(&RenderSettings::default(), &CellSettings::default(), 32.0)
    }

    fn surfaces(count: usize) -> Vec<DeformableSurface> {
        (0..count)
            .map(|i| DeformableSurface {
                mesh: Arc::new(MeshData::grid_patch(3, 16.0)),
                transform: Matrix4::from_translation(Vector3::new(i as f32, 0.0, 0.0)),
            })
            .collect()
    }

    fn height_ref() -> HeightTextureRef {
        HeightTextureRef {
            slot: 0,
            origin: Vector2::new(256.0, 0.0),
            half_extent: 384.0,
        }
    }

    fn toroidal_map() -> ToroidalMap {
        ToroidalMap {
            active_coord: Vector2::new(0, 0),
            active_index: 4,
            cell_size: 64.0,
        }
    }

    fn ready_backend(device: &mut RecordingDevice) -> TerrainRenderBackend {
        let (color, depth) = targets(device, 32);
        let mut backend = backend();
        backend.initialize(device, color, depth).unwrap();
        let (height, displacement) = bindings(device);
        backend.update_height(height, height_ref()).unwrap();
        backend.update_displacement(displacement, toroidal_map()).unwrap();
        backend
    }

    #[test]
    fn operations_before_initialize_fail_loudly() {
        let mut device = RecordingDevice::new();
        let mut backend = backend();
        let camera = Camera::default();
        assert!(matches!(
            backend.draw(&mut device, &camera),
            Err(TerrainError::InvalidState { operation: "draw", state: "uninitialized" })
        ));
        assert!(matches!(
            backend.load_surfaces(&mut device, &surfaces(1)),
            Err(TerrainError::InvalidState { .. })
        ));
        assert_eq!(device.live_count(), 0);
    }

    #[test]
    fn shader_failure_leaves_nothing_behind() {
        let mut device = RecordingDevice::new();
        let (color, depth) = targets(&mut device, 16);
        device.fail_shader = Some("terrain".into());
        let mut backend = backend();
        let err = backend.initialize(&mut device, color, depth).unwrap_err();
        assert!(matches!(err, TerrainError::Device(DeviceError::ShaderCompile(_))));
        assert_eq!(backend.state(), BackendState::Uninitialized);
        assert_eq!(device.live_count(), 2);
    }

    #[test]
    fn invalid_target_format_is_rejected() {
        let mut device = RecordingDevice::new();
        let (_, depth) = targets(&mut device, 16);
        let mut backend = backend();
        let err = backend.initialize(&mut device, depth, depth).unwrap_err();
        assert!(matches!(err, TerrainError::Device(DeviceError::InvalidFormat(_))));
        assert_eq!(device.live_count(), 2);
    }

    #[test]
    fn pipeline_uses_three_point_patches() {
        let mut device = RecordingDevice::new();
        let backend = ready_backend(&mut device);
        let live = backend.live("test").unwrap();
        match device.resource(live.pipeline) {
            Some(Resource::RenderPipeline { state, .. }) => {
                assert_eq!(
                    state.primitive,
                    Primitive::Patches {
                        control_points: 3,
                        max_level: 8
                    }
                );
                assert_eq!(state.cull, CullMode::None);
                assert_eq!(state.depth_test, Some(CompareOp::Less));
                assert_eq!(state.blend, BlendMode::Replace);
            }
            other => panic!("unexpected pipeline resource {:?}", other),
        }
        assert_eq!(device.buffer_data(live.camera_buffer).len(), 144);
        assert_eq!(device.buffer_data(live.params_buffer).len(), 64);
    }

    #[test]
    fn draw_creates_and_frees_one_uniform_set_per_surface() {
        let mut device = RecordingDevice::new();
        let mut backend = ready_backend(&mut device);
        backend.load_surfaces(&mut device, &surfaces(2)).unwrap();
        let camera = Camera::look_at(
            Point3::new(0.0, 10.0, 10.0),
            Point3::new(0.0, 0.0, 0.0),
            cgmath::Deg(60.0),
            1.0,
        );
        backend.draw(&mut device, &camera).unwrap();
        backend.draw(&mut device, &camera).unwrap();

        assert_eq!(device.draws.len(), 4);
        assert_eq!(device.ended_draw_lists, 4);
        assert_eq!(device.live_of_kind("uniform_set"), 0);
        let sets: Vec<Rid> = device.draws.iter().map(|d| d.uniform_set).collect();
        assert!(sets.iter().all(|s| device.freed.contains(s)));
        assert!(device.draws[0].clear.color.is_some());
        assert!(device.draws[1].clear.color.is_none());
        for draw in &device.draws {
            assert_eq!(draw.uniforms.len(), 4 + CELL_COUNT);
            assert_eq!(draw.instances, 1);
        }

        let live = backend.live("test").unwrap();
        assert_eq!(
            device.buffer_data(live.camera_buffer),
            bytemuck::bytes_of(&CameraUniform::from_camera(&camera))
        );
        let params: TerrainParamsUniform = bytemuck::pod_read_unaligned(device.buffer_data(live.params_buffer));
        assert_eq!(params.chunk_origin, [256.0, 0.0]);
        assert_eq!(params.heightmap_half, 384.0);
        assert_eq!(params.tess_level_max, 8.0);
    }

    #[test]
    fn draw_requires_height_and_displacement() {
        let mut device = RecordingDevice::new();
        let (color, depth) = targets(&mut device, 16);
        let mut backend = backend();
        backend.initialize(&mut device, color, depth).unwrap();
        assert!(matches!(
            backend.draw(&mut device, &Camera::default()),
            Err(TerrainError::MissingBinding("height texture"))
        ));
    }

    #[test]
    fn only_first_sub_surface_is_uploaded() {
        let mut device = RecordingDevice::new();
        let mut backend = ready_backend(&mut device);
        let mut mesh = MeshData::grid_patch(1, 4.0);
        mesh.surfaces.push(SurfaceArrays {
            positions: vec![[0.0; 3]; 3],
            normals: vec![[0.0, 1.0, 0.0]; 3],
            uvs: vec![[0.0; 2]; 3],
            indices: vec![0, 1, 2],
        });
        let first_indices = mesh.surfaces[0].indices.len() as u32;
        backend
            .load_surfaces(
                &mut device,
                &[DeformableSurface {
                    mesh: Arc::new(mesh),
                    transform: Matrix4::from_scale(1.0),
                }],
            )
            .unwrap();
        let live = backend.live("test").unwrap();
        match device.resource(live.surfaces[0].index_array) {
            Some(Resource::IndexArray { count, .. }) => assert_eq!(*count, first_indices),
            other => panic!("unexpected index array {:?}", other),
        }
    }

    #[test]
    fn reload_frees_previous_surfaces() {
        let mut device = RecordingDevice::new();
        let mut backend = ready_backend(&mut device);
        backend.load_surfaces(&mut device, &surfaces(3)).unwrap();
        let before = device.live_count();
        backend.load_surfaces(&mut device, &surfaces(1)).unwrap();
        // Seven handles per surface.
        assert_eq!(device.live_count(), before - 2 * 7);
    }

    #[test]
    fn registry_sync_reloads_only_when_stale() {
        let mut device = RecordingDevice::new();
        let mut backend = ready_backend(&mut device);
        let mut registry = SurfaceRegistry::new();
        let id = registry.add(Arc::new(MeshData::grid_patch(2, 8.0)), Matrix4::from_scale(1.0));
        assert!(backend.sync_surfaces(&mut device, &mut registry).unwrap());
        registry.set_transform(id, Matrix4::from_scale(3.0));
        assert!(!backend.sync_surfaces(&mut device, &mut registry).unwrap());
        let live = backend.live("test").unwrap();
        assert_eq!(live.surfaces[0].transform, Matrix4::from_scale(3.0));

        assert!(matches!(
            backend.set_surface_transforms(&[]),
            Err(TerrainError::SurfaceCountMismatch { expected: 1, actual: 0 })
        ));
    }

    #[test]
    fn resize_rebuilds_framebuffer_only_for_new_targets() {
        let mut device = RecordingDevice::new();
        let (color, depth) = targets(&mut device, 32);
        let mut backend = backend();
        backend.initialize(&mut device, color, depth).unwrap();
        let old_framebuffer = backend.live("test").unwrap().framebuffer;
        let old_pipeline = backend.live("test").unwrap().pipeline;

        assert!(!backend.resize(&mut device, color, depth).unwrap());
        assert_eq!(backend.live("test").unwrap().framebuffer, old_framebuffer);

        let (new_color, new_depth) = targets(&mut device, 48);
        assert!(backend.resize(&mut device, new_color, new_depth).unwrap());
        let live = backend.live("test").unwrap();
        assert_ne!(live.framebuffer, old_framebuffer);
        assert!(!device.is_valid(old_framebuffer));
        assert_eq!(live.pipeline, old_pipeline);
    }

    #[test]
    fn cleanup_is_safe_from_every_state() {
        let mut device = RecordingDevice::new();
        let mut never_initialized = backend();
        never_initialized.cleanup(&mut device);
        assert_eq!(never_initialized.state(), BackendState::CleanedUp);

        let mut backend = ready_backend(&mut device);
        backend.load_surfaces(&mut device, &surfaces(2)).unwrap();
        backend.cleanup(&mut device);
        backend.cleanup(&mut device);
        assert_eq!(backend.state(), BackendState::CleanedUp);
        // Only the caller-owned targets and bound textures remain.
        assert_eq!(device.live_count(), 2 + 1 + CELL_COUNT);
        assert!(matches!(
            backend.initialize(&mut device, Rid::INVALID, Rid::INVALID),
            Err(TerrainError::InvalidState { operation: "initialize", .. })
        ));
    }
}
