use crate::cell_grid::{CellStep, DeformationCellGrid, ToroidalMap, CELL_COUNT};
use crate::config::{CellSettings, DebugSettings};
use crate::error::{DeviceError, TerrainError};
use crate::geometry::{DeformableSurface, GeometryRegistry};
use crate::matrix_operations::flatten_matrix_for_wgpu;
use crate::patch_map::PatchMap;
use crate::render::{
    free_if_valid, repeat_f32_bytes, BindingDecl, BindingKind, BufferKind, CameraUniform, ClearValues,
    CompareOp, PipelineState, Primitive, RenderDevice, Rid, ShaderDesc, ShaderSource, TextureDesc,
    TextureFormat, TextureUsage, Uniform, VertexAttribute, VertexFormat, CAPTURE_WGSL, COMPOSITE_WGSL,
};
use crate::terrain::HeightTextureRef;
use bytemuck::{Pod, Zeroable};
use cgmath::Matrix4;

const WORKGROUP_SIZE: u32 = 8;
pub const UNTOUCHED: f32 = 1.0;

/// Depth-to-height mapping of one top-down capture.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CompositeParams {
    pub camera_y: f32,
    pub near: f32,
    pub far: f32,
    pub snow_height: f32,
}

/// Merges one captured depth texel into the accumulated snow height.
///
/// `previous` and the result are normalised heights above `base_height`
/// (1 untouched, 0 pressed to the ground). A capture only ever lowers the
/// value, and only when the captured surface lies within the snow layer.
pub fn composite_texel(previous: f32, depth: f32, base_height: f32, params: &CompositeParams) -> f32 {
    if depth >= 1.0 {
        return previous;
    }
    let surface_y = params.camera_y - (params.near + depth * (params.far - params.near));
    let relative = (surface_y - base_height) / params.snow_height;
    if (0.0..=1.0).contains(&relative) && relative < previous {
        relative
    } else {
        previous
    }
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
struct CompositeUniform {
    cell_corner: [f32; 2],
    cell_size: f32,
    texture_size: f32,
    chunk_origin: [f32; 2],
    heightmap_half: f32,
    max_height: f32,
    camera_y: f32,
    near: f32,
    far: f32,
    snow_height: f32,
}

#[repr(C)]
#[derive(Default, Copy, Clone, Debug, Pod, Zeroable)]
struct ModelUniform {
    model: [[f32; 4]; 4],
}

/// Ping-pong pair plus capture target for one cell slot.
struct CellTargets {
    accumulation: [Rid; 2],
    current: usize,
    depth: Rid,
    framebuffer: Rid,
    camera_buffer: Rid,
}

impl CellTargets {
    fn read(&self) -> Rid {
        self.accumulation[self.current]
    }

    fn write(&self) -> Rid {
        self.accumulation[1 - self.current]
    }
}

struct DeformerBuffers {
    position_buffer: Rid,
    index_buffer: Rid,
    vertex_array: Rid,
    index_array: Rid,
    model_buffer: Rid,
}

impl DeformerBuffers {
    fn free(&self, device: &mut dyn RenderDevice) {
        for rid in [
            self.vertex_array,
            self.index_array,
            self.model_buffer,
            self.position_buffer,
            self.index_buffer,
        ] {
            free_if_valid(device, rid);
        }
    }
}

struct FilterLive {
    capture_shader: Rid,
    capture_pipeline: Rid,
    composite_shader: Rid,
    composite_pipeline: Rid,
    params_buffer: Rid,
    cells: Vec<CellTargets>,
    deformers: Vec<DeformerBuffers>,
    transforms: Vec<Matrix4<f32>>,
}

impl FilterLive {
    fn handles(&self) -> Vec<Rid> {
        let mut handles = Vec::new();
        for cell in &self.cells {
            handles.extend([cell.framebuffer, cell.camera_buffer, cell.depth]);
            handles.extend(cell.accumulation);
        }
        handles.extend([
            self.capture_pipeline,
            self.composite_pipeline,
            self.capture_shader,
            self.composite_shader,
            self.params_buffer,
        ]);
        handles
    }
}

const POSITION_ONLY: [VertexAttribute; 1] = [VertexAttribute {
    location: 0,
    format: VertexFormat::Float32x3,
}];

fn capture_shader_desc() -> ShaderDesc {
    ShaderDesc {
        label: "deformation capture".into(),
        source: ShaderSource::Raster {
            vertex: CAPTURE_WGSL.into(),
            fragment: None,
        },
        bindings: vec![
            BindingDecl::new(0, BindingKind::UniformBuffer),
            BindingDecl::new(1, BindingKind::UniformBuffer),
        ],
    }
}

fn composite_shader_desc() -> ShaderDesc {
    ShaderDesc {
        label: "depth composite".into(),
        source: ShaderSource::Compute {
            compute: COMPOSITE_WGSL.into(),
        },
        bindings: vec![
            BindingDecl::new(0, BindingKind::UniformBuffer),
            BindingDecl::new(1, BindingKind::Texture),
            BindingDecl::new(2, BindingKind::DepthTexture),
            BindingDecl::new(3, BindingKind::Texture),
            BindingDecl::new(4, BindingKind::StorageTexture(TextureFormat::R32Float)),
        ],
    }
}

/// Per-cell depth capture of deformer geometry followed by a monotonic
/// composite into the cell's accumulated displacement texture.
///
/// Each slot owns two accumulation textures. A composite reads one and writes
/// the other, then the roles swap, so the texture being written is never the
/// one being sampled.
pub struct DepthCompositeFilter {
    settings: CellSettings,
    live: Option<Box<FilterLive>>,
}

impl DepthCompositeFilter {
    pub fn new(settings: &CellSettings) -> Self {
        Self {
            settings: settings.clone(),
            live: None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.live.is_some()
    }

    fn live(&self, operation: &'static str) -> Result<&FilterLive, TerrainError> {
        self.live.as_deref().ok_or(TerrainError::InvalidState {
            operation,
            state: "uninitialized",
        })
    }

    fn live_mut(&mut self, operation: &'static str) -> Result<&mut FilterLive, TerrainError> {
        self.live.as_deref_mut().ok_or(TerrainError::InvalidState {
            operation,
            state: "uninitialized",
        })
    }

    pub fn initialize(&mut self, device: &mut dyn RenderDevice) -> Result<(), TerrainError> {
        if self.live.is_some() {
            return Err(TerrainError::InvalidState {
                operation: "initialize",
                state: "initialized",
            });
        }
        let mut created = Vec::new();
        match self.create_live(device, &mut created) {
            Ok(live) => {
                log::info!(
                    "depth composite filter initialized: {} cells of {}x{} texels",
                    CELL_COUNT,
                    self.settings.texture_size,
                    self.settings.texture_size
                );
                self.live = Some(Box::new(live));
                Ok(())
            }
            Err(err) => {
                for rid in created.into_iter().rev() {
                    free_if_valid(device, rid);
                }
                Err(err)
            }
        }
    }

    fn create_live(&self, device: &mut dyn RenderDevice, created: &mut Vec<Rid>) -> Result<FilterLive, TerrainError> {
        let size = self.settings.texture_size;
        let untouched = repeat_f32_bytes(UNTOUCHED, (size * size) as usize);
        let accumulation_desc = TextureDesc::new_2d(
            size,
            size,
            TextureFormat::R32Float,
            TextureUsage::SAMPLING | TextureUsage::STORAGE | TextureUsage::CAN_UPDATE | TextureUsage::CAN_COPY_FROM,
        );
        let depth_desc = TextureDesc::new_2d(
            size,
            size,
            TextureFormat::Depth32Float,
            TextureUsage::DEPTH_ATTACHMENT | TextureUsage::SAMPLING,
        );

        let mut cells = Vec::with_capacity(CELL_COUNT);
        for _ in 0..CELL_COUNT {
            let mut accumulation = [Rid::INVALID; 2];
            for target in &mut accumulation {
                *target = device.texture_create(&accumulation_desc, &[untouched.clone()])?;
                created.push(*target);
            }
            let depth = device.texture_create(&depth_desc, &[])?;
            created.push(depth);
            let framebuffer = device.framebuffer_create(&[depth])?;
            created.push(framebuffer);
            let camera_buffer = device.buffer_create(
                BufferKind::Uniform,
                std::mem::size_of::<CameraUniform>() as u64,
                None,
            )?;
            created.push(camera_buffer);
            cells.push(CellTargets {
                accumulation,
                current: 0,
                depth,
                framebuffer,
                camera_buffer,
            });
        }

        let capture_shader = device.shader_create(&capture_shader_desc())?;
        created.push(capture_shader);
        let capture_pipeline = device.render_pipeline_create(
            capture_shader,
            cells[0].framebuffer,
            &POSITION_ONLY,
            &PipelineState {
                primitive: Primitive::Triangles,
                depth_test: Some(CompareOp::Less),
                ..Default::default()
            },
        )?;
        created.push(capture_pipeline);
        let composite_shader = device.shader_create(&composite_shader_desc())?;
        created.push(composite_shader);
        let composite_pipeline = device.compute_pipeline_create(composite_shader)?;
        created.push(composite_pipeline);
        let params_buffer = device.buffer_create(
            BufferKind::Uniform,
            std::mem::size_of::<CompositeUniform>() as u64,
            None,
        )?;
        created.push(params_buffer);

        Ok(FilterLive {
            capture_shader,
            capture_pipeline,
            composite_shader,
            composite_pipeline,
            params_buffer,
            cells,
            deformers: Vec::new(),
            transforms: Vec::new(),
        })
    }

    /// Re-uploads deformer meshes when the registry is stale, otherwise only
    /// picks up the latest transforms.
    pub fn sync_deformers(
        &mut self,
        device: &mut dyn RenderDevice,
        registry: &mut dyn GeometryRegistry,
    ) -> Result<bool, TerrainError> {
        let live = self.live_mut("sync_deformers")?;
        if !registry.is_stale() {
            let transforms = registry.transforms();
            if transforms.len() != live.deformers.len() {
                return Err(TerrainError::SurfaceCountMismatch {
                    expected: live.deformers.len(),
                    actual: transforms.len(),
                });
            }
            live.transforms = transforms;
            return Ok(false);
        }
        for old in live.deformers.drain(..) {
            old.free(device);
        }
        live.transforms.clear();
        for surface in registry.deformable_surfaces() {
            let mut created = Vec::new();
            match upload_deformer(device, &surface, &mut created) {
                Ok(buffers) => {
                    live.deformers.push(buffers);
                    live.transforms.push(surface.transform);
                }
                Err(err) => {
                    for rid in created.into_iter().rev() {
                        free_if_valid(device, rid);
                    }
                    return Err(err);
                }
            }
        }
        registry.mark_synced();
        log::info!("depth composite filter tracking {} deformers", live.deformers.len());
        Ok(true)
    }

    /// Resets slots the grid just moved onto new cells to untouched snow.
    pub fn on_cells_recentered(&mut self, device: &mut dyn RenderDevice, step: &CellStep) -> Result<(), TerrainError> {
        let size = self.settings.texture_size as usize;
        let live = self.live_mut("on_cells_recentered")?;
        let untouched = repeat_f32_bytes(UNTOUCHED, size * size);
        for &slot in &step.recentered {
            let cell = &mut live.cells[slot];
            for target in cell.accumulation {
                device.texture_update(target, 0, &untouched)?;
            }
            cell.current = 0;
        }
        log::debug!("cleared recentred deformation slots {:?}", step.recentered);
        Ok(())
    }

    /// Captures and composites every update-enabled cell.
    pub fn run(
        &mut self,
        device: &mut dyn RenderDevice,
        grid: &DeformationCellGrid,
        height_texture: Rid,
        height: HeightTextureRef,
        max_height: f32,
    ) -> Result<(), TerrainError> {
        let settings = self.settings.clone();
        let live = self.live_mut("run")?;
        for cell in grid.cells().iter().filter(|c| c.update_enabled) {
            let targets = &live.cells[cell.index];
            device.buffer_update(
                targets.camera_buffer,
                0,
                bytemuck::bytes_of(&CameraUniform::from_camera(&cell.camera)),
            )?;
            capture(device, live, targets)?;

            let half = settings.cell_size / 2.0;
            let uniform = CompositeUniform {
                cell_corner: [cell.center.x - half, cell.center.y - half],
                cell_size: settings.cell_size,
                texture_size: settings.texture_size as f32,
                chunk_origin: [height.origin.x, height.origin.y],
                heightmap_half: height.half_extent,
                max_height,
                camera_y: cell.camera.position.y,
                near: settings.capture_near,
                far: settings.capture_far,
                snow_height: settings.snow_height,
            };
            device.buffer_update(live.params_buffer, 0, bytemuck::bytes_of(&uniform))?;
            composite(device, live, targets, height_texture, settings.texture_size)?;
            live.cells[cell.index].current ^= 1;
        }
        Ok(())
    }

    /// Latest accumulated texture of every slot.
    pub fn displacement_textures(&self) -> Result<[Rid; CELL_COUNT], TerrainError> {
        let live = self.live("displacement_textures")?;
        Ok(std::array::from_fn(|i| live.cells[i].read()))
    }

    /// Textures together with what the terrain shader needs to index them.
    pub fn displacement(&self, grid: &DeformationCellGrid) -> Result<([Rid; CELL_COUNT], usize, ToroidalMap), TerrainError> {
        Ok((self.displacement_textures()?, grid.active_index(), grid.toroidal_map()))
    }

    /// Reads one slot back and summarises it as a patch map.
    pub fn snapshot_patch_map(
        &self,
        device: &mut dyn RenderDevice,
        slot: usize,
        debug: &DebugSettings,
    ) -> Result<PatchMap, TerrainError> {
        let live = self.live("snapshot_patch_map")?;
        let cell = live
            .cells
            .get(slot)
            .ok_or_else(|| TerrainError::Snapshot(format!("no cell slot {}", slot)))?;
        let bytes = device.texture_get_data(cell.read(), 0)?;
        let values: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        PatchMap::from_displacement(&values, self.settings.texture_size as usize, debug.patch_map_grid)
    }

    pub fn cleanup(&mut self, device: &mut dyn RenderDevice) {
        if let Some(live) = self.live.take() {
            for deformer in &live.deformers {
                deformer.free(device);
            }
            for rid in live.handles() {
                free_if_valid(device, rid);
            }
            log::info!("depth composite filter cleaned up");
        }
    }
}

fn capture(device: &mut dyn RenderDevice, live: &FilterLive, targets: &CellTargets) -> Result<(), TerrainError> {
    let list = device.draw_list_begin(
        targets.framebuffer,
        ClearValues {
            color: None,
            depth: Some(1.0),
        },
    )?;
    let mut transient = Vec::with_capacity(live.deformers.len());
    let mut recorded = || -> Result<(), TerrainError> {
        device.draw_list_bind_render_pipeline(list, live.capture_pipeline)?;
        for (deformer, transform) in live.deformers.iter().zip(&live.transforms) {
            let model = ModelUniform {
                model: flatten_matrix_for_wgpu(*transform),
            };
            device.buffer_update(deformer.model_buffer, 0, bytemuck::bytes_of(&model))?;
            let set = device.uniform_set_create(
                &[
                    Uniform::Buffer {
                        binding: 0,
                        buffer: targets.camera_buffer,
                    },
                    Uniform::Buffer {
                        binding: 1,
                        buffer: deformer.model_buffer,
                    },
                ],
                live.capture_shader,
                0,
            )?;
            transient.push(set);
            device.draw_list_bind_uniform_set(list, set, 0)?;
            device.draw_list_bind_vertex_array(list, deformer.vertex_array)?;
            device.draw_list_bind_index_array(list, deformer.index_array)?;
            device.draw_list_draw(list, true, 1)?;
        }
        Ok(())
    };
    let result = recorded();
    let ended = device.draw_list_end(list);
    for set in transient {
        free_if_valid(device, set);
    }
    result?;
    ended?;
    Ok(())
}

fn composite(
    device: &mut dyn RenderDevice,
    live: &FilterLive,
    targets: &CellTargets,
    height_texture: Rid,
    texture_size: u32,
) -> Result<(), TerrainError> {
    let (read, write) = (targets.read(), targets.write());
    if read == write {
        return Err(DeviceError::InvalidUsage("composite would read its own output".into()).into());
    }
    let set = device.uniform_set_create(
        &[
            Uniform::Buffer {
                binding: 0,
                buffer: live.params_buffer,
            },
            Uniform::Texture {
                binding: 1,
                texture: read,
            },
            Uniform::Texture {
                binding: 2,
                texture: targets.depth,
            },
            Uniform::Texture {
                binding: 3,
                texture: height_texture,
            },
            Uniform::StorageTexture {
                binding: 4,
                texture: write,
            },
        ],
        live.composite_shader,
        0,
    )?;
    let groups = texture_size.div_ceil(WORKGROUP_SIZE);
    let dispatched = (|| -> Result<(), DeviceError> {
        let list = device.compute_list_begin()?;
        device.compute_list_bind_compute_pipeline(list, live.composite_pipeline)?;
        device.compute_list_bind_uniform_set(list, set, 0)?;
        device.compute_list_dispatch(list, groups, groups, 1)?;
        device.compute_list_end(list)
    })();
    free_if_valid(device, set);
    dispatched?;
    Ok(())
}

fn upload_deformer(
    device: &mut dyn RenderDevice,
    surface: &DeformableSurface,
    created: &mut Vec<Rid>,
) -> Result<DeformerBuffers, TerrainError> {
    let arrays = surface
        .mesh
        .surfaces
        .first()
        .ok_or_else(|| DeviceError::InvalidUsage("deformer mesh has no surfaces".into()))?;
    if surface.mesh.surfaces.len() > 1 {
        log::warn!("deformer mesh has {} sub-surfaces; only the first is captured", surface.mesh.surfaces.len());
    }
    if !arrays.is_consistent() || arrays.indices.is_empty() {
        return Err(DeviceError::InvalidUsage("inconsistent deformer arrays".into()).into());
    }
    let positions: &[u8] = bytemuck::cast_slice(&arrays.positions);
    let position_buffer = device.buffer_create(BufferKind::Vertex, positions.len() as u64, Some(positions))?;
    created.push(position_buffer);
    let indices: &[u8] = bytemuck::cast_slice(&arrays.indices);
    let index_buffer = device.buffer_create(BufferKind::Index, indices.len() as u64, Some(indices))?;
    created.push(index_buffer);
    let vertex_array = device.vertex_array_create(arrays.vertex_count() as u32, &[position_buffer])?;
    created.push(vertex_array);
    let index_array = device.index_array_create(index_buffer, arrays.indices.len() as u32)?;
    created.push(index_array);
    let model_buffer = device.buffer_create(
        BufferKind::Uniform,
        std::mem::size_of::<ModelUniform>() as u64,
        None,
    )?;
    created.push(model_buffer);
    Ok(DeformerBuffers {
        position_buffer,
        index_buffer,
        vertex_array,
        index_array,
        model_buffer,
    })
}
