pub mod cell_grid;
pub mod chunk_tracker;
pub mod collision;
pub mod config;
pub mod depth_composite;
pub mod error;
pub mod geometry;
pub mod heightmap;
pub mod matrix_operations;
pub mod noise_field;
pub mod patch_map;
mod present_pass;
pub mod render;
pub mod terrain;
pub mod viewer;

pub use crate::cell_grid::{DeformationCellGrid, ToroidalMap};
pub use crate::chunk_tracker::ChunkTracker;
pub use crate::config::TerrainConfig;
pub use crate::depth_composite::DepthCompositeFilter;
pub use crate::error::{DeviceError, TerrainError};
pub use crate::geometry::{GeometryRegistry, MeshData, SurfaceRegistry};
pub use crate::heightmap::HeightmapBank;
pub use crate::noise_field::NoiseField;
pub use crate::render::{RenderDevice, TerrainRenderBackend, WgpuDevice};
pub use crate::terrain::TerrainStreamer;

use crate::matrix_operations::{rotation_matrix_yaw, translate_matrix, Camera};
use crate::present_pass::{PresentBindings, PresentPass};
use crate::render::{HeightTextures, Rid, TextureDesc, TextureFormat, TextureUsage};
use crate::viewer::{ScriptedWalk, WorldPositionProvider};
use cgmath::{Deg, Point3, Vector2, Vector3};
use std::sync::Arc;
use web_time::Instant;
use winit::{
    event::{Event, WindowEvent},
    event_loop::EventLoop,
    window::WindowBuilder,
};

const FRAME_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;
const WALK_SPEED: f32 = 4.0;
const WALK_LOOP_SIZE: f32 = 160.0;
const FOLLOW_DISTANCE: f32 = 7.0;
const FOLLOW_HEIGHT: f32 = 4.0;

struct FrameTargets {
    color: Rid,
    depth: Rid,
}

impl FrameTargets {
    fn new(device: &mut dyn RenderDevice, width: u32, height: u32) -> Result<Self, TerrainError> {
        let color = device.texture_create(
            &TextureDesc::new_2d(
                width,
                height,
                FRAME_FORMAT,
                TextureUsage::COLOR_ATTACHMENT | TextureUsage::SAMPLING,
            ),
            &[],
        )?;
        let depth = device.texture_create(
            &TextureDesc::new_2d(
                width,
                height,
                TextureFormat::Depth32Float,
                TextureUsage::DEPTH_ATTACHMENT,
            ),
            &[],
        )?;
        Ok(Self { color, depth })
    }

    fn free(&self, device: &mut dyn RenderDevice) {
        render::free_if_valid(device, self.color);
        render::free_if_valid(device, self.depth);
    }
}

/// Everything the demo drives once per frame.
struct Scene {
    config: TerrainConfig,
    walk: ScriptedWalk,
    terrain: TerrainStreamer,
    heights: HeightTextures,
    grid: DeformationCellGrid,
    filter: DepthCompositeFilter,
    backend: TerrainRenderBackend,
    terrain_surfaces: SurfaceRegistry,
    deformers: SurfaceRegistry,
    foot: usize,
    targets: FrameTargets,
}

impl Scene {
    fn new(device: &mut WgpuDevice, config: TerrainConfig, width: u32, height: u32) -> Result<Self, TerrainError> {
        let start = Vector2::new(0.0, 0.0);
        let walk = ScriptedWalk::square(start, WALK_LOOP_SIZE, WALK_SPEED);
        let terrain = TerrainStreamer::new(&config, start);
        let heights = HeightTextures::new(device, terrain.bank())?;
        let ground = terrain.surface_height(start.x, start.y);
        let grid = DeformationCellGrid::new(&config.cells, start, ground);

        let mut filter = DepthCompositeFilter::new(&config.cells);
        filter.initialize(device)?;

        let targets = FrameTargets::new(device, width, height)?;
        let mut backend = TerrainRenderBackend::new(&config.render, &config.cells, terrain.max_height());
        backend.initialize(device, targets.color, targets.depth)?;

        let mut terrain_surfaces = SurfaceRegistry::new();
        let anchor = terrain.mesh_anchor();
        terrain_surfaces.add(
            Arc::new(MeshData::grid_patch(
                config.render.terrain_subdivisions,
                config.render.terrain_size,
            )),
            translate_matrix(anchor.x, 0.0, anchor.y),
        );
        let mut deformers = SurfaceRegistry::new();
        let foot = deformers.add(
            Arc::new(MeshData::box_mesh(Vector3::new(0.9, 0.1, 0.6))),
            translate_matrix(start.x, ground, start.y),
        );

        Ok(Self {
            config,
            walk,
            terrain,
            heights,
            grid,
            filter,
            backend,
            terrain_surfaces,
            deformers,
            foot,
            targets,
        })
    }

    fn frame(&mut self, device: &mut WgpuDevice, dt: f32, aspect: f32) -> Result<(), TerrainError> {
        let pose = self.walk.tick(dt);
        let tick = self.terrain.tick(pose.position, dt);
        self.heights.sync(device, self.terrain.bank())?;
        let ground = self.terrain.surface_height(pose.position.x, pose.position.y);

        if let Some(step) = self.grid.update(pose.position) {
            self.filter.on_cells_recentered(device, &step)?;
        }
        self.grid.set_capture_altitude(ground);
        self.deformers.set_transform(
            self.foot,
            translate_matrix(pose.position.x, ground, pose.position.y) * rotation_matrix_yaw(-pose.yaw),
        );
        self.filter.sync_deformers(device, &mut self.deformers)?;

        let (height_texture, height) = self.heights.height_texture(&self.terrain);
        self.filter
            .run(device, &self.grid, height_texture, height, self.terrain.max_height())?;

        if tick.mesh_anchor_moved {
            let anchor = self.terrain.mesh_anchor();
            self.terrain_surfaces
                .set_transform(0, translate_matrix(anchor.x, 0.0, anchor.y));
        }
        self.backend.update_height(height_texture, height)?;
        let (textures, _, map) = self.filter.displacement(&self.grid)?;
        self.backend.update_displacement(textures, map)?;
        self.backend.sync_surfaces(device, &mut self.terrain_surfaces)?;

        let forward = pose.forward();
        let feet = Point3::new(pose.position.x, ground, pose.position.y);
        let eye = feet - forward * FOLLOW_DISTANCE + Vector3::new(0.0, FOLLOW_HEIGHT, 0.0);
        let camera = Camera::look_at(eye, feet, Deg(60.0), aspect);
        self.backend.draw(device, &camera)
    }

    fn resize(&mut self, device: &mut WgpuDevice, width: u32, height: u32) -> Result<(), TerrainError> {
        let targets = FrameTargets::new(device, width, height)?;
        if let Err(err) = self.backend.resize(device, targets.color, targets.depth) {
            targets.free(device);
            return Err(err);
        }
        self.targets.free(device);
        self.targets = targets;
        Ok(())
    }

    fn shutdown(&mut self, device: &mut WgpuDevice) {
        if let Some(path) = self.config.debug.patch_map_path.clone() {
            let snapshot = self
                .filter
                .snapshot_patch_map(device, self.grid.active_index(), &self.config.debug)
                .and_then(|map| map.save_png(&path));
            match snapshot {
                Ok(()) => log::info!("wrote patch map to {}", path.display()),
                Err(err) => log::warn!("patch map snapshot failed: {}", err),
            }
        }
        self.backend.cleanup(device);
        self.filter.cleanup(device);
        self.heights.free(device);
        self.targets.free(device);
    }
}

fn load_config() -> TerrainConfig {
    match std::env::args().nth(1) {
        Some(path) => match TerrainConfig::load(&path) {
            Ok(config) => config,
            Err(err) => {
                log::error!("failed to load {}: {}; using defaults", path, err);
                TerrainConfig::default()
            }
        },
        None => TerrainConfig::default(),
    }
}

async fn arun() {
    env_logger::init();
    let config = load_config();

    let event_loop = EventLoop::new().unwrap();
    let window = WindowBuilder::new()
        .with_title("snowtrail")
        .build(&event_loop)
        .unwrap();
    let size = window.inner_size();

    let instance = wgpu::Instance::default();
    let surface = instance.create_surface(&window).unwrap();
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            compatible_surface: Some(&surface),
        })
        .await
        .expect("Failed to find an appropriate adapter");

    // Patch emulation reads control points from storage buffers in the
    // vertex stage.
    let required_limits = wgpu::Limits::default().using_resolution(adapter.limits());
    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: None,
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::MemoryUsage,
            },
            None,
        )
        .await
        .expect("Failed to create device");

    let swapchain_capabilities = surface.get_capabilities(&adapter);
    let swapchain_format = swapchain_capabilities.formats[0];
    let mut surface_config = surface
        .get_default_config(&adapter, size.width.max(1), size.height.max(1))
        .unwrap();
    surface.configure(&device, &surface_config);

    let mut device = WgpuDevice::new(device, queue);
    let mut scene = Scene::new(&mut device, config, surface_config.width, surface_config.height)
        .expect("Failed to set up the terrain scene");

    let present_pass = PresentPass::new(device.device(), swapchain_format);
    let mut present_bindings = PresentBindings::new(
        device.device(),
        &present_pass,
        device
            .texture_view(scene.targets.color)
            .expect("frame target is live"),
    );

    let mut last_frame = Instant::now();
    let window = &window;

    event_loop
        .run(move |event, target| {
            let _ = (&instance, &adapter);

            if let Event::AboutToWait = event {
                if target.exiting() {
                    return;
                }
                let now = Instant::now();
                let dt = now.duration_since(last_frame).as_secs_f32();
                last_frame = now;

                let aspect = surface_config.width as f32 / surface_config.height as f32;
                if let Err(err) = scene.frame(&mut device, dt, aspect) {
                    log::error!("frame failed: {}", err);
                    scene.shutdown(&mut device);
                    target.exit();
                    return;
                }

                let frame = surface
                    .get_current_texture()
                    .expect("Failed to acquire next swap chain texture");
                let view = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());
                let mut encoder = device
                    .device()
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: None });
                {
                    let mut rpass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: None,
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                    present_pass.record(&mut rpass, &present_bindings);
                }
                device.queue().submit(Some(encoder.finish()));
                frame.present();

                window.request_redraw();
            };

            if let Event::WindowEvent { window_id: _, event } = event {
                match event {
                    WindowEvent::Resized(new_size) => {
                        surface_config.width = new_size.width.max(1);
                        surface_config.height = new_size.height.max(1);
                        surface.configure(device.device(), &surface_config);
                        match scene.resize(&mut device, surface_config.width, surface_config.height) {
                            Ok(()) => {
                                if let Some(view) = device.texture_view(scene.targets.color) {
                                    present_bindings.update_frame(device.device(), &present_pass, view);
                                }
                            }
                            Err(err) => log::error!("resize failed: {}", err),
                        }
                        // On macos the window needs to be redrawn manually after resizing
                        window.request_redraw();
                    }
                    WindowEvent::RedrawRequested => {}
                    WindowEvent::CloseRequested => {
                        scene.shutdown(&mut device);
                        target.exit();
                    }
                    _ => {}
                };
            }
        })
        .unwrap();
}

pub fn run() {
    pollster::block_on(arun());
}
