use crate::chunk_tracker::{ChunkShift, ChunkTracker};
use crate::collision::CollisionField;
use crate::config::TerrainConfig;
use crate::heightmap::{HeightmapBank, HeightmapPublished};
use crate::noise_field::NoiseField;
use cgmath::Vector2;

/// What changed during one simulation tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TerrainTick {
    pub shift: Option<ChunkShift>,
    pub published: Option<HeightmapPublished>,
    pub mesh_anchor_moved: bool,
}

/// Bound heightmap slot and the chunk origin its UVs are relative to.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeightTextureRef {
    pub slot: usize,
    pub origin: Vector2<f32>,
    pub half_extent: f32,
}

/// Drives chunk tracking, heightmap regeneration and the collision field
/// from the viewer's planar position.
pub struct TerrainStreamer {
    noise: NoiseField,
    tracker: ChunkTracker,
    bank: HeightmapBank,
    collision: CollisionField,
    mesh_anchor: Vector2<f32>,
    max_height: f32,
}

fn snap_to_grid(value: f32, step: f32) -> f32 {
    (value / step).round() * step
}

fn anchor_step(offset: f32) -> f32 {
    (offset.abs() - 1.0).ceil().max(0.0) * offset.signum()
}

impl TerrainStreamer {
    pub fn new(config: &TerrainConfig, viewer: Vector2<f32>) -> Self {
        let chunks = &config.chunks;
        let noise = NoiseField::new(config.noise.clone());
        let origin = Vector2::new(
            snap_to_grid(viewer.x, chunks.chunk_size),
            snap_to_grid(viewer.y, chunks.chunk_size),
        );
        let bank = HeightmapBank::new(chunks, &noise, origin);
        let mut collision = CollisionField::new(chunks.collision_size, chunks.max_height);
        collision.refresh(&noise, viewer);
        log::info!(
            "terrain streamer starting at chunk origin {:?} with {} heightmap slots",
            origin,
            chunks.heightmap_slots
        );
        Self {
            tracker: ChunkTracker::new(origin, chunks.chunk_size, chunks.threshold_multiplier),
            bank,
            collision,
            mesh_anchor: Vector2::new(viewer.x.round(), viewer.y.round()),
            max_height: chunks.max_height,
            noise,
        }
    }

    pub fn tick(&mut self, viewer: Vector2<f32>, dt: f32) -> TerrainTick {
        let shift = self.tracker.update(viewer);
        if let Some(shift) = shift {
            self.bank.request(shift.origin);
        }
        let published = self.bank.tick(&self.noise, dt);
        self.collision.refresh(&self.noise, viewer);

        let offset = viewer - self.mesh_anchor;
        let step = Vector2::new(anchor_step(offset.x), anchor_step(offset.y));
        self.mesh_anchor += step;

        TerrainTick {
            shift,
            published,
            mesh_anchor_moved: step != Vector2::new(0.0, 0.0),
        }
    }

    pub fn height_texture(&self) -> HeightTextureRef {
        let active = self.bank.active();
        HeightTextureRef {
            slot: self.bank.active_index(),
            origin: active.origin(),
            half_extent: active.resolution() as f32 / 2.0,
        }
    }

    pub fn chunk_origin(&self) -> Vector2<f32> {
        self.tracker.origin()
    }

    pub fn bank(&self) -> &HeightmapBank {
        &self.bank
    }

    pub fn noise(&self) -> &NoiseField {
        &self.noise
    }

    pub fn collision(&self) -> &CollisionField {
        &self.collision
    }

    /// Whole-unit position the terrain surface mesh is centred on.
    pub fn mesh_anchor(&self) -> Vector2<f32> {
        self.mesh_anchor
    }

    pub fn max_height(&self) -> f32 {
        self.max_height
    }

    /// World height of the published terrain under a planar position.
    pub fn surface_height(&self, x: f32, z: f32) -> f32 {
        self.bank.active().sample_world(x as f64, z as f64) * self.max_height
    }
}
