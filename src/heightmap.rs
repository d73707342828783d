use crate::config::ChunkSettings;
use crate::noise_field::NoiseField;
use cgmath::Vector2;
use rayon::prelude::*;

/// One heightmap slot: `resolution²` unit-range samples centred on `origin`,
/// one sample per world unit, plus a box-filtered mip chain.
pub struct HeightmapBuffer {
    resolution: usize,
    samples: Vec<f32>,
    mips: Vec<Vec<f32>>,
    origin: Vector2<f32>,
    generation: u64,
}

impl HeightmapBuffer {
    pub fn new(resolution: usize) -> Self {
        Self {
            resolution,
            samples: vec![0.0; resolution * resolution],
            mips: Vec::new(),
            origin: Vector2::new(0.0, 0.0),
            generation: 0,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn origin(&self) -> Vector2<f32> {
        self.origin
    }

    /// Bumped every time the slot is rewritten.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Level 0 followed by every mip, each with its edge length.
    pub fn levels(&self) -> impl Iterator<Item = (usize, &[f32])> + '_ {
        let mut size = self.resolution;
        std::iter::once((self.resolution, self.samples.as_slice())).chain(self.mips.iter().map(
            move |mip| {
                size = (size / 2).max(1);
                (size, mip.as_slice())
            },
        ))
    }

    pub fn mip_count(&self) -> usize {
        1 + self.mips.len()
    }

    fn half_extent(&self) -> f64 {
        self.resolution as f64 / 2.0
    }

    /// World coordinate the noise field is evaluated at for texel `(j, i)`.
    pub fn texel_world(&self, j: usize, i: usize) -> (f64, f64) {
        let half = self.half_extent();
        (
            self.origin.x as f64 - half + j as f64,
            self.origin.y as f64 - half + i as f64,
        )
    }

    pub fn texel_uv(&self, j: usize, i: usize) -> (f64, f64) {
        let res = self.resolution as f64;
        (j as f64 / res, i as f64 / res)
    }

    /// Inverse of [`Self::texel_uv`] offset by the chunk origin; shaders do
    /// the same arithmetic.
    pub fn uv_to_world(&self, u: f64, v: f64) -> (f64, f64) {
        let res = self.resolution as f64;
        let half = self.half_extent();
        (
            self.origin.x as f64 + u * res - half,
            self.origin.y as f64 + v * res - half,
        )
    }

    /// Bilinear sample at a world position. Coordinates outside the slot are
    /// clamped to the border texels.
    pub fn sample_world(&self, x: f64, y: f64) -> f32 {
        let half = self.half_extent();
        let max = (self.resolution - 1) as f64;
        let fx = (x - self.origin.x as f64 + half).clamp(0.0, max);
        let fy = (y - self.origin.y as f64 + half).clamp(0.0, max);
        let (x0, y0) = (fx.floor() as usize, fy.floor() as usize);
        let (x1, y1) = ((x0 + 1).min(self.resolution - 1), (y0 + 1).min(self.resolution - 1));
        let (tx, ty) = ((fx - x0 as f64) as f32, (fy - y0 as f64) as f32);
        let at = |x: usize, y: usize| self.samples[y * self.resolution + x];
        let top = at(x0, y0) * (1.0 - tx) + at(x1, y0) * tx;
        let bottom = at(x0, y1) * (1.0 - tx) + at(x1, y1) * tx;
        top * (1.0 - ty) + bottom * ty
    }

    /// Rewrites the slot in place for `origin`. Deterministic for a given
    /// origin and noise config.
    pub fn generate(&mut self, noise: &NoiseField, origin: Vector2<f32>) {
        self.origin = origin;
        let res = self.resolution;
        let half = self.half_extent();
        let (ox, oy) = (origin.x as f64 - half, origin.y as f64 - half);
        self.samples
            .par_chunks_mut(res)
            .enumerate()
            .for_each(|(i, row)| {
                for (j, value) in row.iter_mut().enumerate() {
                    *value = noise.sample_unit(ox + j as f64, oy + i as f64);
                }
            });
        self.rebuild_mips();
        self.generation += 1;
    }

    fn rebuild_mips(&mut self) {
        self.mips.clear();
        let mut size = self.resolution;
        while size > 1 {
            let src: &[f32] = self.mips.last().map(Vec::as_slice).unwrap_or(&self.samples[..]);
            let next = (size / 2).max(1);
            let mut dst = vec![0.0; next * next];
            dst.par_chunks_mut(next).enumerate().for_each(|(y, row)| {
                for (x, value) in row.iter_mut().enumerate() {
                    let mut sum = 0.0;
                    for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                        let sx = (2 * x + dx).min(size - 1);
                        let sy = (2 * y + dy).min(size - 1);
                        sum += src[sy * size + sx];
                    }
                    *value = sum / 4.0;
                }
            });
            self.mips.push(dst);
            size = next;
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Regeneration {
    Idle,
    /// Requested, not yet written.
    Pending { slot: usize, origin: Vector2<f32> },
    /// Written; waiting out the settle delay before publication.
    Ready { slot: usize, elapsed: f32 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HeightmapPublished {
    pub slot: usize,
    pub origin: Vector2<f32>,
    pub generation: u64,
}

/// Ring of heightmap slots. At most one regeneration is in flight; requests
/// arriving meanwhile collapse into a single queued origin (latest wins).
pub struct HeightmapBank {
    slots: Vec<HeightmapBuffer>,
    active: usize,
    settle_delay: f32,
    state: Regeneration,
    queued: Option<Vector2<f32>>,
}

impl HeightmapBank {
    /// Every slot starts generated at `origin` with slot 0 active.
    pub fn new(settings: &ChunkSettings, noise: &NoiseField, origin: Vector2<f32>) -> Self {
        let slots = (0..settings.heightmap_slots)
            .map(|_| {
                let mut buffer = HeightmapBuffer::new(settings.heightmap_resolution);
                buffer.generate(noise, origin);
                buffer
            })
            .collect();
        Self {
            slots,
            active: 0,
            settle_delay: settings.settle_delay_secs,
            state: Regeneration::Idle,
            queued: None,
        }
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active(&self) -> &HeightmapBuffer {
        &self.slots[self.active]
    }

    pub fn slots(&self) -> &[HeightmapBuffer] {
        &self.slots
    }

    pub fn state(&self) -> Regeneration {
        self.state
    }

    pub fn queued(&self) -> Option<Vector2<f32>> {
        self.queued
    }

    fn next_slot(&self) -> usize {
        (self.active + 1) % self.slots.len()
    }

    pub fn request(&mut self, origin: Vector2<f32>) {
        if self.state == Regeneration::Idle {
            self.state = Regeneration::Pending {
                slot: self.next_slot(),
                origin,
            };
            return;
        }
        if let Some(previous) = self.queued.replace(origin) {
            log::warn!(
                "heightmap request for {:?} superseded by {:?} before regeneration started",
                previous,
                origin
            );
        } else {
            log::debug!("heightmap request for {:?} queued behind in-flight regeneration", origin);
        }
    }

    /// Advances the regeneration state machine by one simulation tick.
    /// Returns the publication if this tick swapped the active slot.
    pub fn tick(&mut self, noise: &NoiseField, dt: f32) -> Option<HeightmapPublished> {
        match self.state {
            Regeneration::Idle => None,
            Regeneration::Pending { slot, origin } => {
                let started = web_time::Instant::now();
                self.slots[slot].generate(noise, origin);
                log::debug!(
                    "regenerated heightmap slot {} at {:?} in {:?}",
                    slot,
                    origin,
                    started.elapsed()
                );
                self.state = Regeneration::Ready { slot, elapsed: 0.0 };
                None
            }
            Regeneration::Ready { slot, elapsed } => {
                let elapsed = elapsed + dt;
                if elapsed < self.settle_delay {
                    self.state = Regeneration::Ready { slot, elapsed };
                    return None;
                }
                self.active = slot;
                let buffer = &self.slots[slot];
                let published = HeightmapPublished {
                    slot,
                    origin: buffer.origin(),
                    generation: buffer.generation(),
                };
                log::info!("published heightmap slot {} at origin {:?}", slot, published.origin);
                self.state = match self.queued.take() {
                    Some(origin) => Regeneration::Pending {
                        slot: self.next_slot(),
                        origin,
                    },
                    None => Regeneration::Idle,
                };
                Some(published)
            }
        }
    }
}
