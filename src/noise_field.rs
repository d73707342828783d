use crate::config::FractalConfig;
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};

pub const MAX_OCTAVES: usize = 32;

/// Deterministic 2D fractal noise sampler.
///
/// Output is clamped to `[-1, 1]`; the same config and coordinates always
/// produce the same value, on any thread.
pub struct NoiseField {
    config: FractalConfig,
    fbm: Fbm<Perlin>,
}

impl NoiseField {
    pub fn new(config: FractalConfig) -> Self {
        let fbm = Fbm::<Perlin>::new(config.seed)
            .set_octaves(config.octaves.clamp(1, MAX_OCTAVES))
            .set_frequency(config.frequency)
            .set_lacunarity(config.lacunarity)
            .set_persistence(config.gain);
        Self { config, fbm }
    }

    pub fn config(&self) -> &FractalConfig {
        &self.config
    }

    pub fn sample(&self, x: f64, y: f64) -> f32 {
        let value = self
            .fbm
            .get([x + self.config.offset[0], y + self.config.offset[1]]);
        value.clamp(-1.0, 1.0) as f32
    }

    /// Sample remapped to `[0, 1]`, the form stored in heightmaps.
    pub fn sample_unit(&self, x: f64, y: f64) -> f32 {
        (self.sample(x, y) + 1.0) / 2.0
    }
}

/// One-shot sampling; builds the fractal for a single lookup, so prefer a
/// long-lived [`NoiseField`] in loops.
pub fn sample_noise(x: f64, y: f64, config: &FractalConfig) -> f32 {
    NoiseField::new(config.clone()).sample(x, y)
}
