use crate::noise_field::NoiseField;
use cgmath::Vector2;

/// Fine heightfield around the viewer for physics queries, sampled from the
/// same noise as the rendered heightmap so both agree.
pub struct CollisionField {
    size: usize,
    max_height: f32,
    corner: Vector2<f32>,
    heights: Vec<f32>,
}

impl CollisionField {
    pub fn new(size: usize, max_height: f32) -> Self {
        let edge = size + 1;
        Self {
            size,
            max_height,
            corner: Vector2::new(0.0, 0.0),
            heights: vec![0.0; edge * edge],
        }
    }

    pub fn corner(&self) -> Vector2<f32> {
        self.corner
    }

    pub fn heights(&self) -> &[f32] {
        &self.heights
    }

    /// Re-centres on the whole-unit position under `viewer` and resamples.
    pub fn refresh(&mut self, noise: &NoiseField, viewer: Vector2<f32>) {
        let half = (self.size / 2) as f32;
        self.corner = Vector2::new(viewer.x.floor() - half, viewer.y.floor() - half);
        let edge = self.size + 1;
        for i in 0..edge {
            for j in 0..edge {
                let x = self.corner.x as f64 + j as f64;
                let z = self.corner.y as f64 + i as f64;
                self.heights[i * edge + j] = noise.sample_unit(x, z) * self.max_height;
            }
        }
    }

    pub fn height_at(&self, x: f32, z: f32) -> f32 {
        let edge = self.size + 1;
        let max = self.size as f32;
        let fx = (x - self.corner.x).clamp(0.0, max);
        let fz = (z - self.corner.y).clamp(0.0, max);
        let (x0, z0) = (fx.floor() as usize, fz.floor() as usize);
        let (x1, z1) = ((x0 + 1).min(self.size), (z0 + 1).min(self.size));
        let (tx, tz) = (fx - x0 as f32, fz - z0 as f32);
        let h = |x: usize, z: usize| self.heights[z * edge + x];
        let near = h(x0, z0) + (h(x1, z0) - h(x0, z0)) * tx;
        let far = h(x0, z1) + (h(x1, z1) - h(x0, z1)) * tx;
        near + (far - near) * tz
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FractalConfig;

    #[test]
    fn grid_points_match_noise_heights() {
        let noise = NoiseField::new(FractalConfig::default());
        let mut field = CollisionField::new(8, 32.0);
        field.refresh(&noise, Vector2::new(100.7, -20.2));
        assert_eq!(field.corner(), Vector2::new(96.0, -25.0));
        let expected = noise.sample_unit(98.0, -22.0) * 32.0;
        assert!((field.height_at(98.0, -22.0) - expected).abs() < 1e-5);
    }

    #[test]
    fn queries_outside_clamp_to_edge() {
        let noise = NoiseField::new(FractalConfig::default());
        let mut field = CollisionField::new(4, 10.0);
        field.refresh(&noise, Vector2::new(0.0, 0.0));
        assert_eq!(field.height_at(-50.0, -50.0), field.heights()[0]);
        assert_eq!(field.height_at(50.0, 50.0), *field.heights().last().unwrap());
    }
}
