use cgmath::Vector2;

/// A single whole-chunk move of the chunk origin.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChunkShift {
    pub origin: Vector2<f32>,
    /// Signed chunk steps per axis, each in `-1..=1`.
    pub step: Vector2<i32>,
}

/// Hysteresis controller turning a continuous viewer position into
/// chunk-origin steps.
///
/// Positions are planar: `x` is world x and `y` is world z.
#[derive(Clone, Debug)]
pub struct ChunkTracker {
    origin: Vector2<f32>,
    chunk_size: f32,
    threshold: f32,
}

impl ChunkTracker {
    pub fn new(origin: Vector2<f32>, chunk_size: f32, threshold_multiplier: f32) -> Self {
        Self {
            origin,
            chunk_size,
            threshold: chunk_size * threshold_multiplier / 2.0,
        }
    }

    pub fn origin(&self) -> Vector2<f32> {
        self.origin
    }

    pub fn threshold_distance(&self) -> f32 {
        self.threshold
    }

    fn axis_step(&self, offset: f32) -> i32 {
        if offset >= self.threshold {
            1
        } else if offset <= -self.threshold {
            -1
        } else {
            0
        }
    }

    /// Evaluates both axes independently and moves the origin by at most one
    /// chunk per axis. An offset of exactly the threshold already counts as
    /// outside, so a settled viewer is always strictly inside the deadband.
    pub fn update(&mut self, viewer: Vector2<f32>) -> Option<ChunkShift> {
        let offset = viewer - self.origin;
        let step = Vector2::new(self.axis_step(offset.x), self.axis_step(offset.y));
        if step == Vector2::new(0, 0) {
            return None;
        }
        self.origin.x += step.x as f32 * self.chunk_size;
        self.origin.y += step.y as f32 * self.chunk_size;
        log::info!(
            "chunk origin shifted by {:?} to {:?} (viewer at {:?})",
            step,
            self.origin,
            viewer
        );
        Some(ChunkShift {
            origin: self.origin,
            step,
        })
    }

    /// True once the viewer is inside the deadband on both axes.
    pub fn is_settled(&self, viewer: Vector2<f32>) -> bool {
        let offset = viewer - self.origin;
        offset.x.abs() < self.threshold && offset.y.abs() < self.threshold
    }
}
