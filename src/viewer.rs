use cgmath::{InnerSpace, Vector2, Vector3};

/// Viewer placement for one simulation tick. `position` is planar (x, z).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewerPose {
    pub position: Vector2<f32>,
    /// Heading in radians; 0 faces +x, positive turns toward +z.
    pub yaw: f32,
}

impl ViewerPose {
    pub fn forward(&self) -> Vector3<f32> {
        Vector3::new(self.yaw.cos(), 0.0, self.yaw.sin())
    }
}

/// Source of the viewer's position, polled once per simulation tick.
pub trait WorldPositionProvider {
    fn tick(&mut self, dt: f32) -> ViewerPose;
}

/// Walks a closed loop of waypoints at constant speed.
pub struct ScriptedWalk {
    waypoints: Vec<Vector2<f32>>,
    speed: f32,
    segment: usize,
    travelled: f32,
}

impl ScriptedWalk {
    /// Needs at least two waypoints; fewer leave the viewer standing at the
    /// first one.
    pub fn new(waypoints: Vec<Vector2<f32>>, speed: f32) -> Self {
        Self {
            waypoints,
            speed,
            segment: 0,
            travelled: 0.0,
        }
    }

    /// Square loop of edge `size` starting at `start`.
    pub fn square(start: Vector2<f32>, size: f32, speed: f32) -> Self {
        Self::new(
            vec![
                start,
                start + Vector2::new(size, 0.0),
                start + Vector2::new(size, size),
                start + Vector2::new(0.0, size),
            ],
            speed,
        )
    }

    fn segment_points(&self) -> (Vector2<f32>, Vector2<f32>) {
        let from = self.waypoints[self.segment];
        let to = self.waypoints[(self.segment + 1) % self.waypoints.len()];
        (from, to)
    }

    fn pose(&self) -> ViewerPose {
        let (from, to) = self.segment_points();
        let direction = to - from;
        let length = direction.magnitude();
        let position = if length > 0.0 {
            from + direction * (self.travelled / length)
        } else {
            from
        };
        ViewerPose {
            position,
            yaw: direction.y.atan2(direction.x),
        }
    }
}

impl WorldPositionProvider for ScriptedWalk {
    fn tick(&mut self, dt: f32) -> ViewerPose {
        match self.waypoints.len() {
            0 => {
                return ViewerPose {
                    position: Vector2::new(0.0, 0.0),
                    yaw: 0.0,
                }
            }
            1 => {
                return ViewerPose {
                    position: self.waypoints[0],
                    yaw: 0.0,
                }
            }
            _ => {}
        }
        self.travelled += self.speed * dt;
        loop {
            let (from, to) = self.segment_points();
            let length = (to - from).magnitude();
            if self.travelled < length {
                break;
            }
            self.travelled -= length;
            self.segment = (self.segment + 1) % self.waypoints.len();
            if length == 0.0 && self.waypoints.iter().all(|w| *w == self.waypoints[0]) {
                self.travelled = 0.0;
                break;
            }
        }
        self.pose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vector2<f32>, b: Vector2<f32>) -> bool {
        (a - b).magnitude() < 1e-4
    }

    #[test]
    fn walks_at_constant_speed() {
        let mut walk = ScriptedWalk::square(Vector2::new(0.0, 0.0), 10.0, 2.0);
        let pose = walk.tick(1.0);
        assert!(close(pose.position, Vector2::new(2.0, 0.0)));
        assert!(pose.yaw.abs() < 1e-6);
        let pose = walk.tick(5.0);
        assert!(close(pose.position, Vector2::new(10.0, 2.0)));
        assert!((pose.yaw - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
    }

    #[test]
    fn loop_wraps_to_start() {
        let mut walk = ScriptedWalk::square(Vector2::new(5.0, 5.0), 4.0, 1.0);
        let pose = walk.tick(16.5);
        assert!(close(pose.position, Vector2::new(5.5, 5.0)));
    }

    #[test]
    fn degenerate_routes_stand_still() {
        let mut walk = ScriptedWalk::new(vec![Vector2::new(3.0, 4.0)], 1.0);
        assert_eq!(walk.tick(1.0).position, Vector2::new(3.0, 4.0));
        let mut walk = ScriptedWalk::new(vec![Vector2::new(1.0, 1.0); 3], 1.0);
        assert_eq!(walk.tick(1.0).position, Vector2::new(1.0, 1.0));
    }

    #[test]
    fn forward_follows_yaw() {
        let pose = ViewerPose {
            position: Vector2::new(0.0, 0.0),
            yaw: std::f32::consts::FRAC_PI_2,
        };
        let forward = pose.forward();
        assert!(forward.x.abs() < 1e-6 && (forward.z - 1.0).abs() < 1e-6);
    }
}
