use cgmath::{Deg, EuclideanSpace, Matrix4, Point3, Rad, SquareMatrix, Vector3};

/// cgmath projections target OpenGL clip space (z in -1..1); wgpu wants 0..1.
#[rustfmt::skip]
pub const OPENGL_TO_WGPU_MATRIX: Matrix4<f32> = Matrix4::new(
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 0.5, 0.0,
    0.0, 0.0, 0.5, 1.0,
);

pub fn flatten_matrix_for_wgpu(matrix: Matrix4<f32>) -> [[f32; 4]; 4] {
    matrix.into()
}

/// View looking straight down -Y. Image right is +X and image rows grow
/// towards +Z, so texel (u, v) maps to world (x, z) without flips.
pub fn top_down_view(eye: Point3<f32>) -> Matrix4<f32> {
    Matrix4::look_at_rh(eye, eye - Vector3::unit_y(), -Vector3::unit_z())
}

/// Square orthographic projection covering `half_extent` on each side.
/// Depth is linear between `near` and `far`.
pub fn top_down_ortho(half_extent: f32, near: f32, far: f32) -> Matrix4<f32> {
    OPENGL_TO_WGPU_MATRIX
        * cgmath::ortho(-half_extent, half_extent, -half_extent, half_extent, near, far)
}

pub fn perspective_projection(fovy: Deg<f32>, aspect: f32, near: f32, far: f32) -> Matrix4<f32> {
    OPENGL_TO_WGPU_MATRIX * cgmath::perspective(fovy, aspect, near, far)
}

pub fn translate_matrix(x: f32, y: f32, z: f32) -> Matrix4<f32> {
    Matrix4::from_translation(Vector3::new(x, y, z))
}

pub fn rotation_matrix_yaw(angle: f32) -> Matrix4<f32> {
    Matrix4::from_angle_y(Rad(angle))
}

/// View, projection and eye position handed to draws.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Camera {
    pub view: Matrix4<f32>,
    pub projection: Matrix4<f32>,
    pub position: Point3<f32>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            view: Matrix4::identity(),
            projection: Matrix4::identity(),
            position: Point3::origin(),
        }
    }
}

impl Camera {
    pub fn look_at(eye: Point3<f32>, target: Point3<f32>, fovy: Deg<f32>, aspect: f32) -> Self {
        Self {
            view: Matrix4::look_at_rh(eye, target, Vector3::unit_y()),
            projection: perspective_projection(fovy, aspect, 0.1, 2000.0),
            position: eye,
        }
    }

    pub fn top_down(eye: Point3<f32>, half_extent: f32, near: f32, far: f32) -> Self {
        Self {
            view: top_down_view(eye),
            projection: top_down_ortho(half_extent, near, far),
            position: eye,
        }
    }

    pub fn view_projection(&self) -> Matrix4<f32> {
        self.projection * self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::{Vector4, InnerSpace};

    fn project(camera: &Camera, p: Point3<f32>) -> Vector4<f32> {
        let clip = camera.view_projection() * p.to_homogeneous();
        clip / clip.w
    }

    #[test]
    fn top_down_axes_match_texture_layout() {
        let camera = Camera::top_down(Point3::new(10.0, 50.0, -4.0), 8.0, 1.0, 101.0);
        let centre = project(&camera, Point3::new(10.0, 0.0, -4.0));
        assert!(centre.x.abs() < 1e-5 && centre.y.abs() < 1e-5);

        let east = project(&camera, Point3::new(18.0, 0.0, -4.0));
        assert!((east.x - 1.0).abs() < 1e-5);
        // Framebuffer rows grow downwards, i.e. with decreasing NDC y.
        let south = project(&camera, Point3::new(10.0, 0.0, 4.0));
        assert!((south.y + 1.0).abs() < 1e-5);
    }

    #[test]
    fn ortho_depth_is_linear_in_zero_one() {
        let camera = Camera::top_down(Point3::new(0.0, 10.0, 0.0), 4.0, 2.0, 12.0);
        let near = project(&camera, Point3::new(0.0, 8.0, 0.0));
        let mid = project(&camera, Point3::new(0.0, 3.0, 0.0));
        let far = project(&camera, Point3::new(0.0, -2.0, 0.0));
        assert!(near.z.abs() < 1e-5);
        assert!((mid.z - 0.5).abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }

    #[test]
    fn perspective_camera_looks_at_target() {
        let camera = Camera::look_at(
            Point3::new(0.0, 5.0, 10.0),
            Point3::new(0.0, 0.0, 0.0),
            Deg(60.0),
            1.5,
        );
        let target = project(&camera, Point3::new(0.0, 0.0, 0.0));
        assert!(target.x.abs() < 1e-5 && target.y.abs() < 1e-5);
        assert!(target.z > 0.0 && target.z < 1.0);
        assert!((camera.position.to_vec().magnitude() - 125f32.sqrt()).abs() < 1e-4);
    }
}
