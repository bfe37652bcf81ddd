//! Fly camera: yaw/pitch orientation, keyboard translation, and the
//! view/projection matrices fed to the raygen shader.

use glam::{Mat4, Vec3};

const DEFAULT_SPEED: f32 = 50.0;
const DEFAULT_SENSITIVITY: f32 = 0.1;
const PITCH_LIMIT: f32 = 89.0;

/// Directions the keyboard can push the camera.
#[derive(Clone, Copy, Debug)]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
    Up,
    Down,
}

/// Snapshot of everything that affects the rendered image from the camera.
///
/// Compared per frame; any difference invalidates temporal accumulation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

pub struct Camera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    front: Vec3,
    right: Vec3,
    up: Vec3,
    world_up: Vec3,
    pub speed: f32,
    pub sensitivity: f32,
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    pub fn new(position: Vec3, yaw: f32, pitch: f32) -> Self {
        let mut cam = Camera {
            position,
            yaw,
            pitch,
            front: Vec3::NEG_Z,
            right: Vec3::X,
            up: Vec3::NEG_Y,
            // Vulkan clip space points Y down; so does our world up.
            world_up: Vec3::new(0.0, -1.0, 0.0),
            speed: DEFAULT_SPEED,
            sensitivity: DEFAULT_SENSITIVITY,
            fov_y_degrees: 45.0,
            near: 0.1,
            far: 10_000.0,
        };
        cam.update_vectors();
        cam
    }

    pub fn pose(&self) -> CameraPose {
        CameraPose {
            position: self.position,
            yaw: self.yaw,
            pitch: self.pitch,
        }
    }

    pub fn process_keyboard(&mut self, direction: MoveDirection, dt: f32) {
        let velocity = self.speed * dt;
        match direction {
            MoveDirection::Forward => self.position += self.front * velocity,
            MoveDirection::Backward => self.position -= self.front * velocity,
            MoveDirection::Left => self.position -= self.right * velocity,
            MoveDirection::Right => self.position += self.right * velocity,
            MoveDirection::Up => self.position += self.world_up * velocity,
            MoveDirection::Down => self.position -= self.world_up * velocity,
        }
    }

    pub fn process_mouse(&mut self, delta_x: f32, delta_y: f32) {
        self.yaw += delta_x * self.sensitivity;
        self.pitch += delta_y * self.sensitivity;
        self.pitch = self.pitch.clamp(-PITCH_LIMIT, PITCH_LIMIT);
        self.update_vectors();
    }

    fn update_vectors(&mut self) {
        let yaw = self.yaw.to_radians();
        let pitch = self.pitch.to_radians();
        let front = Vec3::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            yaw.sin() * pitch.cos(),
        );
        self.front = front.normalize();
        self.right = self.front.cross(self.world_up).normalize();
        self.up = self.right.cross(self.front).normalize();
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front, self.up)
    }

    /// Right-handed projection with Vulkan's [0,1] depth range and Y flip.
    pub fn projection_matrix(&self, aspect: f32) -> Mat4 {
        let mut proj = Mat4::perspective_rh(
            self.fov_y_degrees.to_radians(),
            aspect,
            self.near,
            self.far,
        );
        proj.y_axis.y *= -1.0;
        proj
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pose_reflects_movement() {
        let mut cam = Camera::new(Vec3::ZERO, -90.0, 0.0);
        let before = cam.pose();
        assert_eq!(before, cam.pose());

        cam.process_keyboard(MoveDirection::Forward, 0.1);
        assert_ne!(before, cam.pose());
    }

    #[test]
    fn pose_reflects_rotation() {
        let mut cam = Camera::new(Vec3::ZERO, -90.0, 0.0);
        let before = cam.pose();
        cam.process_mouse(1.0, 0.0);
        assert_ne!(before, cam.pose());
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = Camera::new(Vec3::ZERO, 0.0, 0.0);
        cam.process_mouse(0.0, 10_000.0);
        assert!(cam.pitch <= PITCH_LIMIT);
        cam.process_mouse(0.0, -100_000.0);
        assert!(cam.pitch >= -PITCH_LIMIT);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let cam = Camera::new(Vec3::ZERO, 0.0, 0.0);
        let proj = cam.projection_matrix(16.0 / 9.0);
        let unflipped =
            Mat4::perspective_rh(cam.fov_y_degrees.to_radians(), 16.0 / 9.0, cam.near, cam.far);
        assert_eq!(proj.y_axis.y, -unflipped.y_axis.y);
    }
}
