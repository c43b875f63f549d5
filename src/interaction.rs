//! Pointer and touch handling for the two interaction paths.
//!
//! A session runs either the [`DragController`], which turns the model
//! itself, or the [`OrbitController`], which moves the camera around it.
//! Never both on the same pointer stream.

use std::f32::consts::{FRAC_PI_2, TAU};

use glam::{Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::asset::AssetTransform;
use crate::camera::Camera;
use crate::engine::SurfaceSize;
use crate::host::ListenerKind;

pub const ORBIT_DAMPING: f32 = 0.05;
pub const MIN_DISTANCE: f32 = 1.0;
pub const MAX_DISTANCE: f32 = 10.0;
pub const MAX_POLAR_ANGLE: f32 = FRAC_PI_2;
/// Distance factor applied per wheel notch.
pub const ZOOM_STEP: f32 = 0.95;
/// Model units moved per dragged pixel while panning the model.
const MODEL_PAN_SPEED: f32 = 0.005;
const MIN_POLAR_ANGLE: f32 = 1e-4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PointerButton {
    Primary,
    Secondary,
    Middle,
}

/// What a drag does to its subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DragGesture {
    Rotate,
    Pan,
}

impl DragGesture {
    pub fn for_button(button: PointerButton) -> Self {
        match button {
            PointerButton::Primary => DragGesture::Rotate,
            PointerButton::Secondary | PointerButton::Middle => DragGesture::Pan,
        }
    }
}

/// Mouse, wheel and touch input in container pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PointerInput {
    Down { x: f32, y: f32, button: PointerButton },
    Move { x: f32, y: f32 },
    Up,
    /// Positive values zoom out.
    Wheel { delta_y: f32 },
    TouchStart { x: f32, y: f32, touches: u32 },
    TouchMove { x: f32, y: f32, touches: u32 },
    TouchEnd { touches: u32 },
}

impl PointerInput {
    /// The host listener that delivers this input.
    pub fn listener_kind(&self) -> ListenerKind {
        match self {
            PointerInput::Down { .. } => ListenerKind::PointerDown,
            PointerInput::Move { .. } => ListenerKind::PointerMove,
            PointerInput::Up => ListenerKind::PointerUp,
            PointerInput::Wheel { .. } => ListenerKind::Wheel,
            PointerInput::TouchStart { .. } => ListenerKind::TouchStart,
            PointerInput::TouchMove { .. } => ListenerKind::TouchMove,
            PointerInput::TouchEnd { .. } => ListenerKind::TouchEnd,
        }
    }
}

/// New camera distance after a wheel step, within the orbit limits.
pub fn zoomed_distance(distance: f32, delta_y: f32) -> f32 {
    let scaled = if delta_y > 0.0 {
        distance / ZOOM_STEP
    } else if delta_y < 0.0 {
        distance * ZOOM_STEP
    } else {
        distance
    };
    scaled.clamp(MIN_DISTANCE, MAX_DISTANCE)
}

/// Drag-to-rotate on the model.
#[derive(Debug, Clone)]
pub struct DragController {
    sensitivity: f32,
    gesture: Option<DragGesture>,
    anchor: Vec2,
}

impl DragController {
    pub fn new(sensitivity: f32) -> Self {
        Self {
            sensitivity,
            gesture: None,
            anchor: Vec2::ZERO,
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.gesture.is_some()
    }

    pub fn start(&mut self, gesture: DragGesture, position: Vec2) {
        self.gesture = Some(gesture);
        self.anchor = position;
    }

    /// Applies the movement since the last recorded position and moves the
    /// anchor. Repeating the same position changes nothing.
    pub fn drag_to(&mut self, position: Vec2, transform: &mut AssetTransform) -> bool {
        let Some(gesture) = self.gesture else {
            return false;
        };
        let delta = position - self.anchor;
        self.anchor = position;
        if delta == Vec2::ZERO {
            return false;
        }
        self.apply(gesture, delta, transform);
        true
    }

    /// Moves the anchor without touching any transform, for drags that
    /// happen while no model is loaded.
    pub fn track(&mut self, position: Vec2) {
        if self.gesture.is_some() {
            self.anchor = position;
        }
    }

    pub fn end(&mut self) {
        self.gesture = None;
    }

    pub fn apply(&self, gesture: DragGesture, delta: Vec2, transform: &mut AssetTransform) {
        match gesture {
            DragGesture::Rotate => {
                transform.yaw += delta.x * self.sensitivity;
                transform.pitch = (transform.pitch + delta.y * self.sensitivity)
                    .clamp(-FRAC_PI_2, FRAC_PI_2);
            }
            DragGesture::Pan => {
                transform.translation +=
                    Vec3::new(delta.x * MODEL_PAN_SPEED, -delta.y * MODEL_PAN_SPEED, 0.0);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct OrbitPose {
    target: Vec3,
    azimuth: f32,
    polar: f32,
    distance: f32,
}

impl OrbitPose {
    fn from_camera(camera: &Camera) -> Self {
        let offset = camera.position - camera.target;
        let distance = offset.length().max(f32::EPSILON);
        Self {
            target: camera.target,
            azimuth: offset.x.atan2(offset.z),
            polar: (offset.y / distance).clamp(-1.0, 1.0).acos(),
            distance,
        }
    }

    fn position(&self) -> Vec3 {
        let (sin_polar, cos_polar) = self.polar.sin_cos();
        let (sin_azimuth, cos_azimuth) = self.azimuth.sin_cos();
        self.target
            + Vec3::new(
                sin_polar * sin_azimuth,
                cos_polar,
                sin_polar * cos_azimuth,
            ) * self.distance
    }
}

/// Which orbit gestures are honoured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrbitGates {
    pub rotate: bool,
    pub zoom: bool,
    pub pan: bool,
}

/// Damped camera orbit around a target point.
#[derive(Debug, Clone)]
pub struct OrbitController {
    pose: OrbitPose,
    initial: OrbitPose,
    gates: OrbitGates,
    /// Radians per second; zero disables auto-rotation.
    auto_rotate_rate: f32,
    fov: f32,
    pending_azimuth: f32,
    pending_polar: f32,
    pending_pan: Vec3,
    gesture: Option<DragGesture>,
    anchor: Vec2,
}

impl OrbitController {
    pub fn new(camera: &Camera, gates: OrbitGates, auto_rotate_rate: f32) -> Self {
        let mut pose = OrbitPose::from_camera(camera);
        pose.distance = pose.distance.clamp(MIN_DISTANCE, MAX_DISTANCE);
        pose.polar = pose.polar.clamp(MIN_POLAR_ANGLE, MAX_POLAR_ANGLE);
        Self {
            pose,
            initial: pose,
            gates,
            auto_rotate_rate,
            fov: camera.fov,
            pending_azimuth: 0.0,
            pending_polar: 0.0,
            pending_pan: Vec3::ZERO,
            gesture: None,
            anchor: Vec2::ZERO,
        }
    }

    pub fn is_dragging(&self) -> bool {
        self.gesture.is_some()
    }

    pub fn distance(&self) -> f32 {
        self.pose.distance
    }

    pub fn azimuth(&self) -> f32 {
        self.pose.azimuth
    }

    pub fn start(&mut self, gesture: DragGesture, position: Vec2) {
        let allowed = match gesture {
            DragGesture::Rotate => self.gates.rotate,
            DragGesture::Pan => self.gates.pan,
        };
        if allowed {
            self.gesture = Some(gesture);
            self.anchor = position;
        }
    }

    /// Queues rotation or pan for the movement since the last position.
    pub fn drag_to(&mut self, position: Vec2, viewport: SurfaceSize) -> bool {
        let Some(gesture) = self.gesture else {
            return false;
        };
        let delta = position - self.anchor;
        self.anchor = position;
        if delta == Vec2::ZERO {
            return false;
        }
        self.apply(gesture, delta, viewport);
        true
    }

    /// Queues motion for a pixel delta, ignoring disabled gestures.
    pub fn apply(&mut self, gesture: DragGesture, delta: Vec2, viewport: SurfaceSize) {
        let height = viewport.height as f32;
        match gesture {
            DragGesture::Rotate if self.gates.rotate => {
                self.pending_azimuth -= TAU * delta.x / height;
                self.pending_polar -= TAU * delta.y / height;
            }
            DragGesture::Pan if self.gates.pan => {
                let per_pixel =
                    2.0 * self.pose.distance * (self.fov.to_radians() * 0.5).tan() / height;
                let (sin, cos) = self.pose.azimuth.sin_cos();
                let right = Vec3::new(cos, 0.0, -sin);
                self.pending_pan += (-right * delta.x + Vec3::Y * delta.y) * per_pixel;
            }
            _ => {}
        }
    }

    pub fn end(&mut self) {
        self.gesture = None;
    }

    pub fn zoom(&mut self, delta_y: f32) -> bool {
        if !self.gates.zoom {
            return false;
        }
        self.pose.distance = zoomed_distance(self.pose.distance, delta_y);
        true
    }

    /// Advances damping, spins by `spin_seconds` of auto-rotation, then
    /// moves `camera`.
    pub fn update(&mut self, spin_seconds: f32, camera: &mut Camera) {
        if self.auto_rotate_rate != 0.0 && self.gesture.is_none() {
            self.pose.azimuth += self.auto_rotate_rate * spin_seconds;
        }
        self.pose.azimuth += self.pending_azimuth * ORBIT_DAMPING;
        self.pose.polar = (self.pose.polar + self.pending_polar * ORBIT_DAMPING)
            .clamp(MIN_POLAR_ANGLE, MAX_POLAR_ANGLE);
        self.pose.target += self.pending_pan * ORBIT_DAMPING;

        let decay = 1.0 - ORBIT_DAMPING;
        self.pending_azimuth *= decay;
        self.pending_polar *= decay;
        self.pending_pan *= decay;

        camera.target = self.pose.target;
        camera.position = self.pose.position();
    }

    /// Returns to the pose captured at construction and drops pending motion.
    pub fn reset(&mut self, camera: &mut Camera) {
        self.pose = self.initial;
        self.pending_azimuth = 0.0;
        self.pending_polar = 0.0;
        self.pending_pan = Vec3::ZERO;
        self.gesture = None;
        camera.target = self.pose.target;
        camera.position = self.pose.position();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: OrbitGates = OrbitGates {
        rotate: true,
        zoom: true,
        pan: true,
    };

    #[test]
    fn drag_rotates_yaw_by_sensitivity() {
        let mut drag = DragController::new(0.01);
        let mut transform = AssetTransform::default();
        drag.start(DragGesture::Rotate, Vec2::new(100.0, 100.0));
        assert!(drag.drag_to(Vec2::new(110.0, 100.0), &mut transform));
        assert!(!drag.drag_to(Vec2::new(110.0, 100.0), &mut transform));
        drag.end();
        assert!(!drag.drag_to(Vec2::new(150.0, 100.0), &mut transform));
        assert!((transform.yaw - 0.1).abs() < 1e-6);
        assert_eq!(transform.pitch, 0.0);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut drag = DragController::new(0.01);
        let mut transform = AssetTransform::default();
        drag.start(DragGesture::Rotate, Vec2::ZERO);
        drag.drag_to(Vec2::new(0.0, 1000.0), &mut transform);
        assert_eq!(transform.pitch, FRAC_PI_2);
    }

    #[test]
    fn zoom_is_limited() {
        assert_eq!(zoomed_distance(9.9, 1.0), MAX_DISTANCE);
        assert_eq!(zoomed_distance(1.02, -1.0), MIN_DISTANCE);
        assert_eq!(zoomed_distance(5.0, 0.0), 5.0);
    }

    #[test]
    fn orbit_pose_round_trips_camera_position() {
        let camera = Camera::new(45.0, 1.0, 5.0);
        let mut orbit_camera = camera;
        let mut orbit = OrbitController::new(&camera, ALL, 0.0);
        orbit.update(0.016, &mut orbit_camera);
        assert!((orbit_camera.position - camera.position).length() < 1e-4);
    }

    #[test]
    fn orbit_drag_is_damped() {
        let mut camera = Camera::new(45.0, 1.0, 5.0);
        let mut orbit = OrbitController::new(&camera, ALL, 0.0);
        let viewport = SurfaceSize::new(400, 400);
        orbit.start(DragGesture::Rotate, Vec2::ZERO);
        orbit.drag_to(Vec2::new(40.0, 0.0), viewport);
        orbit.end();

        orbit.update(0.016, &mut camera);
        let first = orbit.azimuth();
        orbit.update(0.016, &mut camera);
        let second = orbit.azimuth() - first;
        assert!(first < 0.0);
        assert!(second.abs() < first.abs());
    }

    #[test]
    fn gates_block_disabled_gestures() {
        let camera = Camera::new(45.0, 1.0, 5.0);
        let gates = OrbitGates {
            rotate: false,
            zoom: false,
            pan: true,
        };
        let mut orbit = OrbitController::new(&camera, gates, 0.0);
        orbit.start(DragGesture::Rotate, Vec2::ZERO);
        assert!(!orbit.is_dragging());
        assert!(!orbit.zoom(1.0));
        orbit.start(DragGesture::Pan, Vec2::ZERO);
        assert!(orbit.is_dragging());
    }

    #[test]
    fn polar_angle_stays_above_the_ground() {
        let mut camera = Camera::new(45.0, 1.0, 5.0);
        let mut orbit = OrbitController::new(&camera, ALL, 0.0);
        orbit.start(DragGesture::Rotate, Vec2::ZERO);
        orbit.drag_to(Vec2::new(0.0, -4000.0), SurfaceSize::new(100, 100));
        for _ in 0..200 {
            orbit.update(0.016, &mut camera);
        }
        assert!(camera.position.y >= -1e-4);
    }

    #[test]
    fn auto_rotation_pauses_while_dragging() {
        let mut camera = Camera::new(45.0, 1.0, 5.0);
        let mut orbit = OrbitController::new(&camera, ALL, 1.0);
        orbit.update(1.0, &mut camera);
        assert!((orbit.azimuth() - 1.0).abs() < 1e-6);
        orbit.start(DragGesture::Rotate, Vec2::ZERO);
        orbit.update(1.0, &mut camera);
        assert!((orbit.azimuth() - 1.0).abs() < 1e-6);
    }
}
