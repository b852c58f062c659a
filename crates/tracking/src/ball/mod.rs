//! The ball filter family: ground, fly and ground-collision filters plus
//! the per-hypothesis tracker that owns one of each.

use std::sync::{Arc, RwLock};

use field::CameraInfo;
use nalgebra::{Vector2, Vector3};
use wire::vision::DetectionBall;
use wire::world::WorldBall;

use crate::field_position;

pub mod collision;
pub mod fly;
pub mod ground;
pub mod tracker;

pub use tracker::BallTracker;

/// Camera registry shared between the tracker (writer) and the ball
/// filters (readers). Writes only happen on geometry frames, between filter
/// steps.
pub type SharedCameras = Arc<RwLock<CameraInfo>>;

/// Everything the ball filters know about one robot. Robots are referenced
/// by identifier, never by handle, so a pruned robot filter can not dangle
/// a ball-filter link.
#[derive(Debug, Clone, Copy, Default)]
pub struct RobotInfo {
    /// Team-unique identifier (id, with the blue team offset).
    pub identifier: u32,
    pub robot_pos: Vector2<f32>,
    pub dribbler_pos: Vector2<f32>,
    /// Pose at the previous vision frame, for segment tests against moving
    /// robots.
    pub past_robot_pos: Vector2<f32>,
    pub past_dribbler_pos: Vector2<f32>,
    pub speed: Vector2<f32>,
    pub angular_velocity: f32,
    pub chip_command: bool,
    pub linear_command: bool,
}

impl RobotInfo {
    /// Replaces the current pose with the past one; the intersection tests
    /// against a disappearing ball run in that frame.
    #[must_use]
    pub fn at_past_pose(&self) -> Self {
        Self {
            robot_pos: self.past_robot_pos,
            dribbler_pos: self.past_dribbler_pos,
            ..*self
        }
    }
}

/// One ball detection, converted into the field frame (meters), with the
/// nearest robot attached.
#[derive(Debug, Clone)]
pub struct VisionFrame {
    pub camera_id: u32,
    pub ball_area: u32,
    pub x: f32,
    pub y: f32,
    pub time: i64,
    pub robot: RobotInfo,
    pub chip_command: bool,
    pub linear_command: bool,
    pub vision_processing_time: i64,
}

impl VisionFrame {
    pub fn new(
        ball: &DetectionBall,
        time: i64,
        camera_id: u32,
        robot: RobotInfo,
        vision_processing_time: i64,
    ) -> Self {
        let pos = field_position(ball.x, ball.y);
        Self {
            camera_id,
            ball_area: ball.area,
            x: pos.x,
            y: pos.y,
            time,
            chip_command: robot.chip_command,
            linear_command: robot.linear_command,
            robot,
            vision_processing_time,
        }
    }

    pub fn pos(&self) -> Vector2<f32> {
        Vector2::new(self.x, self.y)
    }
}

/// Capability set shared by the ball filters. One level of dispatch is all
/// the tracker needs; the composite filters call each other directly.
pub trait BallFilter {
    fn process_vision_frame(&mut self, frame: &VisionFrame);

    fn accept_detection(&mut self, frame: &VisionFrame) -> bool;

    /// Writes the filter state at `time` into `ball`.
    /// `last_camera_frame_time` is the newest frame time of the primary
    /// camera, whether or not this hypothesis saw the ball in it.
    fn write_ball_state(
        &mut self,
        ball: &mut WorldBall,
        time: i64,
        robots: &[RobotInfo],
        last_camera_frame_time: i64,
    );

    /// Picks the best matching frame when one camera image contained several
    /// mutually exclusive balls.
    fn choose_ball(&mut self, frames: &[VisionFrame]) -> usize {
        let _ = frames;
        0
    }
}

#[inline]
pub(crate) fn perpendicular(dir: Vector2<f32>) -> Vector2<f32> {
    Vector2::new(dir.y, -dir.x)
}

/// Intersections of a line `offset + lambda * dir` with a circle, as
/// (point, lambda) pairs with `dir` normalized.
pub(crate) fn intersect_line_circle(
    offset: Vector2<f32>,
    dir: Vector2<f32>,
    center: Vector2<f32>,
    radius: f32,
) -> Vec<(Vector2<f32>, f32)> {
    let dir = dir.normalize();
    let const_part = offset - center;

    let a = dir.dot(&dir);
    let b = 2.0 * dir.dot(&const_part);
    let c = const_part.dot(&const_part) - radius * radius;

    let det = b * b - 4.0 * a * c;
    if det < 0.0 {
        return vec![];
    }
    if det < 0.00001 {
        let lambda = -b / (2.0 * a);
        return vec![(offset + dir * lambda, lambda)];
    }
    let lambda1 = (-b + det.sqrt()) / (2.0 * a);
    let lambda2 = (-b - det.sqrt()) / (2.0 * a);
    vec![(offset + dir * lambda1, lambda1), (offset + dir * lambda2, lambda2)]
}

pub(crate) fn intersect_line_segment_circle(
    p1: Vector2<f32>,
    p2: Vector2<f32>,
    center: Vector2<f32>,
    radius: f32,
) -> Option<Vector2<f32>> {
    let dist = (p2 - p1).norm();
    let mut intersections = intersect_line_circle(p1, p2 - p1, center, radius);
    if intersections.is_empty() {
        return None;
    }
    if intersections.len() == 1 {
        let (point, lambda) = intersections[0];
        return (lambda >= 0.0 && lambda <= dist).then_some(point);
    }
    if intersections[0].1 > intersections[1].1 {
        intersections.swap(0, 1);
    }
    intersections
        .into_iter()
        .find(|(_, lambda)| *lambda >= 0.0 && *lambda <= dist)
        .map(|(point, _)| point)
}

/// Intersection parameters (t1, t2) with `p = pos1 + dir1 * t1 = pos2 +
/// dir2 * t2`, unless the directions are collinear.
pub(crate) fn intersect_line_line(
    pos1: Vector2<f32>,
    dir1: Vector2<f32>,
    pos2: Vector2<f32>,
    dir2: Vector2<f32>,
) -> Option<(f32, f32)> {
    if (perpendicular(dir1).dot(&dir2)).abs() / (dir1.norm() * dir2.norm()) < 0.0001 {
        return None;
    }
    let normal1 = perpendicular(dir1);
    let normal2 = perpendicular(dir2);
    let diff = pos2 - pos1;
    let t1 = normal2.dot(&diff) / normal2.dot(&dir1);
    let t2 = -normal1.dot(&diff) / normal1.dot(&dir2);
    Some((t1, t2))
}

/// First intersection of the segment `p1..p2` with a robot footprint: the
/// hull circle cut off by the dribbler plane.
pub(crate) fn intersect_line_segment_robot(
    p1: Vector2<f32>,
    p2: Vector2<f32>,
    robot: &RobotInfo,
    robot_radius: f32,
    robot_size_factor: f32,
) -> Option<Vector2<f32>> {
    let mut robot_radius = robot_radius;
    let mut dribbler_pos = robot.dribbler_pos;
    if robot_size_factor != 1.0 {
        robot_radius *= robot_size_factor;
        dribbler_pos = robot.robot_pos + (robot.dribbler_pos - robot.robot_pos) * robot_size_factor;
    }

    let to_dribbler = (dribbler_pos - robot.robot_pos).normalize();
    let dribbler_sideways = perpendicular(to_dribbler);
    let dribbler_intersection = intersect_line_line(dribbler_pos, dribbler_sideways, p1, p2 - p1);
    let mut dribbler_intersection_pos = None;
    if let Some((t1, t2)) = dribbler_intersection {
        if (0.0..=1.0).contains(&t2) {
            let pos = dribbler_pos + dribbler_sideways * t1;
            if (pos - robot.robot_pos).norm() <= robot_radius {
                if (p1 - dribbler_pos).dot(&to_dribbler) >= 0.0 {
                    // the segment comes from in front of the robot, the
                    // dribbler-line intersection is the correct one
                    return Some(pos);
                }
                dribbler_intersection_pos = Some(pos);
            }
        }
    }

    let mut hull_intersection = intersect_line_segment_circle(p1, p2, robot.robot_pos, robot_radius);
    if let Some(pos) = hull_intersection {
        if (pos - dribbler_pos).dot(&to_dribbler) >= 0.0 {
            hull_intersection = None;
        }
    }
    match (dribbler_intersection_pos, hull_intersection) {
        (Some(dribbler), None) => Some(dribbler),
        (Some(dribbler), Some(hull)) => {
            // the closer of the two
            if (hull - p1).norm() < (dribbler - p1).norm() {
                Some(hull)
            } else {
                Some(dribbler)
            }
        }
        (None, hull) => hull,
    }
}

pub(crate) fn is_inside_robot(
    pos: Vector2<f32>,
    robot_pos: Vector2<f32>,
    dribbler_pos: Vector2<f32>,
    robot_radius: f32,
    size_factor: f32,
) -> bool {
    if (pos - robot_pos).norm() > robot_radius * size_factor {
        return false;
    }
    let to_dribbler = (dribbler_pos - robot_pos).normalize();
    let scaled_dribbler_pos = robot_pos + (dribbler_pos - robot_pos) * size_factor;
    (pos - scaled_dribbler_pos).dot(&to_dribbler) <= 0.0
}

/// Whether the camera at `camera_pos` can see a ball at `pos` past the
/// given robot: the sight line must not cross the robot's footprint at
/// robot height.
pub(crate) fn is_ball_visible(
    pos: Vector2<f32>,
    robot: &RobotInfo,
    robot_radius: f32,
    robot_height: f32,
    camera_pos: Vector3<f32>,
) -> bool {
    let to_ball = Vector3::new(pos.x, pos.y, field::BALL_RADIUS) - camera_pos;
    let length = (camera_pos.z - robot_height) / (camera_pos.z - field::BALL_RADIUS);
    let projected = camera_pos + to_ball * length;
    let projected_2d = Vector2::new(projected.x, projected.y);
    // assumes the ball is only invisible once its center is overshadowed
    let in_radius = (robot.robot_pos - projected_2d).norm() <= robot_radius;
    let front_of_dribbler =
        (projected_2d - robot.dribbler_pos).dot(&(robot.dribbler_pos - robot.robot_pos)) > 0.0;
    let has_intersection =
        intersect_line_segment_robot(pos, projected_2d, robot, robot_radius, 0.98).is_some();
    (!in_radius || front_of_dribbler) && !has_intersection
}
