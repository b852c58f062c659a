//! Ground filter composite that models ball-robot contact: dribbling
//! locks, volley shots and balls that disappear into a robot.

use field::{BALL_RADIUS, DRIBBLER_WIDTH, ROBOT_HEIGHT, ROBOT_RADIUS};
use nalgebra::Vector2;
use wire::world::WorldBall;

use super::ground::GroundFilter;
use super::{
    intersect_line_segment_robot, is_ball_visible, is_inside_robot, perpendicular, BallFilter,
    RobotInfo, SharedCameras, VisionFrame,
};

/// A detection within this distance of the last reported ball is always
/// accepted.
const ACCEPT_BALL_DIST: f32 = 0.5;

/// Consecutive in-dribbler frames before the rotate-and-dribble lock can
/// engage. Empirical.
const DRIBBLE_LOCK_FRAMES: u32 = 15;

/// Inflation of the locked robot's silhouette for the visibility test.
/// Empirical.
const DRIBBLING_ROBOT_VISIBILITY_FACTOR: f32 = 1.05;

/// Ball offset pinned to a robot, stored in the robot-local dribbler frame
/// so it survives robot rotation.
#[derive(Debug, Clone, Copy)]
struct BallOffsetInfo {
    robot_identifier: u32,
    /// (toward dribbler, sideways) components relative to the robot center.
    ball_offset: Vector2<f32>,
    /// World position the ball would have if the robot pushes it.
    pushing_ball_pos: Vector2<f32>,
    force_dribble_mode: bool,
}

impl BallOffsetInfo {
    fn new(projected_ball_pos: Vector2<f32>, robot: &RobotInfo, force_dribbling: bool) -> Self {
        let to_dribbler = (robot.dribbler_pos - robot.robot_pos).normalize();
        Self {
            robot_identifier: robot.identifier,
            ball_offset: Vector2::new(
                (projected_ball_pos - robot.robot_pos).dot(&to_dribbler),
                (projected_ball_pos - robot.robot_pos).dot(&perpendicular(to_dribbler)),
            ),
            pushing_ball_pos: projected_ball_pos,
            force_dribble_mode: force_dribbling,
        }
    }
}

fn unproject_relative_position(relative_pos: Vector2<f32>, robot: &RobotInfo) -> Vector2<f32> {
    let to_dribbler = (robot.dribbler_pos - robot.robot_pos).normalize();
    robot.robot_pos + relative_pos.x * to_dribbler + relative_pos.y * perpendicular(to_dribbler)
}

fn set_ball_data(ball: &mut WorldBall, pos: Vector2<f32>, speed: Vector2<f32>) {
    ball.p_x = pos.x;
    ball.p_y = pos.y;
    ball.v_x = speed.x;
    ball.v_y = speed.y;
}

fn find_robot<'a>(robots: &'a [RobotInfo], identifier: u32) -> Option<&'a RobotInfo> {
    robots.iter().find(|robot| robot.identifier == identifier)
}

/// Ball speed while glued to a rotating robot: robot speed plus the
/// tangential component of the rotation.
fn dribbling_ball_speed(robot: &RobotInfo, relative_position: Vector2<f32>) -> Vector2<f32> {
    let absolute_offset = unproject_relative_position(relative_position, robot) - robot.robot_pos;
    let tangential_length = robot.angular_velocity * absolute_offset.norm();
    let tangential = -perpendicular(absolute_offset.normalize()) * tangential_length;
    robot.speed + tangential
}

pub struct GroundCollisionFilter {
    cameras: SharedCameras,
    primary_camera: u32,
    ground_filter: GroundFilter,
    last_update_time: i64,
    past_ball_state: WorldBall,
    dribble_offset: Option<BallOffsetInfo>,
    rotate_and_dribble_offset: Option<BallOffsetInfo>,
    in_dribbler_frames: u32,
    last_reported_ball_pos: Vector2<f32>,
    last_vision_frame: VisionFrame,
    had_robot_intersection: bool,
    last_valid_speed: f32,
    feasibly_invisible: bool,
}

impl GroundCollisionFilter {
    pub fn new(frame: &VisionFrame, cameras: SharedCameras) -> Self {
        Self {
            cameras,
            primary_camera: frame.camera_id,
            ground_filter: GroundFilter::new(frame),
            last_update_time: 0,
            past_ball_state: WorldBall::default(),
            dribble_offset: None,
            rotate_and_dribble_offset: None,
            in_dribbler_frames: 0,
            last_reported_ball_pos: frame.pos(),
            last_vision_frame: frame.clone(),
            had_robot_intersection: false,
            last_valid_speed: 0.0,
            feasibly_invisible: false,
        }
    }

    pub fn clone_for_camera(&self, primary_camera: u32) -> Self {
        Self {
            cameras: self.cameras.clone(),
            primary_camera,
            ground_filter: GroundFilter::with_camera(&self.ground_filter, primary_camera),
            last_update_time: self.last_update_time,
            past_ball_state: self.past_ball_state.clone(),
            dribble_offset: self.dribble_offset,
            rotate_and_dribble_offset: self.rotate_and_dribble_offset,
            in_dribbler_frames: self.in_dribbler_frames,
            last_reported_ball_pos: self.last_reported_ball_pos,
            last_vision_frame: self.last_vision_frame.clone(),
            had_robot_intersection: self.had_robot_intersection,
            last_valid_speed: self.last_valid_speed,
            feasibly_invisible: self.feasibly_invisible,
        }
    }

    pub fn primary_camera(&self) -> u32 {
        self.primary_camera
    }

    /// Whether an invisible ball is plausibly just occluded by a robot.
    pub fn is_feasibly_invisible(&self) -> bool {
        self.feasibly_invisible
    }

    fn camera_position(&self) -> nalgebra::Vector3<f32> {
        self.cameras
            .read()
            .unwrap()
            .position(self.primary_camera)
            .unwrap_or_else(|| nalgebra::Vector3::new(0.0, 0.0, 4.0))
    }

    /// After a shot against a robot the filter state still carries the
    /// incoming direction; reset so the post-collision velocity is unbiased.
    fn check_volley_shot(&mut self, frame: &VisionFrame) {
        let current_pos = Vector2::new(self.past_ball_state.p_x, self.past_ball_state.p_y);
        let current_speed = Vector2::new(self.past_ball_state.v_x, self.past_ball_state.v_y);
        const FUTURE_TIME_MS: f32 = 50.0;
        let future_pos = current_pos + current_speed * (FUTURE_TIME_MS * 0.001);
        let has_intersection =
            intersect_line_segment_robot(current_pos, future_pos, &frame.robot, ROBOT_RADIUS, 1.05)
                .is_some();

        let no_dribbling = current_speed.norm() - frame.robot.speed.norm() > 2.0
            || self.last_valid_speed - frame.robot.speed.norm() > 2.0;
        if !has_intersection && self.had_robot_intersection && no_dribbling {
            self.ground_filter.reset(frame);
            self.ground_filter.process_vision_frame(frame);
            self.ground_filter
                .write_ball_state(&mut self.past_ball_state, frame.time + 1, &[], 0);
        }
        if !has_intersection {
            self.last_valid_speed = current_speed.norm();
        }
        self.had_robot_intersection = has_intersection;
    }

    fn update_dribble_and_rotate(&mut self, frame: &VisionFrame) {
        let to_dribbler = (frame.robot.dribbler_pos - frame.robot.robot_pos).normalize();
        let sideways = perpendicular(to_dribbler);
        let front_dist = (frame.pos() - frame.robot.dribbler_pos).dot(&to_dribbler).abs();
        let side_dist = (frame.pos() - frame.robot.dribbler_pos).dot(&sideways).abs();

        let max_front_dist = BALL_RADIUS + 0.03;
        let max_side_dist = DRIBBLER_WIDTH + 0.02;
        if front_dist < max_front_dist && side_dist < max_side_dist {
            self.in_dribbler_frames += 1;
        } else {
            self.in_dribbler_frames = 0;
        }
        if let Some(offset) = &self.rotate_and_dribble_offset {
            if offset.robot_identifier != frame.robot.identifier {
                self.in_dribbler_frames = 0;
            }
        }
        self.rotate_and_dribble_offset = Some(BallOffsetInfo::new(frame.pos(), &frame.robot, true));
    }

    fn check_feasible_invisibility(&self, robots: &[RobotInfo]) -> bool {
        let Some(offset) = &self.dribble_offset else {
            return false;
        };
        let Some(robot) = find_robot(robots, offset.robot_identifier) else {
            return false;
        };
        let ball_pos = unproject_relative_position(offset.ball_offset, robot);
        let camera = self.camera_position();
        if !is_ball_visible(
            ball_pos,
            &robot.at_past_pose(),
            ROBOT_RADIUS * DRIBBLING_ROBOT_VISIBILITY_FACTOR,
            ROBOT_HEIGHT * DRIBBLING_ROBOT_VISIBILITY_FACTOR,
            camera,
        ) {
            return true;
        }
        robots.iter().any(|r| {
            !is_ball_visible(ball_pos, &r.at_past_pose(), ROBOT_RADIUS, ROBOT_HEIGHT, camera)
        })
    }

    fn update_dribbling(&mut self, robots: &[RobotInfo]) {
        let Some(offset) = &mut self.dribble_offset else {
            return;
        };
        let Some(robot) = find_robot(robots, offset.robot_identifier) else {
            return;
        };
        let robot = robot.at_past_pose();
        let ball_pos = unproject_relative_position(offset.ball_offset, &robot);
        let was_pushed = is_inside_robot(
            offset.pushing_ball_pos,
            robot.robot_pos,
            robot.dribbler_pos,
            ROBOT_RADIUS,
            1.0,
        );
        if was_pushed {
            offset.pushing_ball_pos = ball_pos;
        }
    }

    fn handle_dribbling(&mut self, ball: &mut WorldBall, robots: &[RobotInfo]) -> bool {
        let Some(offset) = self.dribble_offset else {
            return false;
        };
        let Some(robot) = find_robot(robots, offset.robot_identifier) else {
            return false;
        };

        let ball_pos = unproject_relative_position(offset.ball_offset, robot);
        let was_pushed = is_inside_robot(
            offset.pushing_ball_pos,
            robot.robot_pos,
            robot.dribbler_pos,
            ROBOT_RADIUS,
            1.0,
        );
        let camera = self.camera_position();
        let pushing_pos_visible = is_ball_visible(
            offset.pushing_ball_pos,
            robot,
            ROBOT_RADIUS * DRIBBLING_ROBOT_VISIBILITY_FACTOR,
            ROBOT_HEIGHT * DRIBBLING_ROBOT_VISIBILITY_FACTOR,
            camera,
        );
        let other_robot_obstruction = robots.iter().any(|r| {
            r.identifier != robot.identifier
                && !is_ball_visible(offset.pushing_ball_pos, r, ROBOT_RADIUS, ROBOT_HEIGHT, camera)
        });

        if pushing_pos_visible || other_robot_obstruction || was_pushed || offset.force_dribble_mode
        {
            let ball_speed = dribbling_ball_speed(robot, offset.ball_offset);
            set_ball_data(ball, ball_pos, ball_speed);
        } else {
            set_ball_data(ball, offset.pushing_ball_pos, Vector2::zeros());
        }
        true
    }

    fn check_ball_robot_intersection(
        &self,
        ball: &mut WorldBall,
        robot: &RobotInfo,
        past_pos: Vector2<f32>,
        current_pos: Vector2<f32>,
    ) -> bool {
        let mut outside_robot_past_pos = past_pos;
        let past_inside_current =
            is_inside_robot(past_pos, robot.robot_pos, robot.dribbler_pos, ROBOT_RADIUS, 1.01);
        if past_inside_current {
            outside_robot_past_pos = robot.robot_pos + (past_pos - robot.past_robot_pos);
            if is_inside_robot(
                outside_robot_past_pos,
                robot.robot_pos,
                robot.dribbler_pos,
                ROBOT_RADIUS,
                1.01,
            ) {
                if let Some(intersection) = intersect_line_segment_robot(
                    outside_robot_past_pos,
                    robot.robot_pos + (outside_robot_past_pos - robot.robot_pos).normalize(),
                    robot,
                    ROBOT_RADIUS,
                    1.05,
                ) {
                    outside_robot_past_pos = intersection;
                }
            }
        }

        if let Some(intersection) = intersect_line_segment_robot(
            outside_robot_past_pos,
            current_pos,
            robot,
            ROBOT_RADIUS,
            1.0,
        ) {
            set_ball_data(ball, intersection, robot.speed);
            return true;
        }
        false
    }

    /// Called once per camera frame the ball was not seen in: follows the
    /// locked robot or records a collision when the predicted ball entered
    /// one.
    fn update_empty_frame(&mut self, frame_time: i64, robots: &[RobotInfo]) {
        self.last_update_time = frame_time;
        let past_pos = Vector2::new(self.past_ball_state.p_x, self.past_ball_state.p_y);
        let past_speed = Vector2::new(self.past_ball_state.v_x, self.past_ball_state.v_y);
        self.ground_filter
            .write_ball_state(&mut self.past_ball_state, frame_time, robots, 0);
        let current_pos = Vector2::new(self.past_ball_state.p_x, self.past_ball_state.p_y);

        if self.dribble_offset.is_some() {
            self.update_dribbling(robots);
            return;
        }

        // ball rolled into a robot while invisible
        for r in robots {
            let robot = r.at_past_pose();
            if is_inside_robot(
                current_pos,
                robot.past_robot_pos,
                robot.past_dribbler_pos,
                ROBOT_RADIUS,
                1.0,
            ) {
                if let Some(intersection) =
                    intersect_line_segment_robot(past_pos, current_pos, &robot, ROBOT_RADIUS, 1.0)
                {
                    self.dribble_offset = Some(BallOffsetInfo::new(intersection, &robot, false));
                    return;
                }
                // both past and current position are inside the robot
                let relative_speed = past_speed - robot.speed;
                let project_dir = if relative_speed.norm() < 0.05 {
                    past_pos - robot.robot_pos
                } else {
                    -relative_speed
                };
                if let Some(intersection) = intersect_line_segment_robot(
                    past_pos,
                    past_pos + project_dir.normalize(),
                    &robot,
                    ROBOT_RADIUS,
                    1.0,
                ) {
                    self.dribble_offset = Some(BallOffsetInfo::new(intersection, &robot, false));
                    return;
                }
            }
        }

        // rotate-and-dribble: the ball vanished while sitting at the
        // dribbler long enough
        if self.dribble_offset.is_none() && self.in_dribbler_frames > DRIBBLE_LOCK_FRAMES {
            if let Some(offset) = self.rotate_and_dribble_offset {
                if let Some(r) = find_robot(robots, offset.robot_identifier) {
                    let robot = r.at_past_pose();
                    let unprojected = unproject_relative_position(offset.ball_offset, &robot);
                    if !is_ball_visible(
                        unprojected,
                        &robot,
                        ROBOT_RADIUS,
                        ROBOT_HEIGHT,
                        self.camera_position(),
                    ) {
                        self.dribble_offset = Some(offset);
                    }
                }
            }
        }
    }

    fn compute_ball_state(
        &mut self,
        ball: &mut WorldBall,
        time: i64,
        robots: &[RobotInfo],
        last_camera_frame_time: i64,
    ) {
        if self.last_update_time > 0 && last_camera_frame_time > self.last_update_time {
            self.update_empty_frame(last_camera_frame_time, robots);
            self.feasibly_invisible = self.check_feasible_invisibility(robots);
        }

        self.ground_filter
            .write_ball_state(ball, time, robots, last_camera_frame_time);

        if self.dribble_offset.is_some() {
            self.handle_dribbling(ball, robots);
            return;
        }

        let past_ball_pos = Vector2::new(self.past_ball_state.p_x, self.past_ball_state.p_y);
        let current_ball_pos = Vector2::new(ball.p_x, ball.p_y);
        for robot in robots {
            if self.check_ball_robot_intersection(ball, robot, past_ball_pos, current_ball_pos) {
                return;
            }
        }
    }
}

impl BallFilter for GroundCollisionFilter {
    fn process_vision_frame(&mut self, frame: &VisionFrame) {
        if self.dribble_offset.take().is_some() {
            // the ball is visible again, restart clean
            self.ground_filter.reset(frame);
        }

        self.feasibly_invisible = false;
        self.last_update_time = frame.time;
        self.last_vision_frame = frame.clone();

        self.ground_filter.process_vision_frame(frame);
        self.ground_filter
            .write_ball_state(&mut self.past_ball_state, frame.time + 1, &[], 0);

        self.check_volley_shot(frame);
        self.update_dribble_and_rotate(frame);
    }

    fn accept_detection(&mut self, frame: &VisionFrame) -> bool {
        let reported_ball_dist = (self.last_reported_ball_pos - frame.pos()).norm();
        reported_ball_dist < ACCEPT_BALL_DIST || self.ground_filter.accept_detection(frame)
    }

    fn write_ball_state(
        &mut self,
        ball: &mut WorldBall,
        time: i64,
        robots: &[RobotInfo],
        last_camera_frame_time: i64,
    ) {
        self.compute_ball_state(ball, time, robots, last_camera_frame_time);
        self.last_reported_ball_pos = Vector2::new(ball.p_x, ball.p_y);
    }

    fn choose_ball(&mut self, frames: &[VisionFrame]) -> usize {
        self.ground_filter.choose_ball(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROCESSOR_TICK_DURATION;
    use std::sync::{Arc, RwLock};

    fn shared_cameras() -> SharedCameras {
        let mut cameras = field::CameraInfo::default();
        cameras.update(0, 0.0, 0.0, 4000.0, 500.0);
        Arc::new(RwLock::new(cameras))
    }

    fn robot_with_pose(id: u32, pos: Vector2<f32>, facing: Vector2<f32>) -> RobotInfo {
        let dribbler = pos + facing.normalize() * 0.08;
        RobotInfo {
            identifier: id,
            robot_pos: pos,
            dribbler_pos: dribbler,
            past_robot_pos: pos,
            past_dribbler_pos: dribbler,
            ..Default::default()
        }
    }

    fn frame_at(x: f32, y: f32, time: i64, robot: RobotInfo) -> VisionFrame {
        VisionFrame {
            camera_id: 0,
            ball_area: 100,
            x,
            y,
            time,
            robot,
            chip_command: false,
            linear_command: false,
            vision_processing_time: 0,
        }
    }

    #[test]
    fn accepts_near_last_report_even_when_filter_disagrees() {
        let robot = robot_with_pose(1, Vector2::new(5.0, 5.0), Vector2::new(1.0, 0.0));
        let mut collision = GroundCollisionFilter::new(&frame_at(0.0, 0.0, 0, robot), shared_cameras());
        assert!(collision.accept_detection(&frame_at(0.49, 0.0, PROCESSOR_TICK_DURATION, robot)));
        assert!(!collision.accept_detection(&frame_at(2.0, 0.0, PROCESSOR_TICK_DURATION, robot)));
    }

    #[test]
    fn dribble_lock_follows_the_rotating_robot() {
        let pos = Vector2::new(1.0, 0.0);
        let facing = Vector2::new(1.0, 0.0);
        let robot = robot_with_pose(3, pos, facing);
        // ball pinned to the dribbler
        let ball_pos = robot.dribbler_pos + Vector2::new(BALL_RADIUS, 0.0);

        let mut collision =
            GroundCollisionFilter::new(&frame_at(ball_pos.x, ball_pos.y, 0, robot), shared_cameras());
        for i in 1..=(DRIBBLE_LOCK_FRAMES + 5) {
            let time = i as i64 * PROCESSOR_TICK_DURATION;
            collision.process_vision_frame(&frame_at(ball_pos.x, ball_pos.y, time, robot));
        }

        // detections cease; the robot has turned so the ball now sits in
        // its camera shadow (camera at the origin, robot facing away)
        let occluding_pos = Vector2::new(1.0, 0.3);
        let away_from_camera = occluding_pos.normalize();
        let occluding = robot_with_pose(3, occluding_pos, away_from_camera);
        let robots = [occluding];
        let gone_time = (DRIBBLE_LOCK_FRAMES as i64 + 20) * PROCESSOR_TICK_DURATION;
        let mut ball = WorldBall::default();
        collision.write_ball_state(&mut ball, gone_time, &robots, gone_time);

        assert!(collision.dribble_offset.is_some(), "dribble lock did not engage");
        // the reported ball keeps its dribbler-local offset: it sits in
        // front of the robot's new facing direction, rotated with it
        let reported = Vector2::new(ball.p_x, ball.p_y);
        let direction = (reported - occluding_pos).normalize();
        assert!(direction.dot(&away_from_camera) > 0.99);
        assert!((reported - occluding_pos).norm() > 0.08);
    }

    #[test]
    fn disappearing_ball_rolling_into_robot_sticks_at_the_entry_point() {
        let far_robot = robot_with_pose(7, Vector2::new(0.5, 0.0), Vector2::new(-1.0, 0.0));
        let mut collision =
            GroundCollisionFilter::new(&frame_at(0.0, 0.0, 0, far_robot), shared_cameras());
        // roll toward the robot at 1 m/s
        let mut time = 0;
        for i in 1..=30 {
            time = i * PROCESSOR_TICK_DURATION;
            let x = 0.01 * i as f32;
            collision.process_vision_frame(&frame_at(x, 0.0, time, far_robot));
        }
        // ball vanishes; per-tick queries carry the prediction into the
        // robot one step at a time, like the tracker does
        let robots = [far_robot];
        let mut ball = WorldBall::default();
        for i in 1..=40 {
            let query = time + i * PROCESSOR_TICK_DURATION;
            collision.write_ball_state(&mut ball, query, &robots, query);
        }

        // reported position stays at the hull, not inside the robot
        let dist_to_center = (Vector2::new(ball.p_x, ball.p_y) - far_robot.robot_pos).norm();
        assert!(dist_to_center > ROBOT_RADIUS * 0.8, "ball ended up inside the robot");
        assert!(ball.p_x <= 0.55);
    }

    #[test]
    fn volley_reset_clears_incoming_velocity_bias() {
        let robot = robot_with_pose(2, Vector2::new(1.0, 0.0), Vector2::new(-1.0, 0.0));
        let mut collision =
            GroundCollisionFilter::new(&frame_at(0.0, 0.0, 0, robot), shared_cameras());
        // fast approach toward the robot
        let mut i = 1;
        while i * PROCESSOR_TICK_DURATION < 300_000_000 {
            let t = i * PROCESSOR_TICK_DURATION;
            let x = 0.03 * i as f32;
            if x > 0.85 {
                break;
            }
            collision.process_vision_frame(&frame_at(x, 0.0, t, robot));
            i += 1;
        }
        // rebound frames away from the robot
        let rebound_start = i;
        for j in 0..10 {
            let t = (rebound_start + j) * PROCESSOR_TICK_DURATION;
            let x = 0.85 - 0.03 * j as f32;
            collision.process_vision_frame(&frame_at(x, 0.0, t, robot));
        }
        let mut ball = WorldBall::default();
        let t = (rebound_start + 10) * PROCESSOR_TICK_DURATION;
        collision.write_ball_state(&mut ball, t, &[robot], t);
        // velocity direction follows the rebound, not the approach
        assert!(ball.v_x < 0.5, "velocity still biased toward the robot: {}", ball.v_x);
    }
}
