//! Per-robot Kalman filter with a permanent and a speculative timeline.
//!
//! Vision frames and already-elapsed radio commands apply permanently, in
//! timestamp order. Queries re-derive a future state from the permanent one
//! so speculative prediction can never corrupt the history.
//!
//! Filter model after Browning/Bowling/Veloso, "Improbability Filtering for
//! Rejecting False Positives" (2002), with v_s and v_f swapped.

use std::collections::{HashMap, VecDeque};
use std::f32::consts::{FRAC_PI_2, PI};

use filter::KalmanFilter;
use nalgebra::Vector2;
use wire::radio::{KickStyle, RobotCommand};
use wire::vision::DetectionRobot;
use wire::world::{RobotRaw, WorldRobot};

use crate::{field_position, wrap_angle, PROCESSOR_TICK_DURATION};

const MAX_LINEAR_ACCELERATION: f32 = 10.0;
const MAX_ROTATION_ACCELERATION: f32 = 60.0;
const OMEGA_MAX: f32 = 10.0 * 2.0 * PI;

/// The primary camera hands over once it has been silent for this long.
const CAMERA_SWITCH_TIME: i64 = 100_000_000;

/// Raw measurements older than this do not contribute finite-difference
/// speeds.
const RAW_SPEED_WINDOW: i64 = 200_000_000;

// state (x, y, phi, v_s, v_f, omega), observing position and heading
type Kalman = KalmanFilter<6, 3>;

/// Measurement noise selection; the speed tracker runs the same filter with
/// a telemetry-biased profile.
#[derive(Debug, Clone, Copy)]
pub struct NoiseProfile {
    /// stddev (x, y, phi) for the primary camera
    pub primary: (f32, f32, f32),
    /// stddev (x, y, phi) for all other cameras
    pub secondary: (f32, f32, f32),
    /// apply the radio-command control input whenever one is known,
    /// regardless of its age
    pub control_always: bool,
}

impl NoiseProfile {
    /// Vision-grade tracking noise.
    pub fn vision() -> Self {
        Self {
            primary: (0.004, 0.004, 0.01),
            secondary: (0.02, 0.02, 0.03),
            control_always: false,
        }
    }

    /// Telemetry profile: position measurements barely correct the state,
    /// commanded speeds dominate.
    pub fn telemetry() -> Self {
        Self {
            primary: (0.1, 0.1, 0.25),
            secondary: (0.5, 0.5, 0.75),
            control_always: true,
        }
    }
}

pub struct RobotVisionFrame {
    pub camera_id: u32,
    pub detection: DetectionRobot,
    pub time: i64,
    pub vision_processing_time: i64,
}

struct RawMeasurement {
    time: i64,
    p_x: f32,
    p_y: f32,
    phi: f32,
    camera_id: u32,
}

pub struct RobotFilter {
    id: u32,
    kalman: Kalman,
    future_kalman: Kalman,
    last_time: i64,
    future_time: i64,
    predicted: Kalman,

    primary_camera: Option<u32>,
    last_primary_time: i64,
    frame_counter: u32,

    vision_frames: VecDeque<RobotVisionFrame>,
    radio_commands: VecDeque<(RobotCommand, i64)>,
    last_radio_command: Option<(RobotCommand, i64)>,
    future_radio_command: Option<(RobotCommand, i64)>,

    measurements: Vec<RawMeasurement>,
    last_raw: HashMap<u32, RobotRaw>,

    past_robot_pos: Vector2<f32>,
    past_dribbler_pos: Vector2<f32>,

    noise: NoiseProfile,
}

impl RobotFilter {
    pub fn new(robot: &DetectionRobot, last_time: i64, noise: NoiseProfile) -> Self {
        let pos = field_position(robot.x, robot.y);
        let state = [
            pos.x,
            pos.y,
            robot.orientation + FRAC_PI_2,
            0.0,
            0.0,
            0.0,
        ];
        let mut kalman = Kalman::new(state);
        // we can only observe the pose
        kalman.h[(0, 0)] = 1.0;
        kalman.h[(1, 1)] = 1.0;
        kalman.h[(2, 2)] = 1.0;

        let future_kalman = Self::derive_future(&kalman);
        let predicted = future_kalman.clone();
        Self {
            id: robot.robot_id.unwrap_or(0),
            kalman,
            future_kalman,
            last_time,
            future_time: last_time,
            predicted,
            primary_camera: None,
            last_primary_time: 0,
            frame_counter: 0,
            vision_frames: VecDeque::new(),
            radio_commands: VecDeque::new(),
            last_radio_command: None,
            future_radio_command: None,
            measurements: Vec::new(),
            last_raw: HashMap::new(),
            past_robot_pos: pos,
            past_dribbler_pos: pos,
            noise,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn last_update(&self) -> i64 {
        self.last_time
    }

    pub fn primary_camera(&self) -> Option<u32> {
        self.primary_camera
    }

    /// The future timeline observes the velocity block and starts as a copy
    /// of the permanent filter.
    fn derive_future(kalman: &Kalman) -> Kalman {
        let mut future = kalman.clone();
        future.h = filter::ObsMat::zeros();
        future.h[(0, 3)] = 1.0;
        future.h[(1, 4)] = 1.0;
        future.h[(2, 5)] = 1.0;
        future
    }

    fn reset_future(&mut self) {
        self.future_kalman = Self::derive_future(&self.kalman);
        self.future_time = self.last_time;
        self.future_radio_command = self.last_radio_command.clone();
    }

    /// Advances the filter to the best prediction for `time`.
    ///
    /// Vision frames apply permanently and must carry non-decreasing
    /// timestamps; radio commands interleave in timestamp order and only
    /// apply once their time has been reached.
    pub fn update(&mut self, time: i64) {
        let mut vision_updated = false;
        while let Some(frame) = self.vision_frames.front() {
            if frame.time > time {
                break;
            }
            let frame = self.vision_frames.pop_front().unwrap();

            // radio commands that reached the robot before this frame
            while let Some((_, command_time)) = self.radio_commands.front() {
                if *command_time > frame.time {
                    break;
                }
                let command = self.radio_commands.pop_front().unwrap();
                self.predict_permanent(command.1, false);
                self.last_radio_command = Some(command);
            }
            self.discard_elapsed_commands(frame.time);

            let camera_switched = self.check_camera(frame.camera_id, frame.time);
            self.predict_permanent(frame.time, camera_switched);
            self.apply_vision_frame(&frame);

            vision_updated = true;
        }

        if vision_updated || time < self.future_time {
            // prediction is rebased on the latest vision frame
            self.reset_future();
        }

        // commands newer than the future timeline advance it permanently
        let mut future_commands: Vec<(RobotCommand, i64)> = Vec::new();
        for command in &self.radio_commands {
            if command.1 > time {
                break;
            }
            if command.1 > self.future_time {
                future_commands.push(command.clone());
            }
        }
        for command in future_commands {
            self.predict_future(command.1);
            self.future_radio_command = Some(command);
        }

        // speculative predict to the requested time
        self.predicted = self.future_kalman.clone();
        let cmd = self.future_radio_command.clone();
        Self::predict_into(
            &mut self.predicted,
            self.future_time,
            time,
            false,
            cmd.as_ref(),
            &self.noise,
        );
    }

    fn discard_elapsed_commands(&mut self, time: i64) {
        while let Some((_, command_time)) = self.radio_commands.front() {
            if *command_time > time {
                break;
            }
            self.radio_commands.pop_front();
        }
    }

    fn predict_permanent(&mut self, time: i64, camera_switched: bool) {
        let cmd = self.last_radio_command.clone();
        Self::predict_into(
            &mut self.kalman,
            self.last_time,
            time,
            camera_switched,
            cmd.as_ref(),
            &self.noise,
        );
        self.last_time = time;
    }

    fn predict_future(&mut self, time: i64) {
        let cmd = self.future_radio_command.clone();
        Self::predict_into(
            &mut self.future_kalman,
            self.future_time,
            time,
            false,
            cmd.as_ref(),
            &self.noise,
        );
        self.future_time = time;
    }

    fn predict_into(
        kalman: &mut Kalman,
        last_time: i64,
        time: i64,
        camera_switched: bool,
        cmd: Option<&(RobotCommand, i64)>,
        noise: &NoiseProfile,
    ) {
        let time_diff = ((time - last_time).max(0)) as f32 * 1e-9;

        // local and global coordinate system are rotated by 90 degrees
        let phi = kalman.state()[2] - FRAC_PI_2;
        let v_s = kalman.state()[3];
        let v_f = kalman.state()[4];
        let omega = kalman.state()[5];

        kalman.f = filter::CovMat::identity();
        kalman.f[(0, 3)] = phi.cos() * time_diff;
        kalman.f[(0, 4)] = -phi.sin() * time_diff;
        kalman.f[(1, 3)] = phi.sin() * time_diff;
        kalman.f[(1, 4)] = phi.cos() * time_diff;
        kalman.f[(2, 5)] = time_diff;

        kalman.u = filter::StateVec::zeros();
        let command_known = match cmd {
            Some((_, command_time)) => {
                noise.control_always || time < *command_time + 2 * PROCESSOR_TICK_DURATION
            }
            None => false,
        };
        if command_known {
            let command = &cmd.unwrap().0;
            // radio commands are intended to be applied over one tick
            let cmd_interval = (PROCESSOR_TICK_DURATION as f32 * 1e-9).max(time_diff);

            let accel_s = (command.v_s - v_s) / cmd_interval;
            let accel_f = (command.v_f - v_f) / cmd_interval;
            let accel_omega = (command.omega - omega) / cmd_interval;

            kalman.u[3] =
                accel_s.clamp(-MAX_LINEAR_ACCELERATION, MAX_LINEAR_ACCELERATION) * time_diff;
            kalman.u[4] =
                accel_f.clamp(-MAX_LINEAR_ACCELERATION, MAX_LINEAR_ACCELERATION) * time_diff;
            kalman.u[5] = accel_omega.clamp(-MAX_ROTATION_ACCELERATION, MAX_ROTATION_ACCELERATION)
                * time_diff;
        }

        // prevent rotation speed windup
        if omega > OMEGA_MAX {
            kalman.u[5] = kalman.u[5].min(OMEGA_MAX - omega);
        } else if omega < -OMEGA_MAX {
            kalman.u[5] = kalman.u[5].max(-OMEGA_MAX + omega);
        }

        kalman.b = kalman.f;
        kalman.b[(0, 2)] = -(v_s * phi.sin() + v_f * phi.cos()) * time_diff;
        kalman.b[(1, 2)] = (v_s * phi.cos() - v_f * phi.sin()) * time_diff;

        // constant-acceleration process noise, no position error terms
        let sigma_a_x = 4.0f32;
        let sigma_a_y = 4.0f32;
        let sigma_a_phi = 10.0f32;
        let mut g = [
            time_diff * time_diff / 2.0 * sigma_a_x,
            time_diff * time_diff / 2.0 * sigma_a_y,
            time_diff * time_diff / 2.0 * sigma_a_phi,
            time_diff * sigma_a_x,
            time_diff * sigma_a_y,
            time_diff * sigma_a_phi,
        ];
        if camera_switched {
            // handle small errors in camera alignment
            g[0] += 0.02;
            g[1] += 0.02;
            g[2] += 0.05;
        }
        kalman.q = filter::CovMat::zeros();
        for axis in 0..3 {
            kalman.q[(axis, axis)] = g[axis] * g[axis];
            kalman.q[(axis, axis + 3)] = g[axis] * g[axis + 3];
            kalman.q[(axis + 3, axis)] = g[axis + 3] * g[axis];
            kalman.q[(axis + 3, axis + 3)] = g[axis + 3] * g[axis + 3];
        }

        kalman.predict();
    }

    fn check_camera(&mut self, camera_id: u32, time: i64) -> bool {
        match self.primary_camera {
            None => {
                self.primary_camera = Some(camera_id);
                self.last_primary_time = time;
                false
            }
            Some(primary) if primary == camera_id => {
                self.last_primary_time = time;
                false
            }
            Some(_) if self.last_primary_time + CAMERA_SWITCH_TIME < time => {
                self.primary_camera = Some(camera_id);
                self.last_primary_time = time;
                true
            }
            Some(_) => false,
        }
    }

    fn apply_vision_frame(&mut self, frame: &RobotVisionFrame) {
        self.past_robot_pos = self.robot_pos();
        self.past_dribbler_pos = self.dribbler_pos();

        let p_rot = self.kalman.state()[2];
        let p_rot_limited = wrap_angle(p_rot);
        if p_rot != p_rot_limited {
            // prevent rotation windup
            self.kalman.modify_state(2, p_rot_limited);
        }
        let rot = frame.detection.orientation + FRAC_PI_2;
        // prevent discontinuities
        let diff = wrap_angle(rot - p_rot_limited);

        let pos = field_position(frame.detection.x, frame.detection.y);
        self.measurements.push(RawMeasurement {
            time: frame.time,
            p_x: pos.x,
            p_y: pos.y,
            phi: p_rot_limited + diff,
            camera_id: frame.camera_id,
        });

        self.kalman.z[0] = pos.x;
        self.kalman.z[1] = pos.y;
        self.kalman.z[2] = p_rot_limited + diff;

        let stddev = if self.primary_camera == Some(frame.camera_id) {
            self.noise.primary
        } else {
            self.noise.secondary
        };
        self.kalman.r = filter::CovMat::zeros();
        self.kalman.r[(0, 0)] = stddev.0 * stddev.0;
        self.kalman.r[(1, 1)] = stddev.1 * stddev.1;
        self.kalman.r[(2, 2)] = stddev.2 * stddev.2;

        if self.kalman.update().is_err() {
            tracing::debug!(robot = self.id, "dropping degenerate vision update");
        }
    }

    /// Writes the predicted state into a world robot. `system_time` is the
    /// unscaled wall time used for the raw-measurement delay field.
    pub fn get(&mut self, flip: bool, no_raw_data: bool, system_time: i64) -> WorldRobot {
        let state = self.predicted.state();
        let mut px = state[0];
        let mut py = state[1];
        let mut phi = state[2];
        let v_s = state[3];
        let v_f = state[4];
        let tmp_phi = phi - FRAC_PI_2;
        let mut vx = tmp_phi.cos() * v_s - tmp_phi.sin() * v_f;
        let mut vy = tmp_phi.sin() * v_s + tmp_phi.cos() * v_f;
        let omega = state[5];

        if flip {
            phi += PI;
            px = -px;
            py = -py;
            vx = -vx;
            vy = -vy;
        }

        let mut robot = WorldRobot {
            id: self.id,
            p_x: px,
            p_y: py,
            phi: wrap_angle(phi),
            v_x: vx,
            v_y: vy,
            omega,
            raw: Vec::new(),
        };

        if no_raw_data {
            return robot;
        }

        for measurement in self.measurements.drain(..) {
            let (p_x, p_y, rot) = if flip {
                (-measurement.p_x, -measurement.p_y, measurement.phi + PI)
            } else {
                (measurement.p_x, measurement.p_y, measurement.phi)
            };
            let mut raw = RobotRaw {
                time: measurement.time,
                p_x,
                p_y,
                phi: wrap_angle(rot),
                camera_id: measurement.camera_id,
                v_x: None,
                v_y: None,
                omega: None,
                time_diff_scaled: None,
                system_delay: None,
            };

            if let Some(prev) = self.last_raw.get(&raw.camera_id) {
                if raw.time > prev.time && prev.time + RAW_SPEED_WINDOW > raw.time {
                    let dt = (raw.time - prev.time) as f32 * 1e-9;
                    raw.v_x = Some((raw.p_x - prev.p_x) / dt);
                    raw.v_y = Some((raw.p_y - prev.p_y) / dt);
                    raw.omega = Some(wrap_angle(raw.phi - prev.phi) / dt);
                    raw.time_diff_scaled = Some((raw.time - prev.time) as f32 * 1e-7);
                    raw.system_delay = Some((system_time - raw.time) as f32 * 1e-9);
                }
            }
            self.last_raw.insert(raw.camera_id, raw.clone());
            robot.raw.push(raw);
        }
        robot
    }

    /// Distance from the vision-based (permanent) position to a detection.
    pub fn distance_to(&self, robot: &DetectionRobot) -> f32 {
        let detected = field_position(robot.x, robot.y);
        let state = self.kalman.state();
        (detected - Vector2::new(state[0], state[1])).norm()
    }

    pub fn robot_pos(&self) -> Vector2<f32> {
        let state = self.kalman.state();
        Vector2::new(state[0], state[1])
    }

    pub fn dribbler_pos(&self) -> Vector2<f32> {
        let state = self.kalman.state();
        let phi = wrap_angle(state[2]);
        self.robot_pos() + 0.08 * Vector2::new(phi.cos(), phi.sin())
    }

    /// Global speed from the permanent timeline.
    pub fn speed(&self) -> Vector2<f32> {
        let state = self.kalman.state();
        let tmp_phi = state[2] - FRAC_PI_2;
        Vector2::new(
            tmp_phi.cos() * state[3] - tmp_phi.sin() * state[4],
            tmp_phi.sin() * state[3] + tmp_phi.cos() * state[4],
        )
    }

    pub fn angular_velocity(&self) -> f32 {
        self.kalman.state()[5]
    }

    /// Pose at the previous vision frame.
    pub fn past_pose(&self) -> (Vector2<f32>, Vector2<f32>) {
        (self.past_robot_pos, self.past_dribbler_pos)
    }

    pub fn kick_is_chip(&self) -> bool {
        matches!(
            self.last_radio_command,
            Some((RobotCommand { kick_style: Some(KickStyle::Chip), .. }, _))
        )
    }

    pub fn kick_is_linear(&self) -> bool {
        matches!(
            self.last_radio_command,
            Some((RobotCommand { kick_style: Some(KickStyle::Linear), .. }, _))
        )
    }

    pub fn add_vision_frame(&mut self, camera_id: u32, robot: DetectionRobot, time: i64, vision_processing_time: i64) {
        self.vision_frames.push_back(RobotVisionFrame {
            camera_id,
            detection: robot,
            time,
            vision_processing_time,
        });
        // only count frames for the primary camera
        if self.primary_camera.is_none() || self.primary_camera == Some(camera_id) {
            self.frame_counter += 1;
        }
    }

    pub fn add_radio_command(&mut self, command: RobotCommand, time: i64) {
        self.radio_commands.push_back((command, time));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(x_mm: f32, y_mm: f32, orientation: f32) -> DetectionRobot {
        DetectionRobot {
            confidence: 1.0,
            robot_id: Some(4),
            x: x_mm,
            y: y_mm,
            orientation,
            pixel_x: 0.0,
            pixel_y: 0.0,
        }
    }

    fn feed(filter: &mut RobotFilter, frames: impl Iterator<Item = (i64, f32, f32, f32)>) {
        for (time, x, y, phi) in frames {
            filter.add_vision_frame(0, detection(x, y, phi), time, 0);
            filter.update(time);
        }
    }

    #[test]
    fn stationary_robot_settles() {
        let mut filter = RobotFilter::new(&detection(2000.0, -1000.0, 0.5), 0, NoiseProfile::vision());
        feed(
            &mut filter,
            (1..=20).map(|i| (i * PROCESSOR_TICK_DURATION, 2000.0, -1000.0, 0.5)),
        );
        let robot = filter.get(false, true, 0);
        assert!((robot.p_x - 1.0).abs() < 0.005);
        assert!((robot.p_y - 2.0).abs() < 0.005);
        assert!((robot.phi - (0.5 + FRAC_PI_2)).abs() < 0.01);
        assert!(robot.v_x.abs() < 0.05 && robot.v_y.abs() < 0.05);
    }

    #[test]
    fn emitted_heading_is_wrapped() {
        let mut filter = RobotFilter::new(&detection(0.0, 0.0, 3.0), 0, NoiseProfile::vision());
        feed(
            &mut filter,
            (1..=10).map(|i| (i * PROCESSOR_TICK_DURATION, 0.0, 0.0, 3.0)),
        );
        let robot = filter.get(false, true, 0);
        assert!(robot.phi > -PI && robot.phi <= PI);

        let flipped = {
            filter.update(10 * PROCESSOR_TICK_DURATION);
            filter.get(true, true, 0)
        };
        assert!(flipped.phi > -PI && flipped.phi <= PI);
        assert!((flipped.p_x + robot.p_x).abs() < 1e-6);
    }

    #[test]
    fn angular_velocity_does_not_wind_up() {
        let mut filter = RobotFilter::new(&detection(0.0, 0.0, 0.0), 0, NoiseProfile::vision());
        let spin = RobotCommand {
            omega: 25.0 * 2.0 * PI,
            ..Default::default()
        };
        for i in 1..=300 {
            let time = i * PROCESSOR_TICK_DURATION;
            filter.add_radio_command(spin.clone(), time - 1);
            let angle = wrap_angle(0.0);
            filter.add_vision_frame(0, detection(0.0, 0.0, angle), time, 0);
            filter.update(time);
        }
        let robot = filter.get(false, true, 0);
        assert!(robot.omega.abs() <= OMEGA_MAX + 1.0);
    }

    #[test]
    fn stale_frames_are_not_reapplied() {
        let mut filter = RobotFilter::new(&detection(0.0, 0.0, 0.0), 0, NoiseProfile::vision());
        feed(
            &mut filter,
            (1..=5).map(|i| (i * PROCESSOR_TICK_DURATION, 0.0, 0.0, 0.0)),
        );
        let frames_before = filter.frame_counter();
        // querying an older time must not consume anything twice
        filter.update(2 * PROCESSOR_TICK_DURATION);
        assert_eq!(filter.frame_counter(), frames_before);
        let robot = filter.get(false, true, 0);
        assert!(robot.p_x.abs() < 0.01);
    }

    #[test]
    fn camera_handover_keeps_position_continuous() {
        let mut filter = RobotFilter::new(&detection(1000.0, 0.0, 0.0), 0, NoiseProfile::vision());
        feed(
            &mut filter,
            (1..=30).map(|i| (i * PROCESSOR_TICK_DURATION, 1000.0, 0.0, 0.0)),
        );
        let before = filter.get(false, true, 0);
        // silence, then a different camera takes over
        let handover_time = 30 * PROCESSOR_TICK_DURATION + CAMERA_SWITCH_TIME + PROCESSOR_TICK_DURATION;
        filter.add_vision_frame(1, detection(1000.0, 0.0, 0.0), handover_time, 0);
        filter.update(handover_time);
        let after = filter.get(false, true, 0);
        assert_eq!(filter.primary_camera(), Some(1));
        assert!((before.p_x - after.p_x).abs() < 0.05);
        assert!((before.p_y - after.p_y).abs() < 0.05);
    }
}
