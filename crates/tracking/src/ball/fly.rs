//! Chip-kick detection and parabolic flight reconstruction.
//!
//! A sliding window over the latest detections decides whether a shot
//! started; once one is tracked, four independent predicates decide whether
//! it is a chip. The flight is reconstructed by one of three approaches,
//! preferred in this order: least-squares over the stacked projection
//! equations, line-of-sight intersections between two cameras, and a
//! detection-area fallback that uses the apparent ball radius as a
//! pseudo-range.

use std::collections::VecDeque;

use nalgebra::{DMatrix, DVector, Matrix3, Vector2, Vector3};
use wire::world::WorldBall;

use super::{BallFilter, RobotInfo, SharedCameras, VisionFrame};
use crate::NS_PER_SEC;

/// Vertical speed retained after a floor contact.
const FLOOR_DAMPING: f32 = 0.55;
/// 60 Hz, 3 seconds in the air.
const MAX_FRAMES_PER_FLIGHT: usize = 200;
const ACCEPT_DIST: f32 = 0.35;
/// Must be greater or equal to the accept distance.
const ACTIVE_DIST: f32 = 0.5;
/// Frame count past which only the pseudo-inverse approach is trusted.
const APPROACH_SWITCH_FRAME_COUNT: usize = 16;

const GRAVITY: f32 = 9.81;

#[derive(Debug, Clone)]
struct ChipDetection {
    dribbler_speed: f32,
    abs_speed: f32,
    /// Nanoseconds since filter init.
    time: i64,
    ball_pos: Vector2<f32>,
    dribbler_pos: Vector2<f32>,
    robot_pos: Vector2<f32>,
    camera_id: u32,
    ball_area: f32,
    chip_command: bool,
    linear_command: bool,
}

impl ChipDetection {
    fn seconds(&self) -> f64 {
        self.time as f64 / NS_PER_SEC
    }
}

#[derive(Debug, Clone, Copy)]
struct PinvResult {
    x0: f32,
    y0: f32,
    z0: f32,
    vx: f32,
    vy: f32,
    vz: f32,
    dist_start_pos: f32,
    vx_control: f32,
    vy_control: f32,
    ref_speed: f32,
}

#[derive(Debug, Clone, Copy)]
struct IntersectionResult {
    ground_speed: Vector2<f32>,
    z_speed: f32,
}

struct Prediction {
    pos: Vector3<f32>,
    speed: Vector3<f32>,
}

/// Quadratic least squares over (t, value) points; the linear coefficient
/// is the launch speed of a gravity parabola.
#[derive(Default)]
struct QuadraticFitter {
    points: Vec<(f32, f32)>,
}

impl QuadraticFitter {
    fn add_point(&mut self, t: f32, value: f32) {
        self.points.push((t, value));
    }

    fn clear(&mut self) {
        self.points.clear();
    }

    /// Returns (a, b, c) of `a t^2 + b t + c`.
    fn fit(&self) -> Option<(f32, f32, f32)> {
        if self.points.len() < 3 {
            return None;
        }
        let mut normal = Matrix3::<f32>::zeros();
        let mut rhs = Vector3::<f32>::zeros();
        for &(t, value) in &self.points {
            let basis = Vector3::new(t * t, t, 1.0);
            normal += basis * basis.transpose();
            rhs += basis * value;
        }
        normal.try_inverse().map(|inv| {
            let solution = inv * rhs;
            (solution.x, solution.y, solution.z)
        })
    }
}

pub struct FlyFilter {
    cameras: SharedCameras,
    primary_camera: u32,

    chip_detected: bool,
    is_active: bool,
    shot_detected: bool,

    shot_detection_window: VecDeque<ChipDetection>,
    kick_frames: Vec<ChipDetection>,
    shot_start_frame: usize,

    chip_start_pos: Vector2<f32>,
    /// Nanoseconds since init.
    chip_start_time: f64,
    ground_speed: Vector2<f32>,
    z_speed: f32,
    touchdown_pos: Vector2<f32>,

    bouncing: bool,
    bounce_start_time: f64,
    bounce_z_speed: f32,
    bounce_start_pos: Vector2<f32>,
    bounce_ground_speed: Vector2<f32>,

    dist_to_start_pos: f32,
    init_time: i64,
    fly_fitter: QuadraticFitter,
    last_prediction_time: i64,
    accept_dist: f32,
}

impl FlyFilter {
    pub fn new(frame: &VisionFrame, cameras: SharedCameras) -> Self {
        Self {
            cameras,
            primary_camera: frame.camera_id,
            chip_detected: false,
            is_active: false,
            shot_detected: false,
            shot_detection_window: VecDeque::new(),
            kick_frames: Vec::new(),
            shot_start_frame: 0,
            chip_start_pos: Vector2::zeros(),
            chip_start_time: 0.0,
            ground_speed: Vector2::zeros(),
            z_speed: 0.0,
            touchdown_pos: Vector2::zeros(),
            bouncing: false,
            bounce_start_time: 0.0,
            bounce_z_speed: 0.0,
            bounce_start_pos: Vector2::zeros(),
            bounce_ground_speed: Vector2::zeros(),
            dist_to_start_pos: 0.0,
            init_time: frame.time,
            fly_fitter: QuadraticFitter::default(),
            last_prediction_time: frame.time,
            accept_dist: 0.0,
        }
    }

    pub fn clone_for_camera(&self, primary_camera: u32) -> Self {
        Self {
            cameras: self.cameras.clone(),
            primary_camera,
            chip_detected: self.chip_detected,
            is_active: self.is_active,
            shot_detected: self.shot_detected,
            shot_detection_window: self.shot_detection_window.clone(),
            kick_frames: self.kick_frames.clone(),
            shot_start_frame: self.shot_start_frame,
            chip_start_pos: self.chip_start_pos,
            chip_start_time: self.chip_start_time,
            ground_speed: self.ground_speed,
            z_speed: self.z_speed,
            touchdown_pos: self.touchdown_pos,
            bouncing: self.bouncing,
            bounce_start_time: self.bounce_start_time,
            bounce_z_speed: self.bounce_z_speed,
            bounce_start_pos: self.bounce_start_pos,
            bounce_ground_speed: self.bounce_ground_speed,
            dist_to_start_pos: self.dist_to_start_pos,
            init_time: self.init_time,
            fly_fitter: QuadraticFitter::default(),
            last_prediction_time: self.last_prediction_time,
            accept_dist: self.accept_dist,
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active && self.accept_dist < ACTIVE_DIST
    }

    /// True once per detected shot; reading consumes the flag.
    pub fn take_shot_detected(&mut self) -> bool {
        std::mem::take(&mut self.shot_detected)
    }

    pub fn dist_to_start_pos(&self) -> f32 {
        self.dist_to_start_pos
    }

    fn camera_position(&self, camera_id: u32) -> Vector3<f32> {
        self.cameras
            .read()
            .unwrap()
            .position(camera_id)
            .unwrap_or_else(|| Vector3::new(0.0, 0.0, 4.0))
    }

    fn focal_length(&self, camera_id: u32) -> f32 {
        self.cameras
            .read()
            .unwrap()
            .focal_length(camera_id)
            .unwrap_or(1.0)
    }

    /// 3-D position inferred from the apparent ball area: the reported area
    /// shrinks with camera distance, which gives a pseudo-range along the
    /// sight line.
    fn unproject(&self, detection: &ChipDetection, ball_radius: f32) -> Vector3<f32> {
        let f = self.focal_length(detection.camera_id);
        let a = detection.ball_area.max(1.0);
        let dist_inferred =
            f * (ball_radius / (a / std::f32::consts::PI).sqrt() + 1.0) / 1000.0;
        let cam = self.camera_position(detection.camera_id);
        let ball_ground = Vector3::new(detection.ball_pos.x, detection.ball_pos.y, 0.0);
        cam + (ball_ground - cam).normalize() * dist_inferred
    }

    fn check_is_shot(&mut self) -> bool {
        if self.shot_detection_window.len() < 4 {
            return false;
        }
        let window = &self.shot_detection_window;
        let anchor = window[0].dribbler_pos;
        let dribbler_dist: Vec<f32> = (0..4).map(|i| (anchor - window[i].ball_pos).norm()).collect();

        let dist = (window[1].ball_pos - window[3].ball_pos).norm() as f64;
        let time_diff = window[3].seconds() - window[1].seconds();
        let abs_speed = (dist / time_diff) as f32;

        let accelerating = window[1].dribbler_speed > window[0].dribbler_speed
            && window[1].dribbler_speed > 0.1
            && abs_speed > 1.0
            && window[1].abs_speed - window[0].abs_speed > 0.2;
        let leaving = dribbler_dist[0] < dribbler_dist[1]
            && dribbler_dist[1] < dribbler_dist[2]
            && dribbler_dist[2] < dribbler_dist[3]
            && dribbler_dist[3] - dribbler_dist[0] > 0.06
            && dribbler_dist[0] < 0.1;
        if accelerating && leaving {
            self.shot_start_frame = if window[0].dribbler_speed > 0.1 { 0 } else { 1 };
            return true;
        }
        false
    }

    fn num_measurements_with_own_camera(&self) -> usize {
        let last_camera = match self.kick_frames.last() {
            Some(frame) => frame.camera_id,
            None => return 0,
        };
        self.kick_frames.iter().filter(|m| m.camera_id == last_camera).count()
    }

    fn collision(&mut self) -> bool {
        if self.kick_frames.len() < 3 || !self.is_active {
            return false;
        }
        let n = self.kick_frames.len();
        let first = self.kick_frames[n - 3].ball_pos;
        let second = self.kick_frames[n - 2].ball_pos;
        let third = self.kick_frames[n - 1].ball_pos;

        let angle = ((first.y - second.y).atan2(first.x - second.x)
            - (third.y - second.y).atan2(third.x - second.x))
        .abs();
        let robot_dist = (third - self.kick_frames[n - 1].robot_pos).norm();
        let height = self.predict_trajectory(self.last_prediction_time).pos.z;

        use std::f32::consts::PI;
        (angle < 0.86 * PI || angle > 1.14 * PI) && height < 0.15 && robot_dist < 0.18
    }

    /// Least-squares reconstruction over the stacked projection equations.
    /// Solves the detailed 6-parameter system and the coarse 4-parameter
    /// control system whose launch point is pinned to the first airborne
    /// frame.
    fn calc_pinv(&mut self) -> Option<PinvResult> {
        let first_in_the_air = self.kick_frames.get(self.shot_start_frame)?.clone();
        let n = self.kick_frames.len();
        let rows = (n - self.shot_start_frame - 1) * 2;
        // both least-squares systems must be overdetermined
        if rows < 6 {
            return None;
        }

        let x0 = first_in_the_air.ball_pos.x;
        let y0 = first_in_the_air.ball_pos.y;

        let mut d_detailed = DMatrix::<f32>::zeros(rows, 6);
        let mut b_detailed = DVector::<f32>::zeros(rows);
        let mut d_control = DMatrix::<f32>::zeros(rows, 4);
        let mut b_control = DVector::<f32>::zeros(rows);

        for (row2, i) in ((self.shot_start_frame + 1)..n).enumerate() {
            let frame = &self.kick_frames[i];
            let cam = self.camera_position(frame.camera_id);
            let t_i = ((frame.time - first_in_the_air.time) as f64 / NS_PER_SEC) as f32;
            let x = frame.ball_pos.x;
            let y = frame.ball_pos.y;
            let alpha = (x - cam.x) / cam.z;
            let beta = (y - cam.y) / cam.z;
            let row = row2 * 2;

            // parameters: (z0, vz, x0, vx, y0, vy)
            d_detailed[(row, 0)] = alpha;
            d_detailed[(row, 1)] = alpha * t_i;
            d_detailed[(row, 2)] = 1.0;
            d_detailed[(row, 3)] = t_i;
            b_detailed[row] = 0.5 * GRAVITY * alpha * t_i * t_i + x;

            d_detailed[(row + 1, 0)] = beta;
            d_detailed[(row + 1, 1)] = beta * t_i;
            d_detailed[(row + 1, 4)] = 1.0;
            d_detailed[(row + 1, 5)] = t_i;
            b_detailed[row + 1] = 0.5 * GRAVITY * beta * t_i * t_i + y;

            // parameters: (z0, vz, vx, vy)
            d_control[(row, 0)] = alpha;
            d_control[(row, 1)] = alpha * t_i;
            d_control[(row, 2)] = t_i;
            b_control[row] = 0.5 * GRAVITY * alpha * t_i * t_i + x - x0;

            d_control[(row + 1, 0)] = beta;
            d_control[(row + 1, 1)] = beta * t_i;
            d_control[(row + 1, 3)] = t_i;
            b_control[row + 1] = 0.5 * GRAVITY * beta * t_i * t_i + y - y0;
        }

        let pi = d_detailed.svd(true, true).solve(&b_detailed, 1e-6).ok()?;
        let pi_control = d_control.svd(true, true).solve(&b_control, 1e-6).ok()?;

        let mut res = PinvResult {
            z0: pi[0],
            vz: pi[1],
            x0: pi[2],
            vx: pi[3],
            y0: pi[4],
            vy: pi[5],
            dist_start_pos: 0.0,
            vx_control: pi_control[2],
            vy_control: pi_control[3],
            ref_speed: 0.0,
        };

        let calculated_start = Vector2::new(res.x0, res.y0);
        let dist_start_pos = (calculated_start - first_in_the_air.ball_pos).norm();
        if !self.bouncing {
            // used for filter prioritisation
            self.dist_to_start_pos = dist_start_pos;
        }
        res.dist_start_pos = dist_start_pos;

        // reference ground speed from the first measurement of the current
        // camera, geometry offsets between cameras would corrupt it
        let last = self.kick_frames.last().unwrap();
        let mut reference = first_in_the_air.clone();
        if reference.camera_id != last.camera_id {
            for m in &self.kick_frames {
                if m.camera_id == last.camera_id && m.ball_pos != last.ball_pos {
                    reference = m.clone();
                    break;
                }
            }
        }
        let ref_time = last.seconds() - reference.seconds();
        if ref_time > 0.0 {
            res.ref_speed = ((reference.ball_pos - last.ball_pos).norm() as f64 / ref_time) as f32;
        }
        Some(res)
    }

    /// Line-of-sight reconstruction: each detection ray is intersected with
    /// the assumed ground direction, heights follow from the intercept
    /// theorem.
    fn calc_intersection(&self, pinv: &PinvResult) -> IntersectionResult {
        let start_frame = &self.kick_frames[self.shot_start_frame];
        let v_ground = if self.kick_frames.len() < 10 && start_frame.abs_speed < 1.0 {
            start_frame.ball_pos - start_frame.robot_pos
        } else {
            let mut v = Vector2::new(pinv.vx, pinv.vy);
            if pinv.vx * pinv.vx_control < 0.0 && pinv.vy * pinv.vy_control < 0.0 {
                v = Vector2::new(pinv.vx_control, pinv.vy_control);
            }
            v
        };

        let s = start_frame.ball_pos;
        let v = s + v_ground;
        let start_time = start_frame.seconds();

        let mut z_speed_sum = 0.0f64;
        let mut num_z_speeds = 0usize;
        let mut ground_speed_length = 0.0f64;
        for frame in &self.kick_frames[(self.shot_start_frame + 1)..] {
            let cam = self.camera_position(frame.camera_id);
            let k = Vector2::new(cam.x, cam.y);
            let p = frame.ball_pos;

            let numerator = (k.y - s.y) / (v.y - s.y) - (k.x - s.x) / (v.x - s.x);
            let denominator = (p.x - k.x) / (v.x - s.x) - (p.y - k.y) / (v.y - s.y);
            if denominator == 0.0 {
                continue;
            }
            let mu = numerator / denominator;
            let intersection = k + (p - k) * mu;

            let time_diff = (frame.seconds() - start_time) as f32;
            if time_diff <= 0.0 {
                continue;
            }
            ground_speed_length += ((s - intersection).norm() / time_diff) as f64;

            let h_cam = cam.z;
            let d = (p - intersection).norm();
            let big_d = (k - p).norm();
            let h = (h_cam * d) / big_d;

            z_speed_sum += (h / time_diff + GRAVITY * 0.5 * time_diff) as f64;
            num_z_speeds += 1;
        }
        let samples = (self.kick_frames.len() - self.shot_start_frame - 1).max(1);
        let ground_speed_length = ground_speed_length / samples as f64;
        let z_speed = if num_z_speeds > 0 {
            (z_speed_sum / num_z_speeds as f64) as f32
        } else {
            0.0
        };

        IntersectionResult {
            ground_speed: v_ground.normalize() * ground_speed_length as f32,
            z_speed,
        }
    }

    fn approach_pinv_apply(&mut self, pinv: &PinvResult) {
        let first_in_the_air = self.kick_frames[self.shot_start_frame].clone();
        self.chip_start_pos = first_in_the_air.ball_pos;
        self.chip_start_time = first_in_the_air.time as f64;
        self.ground_speed = Vector2::new(pinv.vx, pinv.vy);
        self.z_speed = pinv.vz;

        if pinv.dist_start_pos < 0.06 {
            self.chip_start_pos = Vector2::new(pinv.x0, pinv.y0);
        }

        // the fit's launch z is nonzero; shift the launch time to the
        // moment the parabola crossed the ground
        let vz = pinv.vz;
        let disc = (vz * vz + GRAVITY * pinv.z0 * 2.0).max(0.0).sqrt();
        let t1 = (vz + disc) / GRAVITY;
        let t2 = (vz - disc) / GRAVITY;
        let t = t1.min(t2);
        if t.is_nan() {
            self.reset_flight_reconstruction();
            return;
        }
        if pinv.dist_start_pos < 0.06 && t.abs() < 0.08 {
            self.chip_start_pos += self.ground_speed * t;
        }
        if t.abs() < 0.08 {
            self.z_speed = pinv.vz - GRAVITY * t;
        }
        if t.abs() < 0.04 {
            // maximum error 20 ms at 50 Hz
            self.chip_start_time = first_in_the_air.time as f64 + t as f64 * NS_PER_SEC;
        }
    }

    fn approach_intersect_apply(&mut self, intersection: &IntersectionResult) {
        let first_in_the_air = &self.kick_frames[self.shot_start_frame];
        self.chip_start_pos = first_in_the_air.ball_pos;
        // the actual kick was before the first airborne frame
        self.chip_start_time = first_in_the_air.time as f64 - 10_000_000.0;
        self.ground_speed = intersection.ground_speed;
        self.z_speed = intersection.z_speed;
    }

    fn approach_area_apply(&mut self) {
        let first_in_the_air = self.kick_frames[self.shot_start_frame].clone();
        self.chip_start_pos = first_in_the_air.ball_pos;
        self.chip_start_time = first_in_the_air.time as f64;
        self.z_speed = 0.0;
        self.ground_speed = Vector2::zeros();
        if self.kick_frames.len() < self.shot_start_frame + 4 {
            return;
        }

        let ball_radius = self.average_apparent_radius(100.0);

        let start = self.shot_start_frame + 2;
        let end = self.kick_frames.len();
        let num = (end - start) as f32;
        let mut speed_sum = Vector2::zeros();
        for frame in &self.kick_frames[start..end] {
            let time_diff = (frame.seconds() - first_in_the_air.seconds()) as f32;
            if time_diff <= 0.0 {
                continue;
            }
            let unprojected = self.unproject(frame, ball_radius);
            speed_sum +=
                (unprojected.xy() - first_in_the_air.ball_pos) / time_diff;
        }
        self.ground_speed = speed_sum / num;

        self.fly_fitter.clear();
        let start_time = self.kick_frames[self.shot_start_frame].seconds();
        for frame in &self.kick_frames[start..end] {
            let time = (frame.seconds() - start_time) as f32;
            let height = self.unproject(frame, ball_radius).z;
            self.fly_fitter.add_point(time, height);
        }
        if let Some((_, b, _)) = self.fly_fitter.fit() {
            self.z_speed = b;
        }
    }

    fn average_apparent_radius(&self, range_offset_mm: f32) -> f32 {
        let start = self.shot_start_frame + 1;
        let end = (self.shot_start_frame + 4).min(self.kick_frames.len());
        let mut ball_radius = 0.0;
        for frame in &self.kick_frames[start..end] {
            let ball_pos = Vector3::new(frame.ball_pos.x, frame.ball_pos.y, 0.0);
            let cam = self.camera_position(frame.camera_id);
            let d = (ball_pos - cam).norm() * 1000.0 - range_offset_mm;
            let focal_length = self.focal_length(frame.camera_id);
            ball_radius +=
                (d / focal_length - 1.0) * (frame.ball_area / std::f32::consts::PI).sqrt();
        }
        ball_radius / (end - start).max(1) as f32
    }

    fn approach_pinv_applicable(&self, pinv: &PinvResult) -> bool {
        let v_ground = Vector2::new(pinv.vx, pinv.vy);
        let center = self.kick_frames[0].ball_pos;
        let v_to_proj = inner_angle(center, self.kick_frames.last().unwrap().ball_pos, center + v_ground);

        pinv.z0 > -0.5
            && (pinv.z0 < 1.0 || (self.is_active && pinv.z0 < 4.0))
            && pinv.vz > 1.0
            && pinv.vz < 10.0
            && pinv.dist_start_pos < 0.4
            && (v_to_proj.is_nan() || v_to_proj < 0.7)
    }

    fn approach_intersect_applicable(&self, intersection: &IntersectionResult) -> bool {
        // the calculated direction must not differ too much from the
        // projection and has to lie between projection and camera
        let center = self.kick_frames[0].ball_pos;
        let last_ball = self.kick_frames.last().unwrap().ball_pos;
        let v_to_proj = inner_angle(center, last_ball, center + intersection.ground_speed);

        let cam3d = self.camera_position(self.kick_frames.last().unwrap().camera_id);
        let cam = Vector2::new(cam3d.x, cam3d.y);
        let angle_speed = inner_angle(center, cam, center + intersection.ground_speed);
        let angle_projection = inner_angle(center, cam, last_ball);

        angle_speed < angle_projection && v_to_proj < 0.7
    }

    fn parabolic_flight_reconstruct(&mut self, pinv: &PinvResult, intersection: &IntersectionResult) {
        if self.approach_pinv_applicable(pinv) && self.kick_frames.len() > APPROACH_SWITCH_FRAME_COUNT {
            self.approach_pinv_apply(pinv);
            self.is_active = true;
            return;
        }

        let last_ball = self.kick_frames.last().unwrap().ball_pos;
        let cam3d = self.camera_position(self.kick_frames.last().unwrap().camera_id);
        let cam = Vector2::new(cam3d.x, cam3d.y);
        let center = self.kick_frames[0].ball_pos;
        let intersection_angle = inner_angle(center, cam, last_ball);

        if intersection_angle < 0.4 {
            // flying almost straight at the camera, the rays barely move
            self.approach_area_apply();
            self.is_active = true;
        } else if self.approach_intersect_applicable(intersection) {
            self.approach_intersect_apply(intersection);
            self.is_active = true;
        } else {
            self.is_active = false;
        }
    }

    /// Chip predicate: the ground projection of a flying ball curves away
    /// from the launch line as seen by the camera.
    fn detection_curviness(&self, pinv: &PinvResult) -> bool {
        if self.kick_frames.len() < 5 {
            return false;
        }
        let cam_pos = self.camera_position(self.kick_frames[0].camera_id);

        let dp = self.kick_frames[0].ball_pos;
        let mut angles = Vec::with_capacity(self.kick_frames.len());
        for frame in &self.kick_frames[2..] {
            // the first angles are too noisy
            let ball = frame.ball_pos;
            let mut angle = (cam_pos.y - dp.y).atan2(cam_pos.x - dp.x)
                - (ball.y - dp.y).atan2(ball.x - dp.x);
            angle = (angle + 2.0 * std::f32::consts::PI).rem_euclid(2.0 * std::f32::consts::PI);
            angles.push(angle);
        }

        let slope = linear_slope(&angles);
        if self.kick_frames.len() < 8 && pinv.ref_speed < 2.0 {
            // reflection shots often have a distinct slope at low speeds
            return false;
        }
        slope.abs() > (-0.03212 * self.kick_frames.len() as f32 + 0.4873).max(0.06)
    }

    /// Chip predicate: area-based back-projection yields consistently
    /// rising heights.
    fn detection_height(&self) -> bool {
        if self.kick_frames.len() < 5 {
            return false;
        }
        if self.kick_frames.last().unwrap().camera_id != self.kick_frames[0].camera_id {
            // a camera change invalidates the apparent-radius assumption
            return false;
        }

        let ball_radius = self.average_apparent_radius(50.0);
        let heights: Vec<f32> = self
            .kick_frames
            .iter()
            .map(|m| self.unproject(m, ball_radius).z)
            .collect();
        let low = heights[0] + heights[1];
        let high = heights[heights.len() - 2] + heights[heights.len() - 1];

        if self.kick_frames.len() > 6 && monotonic_rising_one_exception(&heights) {
            return high > 0.5 && high - low > 0.5;
        }
        high > 1.0 && high - low > 1.0
    }

    /// Chip predicate: ground-projected speed of a flying ball appears to
    /// grow, while rolling balls decelerate.
    fn detection_speed(&self) -> bool {
        let last_camera = self.kick_frames.last().unwrap().camera_id;
        let mut speeds = Vec::new();
        for pair in self.kick_frames.windows(2) {
            if pair[1].camera_id != last_camera {
                // bad geometry calibration may fake accelerations
                continue;
            }
            let dist = (pair[1].ball_pos - pair[0].ball_pos).norm();
            let time_diff = (pair[1].seconds() - pair[0].seconds()) as f32;
            if time_diff > 0.0 {
                speeds.push(dist / time_diff);
            }
        }
        if speeds.len() < 2 {
            return false;
        }
        let avg: f32 = speeds.iter().sum::<f32>() / speeds.len() as f32;

        let filtered: Vec<f32> = speeds[1..]
            .iter()
            .copied()
            .filter(|&s| s <= 1.4 * avg)
            .collect();
        if filtered.len() < 2 {
            return false;
        }
        let slope = linear_slope(&filtered) / (filtered.iter().sum::<f32>() / filtered.len() as f32);

        (slope > 0.02 && speeds.len() > 5) || (slope > 0.002 && speeds.len() > 14)
    }

    /// Chip predicate: the least-squares reconstruction itself is physically
    /// plausible.
    fn detection_pinv(&self, pinv: &PinvResult) -> bool {
        let v_ground = Vector2::new(pinv.vx, pinv.vy);

        let max_flight_duration_half = pinv.vz / GRAVITY;
        let max_flight_duration = max_flight_duration_half * 2.0;
        let max_height = pinv.vz * max_flight_duration_half
            - (GRAVITY * 0.5) * max_flight_duration_half * max_flight_duration_half;
        let time_elapsed =
            (self.kick_frames.last().unwrap().time as f64 - self.chip_start_time) / NS_PER_SEC;

        let flight_dist_ground_calc = pinv.vz * time_elapsed as f32;
        let flight_dist_measured =
            (self.kick_frames[0].ball_pos - self.kick_frames.last().unwrap().ball_pos).norm();

        if self.kick_frames[0].camera_id != self.kick_frames.last().unwrap().camera_id
            && max_height < 0.5
        {
            // camera changes lead to false detections
            return false;
        }

        pinv.z0 > -0.4
            && pinv.z0 < 1.5
            && pinv.vz > 1.0
            && pinv.vz < 10.0
            && pinv.dist_start_pos < 1.0
            && v_ground.norm() > 1.5
            && (time_elapsed as f32) < max_flight_duration
            && max_height > 0.1
            && (flight_dist_ground_calc - flight_dist_measured).abs()
                < flight_dist_ground_calc.min(flight_dist_measured) / 3.0
            && self.kick_frames.len() > 5
    }

    fn predict_trajectory(&mut self, time: i64) -> Prediction {
        let flight_duration = (2.0 * self.z_speed / GRAVITY) as f64;
        let t = ((time - self.init_time) as f64 - self.chip_start_time) / NS_PER_SEC;

        self.touchdown_pos = self.chip_start_pos + self.ground_speed * flight_duration as f32;

        let mut abort_bounce = false;
        if self.is_active && t > 0.3 && t < 3.0 && t > flight_duration {
            if !self.bouncing {
                self.bounce_start_time = self.chip_start_time + flight_duration * NS_PER_SEC;
                self.bounce_z_speed = FLOOR_DAMPING * self.z_speed;
                self.bounce_ground_speed = self.ground_speed;
                self.bouncing = true;
                self.bounce_start_pos = self.touchdown_pos;
            } else {
                let bounce_flight_duration = (2.0 * self.bounce_z_speed / GRAVITY) as f64;
                let bounce_time =
                    ((time - self.init_time) as f64 - self.bounce_start_time) / NS_PER_SEC;
                if bounce_time > bounce_flight_duration {
                    self.bounce_start_time += bounce_flight_duration * NS_PER_SEC;
                    self.bounce_start_pos +=
                        self.bounce_ground_speed * bounce_flight_duration as f32;
                    self.bounce_z_speed *= FLOOR_DAMPING;
                }
                let tb = (bounce_flight_duration / 2.0) as f32;
                let bounce_height = self.bounce_z_speed * tb - (GRAVITY * 0.5) * tb * tb;
                if bounce_height < 0.01 {
                    abort_bounce = true;
                }
            }
        }

        let prediction;
        if self.bouncing {
            // ground speed from the raw detections, the reconstruction value
            // drifts over multiple bounces
            let mut ground_speed = 0.0f64;
            let mut num = 0usize;
            let n = self.kick_frames.len();
            for i in ((n.saturating_sub(4)).max(1)..n).rev() {
                let fst = &self.kick_frames[i];
                let snd = &self.kick_frames[0];
                let dt = fst.seconds() - snd.seconds();
                if dt > 0.0 {
                    ground_speed += ((fst.ball_pos - snd.ball_pos).norm() as f64) / dt;
                    num += 1;
                }
            }
            ground_speed /= (num + 2) as f64;
            self.bounce_ground_speed = self.bounce_ground_speed.normalize() * ground_speed as f32;

            let bounce_time =
                (((time - self.init_time) as f64 - self.bounce_start_time) / NS_PER_SEC) as f32;
            let ground_pos = self.bounce_start_pos + self.bounce_ground_speed * bounce_time;
            let z_speed = self.bounce_z_speed - GRAVITY * bounce_time;
            let z_pos =
                bounce_time * self.bounce_z_speed - 0.5 * GRAVITY * bounce_time * bounce_time;
            if abort_bounce || z_pos < 0.0 {
                self.reset_flight_reconstruction();
            }
            prediction = Prediction {
                pos: Vector3::new(ground_pos.x, ground_pos.y, z_pos.max(0.0)),
                speed: Vector3::new(
                    self.bounce_ground_speed.x,
                    self.bounce_ground_speed.y,
                    z_speed,
                ),
            };
        } else {
            let t = t as f32;
            let ground_pos = self.chip_start_pos + self.ground_speed * t;
            let z_speed = self.z_speed - GRAVITY * t;
            let z_pos = t * self.z_speed - 0.5 * GRAVITY * t * t;
            prediction = Prediction {
                pos: Vector3::new(ground_pos.x, ground_pos.y, z_pos),
                speed: Vector3::new(self.ground_speed.x, self.ground_speed.y, z_speed),
            };
        }

        self.last_prediction_time = time;
        prediction
    }

    fn reset_flight_reconstruction(&mut self) {
        self.is_active = false;
        self.chip_detected = false;
        self.bouncing = false;
        self.kick_frames.clear();
        self.fly_fitter.clear();
        self.last_prediction_time = self.init_time;
    }

    pub fn move_to_camera(&mut self, primary_camera: u32) {
        self.primary_camera = primary_camera;
    }
}

impl BallFilter for FlyFilter {
    fn process_vision_frame(&mut self, frame: &VisionFrame) {
        let reported_ball_pos = frame.pos();
        let time_since_init = frame.time - self.init_time;
        let dribbler_dist = (frame.robot.dribbler_pos - reported_ball_pos).norm();

        let mut dribbler_speed = 0.0;
        let mut abs_speed = 0.0;
        if let Some(last) = self.shot_detection_window.back() {
            let time_diff = ((time_since_init - last.time) as f64 / NS_PER_SEC) as f32;
            if time_diff > 0.0 {
                let last_dribbler_dist = (last.dribbler_pos - last.ball_pos).norm();
                dribbler_speed = (dribbler_dist - last_dribbler_dist) / time_diff;
                abs_speed = (reported_ball_pos - last.ball_pos).norm() / time_diff;
            }
        }

        let current = ChipDetection {
            dribbler_speed,
            abs_speed,
            time: time_since_init,
            ball_pos: reported_ball_pos,
            dribbler_pos: frame.robot.dribbler_pos,
            robot_pos: frame.robot.robot_pos,
            camera_id: frame.camera_id,
            ball_area: frame.ball_area as f32,
            chip_command: frame.chip_command,
            linear_command: frame.linear_command,
        };
        self.shot_detection_window.push_back(current.clone());
        if self.shot_detection_window.len() > 4 {
            self.shot_detection_window.pop_front();
        }

        if self.kick_frames.is_empty() && self.check_is_shot() {
            let mut window: Vec<ChipDetection> = self.shot_detection_window.drain(..).collect();
            let last = window.pop().unwrap();
            self.kick_frames = window;
            // keep the last measurement to infer speed
            self.shot_detection_window.push_back(last);
            self.chip_start_time = self.kick_frames[0].time as f64;
            self.shot_detected = true;
        }

        if !self.kick_frames.is_empty() {
            self.kick_frames.push(current);

            if self.collision() {
                self.reset_flight_reconstruction();
                return;
            }
            if !self.bouncing {
                let Some(pinv) = self.calc_pinv() else {
                    return;
                };
                let intersection = self.calc_intersection(&pinv);
                if self.kick_frames[0].linear_command {
                    // no chip detection for flat kicks
                    self.reset_flight_reconstruction();
                    return;
                }
                if !self.chip_detected {
                    let height_says_chip = self.detection_height();
                    let is_curvy = self.detection_curviness(&pinv);
                    if self.kick_frames[0].chip_command {
                        self.chip_detected = true;
                    } else if self.detection_speed() {
                        let cam3d =
                            self.camera_position(self.kick_frames.last().unwrap().camera_id);
                        let angle_to_cam = inner_angle(
                            self.kick_frames[0].ball_pos,
                            Vector2::new(cam3d.x, cam3d.y),
                            self.kick_frames.last().unwrap().ball_pos,
                        );
                        if self.num_measurements_with_own_camera() > 10 {
                            self.chip_detected = true;
                        }
                        if angle_to_cam > 0.45 {
                            if is_curvy {
                                self.chip_detected = true;
                            }
                        } else if height_says_chip {
                            self.chip_detected = true;
                        }
                    }
                    if self.detection_pinv(&pinv) {
                        self.chip_detected = true;
                    }
                }
                if self.chip_detected {
                    self.parabolic_flight_reconstruct(&pinv, &intersection);
                }
            }
        }

        if self.kick_frames.len() > 30 && !self.chip_detected {
            self.reset_flight_reconstruction();
        }
        if self.kick_frames.len() >= MAX_FRAMES_PER_FLIGHT {
            self.reset_flight_reconstruction();
        }
    }

    fn accept_detection(&mut self, frame: &VisionFrame) -> bool {
        // acceptance projects the predicted flight position to the ground
        // through the detection's camera, meaningless while inactive
        if !self.is_active {
            return false;
        }
        let pred_time = frame.time.max(self.last_prediction_time);
        let pred = self.predict_trajectory(pred_time);
        let cam = self.camera_position(frame.camera_id);
        let lambda = -cam.z / (cam.z - pred.pos.z);
        let pred_ground = cam + (cam - pred.pos) * lambda;
        let ball = Vector3::new(frame.x, frame.y, 0.0);

        self.accept_dist = (ball - pred_ground).norm();
        self.accept_dist < ACCEPT_DIST
    }

    fn write_ball_state(
        &mut self,
        ball: &mut WorldBall,
        time: i64,
        _robots: &[RobotInfo],
        _last_camera_frame_time: i64,
    ) {
        let prediction = self.predict_trajectory(time);

        // highest point still ahead of the ball, damping ignored
        let vz = prediction.speed.z;
        let top_height = prediction.pos.z + 0.5 * vz.abs() * vz.abs() / GRAVITY;

        // leave low bounces to the ground filter
        if (self.is_active && !self.bouncing) || top_height > 0.05 {
            ball.p_x = prediction.pos.x;
            ball.p_y = prediction.pos.y;
            ball.v_x = prediction.speed.x;
            ball.v_y = prediction.speed.y;
        }
        ball.p_z = prediction.pos.z;
        ball.v_z = prediction.speed.z;
        ball.is_bouncing = self.bouncing;
        ball.touchdown = Some(wire::Point {
            x: self.touchdown_pos.x,
            y: self.touchdown_pos.y,
        });
    }
}

/// Angle at `center` of the triangle (center, a, b), in [0, pi].
fn inner_angle(center: Vector2<f32>, a: Vector2<f32>, b: Vector2<f32>) -> f32 {
    let d1 = a - center;
    let d2 = b - center;
    (d1.dot(&d2) / (d1.norm() * d2.norm())).acos()
}

/// Least-squares slope of evenly indexed values.
fn linear_slope(values: &[f32]) -> f32 {
    let n = values.len() as f32;
    let mut x_sum = 0.0;
    let mut x_sq_sum = 0.0;
    let mut val_sum = 0.0;
    let mut val_x_sum = 0.0;
    for (i, &value) in values.iter().enumerate() {
        let x = i as f32;
        x_sum += x;
        x_sq_sum += x * x;
        val_sum += value;
        val_x_sum += x * value;
    }
    let denominator = n * x_sq_sum - x_sum * x_sum;
    if denominator == 0.0 {
        return 0.0;
    }
    (n * val_x_sum - x_sum * val_sum) / denominator
}

fn monotonic_rising_one_exception(points: &[f32]) -> bool {
    let mut exceptions = 0;
    for pair in points.windows(2) {
        if pair[1] > pair[0] {
            exceptions += 1;
        }
    }
    exceptions < 2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, RwLock};

    fn shared_cameras() -> SharedCameras {
        let mut cameras = field::CameraInfo::default();
        // camera position is specified in raw vision coordinates
        cameras.update(0, 0.0, 0.0, 4000.0, 500.0);
        cameras.update(1, 3000.0, 3000.0, 4000.0, 500.0);
        Arc::new(RwLock::new(cameras))
    }

    fn kicker_at(x: f32, y: f32) -> RobotInfo {
        let pos = Vector2::new(x, y);
        let dribbler = pos + Vector2::new(0.08, 0.0);
        RobotInfo {
            identifier: 1,
            robot_pos: pos,
            dribbler_pos: dribbler,
            past_robot_pos: pos,
            past_dribbler_pos: dribbler,
            ..Default::default()
        }
    }

    /// Projects a 3-D flight position onto the reported ground position as
    /// the camera sees it.
    fn project_to_ground(cam: Vector3<f32>, pos: Vector3<f32>) -> Vector2<f32> {
        let scale = cam.z / (cam.z - pos.z);
        let ground = cam + (pos - cam) * scale;
        Vector2::new(ground.x, ground.y)
    }

    fn chip_frames(v_ground: f32, v_z: f32, count: usize) -> Vec<VisionFrame> {
        let cam = Vector3::new(0.0, 0.0, 4.0);
        let robot = kicker_at(-0.1, 0.0);
        let dt = 0.016f64;
        let mut frames = Vec::new();
        // two pre-shot frames with the ball at the dribbler
        for i in 0..2 {
            let t = i as f64 * dt;
            frames.push(VisionFrame {
                camera_id: 0,
                ball_area: 120,
                x: -0.02 + 0.001 * i as f32,
                y: 0.0,
                time: (t * NS_PER_SEC) as i64,
                robot,
                chip_command: false,
                linear_command: false,
                vision_processing_time: 0,
            });
        }
        for i in 0..count {
            let t_flight = i as f64 * dt;
            let t = (i + 2) as f64 * dt;
            let pos = Vector3::new(
                v_ground * t_flight as f32,
                0.0,
                (v_z * t_flight as f32 - 0.5 * GRAVITY * (t_flight as f32).powi(2)).max(0.0),
            );
            let ground = project_to_ground(cam, pos);
            frames.push(VisionFrame {
                camera_id: 0,
                ball_area: 120,
                x: ground.x,
                y: ground.y,
                time: (t * NS_PER_SEC) as i64,
                robot,
                chip_command: false,
                linear_command: false,
                vision_processing_time: 0,
            });
        }
        frames
    }

    #[test]
    fn chip_kick_activates_and_reconstructs_touchdown() {
        let frames = chip_frames(3.0, 4.0, 40);
        let mut fly = FlyFilter::new(&frames[0], shared_cameras());
        let mut active_at = None;
        for (i, frame) in frames.iter().enumerate() {
            fly.process_vision_frame(frame);
            if fly.is_active() && active_at.is_none() {
                active_at = Some(i);
            }
        }
        assert!(fly.is_active(), "fly filter never activated");

        // analytic touchdown: v_ground * 2 v_z / g from the launch point
        let expected = 3.0 * (2.0 * 4.0 / GRAVITY);
        let mut ball = WorldBall::default();
        let query_time = frames.last().unwrap().time;
        fly.write_ball_state(&mut ball, query_time, &[], 0);
        let touchdown = ball.touchdown.unwrap();
        assert!(
            (touchdown.x - expected).abs() < 0.1,
            "touchdown {} vs expected {}",
            touchdown.x,
            expected
        );
        assert!(touchdown.y.abs() < 0.1);
    }

    #[test]
    fn flat_roll_does_not_activate() {
        let robot = kicker_at(-0.1, 0.0);
        let mut frames = Vec::new();
        for i in 0..40 {
            let t = i as f64 * 0.016;
            frames.push(VisionFrame {
                camera_id: 0,
                ball_area: 120,
                x: 2.0 * t as f32,
                y: 0.0,
                time: (t * NS_PER_SEC) as i64,
                robot,
                chip_command: false,
                linear_command: false,
                vision_processing_time: 0,
            });
        }
        let mut fly = FlyFilter::new(&frames[0], shared_cameras());
        for frame in &frames {
            fly.process_vision_frame(frame);
        }
        assert!(!fly.is_active());
    }

    #[test]
    fn linear_kick_command_vetoes_chip_detection() {
        let mut frames = chip_frames(3.0, 4.0, 30);
        for frame in &mut frames {
            frame.linear_command = true;
        }
        let mut fly = FlyFilter::new(&frames[0], shared_cameras());
        for frame in &frames {
            fly.process_vision_frame(frame);
        }
        assert!(!fly.is_active());
    }

    #[test]
    fn quadratic_fitter_recovers_coefficients() {
        let mut fitter = QuadraticFitter::default();
        for i in 0..10 {
            let t = i as f32 * 0.1;
            fitter.add_point(t, -4.9 * t * t + 4.0 * t + 0.1);
        }
        let (a, b, c) = fitter.fit().unwrap();
        assert!((a + 4.9).abs() < 1e-2);
        assert!((b - 4.0).abs() < 1e-2);
        assert!((c - 0.1).abs() < 1e-2);
    }

    #[test]
    fn inner_angle_of_perpendicular_directions() {
        let angle = inner_angle(
            Vector2::zeros(),
            Vector2::new(1.0, 0.0),
            Vector2::new(0.0, 2.0),
        );
        assert!((angle - std::f32::consts::FRAC_PI_2).abs() < 1e-5);
    }
}
