//! Rolling-ball Kalman filter.
//!
//! Constant-velocity model with rolling friction folded into the control
//! vector. The state carries z rows so the emitted ball state has a height
//! slot, but only the ground position is ever measured.

use filter::KalmanFilter;
use nalgebra::Vector2;
use wire::world::WorldBall;

use super::{BallFilter, RobotInfo, VisionFrame};

/// Plain euclidean accept radius around the filter position.
const ACCEPT_DIST: f32 = 0.45;

/// Rolling deceleration on the league carpet.
const FRICTION_DECELERATION: f32 = 0.4;

const GRAVITY: f32 = 9.81;

// state (x, y, z, vx, vy, vz), measuring (x, y, z)
type Kalman = KalmanFilter<6, 3>;

#[derive(Clone)]
pub struct GroundFilter {
    kalman: Kalman,
    last_update: i64,
    primary_camera: u32,
}

impl GroundFilter {
    pub fn new(frame: &VisionFrame) -> Self {
        let mut this = Self {
            kalman: Kalman::new([frame.x, frame.y, 0.0, 0.0, 0.0, 0.0]),
            last_update: frame.time,
            primary_camera: frame.camera_id,
        };
        this.init_measurement_model();
        this
    }

    pub fn with_camera(other: &GroundFilter, primary_camera: u32) -> Self {
        Self {
            kalman: other.kalman.clone(),
            last_update: other.last_update,
            primary_camera,
        }
    }

    fn init_measurement_model(&mut self) {
        self.kalman.h = filter::ObsMat::zeros();
        self.kalman.h[(0, 0)] = 1.0;
        self.kalman.h[(1, 1)] = 1.0;
        self.kalman.h[(2, 2)] = 1.0;
    }

    /// Restarts tracking at the frame position with zero speed.
    pub fn reset(&mut self, frame: &VisionFrame) {
        self.kalman.reset([frame.x, frame.y, 0.0, 0.0, 0.0, 0.0]);
        self.init_measurement_model();
        self.last_update = frame.time;
    }

    pub fn primary_camera(&self) -> u32 {
        self.primary_camera
    }

    pub fn pos(&self) -> Vector2<f32> {
        Vector2::new(self.kalman.state()[0], self.kalman.state()[1])
    }

    pub fn speed(&self) -> Vector2<f32> {
        Vector2::new(self.kalman.state()[3], self.kalman.state()[4])
    }

    fn distance_to(&self, obj_pos: Vector2<f32>) -> f32 {
        (obj_pos - self.pos()).norm()
    }

    fn predict_model(kalman: &mut Kalman, time_diff: f32) {
        kalman.f = filter::CovMat::identity();
        kalman.f[(0, 3)] = time_diff;
        kalman.f[(1, 4)] = time_diff;
        kalman.f[(2, 5)] = time_diff;
        kalman.b = kalman.f;

        // simple rolling friction estimate
        let deceleration = FRICTION_DECELERATION * time_diff;
        let state = *kalman.state();
        let v = (state[3] * state[3] + state[4] * state[4]).sqrt();
        let phi = state[4].atan2(state[3]);
        kalman.u = filter::StateVec::zeros();
        if v < deceleration {
            // friction would reverse the ball within this step
            kalman.u[0] = -v * phi.cos() * time_diff / 2.0;
            kalman.u[1] = -v * phi.sin() * time_diff / 2.0;
            kalman.u[3] = -state[3] / 2.0;
            kalman.u[4] = -state[4] / 2.0;
            // only a moving ball can fly
            kalman.u[2] = -state[2] / 2.0;
            kalman.u[5] = -state[5] / 2.0;
        } else if state[2] < 0.1 {
            // rolling
            kalman.u[0] = -deceleration * phi.cos() * time_diff / 2.0;
            kalman.u[1] = -deceleration * phi.sin() * time_diff / 2.0;
            kalman.u[3] = -deceleration * phi.cos();
            kalman.u[4] = -deceleration * phi.sin();
            kalman.u[2] = -state[2] / 2.0;
            kalman.u[5] = -state[5] / 2.0;
        } else {
            kalman.u[2] = -GRAVITY * time_diff * time_diff / 2.0;
            kalman.u[5] = -GRAVITY * time_diff;
        }

        let sigma_a = 4.0f32;
        let g = [
            time_diff * time_diff / 2.0 * sigma_a,
            time_diff * time_diff / 2.0 * sigma_a,
            time_diff * time_diff / 2.0 * sigma_a,
            time_diff * sigma_a,
            time_diff * sigma_a,
            time_diff * sigma_a,
        ];
        kalman.q = filter::CovMat::zeros();
        for axis in 0..3 {
            kalman.q[(axis, axis)] = g[axis] * g[axis];
            kalman.q[(axis, axis + 3)] = g[axis] * g[axis + 3];
            kalman.q[(axis + 3, axis)] = g[axis + 3] * g[axis];
            kalman.q[(axis + 3, axis + 3)] = g[axis + 3] * g[axis + 3];
        }

        kalman.predict();
    }

    /// Permanently advances the filter to `time`.
    fn advance(&mut self, time: i64) {
        if time <= self.last_update {
            return;
        }
        let time_diff = (time - self.last_update) as f32 * 1e-9;
        Self::predict_model(&mut self.kalman, time_diff);
        self.last_update = time;
    }
}

impl BallFilter for GroundFilter {
    fn process_vision_frame(&mut self, frame: &VisionFrame) {
        self.advance(frame.time);

        self.kalman.z[0] = frame.x;
        self.kalman.z[1] = frame.y;
        self.kalman.z[2] = 0.0;

        // a good calibration should work with 0.002 or a bit less
        let sigma = 0.003f32;
        self.kalman.r = filter::CovMat::zeros();
        self.kalman.r[(0, 0)] = sigma * sigma;
        self.kalman.r[(1, 1)] = sigma * sigma;
        self.kalman.r[(2, 2)] = 1e-6;
        if self.kalman.update().is_err() {
            tracing::debug!("dropping degenerate ball update");
        }
        self.last_update = frame.time;
    }

    fn accept_detection(&mut self, frame: &VisionFrame) -> bool {
        self.distance_to(frame.pos()) < ACCEPT_DIST
    }

    fn write_ball_state(
        &mut self,
        ball: &mut WorldBall,
        time: i64,
        _robots: &[RobotInfo],
        _last_camera_frame_time: i64,
    ) {
        // speculative predict on a copy, the history stays untouched
        let mut kalman = self.kalman.clone();
        if time > self.last_update {
            let time_diff = (time - self.last_update) as f32 * 1e-9;
            Self::predict_model(&mut kalman, time_diff);
        }
        let state = kalman.state();
        ball.p_x = state[0];
        ball.p_y = state[1];
        ball.p_z = state[2];
        ball.v_x = state[3];
        ball.v_y = state[4];
        ball.v_z = state[5];
    }

    fn choose_ball(&mut self, frames: &[VisionFrame]) -> usize {
        let mut min_distance = f32::MAX;
        let mut min_index = 0;
        for (index, frame) in frames.iter().enumerate() {
            let dist = self.distance_to(frame.pos());
            if dist < min_distance {
                min_distance = dist;
                min_index = index;
            }
        }
        min_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROCESSOR_TICK_DURATION;

    fn frame(x: f32, y: f32, time: i64) -> VisionFrame {
        VisionFrame {
            camera_id: 0,
            ball_area: 0,
            x,
            y,
            time,
            robot: RobotInfo::default(),
            chip_command: false,
            linear_command: false,
            vision_processing_time: 0,
        }
    }

    #[test]
    fn still_ball_settles_with_low_speed() {
        let first = frame(1.0, 2.0, 0);
        let mut ground = GroundFilter::new(&first);
        for i in 1..10 {
            ground.process_vision_frame(&frame(1.0, 2.0, i * PROCESSOR_TICK_DURATION));
        }
        let mut ball = WorldBall::default();
        ground.write_ball_state(&mut ball, 10 * PROCESSOR_TICK_DURATION, &[], 0);
        assert!((ball.p_x - 1.0).abs() < 0.005);
        assert!((ball.p_y - 2.0).abs() < 0.005);
        assert!((ball.v_x * ball.v_x + ball.v_y * ball.v_y).sqrt() < 0.02);
    }

    #[test]
    fn rolling_ball_speed_estimate_converges() {
        // 2 m/s along x
        let mut ground = GroundFilter::new(&frame(0.0, 0.0, 0));
        for i in 1..=100 {
            let t = i * PROCESSOR_TICK_DURATION;
            ground.process_vision_frame(&frame(0.02 * i as f32, 0.0, t));
        }
        let mut ball = WorldBall::default();
        ground.write_ball_state(&mut ball, 100 * PROCESSOR_TICK_DURATION, &[], 0);
        assert!((ball.v_x - 2.0).abs() < 0.1, "vx = {}", ball.v_x);
        assert!(ball.v_y.abs() < 0.05);
    }

    #[test]
    fn accepts_nearby_and_rejects_distant_detections() {
        let mut ground = GroundFilter::new(&frame(0.0, 0.0, 0));
        assert!(ground.accept_detection(&frame(0.2, 0.0, PROCESSOR_TICK_DURATION)));
        assert!(!ground.accept_detection(&frame(1.0, 0.0, PROCESSOR_TICK_DURATION)));
    }

    #[test]
    fn chooses_the_closest_of_several_balls() {
        let mut ground = GroundFilter::new(&frame(0.0, 0.0, 0));
        let candidates = [
            frame(0.5, 0.5, PROCESSOR_TICK_DURATION),
            frame(0.05, 0.0, PROCESSOR_TICK_DURATION),
            frame(-1.0, 0.0, PROCESSOR_TICK_DURATION),
        ];
        assert_eq!(ground.choose_ball(&candidates), 1);
    }
}
