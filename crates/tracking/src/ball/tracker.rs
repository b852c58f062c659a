//! One ball hypothesis: a ground-collision filter plus a fly filter,
//! fed from the same frame queue.

use std::collections::VecDeque;

use nalgebra::Vector2;
use wire::world::{BallRaw, WorldBall};

use super::collision::GroundCollisionFilter;
use super::fly::FlyFilter;
use super::{BallFilter, RobotInfo, SharedCameras, VisionFrame};

pub struct BallTracker {
    ground_filter: GroundCollisionFilter,
    fly_filter: FlyFilter,
    primary_camera: u32,
    cameras: SharedCameras,

    last_time: i64,
    last_update_time: i64,
    init_time: i64,
    last_ball_pos: Vector2<f32>,
    last_frame_time: i64,

    frame_counter: u32,
    update_frame_counter: u32,
    confidence: f64,
    cached_dist_to_camera: f32,

    vision_frames: VecDeque<VisionFrame>,
    raw_measurements: Vec<VisionFrame>,
}

impl BallTracker {
    pub fn new(frame: &VisionFrame, cameras: SharedCameras) -> Self {
        Self {
            ground_filter: GroundCollisionFilter::new(frame, cameras.clone()),
            fly_filter: FlyFilter::new(frame, cameras.clone()),
            primary_camera: frame.camera_id,
            cameras,
            last_time: frame.time,
            last_update_time: frame.time,
            init_time: frame.time,
            last_ball_pos: frame.pos(),
            last_frame_time: 0,
            frame_counter: 0,
            update_frame_counter: 0,
            confidence: 0.0,
            cached_dist_to_camera: 0.0,
            vision_frames: VecDeque::new(),
            raw_measurements: Vec::new(),
        }
    }

    /// Clone for a cross-camera hand-over: filter state carries over, the
    /// new camera becomes primary.
    pub fn clone_for_camera(&self, primary_camera: u32) -> Self {
        let mut fly_filter = self.fly_filter.clone_for_camera(primary_camera);
        fly_filter.move_to_camera(primary_camera);
        Self {
            ground_filter: self.ground_filter.clone_for_camera(primary_camera),
            fly_filter,
            primary_camera,
            cameras: self.cameras.clone(),
            last_time: self.last_time,
            last_update_time: self.last_update_time,
            init_time: self.init_time,
            last_ball_pos: self.last_ball_pos,
            last_frame_time: self.last_frame_time,
            frame_counter: 0,
            update_frame_counter: self.update_frame_counter,
            confidence: self.confidence,
            cached_dist_to_camera: 0.0,
            vision_frames: VecDeque::new(),
            raw_measurements: Vec::new(),
        }
    }

    pub fn primary_camera(&self) -> u32 {
        self.primary_camera
    }

    pub fn init_time(&self) -> i64 {
        self.init_time
    }

    pub fn last_update(&self) -> i64 {
        self.last_time
    }

    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn is_flying(&self) -> bool {
        self.fly_filter.is_active()
    }

    /// True once after a shot was first detected.
    pub fn is_shot(&mut self) -> bool {
        self.fly_filter.take_shot_detected()
    }

    pub fn is_feasibly_invisible(&self) -> bool {
        if self.fly_filter.is_active() {
            false
        } else {
            self.ground_filter.is_feasibly_invisible()
        }
    }

    pub fn accept_detection(&mut self, frame: &VisionFrame) -> bool {
        self.fly_filter.accept_detection(frame) || self.ground_filter.accept_detection(frame)
    }

    /// Distance between the filter and its primary camera, used for
    /// hypothesis prioritisation. Flight reconstructions rank by their
    /// distance to the flight start instead.
    pub fn calc_dist_to_camera(&mut self, flying: bool) {
        let cam = self
            .cameras
            .read()
            .unwrap()
            .position(self.primary_camera)
            .unwrap_or_default();
        let mut dist = (self.last_ball_pos - Vector2::new(cam.x, cam.y)).norm();
        if flying && self.fly_filter.is_active() {
            dist = self.fly_filter.dist_to_start_pos();
        }
        self.cached_dist_to_camera = dist;
    }

    pub fn cached_dist_to_camera(&self) -> f32 {
        self.cached_dist_to_camera
    }

    /// Exponentially smoothed frames-per-update measure.
    pub fn update_confidence(&mut self) {
        self.confidence = 0.98 * self.confidence + 0.02 * f64::from(self.update_frame_counter);
        self.update_frame_counter = 0;
    }

    /// Applies all queued frames up to `time`. Frames sharing one timestamp
    /// come from the same camera image and can contain at most one real
    /// ball, so each filter chooses its own candidate.
    pub fn update(&mut self, time: i64) {
        while let Some(first) = self.vision_frames.front() {
            if first.time > time {
                break;
            }
            let mut same_time_frames = vec![self.vision_frames.pop_front().unwrap()];
            while let Some(next) = self.vision_frames.front() {
                if next.time != same_time_frames[0].time {
                    break;
                }
                same_time_frames.push(self.vision_frames.pop_front().unwrap());
            }
            self.raw_measurements.extend(same_time_frames.iter().cloned());

            let fly_choice = self.fly_filter.choose_ball(&same_time_frames);
            self.fly_filter.process_vision_frame(&same_time_frames[fly_choice]);

            let ground_choice = self.ground_filter.choose_ball(&same_time_frames);
            self.ground_filter
                .process_vision_frame(&same_time_frames[ground_choice]);

            self.last_frame_time = same_time_frames[0].time;
            self.last_time = time;
            self.last_ball_pos = same_time_frames[ground_choice].pos();
        }
        self.last_update_time = time;
    }

    /// Writes the consolidated ball state. The ground filter writes first;
    /// an active fly filter overlays the flight state.
    /// `last_camera_frame_time` is the newest frame time of the primary
    /// camera; it being ahead of the last accepted ball frame means the
    /// camera looked and did not see the ball.
    pub fn get(
        &mut self,
        flip: bool,
        reset_raw: bool,
        robots: &[RobotInfo],
        last_camera_frame_time: i64,
    ) -> WorldBall {
        let mut ball = WorldBall::default();
        let camera_time = last_camera_frame_time.max(self.last_frame_time);

        self.ground_filter
            .write_ball_state(&mut ball, self.last_update_time, robots, camera_time);
        if self.fly_filter.is_active() {
            self.fly_filter
                .write_ball_state(&mut ball, self.last_update_time, robots, camera_time);
        }

        if flip {
            ball.p_x = -ball.p_x;
            ball.p_y = -ball.p_y;
            ball.v_x = -ball.v_x;
            ball.v_y = -ball.v_y;
            if let Some(touchdown) = &mut ball.touchdown {
                touchdown.x = -touchdown.x;
                touchdown.y = -touchdown.y;
            }
        }

        for frame in &self.raw_measurements {
            let (p_x, p_y) = if flip { (-frame.x, -frame.y) } else { (frame.x, frame.y) };
            ball.raw.push(BallRaw {
                time: frame.time,
                p_x,
                p_y,
                camera_id: frame.camera_id,
                area: frame.ball_area,
                vision_processing_time: frame.vision_processing_time,
            });
        }
        if reset_raw {
            self.raw_measurements.clear();
        }
        ball
    }

    pub fn add_vision_frame(&mut self, frame: VisionFrame) {
        self.last_time = frame.time;
        self.vision_frames.push_back(frame);
        self.frame_counter += 1;
        self.update_frame_counter += 1;
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
        cameras.update(1, 2000.0, 2000.0, 4000.0, 500.0);
        Arc::new(RwLock::new(cameras))
    }

    fn frame(x: f32, y: f32, time: i64, camera_id: u32) -> VisionFrame {
        VisionFrame {
            camera_id,
            ball_area: 100,
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
    fn tracks_a_still_ball() {
        let first = frame(1.0, 2.0, 0, 0);
        let mut tracker = BallTracker::new(&first, shared_cameras());
        for i in 1..=10 {
            let t = i * PROCESSOR_TICK_DURATION;
            tracker.add_vision_frame(frame(1.0, 2.0, t, 0));
            tracker.update(t);
        }
        let ball = tracker.get(false, true, &[], 0);
        assert!((ball.p_x - 1.0).abs() < 0.005);
        assert!((ball.p_y - 2.0).abs() < 0.005);
        assert!((ball.v_x * ball.v_x + ball.v_y * ball.v_y).sqrt() < 0.02);
        assert_eq!(tracker.frame_counter(), 10);
    }

    #[test]
    fn same_time_frames_count_as_one_update() {
        let mut tracker = BallTracker::new(&frame(0.0, 0.0, 0, 0), shared_cameras());
        let t = PROCESSOR_TICK_DURATION;
        // two candidate balls in one camera image
        tracker.add_vision_frame(frame(0.01, 0.0, t, 0));
        tracker.add_vision_frame(frame(0.6, 0.0, t, 0));
        tracker.update(t);
        let ball = tracker.get(false, true, &[], 0);
        // the filters follow the nearer candidate
        assert!(ball.p_x < 0.1);
        assert_eq!(ball.raw.len(), 2);
    }

    #[test]
    fn camera_clone_keeps_state_and_resets_frames() {
        let mut tracker = BallTracker::new(&frame(0.5, 0.5, 0, 0), shared_cameras());
        for i in 1..=8 {
            let t = i * PROCESSOR_TICK_DURATION;
            tracker.add_vision_frame(frame(0.5, 0.5, t, 0));
            tracker.update(t);
        }
        let cloned = tracker.clone_for_camera(1);
        assert_eq!(cloned.primary_camera(), 1);
        assert_eq!(cloned.frame_counter(), 0);
        assert_eq!(cloned.init_time(), tracker.init_time());
    }

    #[test]
    fn confidence_rises_with_updates() {
        let mut tracker = BallTracker::new(&frame(0.0, 0.0, 0, 0), shared_cameras());
        for i in 1..=20 {
            let t = i * PROCESSOR_TICK_DURATION;
            tracker.add_vision_frame(frame(0.0, 0.0, t, 0));
            tracker.update(t);
            tracker.update_confidence();
        }
        assert!(tracker.confidence() > 0.1);
    }
}
