//! Telemetry twin of the tracker: same vision stream, but the robot
//! filters weight commanded speeds heavily so the emitted velocities track
//! the motor commands instead of vision jitter. Balls are not tracked.

use wire::radio::RadioCommand;
use wire::world::WorldState;

use crate::robot_filter::NoiseProfile;
use crate::tracker::Tracker;

pub struct SpeedTracker {
    inner: Tracker,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self {
            inner: Tracker::with_noise(NoiseProfile::telemetry(), false),
        }
    }

    pub fn reset(&mut self) {
        self.inner.reset();
    }

    pub fn set_flip(&mut self, flip: bool) {
        self.inner.set_flip(flip);
    }

    pub fn queue_packet(&mut self, packet: Vec<u8>, receive_time: i64) {
        self.inner.queue_packet(packet, receive_time);
    }

    pub fn queue_radio_commands(&mut self, commands: &[RadioCommand], time: i64) {
        self.inner.queue_radio_commands(commands, time);
    }

    pub fn handle_command(&mut self, command: &wire::command::TrackingCommand) {
        self.inner.handle_command(command);
    }

    pub fn process(&mut self, current_time: i64) {
        self.inner.process(current_time);
    }

    /// World state restricted to what telemetry consumers need: the robot
    /// arrays with command-following speed estimates.
    pub fn world_state(&mut self, current_time: i64, system_time: i64) -> WorldState {
        let mut world = self.inner.world_state(current_time, system_time, true);
        world.ball = None;
        world
    }
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PROCESSOR_TICK_DURATION;
    use wire::radio::{RadioCommand, RobotCommand};
    use wire::vision::{DetectionFrame, DetectionRobot, VisionWrapper};
    use wire::Encode;

    fn wrapper_with_robot(x_mm: f32, time_s: f64) -> Vec<u8> {
        VisionWrapper {
            detection: Some(DetectionFrame {
                frame_number: 0,
                t_capture: time_s,
                t_sent: time_s,
                camera_id: 0,
                balls: vec![],
                robots_yellow: vec![DetectionRobot {
                    confidence: 1.0,
                    robot_id: Some(1),
                    x: x_mm,
                    y: 0.0,
                    orientation: 0.0,
                    pixel_x: 0.0,
                    pixel_y: 0.0,
                }],
                robots_blue: vec![],
            }),
            geometry: None,
        }
        .encode_to_vec()
    }

    #[test]
    fn commanded_speed_dominates_a_static_vision_track() {
        let mut speed_tracker = SpeedTracker::new();
        let command = RadioCommand {
            generation: 0,
            id: 1,
            is_blue: false,
            command: RobotCommand {
                v_f: 1.0,
                ..Default::default()
            },
        };
        for i in 1..=100 {
            let time = i * PROCESSOR_TICK_DURATION;
            speed_tracker.queue_packet(wrapper_with_robot(0.0, time as f64 * 1e-9), time);
            speed_tracker.process(time);
            speed_tracker.queue_radio_commands(std::slice::from_ref(&command), time + 1);
        }
        let world = speed_tracker.world_state(101 * PROCESSOR_TICK_DURATION, 0);
        assert!(world.ball.is_none());
        let robot = &world.yellow[0];
        // robot heading is +pi/2 after rotation, forward command maps to +y
        let forward_speed = (robot.v_x * robot.v_x + robot.v_y * robot.v_y).sqrt();
        assert!(forward_speed > 0.3, "commanded speed not reflected: {forward_speed}");
    }
}
