//! End-to-end tracking scenarios driven through encoded vision packets.

use std::f32::consts::FRAC_PI_2;

use tracking::{Tracker, PROCESSOR_TICK_DURATION};
use wire::vision::{
    DetectionBall, DetectionFrame, DetectionRobot, GeometryCameraCalibration, GeometryData,
    GeometryFieldSize, VisionWrapper,
};
use wire::Encode;

const GRAVITY: f32 = 9.81;

/// Vision x/y (millimeters) for an internal field position (meters).
fn vision_coords(x: f32, y: f32) -> (f32, f32) {
    (y * 1000.0, -x * 1000.0)
}

fn geometry_packet(cameras: &[(u32, f32, f32, f32)]) -> Vec<u8> {
    VisionWrapper {
        detection: None,
        geometry: Some(GeometryData {
            field: GeometryFieldSize {
                field_length: 9000.0,
                field_width: 6000.0,
                goal_width: 1000.0,
                goal_depth: 180.0,
                boundary_width: 300.0,
                field_lines: vec![],
                field_arcs: vec![],
            },
            calibrations: cameras
                .iter()
                .map(|(id, tx, ty, tz)| GeometryCameraCalibration {
                    camera_id: *id,
                    focal_length: 500.0,
                    derived_camera_world_tx: Some(*tx),
                    derived_camera_world_ty: Some(*ty),
                    derived_camera_world_tz: Some(*tz),
                })
                .collect(),
        }),
    }
    .encode_to_vec()
}

fn ball_detection(x: f32, y: f32) -> DetectionBall {
    let (vx, vy) = vision_coords(x, y);
    DetectionBall {
        confidence: 0.95,
        area: 120,
        x: vx,
        y: vy,
        pixel_x: 0.0,
        pixel_y: 0.0,
    }
}

fn robot_detection(id: u32, x: f32, y: f32, phi: f32) -> DetectionRobot {
    let (vx, vy) = vision_coords(x, y);
    DetectionRobot {
        confidence: 0.95,
        robot_id: Some(id),
        x: vx,
        y: vy,
        // internal heading is orientation + pi/2
        orientation: phi - FRAC_PI_2,
        pixel_x: 0.0,
        pixel_y: 0.0,
    }
}

fn detection_packet(
    camera_id: u32,
    time: i64,
    balls: Vec<DetectionBall>,
    robots_yellow: Vec<DetectionRobot>,
) -> Vec<u8> {
    let seconds = time as f64 * 1e-9;
    VisionWrapper {
        detection: Some(DetectionFrame {
            frame_number: 0,
            t_capture: seconds,
            t_sent: seconds,
            camera_id,
            balls,
            robots_yellow,
            robots_blue: vec![],
        }),
        geometry: None,
    }
    .encode_to_vec()
}

fn tracker_with_cameras(cameras: &[(u32, f32, f32, f32)]) -> Tracker {
    let mut tracker = Tracker::new();
    tracker.queue_packet(geometry_packet(cameras), 1);
    tracker.process(1);
    tracker
}

#[test]
fn still_ball_one_camera() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);

    for i in 1..=10 {
        let t = i * PROCESSOR_TICK_DURATION;
        tracker.queue_packet(detection_packet(0, t, vec![ball_detection(1.0, 2.0)], vec![]), t);
        tracker.process(t);
    }
    let world = tracker.world_state(100_000_000, 0, true);
    let ball = world.ball.expect("no ball tracked");
    assert!((ball.p_x - 1.0).abs() < 0.005, "p_x = {}", ball.p_x);
    assert!((ball.p_y - 2.0).abs() < 0.005, "p_y = {}", ball.p_y);
    let speed = (ball.v_x * ball.v_x + ball.v_y * ball.v_y).sqrt();
    assert!(speed < 0.02, "|v| = {speed}");
}

#[test]
fn straight_roll_speed_converges() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);

    for i in 1..=100 {
        let t = i * PROCESSOR_TICK_DURATION;
        let x = 0.02 * i as f32;
        tracker.queue_packet(detection_packet(0, t, vec![ball_detection(x, 0.0)], vec![]), t);
        tracker.process(t);

        if i >= 20 {
            let world = tracker.world_state(t, 0, true);
            let ball = world.ball.expect("ball lost");
            assert!(
                (ball.v_x - 2.0).abs() < 0.1,
                "steady-state error too large at frame {i}: vx = {}",
                ball.v_x
            );
        }
    }
}

#[test]
fn camera_handover_is_continuous() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, -2000.0, 4000.0), (1, 0.0, 2000.0, 4000.0)]);

    let mut last_x = 0.0;
    for i in 1..=100 {
        let t = i * PROCESSOR_TICK_DURATION;
        let x = 0.02 * i as f32;
        let camera_id = if t < 500_000_000 { 0 } else { 1 };
        tracker.queue_packet(
            detection_packet(camera_id, t, vec![ball_detection(x, 0.0)], vec![]),
            t,
        );
        tracker.process(t);

        let world = tracker.world_state(t, 0, true);
        let ball = world.ball.expect("ball lost");
        if i > 1 {
            assert!(
                (ball.p_x - last_x).abs() < 0.05,
                "discontinuity at frame {i}: {} -> {}",
                last_x,
                ball.p_x
            );
        }
        last_x = ball.p_x;

        if i == 51 {
            // hand-over just happened: the clone coexists with the original
            assert!(tracker.ball_hypothesis_count() >= 2);
        }
    }
    // the original hypothesis starved and was pruned
    assert_eq!(tracker.ball_hypothesis_count(), 1);
}

#[test]
fn duplicate_frame_is_dropped() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);

    let t = PROCESSOR_TICK_DURATION;
    let packet = detection_packet(0, t, vec![ball_detection(0.5, 0.5)], vec![]);
    tracker.queue_packet(packet.clone(), t);
    tracker.queue_packet(packet, t);
    tracker.process(t);

    let world = tracker.world_state(t, 0, true);
    let ball = world.ball.expect("no ball tracked");
    assert_eq!(ball.raw.len(), 1, "duplicate frame was not dropped");
}

#[test]
fn replay_after_reset_reproduces_world_states() {
    let frames: Vec<(i64, Vec<u8>)> = (1..=50)
        .map(|i| {
            let t = i * PROCESSOR_TICK_DURATION;
            let x = 0.01 * i as f32;
            (
                t,
                detection_packet(
                    0,
                    t,
                    vec![ball_detection(x, -0.2)],
                    vec![robot_detection(5, -1.0, 0.0, 0.0)],
                ),
            )
        })
        .collect();

    let run = |tracker: &mut Tracker| {
        tracker.queue_packet(geometry_packet(&[(0, 0.0, 0.0, 4000.0)]), 1);
        tracker.process(1);
        let mut states = Vec::new();
        for (t, packet) in &frames {
            tracker.queue_packet(packet.clone(), *t);
            tracker.process(*t);
            states.push(tracker.world_state(*t, 0, true));
        }
        states
    };

    let mut tracker = Tracker::new();
    let first = run(&mut tracker);
    tracker.reset();
    let second = run(&mut tracker);
    assert_eq!(first, second);
}

#[test]
fn robots_need_five_frames_after_the_reset_window() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);

    // well past the 500 ms reset window
    let base = 1_000_000_000;
    for i in 1..=3 {
        let t = base + i * PROCESSOR_TICK_DURATION;
        tracker.queue_packet(
            detection_packet(0, t, vec![], vec![robot_detection(2, 0.0, 0.0, 0.0)]),
            t,
        );
        tracker.process(t);
    }
    let world = tracker.world_state(base + 3 * PROCESSOR_TICK_DURATION, 0, true);
    assert!(world.yellow.is_empty(), "robot emitted with only 3 frames");

    for i in 4..=6 {
        let t = base + i * PROCESSOR_TICK_DURATION;
        tracker.queue_packet(
            detection_packet(0, t, vec![], vec![robot_detection(2, 0.0, 0.0, 0.0)]),
            t,
        );
        tracker.process(t);
    }
    let world = tracker.world_state(base + 6 * PROCESSOR_TICK_DURATION, 0, true);
    assert_eq!(world.yellow.len(), 1);
    assert_eq!(world.yellow[0].id, 2);
}

#[test]
fn dribbling_occlusion_follows_the_robot() {
    // camera at the origin; the robot faces away from it so the ball at its
    // dribbler disappears into the camera shadow
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);

    let robot_pos = (1.0f32, 0.0f32);
    let ball_x = robot_pos.0 + 0.08 + 0.0215;
    let mut t = 0;
    for i in 1..=40 {
        t = i * PROCESSOR_TICK_DURATION;
        tracker.queue_packet(
            detection_packet(
                0,
                t,
                vec![ball_detection(ball_x, 0.0)],
                vec![robot_detection(3, robot_pos.0, robot_pos.1, 0.0)],
            ),
            t,
        );
        tracker.process(t);
        tracker.world_state(t, 0, true);
    }

    // the ball disappears; the robot rotates in place by 90 degrees over
    // the following half second
    let occlusion_start = t;
    let mut ball_positions = Vec::new();
    for i in 1..=50 {
        t = occlusion_start + i * PROCESSOR_TICK_DURATION;
        let phi = FRAC_PI_2 * (i as f32 / 50.0).min(1.0);
        tracker.queue_packet(
            detection_packet(
                0,
                t,
                vec![],
                vec![robot_detection(3, robot_pos.0, robot_pos.1, phi)],
            ),
            t,
        );
        tracker.process(t);
        let world = tracker.world_state(t, 0, true);
        if let Some(ball) = world.ball {
            ball_positions.push((ball.p_x, ball.p_y));
        }
    }

    let last = ball_positions.last().expect("ball dropped during occlusion");
    // after the rotation the dribbler points along +y: the reported ball
    // rotated with the robot
    assert!(
        last.1 > 0.05,
        "ball did not follow the rotation: ({}, {})",
        last.0,
        last.1
    );
    assert!(
        (last.0 - robot_pos.0).abs() < 0.06,
        "ball left the robot: ({}, {})",
        last.0,
        last.1
    );
}

#[test]
fn chip_kick_reconstruction() {
    let mut tracker = tracker_with_cameras(&[(0, 0.0, 0.0, 4000.0)]);
    let camera = nalgebra::Vector3::new(0.0f32, 0.0, 4.0);

    // kicker sitting just behind the launch point
    let kicker = robot_detection(7, -0.1, 0.0, 0.0);
    // a couple of pre-shot frames with the ball at the dribbler
    let mut t = 0;
    for i in 1..=3 {
        t = i * PROCESSOR_TICK_DURATION;
        tracker.queue_packet(
            detection_packet(0, t, vec![ball_detection(-0.02, 0.0)], vec![kicker.clone()]),
            t,
        );
        tracker.process(t);
        tracker.world_state(t, 0, true);
    }

    // chip launch from (0, 0) with 3 m/s ground, 4 m/s vertical
    let launch_time = t;
    let mut was_flying = false;
    let mut touchdown = None;
    for i in 1..=45 {
        t = launch_time + i * PROCESSOR_TICK_DURATION;
        let flight_t = (i - 1) as f32 * 0.01;
        let pos = nalgebra::Vector3::new(
            3.0 * flight_t,
            0.0,
            (4.0 * flight_t - 0.5 * GRAVITY * flight_t * flight_t).max(0.0),
        );
        // what the camera reports: the flight position projected to ground
        let scale = camera.z / (camera.z - pos.z);
        let ground = camera + (pos - camera) * scale;
        tracker.queue_packet(
            detection_packet(
                0,
                t,
                vec![ball_detection(ground.x, ground.y)],
                vec![kicker.clone()],
            ),
            t,
        );
        tracker.process(t);
        let world = tracker.world_state(t, 0, true);
        if tracker.ball_is_flying() {
            was_flying = true;
            touchdown = world.ball.and_then(|ball| ball.touchdown);
        }
    }

    assert!(was_flying, "fly filter never activated");
    let touchdown = touchdown.expect("no touchdown prediction");
    // analytic touchdown: v_ground * 2 v_z / g
    let expected = 3.0 * (2.0 * 4.0 / GRAVITY);
    assert!(
        (touchdown.x - expected).abs() < 0.1,
        "touchdown {} vs {}",
        touchdown.x,
        expected
    );
    assert!(touchdown.y.abs() < 0.1);
}
