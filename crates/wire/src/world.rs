//! Emitted world-state status: the consolidated tracking output plus
//! whatever changed this tick (game state, geometry, timing).

use crate::radio::{RadioCommand, RadioResponse};
use crate::referee::GameState;
use crate::{message, Point};

message! {
    /// Raw ball measurement attached for debugging.
    pub struct BallRaw {
        pub time: i64,
        pub p_x: f32,
        pub p_y: f32,
        pub camera_id: u32,
        pub area: u32,
        /// Vision processing latency of the frame, nanoseconds.
        pub vision_processing_time: i64,
    }
}

message! {
    pub struct WorldBall {
        pub p_x: f32,
        pub p_y: f32,
        pub p_z: f32,
        pub v_x: f32,
        pub v_y: f32,
        pub v_z: f32,
        pub touchdown: Option<Point>,
        pub is_bouncing: bool,
        pub raw: Vec<BallRaw>,
    }
}

message! {
    /// Raw robot measurement with finite-difference speeds against the
    /// previous measurement of the same camera.
    pub struct RobotRaw {
        pub time: i64,
        pub p_x: f32,
        pub p_y: f32,
        pub phi: f32,
        pub camera_id: u32,
        pub v_x: Option<f32>,
        pub v_y: Option<f32>,
        pub omega: Option<f32>,
        pub time_diff_scaled: Option<f32>,
        pub system_delay: Option<f32>,
    }
}

message! {
    pub struct WorldRobot {
        pub id: u32,
        pub p_x: f32,
        pub p_y: f32,
        /// Wrapped into (-pi, pi].
        pub phi: f32,
        pub v_x: f32,
        pub v_y: f32,
        pub omega: f32,
        pub raw: Vec<RobotRaw>,
    }
}

message! {
    pub struct TrackingAoi {
        pub x1: f32,
        pub y1: f32,
        pub x2: f32,
        pub y2: f32,
    }
}

message! {
    pub struct WorldState {
        pub time: i64,
        pub has_vision_data: bool,
        pub is_simulated: bool,
        pub ball: Option<WorldBall>,
        pub yellow: Vec<WorldRobot>,
        pub blue: Vec<WorldRobot>,
        pub radio_responses: Vec<RadioResponse>,
        pub tracking_aoi: Option<TrackingAoi>,
    }
}

message! {
    /// Geometry attached to the status on the tick it changed.
    pub struct WorldGeometry {
        pub field_width: f32,
        pub field_height: f32,
        pub goal_width: f32,
        pub goal_depth: f32,
        pub boundary_width: f32,
        pub line_width: f32,
        pub center_circle_radius: f32,
        pub defense_width: f32,
        pub defense_height: f32,
        pub defense_radius: f32,
        pub is_2014_type: bool,
    }
}

message! {
    pub struct Timing {
        /// Seconds the tracking step took this tick.
        pub tracking: f32,
        /// Seconds the controller step took this tick.
        pub controller: f32,
    }
}

message! {
    pub struct RobotSpec {
        pub generation: u32,
        pub id: u32,
    }
}

message! {
    pub struct TeamRoster {
        pub robots: Vec<RobotSpec>,
    }
}

message! {
    /// One status emission of the processor.
    pub struct Status {
        pub world_state: Option<WorldState>,
        pub game_state: Option<GameState>,
        pub geometry: Option<WorldGeometry>,
        pub radio_commands: Vec<RadioCommand>,
        pub timing: Option<Timing>,
        pub team_yellow: Option<TeamRoster>,
        pub team_blue: Option<TeamRoster>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    #[test]
    fn status_roundtrip() {
        let status = Status {
            world_state: Some(WorldState {
                time: 123_456_789,
                has_vision_data: true,
                is_simulated: false,
                ball: Some(WorldBall {
                    p_x: 1.0,
                    p_y: 2.0,
                    v_x: -0.5,
                    touchdown: Some(Point { x: 3.0, y: 4.0 }),
                    is_bouncing: true,
                    ..Default::default()
                }),
                yellow: vec![WorldRobot {
                    id: 2,
                    p_x: 0.5,
                    phi: -1.0,
                    ..Default::default()
                }],
                blue: vec![],
                radio_responses: vec![],
                tracking_aoi: None,
            }),
            game_state: None,
            geometry: None,
            radio_commands: vec![],
            timing: Some(Timing {
                tracking: 0.001,
                controller: 0.002,
            }),
            team_yellow: None,
            team_blue: None,
        };
        let decoded = Status::decode_from_slice(&status.encode_to_vec()).unwrap();
        assert_eq!(status, decoded);
    }
}
