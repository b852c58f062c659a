//! Radio commands toward the motion controller and telemetry responses
//! coming back.

use crate::{message, message_enum};

message_enum! {
    pub enum KickStyle {
        Linear = 0,
        Chip = 1,
    }
}

message! {
    /// Low-level command for a single robot, local frame (v_s strafe,
    /// v_f forward).
    pub struct RobotCommand {
        pub v_s: f32,
        pub v_f: f32,
        pub omega: f32,
        pub kick_style: Option<KickStyle>,
        pub kick_power: f32,
        pub dribbler: f32,
        pub standby: bool,
        pub strategy_controlled: bool,
        /// Measured local speeds copied from the speed tracker, feedback for
        /// the on-board controller.
        pub cur_v_s: Option<f32>,
        pub cur_v_f: Option<f32>,
        pub cur_omega: Option<f32>,
    }
}

impl RobotCommand {
    /// Standby command: everything off, the robot halts.
    #[must_use]
    pub fn standby() -> Self {
        Self {
            standby: true,
            ..Default::default()
        }
    }
}

message! {
    /// One addressed command of a per-tick radio batch.
    pub struct RadioCommand {
        pub generation: u32,
        pub id: u32,
        pub is_blue: bool,
        pub command: RobotCommand,
    }
}

message! {
    /// Telemetry one robot reports back over radio.
    pub struct RadioResponse {
        pub generation: u32,
        pub id: u32,
        pub is_blue: bool,
        pub battery: f32,
        pub packet_loss_rx: f32,
        pub packet_loss_tx: f32,
        /// Measured local speeds as the motor controller sees them.
        pub v_s: Option<f32>,
        pub v_f: Option<f32>,
        pub omega: Option<f32>,
        pub ball_detected: bool,
    }
}
