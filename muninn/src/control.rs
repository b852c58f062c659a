//! Per-robot command evaluation: feedforward from the strategy's desired
//! trajectory point plus proportional feedback against the predicted world
//! robot, rotated into the robot-local frame.

use std::f32::consts::FRAC_PI_2;

use nalgebra::Vector2;
use tracking::wrap_angle;
use wire::radio::RobotCommand;
use wire::world::WorldRobot;

use crate::config::ControllerConfig;

const TICK_SECONDS: f32 = 0.01;
const MAX_LINEAR_ACCELERATION: f32 = 10.0;
const MAX_ROTATION_ACCELERATION: f32 = 60.0;

/// Inputs older than this no longer drive the robot; it halts instead of
/// chasing a stale target.
const INPUT_TIMEOUT: i64 = 500_000_000;

/// Desired state at the evaluation horizon, world frame.
#[derive(Debug, Clone, Copy)]
pub struct ControllerInput {
    pub desired_pos: Vector2<f32>,
    pub desired_velocity: Vector2<f32>,
    pub desired_phi: f32,
    pub desired_omega: f32,
}

/// Controller memory of one robot. Deterministic: the output depends only
/// on the stored input, the previous command and the arguments.
pub struct CommandEvaluator {
    config: ControllerConfig,
    input: Option<ControllerInput>,
    input_time: i64,
    last_command: RobotCommand,
}

impl CommandEvaluator {
    pub fn new(config: ControllerConfig) -> Self {
        Self {
            config,
            input: None,
            input_time: 0,
            last_command: RobotCommand::default(),
        }
    }

    pub fn set_input(&mut self, input: ControllerInput, time: i64) {
        self.input = Some(input);
        self.input_time = time;
    }

    /// Drops the stored input and the acceleration reference; the robot
    /// halts on the next evaluation.
    pub fn clear_input(&mut self) {
        self.input = None;
        self.last_command = RobotCommand::default();
    }

    /// Fills the velocity fields of `command` for the robot state predicted
    /// at `time`. Manual commands pass through untouched; standby and
    /// missing state halt the robot.
    pub fn calculate_command(
        &mut self,
        robot: Option<&WorldRobot>,
        time: i64,
        command: &mut RobotCommand,
    ) {
        if command.standby || !command.strategy_controlled {
            self.last_command = command.clone();
            return;
        }

        if self.input.is_some() && time - self.input_time > INPUT_TIMEOUT {
            self.input = None;
        }
        let (Some(robot), Some(input)) = (robot, self.input) else {
            // no tracked robot or no usable strategy input: halt instead of
            // acting on stale data
            command.v_s = 0.0;
            command.v_f = 0.0;
            command.omega = 0.0;
            self.last_command = command.clone();
            return;
        };

        let robot_pos = Vector2::new(robot.p_x, robot.p_y);
        let robot_vel = Vector2::new(robot.v_x, robot.v_y);

        let position_error = input.desired_pos - robot_pos;
        let velocity_error = input.desired_velocity - robot_vel;
        let global = input.desired_velocity
            + position_error * self.config.position_gain
            + velocity_error * self.config.velocity_gain;

        // rotate into the robot-local frame (v_s strafe, v_f forward)
        let theta = robot.phi - FRAC_PI_2;
        let v_s = theta.cos() * global.x + theta.sin() * global.y;
        let v_f = -theta.sin() * global.x + theta.cos() * global.y;
        let omega = input.desired_omega
            + wrap_angle(input.desired_phi - robot.phi) * self.config.heading_gain;

        // respect the same acceleration limits the tracking prediction
        // assumes
        let max_dv = MAX_LINEAR_ACCELERATION * TICK_SECONDS;
        let max_domega = MAX_ROTATION_ACCELERATION * TICK_SECONDS;
        command.v_s = clamp_step(self.last_command.v_s, v_s, max_dv);
        command.v_f = clamp_step(self.last_command.v_f, v_f, max_dv);
        command.omega = clamp_step(self.last_command.omega, omega, max_domega);

        self.last_command = command.clone();
    }
}

fn clamp_step(previous: f32, desired: f32, max_step: f32) -> f32 {
    previous + (desired - previous).clamp(-max_step, max_step)
}
