//! Fixed-frequency processing: tracking, referee merging, per-robot
//! command evaluation and radio dispatch, in a rigid order at 100 Hz.
//!
//! The processor owns all mutable state and runs on a dedicated thread.
//! Inputs arrive over channels and are drained at the tick boundary; no
//! step blocks on I/O.

use std::f32::consts::FRAC_PI_2;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clock::Clock;
use futures::channel::mpsc;
use tracking::{SpeedTracker, Tracker};
use wire::command::Command;
use wire::radio::{RadioCommand, RadioResponse, RobotCommand};
use wire::world::{RobotSpec, Status, TeamRoster, Timing, WorldRobot, WorldState};

use crate::config::ControllerConfig;
use crate::control::{CommandEvaluator, ControllerInput};
use crate::referee::Referee;

pub const FREQUENCY: u32 = 100;
pub const TICK_DURATION: i64 = 1_000_000_000 / FREQUENCY as i64;

/// Strategy input for one robot. `None` means the strategy handed over an
/// uninitialized command; the robot halts.
pub struct StrategyCommand {
    pub is_blue: bool,
    pub generation: u32,
    pub id: u32,
    pub command: Option<(RobotCommand, Option<ControllerInput>)>,
}

pub struct ProcessorChannels {
    pub vision_rx: mpsc::UnboundedReceiver<(Vec<u8>, i64)>,
    pub referee_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pub command_rx: mpsc::UnboundedReceiver<Command>,
    pub strategy_rx: mpsc::UnboundedReceiver<StrategyCommand>,
    pub radio_response_rx: mpsc::UnboundedReceiver<Vec<RadioResponse>>,

    pub status_tx: mpsc::UnboundedSender<Status>,
    pub strategy_status_tx: mpsc::UnboundedSender<Status>,
    pub radio_tx: mpsc::UnboundedSender<(Vec<RadioCommand>, i64)>,
}

struct Robot {
    generation: u32,
    id: u32,
    controller: CommandEvaluator,
    strategy_command: Option<RobotCommand>,
    manual_command: Option<RobotCommand>,
}

impl Robot {
    fn new(spec: &RobotSpec, config: ControllerConfig) -> Self {
        Self {
            generation: spec.generation,
            id: spec.id,
            controller: CommandEvaluator::new(config),
            strategy_command: None,
            manual_command: None,
        }
    }

    /// Manual override beats the strategy command beats standby.
    fn merge_into_command(&self) -> RobotCommand {
        if let Some(manual) = &self.manual_command {
            if !manual.strategy_controlled {
                let mut command = manual.clone();
                command.strategy_controlled = false;
                return command;
            }
        }
        if let Some(strategy) = &self.strategy_command {
            let mut command = strategy.clone();
            command.strategy_controlled = true;
            return command;
        }
        RobotCommand::standby()
    }
}

#[derive(Default)]
struct Team {
    roster: TeamRoster,
    robots: Vec<Robot>,
}

pub struct Processor {
    clock: Arc<Clock>,
    channels: ProcessorChannels,

    tracker: Tracker,
    speed_tracker: SpeedTracker,
    referee: Referee,
    referee_internal: Referee,
    referee_internal_active: bool,

    blue_team: Team,
    yellow_team: Team,
    responses: Vec<RadioResponse>,

    simulator_enabled: bool,
    transceiver_enabled: bool,
    controller_config: ControllerConfig,
    stopped: bool,
}

impl Processor {
    pub fn new(
        clock: Arc<Clock>,
        channels: ProcessorChannels,
        controller_config: ControllerConfig,
    ) -> Self {
        Self {
            clock,
            channels,
            tracker: Tracker::new(),
            speed_tracker: SpeedTracker::new(),
            referee: Referee::new(false),
            referee_internal: Referee::new(true),
            referee_internal_active: false,
            blue_team: Team::default(),
            yellow_team: Team::default(),
            responses: Vec::new(),
            simulator_enabled: false,
            transceiver_enabled: false,
            controller_config,
            stopped: false,
        }
    }

    /// Periodic loop pegged to the virtual clock. Returns when every
    /// command sender is gone; the final tick completes its emissions
    /// first.
    pub fn run(&mut self) {
        let mut next_tick = Instant::now();
        while !self.stopped {
            match self.clock.tick_interval(1000 / FREQUENCY as u64) {
                Some(interval) => {
                    next_tick += interval;
                    let now = Instant::now();
                    if next_tick > now {
                        std::thread::sleep(next_tick - now);
                    } else {
                        // fell behind, re-anchor instead of bursting
                        next_tick = now;
                    }
                    self.tick();
                }
                None => {
                    // paused; wake up occasionally to notice scaling changes
                    std::thread::sleep(Duration::from_millis(10));
                    next_tick = Instant::now();
                    self.drain_commands();
                }
            }
        }
    }

    fn drain_inputs(&mut self) {
        while let Ok(Some((packet, receive_time))) = self.channels.vision_rx.try_next() {
            self.tracker.queue_packet(packet.clone(), receive_time);
            self.speed_tracker.queue_packet(packet, receive_time);
        }
        while let Ok(Some(packet)) = self.channels.referee_rx.try_next() {
            self.referee.handle_packet(&packet);
        }
        while let Ok(Some(responses)) = self.channels.radio_response_rx.try_next() {
            // responses may arrive in several chunks between two ticks
            self.responses.extend(responses);
        }
        while let Ok(Some(command)) = self.channels.strategy_rx.try_next() {
            self.handle_strategy_command(command);
        }
        self.drain_commands();
    }

    fn drain_commands(&mut self) {
        loop {
            match self.channels.command_rx.try_next() {
                Ok(Some(command)) => self.handle_command(&command),
                Ok(None) => {
                    // all command senders dropped: shut down
                    self.stopped = true;
                    break;
                }
                Err(_) => break,
            }
        }
    }

    /// One full processing step; the order is rigid.
    pub fn tick(&mut self) {
        let tracker_start = clock::system_time();
        let current_time = self.clock.now();

        self.drain_inputs();

        // 1. tracking
        self.tracker.process(current_time);
        self.speed_tracker.process(current_time);
        let mut world = self
            .tracker
            .world_state(current_time, clock::system_time(), true);
        let radio_world = self.speed_tracker.world_state(current_time, clock::system_time());
        world.is_simulated = self.simulator_enabled;

        // 2. referee overlay
        let referee = if self.referee_internal_active {
            &mut self.referee_internal
        } else {
            &mut self.referee
        };
        referee.process(&world);
        let game_state = referee.game_state().clone();

        // 3. extra data
        world.radio_responses = self.responses.clone();

        let status = Status {
            world_state: Some(world.clone()),
            game_state: Some(game_state.clone()),
            geometry: self.tracker.geometry_update(),
            ..Default::default()
        };
        let _ = self.channels.status_tx.unbounded_send(status);

        // 4. controller evaluation one tick ahead
        let controller_start = clock::system_time();
        let controller_time = current_time + TICK_DURATION;
        let mut radio_commands = Vec::new();
        Self::process_team(
            &mut self.blue_team,
            true,
            &world.blue,
            &radio_world.blue,
            controller_time,
            &mut radio_commands,
        );
        Self::process_team(
            &mut self.yellow_team,
            false,
            &world.yellow,
            &radio_world.yellow,
            controller_time,
            &mut radio_commands,
        );

        if self.transceiver_enabled {
            // active starting from now; input for the next tick's prediction
            self.tracker
                .queue_radio_commands(&radio_commands, current_time + 1);
            self.speed_tracker
                .queue_radio_commands(&radio_commands, current_time + 1);
        }

        // 5. predicted world for the strategy's next iteration
        let mut strategy_world = self
            .tracker
            .world_state(controller_time, clock::system_time(), false);
        strategy_world.is_simulated = self.simulator_enabled;
        strategy_world.radio_responses = std::mem::take(&mut self.responses);
        let strategy_status = Status {
            world_state: Some(strategy_world),
            game_state: Some(game_state),
            ..Default::default()
        };
        let _ = self.channels.strategy_status_tx.unbounded_send(strategy_status);

        // 6. timing debug
        let controller_end = clock::system_time();
        let timing_status = Status {
            timing: Some(Timing {
                tracking: (controller_start - tracker_start) as f32 * 1e-9,
                controller: (controller_end - controller_start) as f32 * 1e-9,
            }),
            ..Default::default()
        };
        let _ = self.channels.status_tx.unbounded_send(timing_status);

        if self.transceiver_enabled {
            let processing_delay = self.clock.now() - current_time;
            let _ = self
                .channels
                .radio_tx
                .unbounded_send((radio_commands, processing_delay));
        }
    }

    fn process_team(
        team: &mut Team,
        is_blue: bool,
        robots: &[WorldRobot],
        radio_robots: &[WorldRobot],
        time: i64,
        radio_commands: &mut Vec<RadioCommand>,
    ) {
        for robot in &mut team.robots {
            let mut command = robot.merge_into_command();
            let world_robot = robots.iter().find(|r| r.id == robot.id);
            robot
                .controller
                .calculate_command(world_robot, time, &mut command);

            // measured local speed feedback for the on-board controller
            if let Some(radio_robot) = radio_robots.iter().find(|r| r.id == robot.id) {
                let theta = radio_robot.phi - FRAC_PI_2;
                command.cur_v_s = Some(theta.cos() * radio_robot.v_x + theta.sin() * radio_robot.v_y);
                command.cur_v_f =
                    Some(-theta.sin() * radio_robot.v_x + theta.cos() * radio_robot.v_y);
                command.cur_omega = Some(radio_robot.omega);
            }

            radio_commands.push(RadioCommand {
                generation: robot.generation,
                id: robot.id,
                is_blue,
                command,
            });
        }
    }

    pub fn handle_command(&mut self, command: &Command) {
        let mut teams_changed = false;

        if let Some(roster) = &command.set_team_blue {
            self.set_team(roster.clone(), true);
            teams_changed = true;
        }
        if let Some(roster) = &command.set_team_yellow {
            self.set_team(roster.clone(), false);
            teams_changed = true;
        }

        if let Some(simulator) = &command.simulator {
            if let Some(enable) = simulator.enable {
                self.tracker.reset();
                self.speed_tracker.reset();
                self.simulator_enabled = enable;
            }
        }

        if teams_changed {
            self.tracker.reset();
            self.speed_tracker.reset();
            self.send_teams();
        }

        if let Some(flip) = command.flip {
            self.tracker.set_flip(flip);
            self.speed_tracker.set_flip(flip);
        }

        if let Some(referee) = &command.referee {
            if let Some(active) = referee.active {
                self.referee_internal_active = active;
            }
            if let Some(packet) = &referee.packet {
                self.referee_internal.handle_packet(packet);
            }
            if let Some(packet) = &referee.autoref_packet {
                self.referee_internal.handle_packet(packet);
            }
        }

        if let Some(control) = &command.control {
            self.handle_control(true, &control.commands);
            self.handle_control(false, &control.commands);
        }

        if let Some(tracking) = &command.tracking {
            self.tracker.handle_command(tracking);
            self.speed_tracker.handle_command(tracking);
        }

        if let Some(transceiver) = &command.transceiver {
            if let Some(enable) = transceiver.enable {
                self.transceiver_enabled = enable;
            }
        }
    }

    fn handle_control(&mut self, is_blue: bool, commands: &[RadioCommand]) {
        let team = if is_blue {
            &mut self.blue_team
        } else {
            &mut self.yellow_team
        };
        // a control message replaces all previous overrides
        for robot in &mut team.robots {
            robot.manual_command = None;
        }
        for command in commands {
            if command.is_blue != is_blue {
                continue;
            }
            if let Some(robot) = team
                .robots
                .iter_mut()
                .find(|robot| robot.generation == command.generation && robot.id == command.id)
            {
                robot.manual_command = Some(command.command.clone());
            }
        }
    }

    fn handle_strategy_command(&mut self, command: StrategyCommand) {
        let team = if command.is_blue {
            &mut self.blue_team
        } else {
            &mut self.yellow_team
        };
        let Some(robot) = team
            .robots
            .iter_mut()
            .find(|robot| robot.generation == command.generation && robot.id == command.id)
        else {
            // unknown id: silently ignored
            return;
        };

        match command.command {
            Some((robot_command, input)) => {
                robot.strategy_command = Some(robot_command);
                if let Some(input) = input {
                    robot.controller.set_input(input, self.clock.now());
                }
            }
            None => {
                // uninitialized strategy command: halt, do not crash
                robot.strategy_command = None;
                robot.controller.clear_input();
            }
        }
    }

    fn set_team(&mut self, roster: TeamRoster, is_blue: bool) {
        let team = if is_blue {
            &mut self.blue_team
        } else {
            &mut self.yellow_team
        };
        team.robots = roster
            .robots
            .iter()
            .map(|spec| Robot::new(spec, self.controller_config.clone()))
            .collect();
        team.roster = roster;
    }

    fn send_teams(&mut self) {
        let status = Status {
            team_blue: Some(self.blue_team.roster.clone()),
            team_yellow: Some(self.yellow_team.roster.clone()),
            ..Default::default()
        };
        let _ = self.channels.status_tx.unbounded_send(status);
    }

    /// The most recent world snapshot, mainly for tests and tools.
    pub fn world_snapshot(&mut self) -> WorldState {
        let now = self.clock.now();
        self.tracker.world_state(now, clock::system_time(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::command::{SimulatorCommand, TransceiverCommand};
    use wire::vision::{DetectionBall, DetectionFrame, VisionWrapper};
    use wire::Encode;

    struct Harness {
        processor: Processor,
        vision_tx: mpsc::UnboundedSender<(Vec<u8>, i64)>,
        command_tx: mpsc::UnboundedSender<Command>,
        status_rx: mpsc::UnboundedReceiver<Status>,
        strategy_status_rx: mpsc::UnboundedReceiver<Status>,
        radio_rx: mpsc::UnboundedReceiver<(Vec<RadioCommand>, i64)>,
    }

    fn harness() -> Harness {
        let (vision_tx, vision_rx) = mpsc::unbounded();
        let (_referee_tx, referee_rx) = mpsc::unbounded();
        let (command_tx, command_rx) = mpsc::unbounded();
        let (_strategy_tx, strategy_rx) = mpsc::unbounded();
        let (_response_tx, radio_response_rx) = mpsc::unbounded();
        let (status_tx, status_rx) = mpsc::unbounded();
        let (strategy_status_tx, strategy_status_rx) = mpsc::unbounded();
        let (radio_tx, radio_rx) = mpsc::unbounded();

        let channels = ProcessorChannels {
            vision_rx,
            referee_rx,
            command_rx,
            strategy_rx,
            radio_response_rx,
            status_tx,
            strategy_status_tx,
            radio_tx,
        };
        let processor = Processor::new(
            Arc::new(Clock::new()),
            channels,
            ControllerConfig::default(),
        );
        Harness {
            processor,
            vision_tx,
            command_tx,
            status_rx,
            strategy_status_rx,
            radio_rx,
        }
    }

    fn drain_world_states(rx: &mut mpsc::UnboundedReceiver<Status>) -> Vec<WorldState> {
        let mut result = Vec::new();
        while let Ok(Some(status)) = rx.try_next() {
            if let Some(world) = status.world_state {
                result.push(world);
            }
        }
        result
    }

    #[test]
    fn emits_monotone_world_states() {
        let mut h = harness();
        for _ in 0..5 {
            h.processor.tick();
        }
        let worlds = drain_world_states(&mut h.status_rx);
        assert_eq!(worlds.len(), 5);
        for pair in worlds.windows(2) {
            assert!(pair[1].time >= pair[0].time);
        }
    }

    #[test]
    fn strategy_status_is_one_tick_ahead() {
        let mut h = harness();
        h.processor.tick();
        let current = drain_world_states(&mut h.status_rx);
        let predicted = drain_world_states(&mut h.strategy_status_rx);
        assert_eq!(predicted[0].time, current[0].time + TICK_DURATION);
    }

    #[test]
    fn radio_commands_only_flow_with_the_transceiver_enabled() {
        let mut h = harness();
        h.command_tx
            .unbounded_send(Command {
                set_team_yellow: Some(TeamRoster {
                    robots: vec![RobotSpec { generation: 1, id: 4 }],
                }),
                ..Default::default()
            })
            .unwrap();
        h.processor.tick();
        assert!(h.radio_rx.try_next().is_err(), "radio sent while disabled");

        h.command_tx
            .unbounded_send(Command {
                transceiver: Some(TransceiverCommand { enable: Some(true) }),
                ..Default::default()
            })
            .unwrap();
        h.processor.tick();
        let (commands, delay) = h.radio_rx.try_next().unwrap().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id, 4);
        assert!(!commands[0].is_blue);
        // no strategy input: the robot is on standby
        assert!(commands[0].command.standby);
        assert!(delay >= 0);
    }

    #[test]
    fn simulator_toggle_resets_tracking(){
        let mut h = harness();
        // track a ball, then flip the simulator switch
        let time = h.processor.clock.now();
        let packet = VisionWrapper {
            detection: Some(DetectionFrame {
                frame_number: 0,
                t_capture: time as f64 * 1e-9,
                t_sent: time as f64 * 1e-9,
                camera_id: 0,
                balls: vec![DetectionBall {
                    confidence: 1.0,
                    area: 100,
                    x: 500.0,
                    y: 500.0,
                    pixel_x: 0.0,
                    pixel_y: 0.0,
                }],
                robots_yellow: vec![],
                robots_blue: vec![],
            }),
            geometry: None,
        }
        .encode_to_vec();
        h.vision_tx.unbounded_send((packet, time)).unwrap();
        h.processor.tick();

        h.command_tx
            .unbounded_send(Command {
                simulator: Some(SimulatorCommand { enable: Some(true) }),
                ..Default::default()
            })
            .unwrap();
        h.processor.tick();
        let worlds = drain_world_states(&mut h.status_rx);
        let last = worlds.last().unwrap();
        assert!(last.is_simulated);
        // tracking state was discarded with the toggle
        assert!(!last.has_vision_data);
    }
}
