//! Referee packet folding: turns the league's command stream into the game
//! state attached to every world status.

use nalgebra::Vector2;
use wire::referee::{Command, GameEvent, GameState, RefereePacket, State};
use wire::{Decode, Point};

/// A free kick or kickoff turns into regular play once the ball moved this
/// far from where it was released.
const BALL_MOVE_DISTANCE: f32 = 0.05;

pub struct Referee {
    game_state: GameState,
    counter: u32,
    flipped: bool,
    /// Ball position when the current restart state was entered.
    restart_ball_pos: Option<Vector2<f32>>,
    /// Whether this instance is driven by injected packets instead of the
    /// network referee.
    internal: bool,
}

impl Referee {
    pub fn new(internal: bool) -> Self {
        Self {
            game_state: GameState::default(),
            counter: 0,
            flipped: false,
            restart_ball_pos: None,
            internal,
        }
    }

    pub fn game_state(&self) -> &GameState {
        &self.game_state
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn flipped(&self) -> bool {
        self.flipped
    }

    pub fn is_game_running(&self) -> bool {
        !matches!(self.game_state.state, State::Halt | State::Stop)
    }

    /// Consumes one encoded referee packet. A packet repeating the current
    /// command counter only refreshes team info and stage timing.
    pub fn handle_packet(&mut self, data: &[u8]) {
        let packet = match RefereePacket::decode_from_slice(data) {
            Ok(packet) => packet,
            Err(error) => {
                tracing::debug!(%error, "dropping malformed referee packet");
                return;
            }
        };

        self.game_state.stage = packet.stage;
        self.game_state.stage_time_left = packet.stage_time_left;
        self.game_state.yellow = packet.yellow.clone();
        self.game_state.blue = packet.blue.clone();

        if let Some(blue_on_positive) = packet.blue_team_on_positive_half {
            self.flipped = blue_on_positive;
        }

        if packet.command_counter != self.counter {
            self.counter = packet.command_counter;
            let next = process_command(packet.command, self.game_state.state);
            if next != self.game_state.state {
                self.restart_ball_pos = None;
            }
            self.game_state.state = next;
        }

        self.game_state.designated_position = packet
            .designated_position
            .map(|pos| convert_designated_position(&pos));
        self.game_state.game_event = packet.game_event;
    }

    /// Tracks the ball to advance restart states into regular play.
    pub fn process(&mut self, world: &wire::world::WorldState) {
        let in_restart = matches!(
            self.game_state.state,
            State::KickoffYellow
                | State::KickoffBlue
                | State::DirectYellow
                | State::DirectBlue
                | State::IndirectYellow
                | State::IndirectBlue
                | State::PenaltyYellow
                | State::PenaltyBlue
        );
        if !in_restart {
            self.restart_ball_pos = None;
            return;
        }
        let Some(ball) = &world.ball else {
            return;
        };
        let ball_pos = Vector2::new(ball.p_x, ball.p_y);
        match self.restart_ball_pos {
            None => self.restart_ball_pos = Some(ball_pos),
            Some(start) => {
                if (ball_pos - start).norm() > BALL_MOVE_DISTANCE {
                    self.game_state.state = State::Game;
                    self.restart_ball_pos = None;
                }
            }
        }
    }

    /// Placement position for a foul. Events that do not carry a location
    /// have no position; callers must handle the absence.
    pub fn ball_placement_pos_for_foul(event: &GameEvent) -> Option<Point> {
        event.location()
    }
}

/// Referee positions are reported in vision coordinates (millimeters).
fn convert_designated_position(pos: &Point) -> Point {
    Point {
        x: -pos.y / 1000.0,
        y: pos.x / 1000.0,
    }
}

fn process_command(command: Command, current: State) -> State {
    match command {
        Command::Halt => State::Halt,
        Command::Stop => State::Stop,
        Command::ForceStart => State::GameForce,
        Command::NormalStart => match current {
            State::KickoffYellowPrepare => State::KickoffYellow,
            State::KickoffBluePrepare => State::KickoffBlue,
            State::PenaltyYellowPrepare => State::PenaltyYellow,
            State::PenaltyBluePrepare => State::PenaltyBlue,
            other => other,
        },
        Command::PrepareKickoffYellow => State::KickoffYellowPrepare,
        Command::PrepareKickoffBlue => State::KickoffBluePrepare,
        Command::PreparePenaltyYellow => State::PenaltyYellowPrepare,
        Command::PreparePenaltyBlue => State::PenaltyBluePrepare,
        Command::DirectFreeYellow => State::DirectYellow,
        Command::DirectFreeBlue => State::DirectBlue,
        Command::IndirectFreeYellow => State::IndirectYellow,
        Command::IndirectFreeBlue => State::IndirectBlue,
        Command::TimeoutYellow => State::TimeoutYellow,
        Command::TimeoutBlue => State::TimeoutBlue,
        Command::BallPlacementYellow => State::BallPlacementYellow,
        Command::BallPlacementBlue => State::BallPlacementBlue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wire::referee::{EventTeam, Stage, TeamInfo};
    use wire::world::{WorldBall, WorldState};
    use wire::Encode;

    fn packet(command: Command, counter: u32) -> RefereePacket {
        RefereePacket {
            packet_timestamp: 0,
            stage: Stage::NormalFirstHalf,
            stage_time_left: Some(120_000_000),
            command,
            command_counter: counter,
            command_timestamp: 0,
            yellow: TeamInfo {
                name: "yellow".into(),
                ..Default::default()
            },
            blue: TeamInfo::default(),
            designated_position: None,
            blue_team_on_positive_half: None,
            game_event: None,
        }
    }

    fn world_with_ball(x: f32, y: f32) -> WorldState {
        WorldState {
            ball: Some(WorldBall {
                p_x: x,
                p_y: y,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn command_stream_drives_the_state_machine() {
        let mut referee = Referee::new(false);
        assert_eq!(referee.game_state().state, State::Halt);

        referee.handle_packet(&packet(Command::Stop, 1).encode_to_vec());
        assert_eq!(referee.game_state().state, State::Stop);

        referee.handle_packet(&packet(Command::PrepareKickoffBlue, 2).encode_to_vec());
        assert_eq!(referee.game_state().state, State::KickoffBluePrepare);

        referee.handle_packet(&packet(Command::NormalStart, 3).encode_to_vec());
        assert_eq!(referee.game_state().state, State::KickoffBlue);
        assert!(referee.is_game_running());
    }

    #[test]
    fn repeated_counter_only_updates_team_info() {
        let mut referee = Referee::new(false);
        referee.handle_packet(&packet(Command::Stop, 1).encode_to_vec());

        let mut repeat = packet(Command::PrepareKickoffBlue, 1);
        repeat.yellow.score = 2;
        referee.handle_packet(&repeat.encode_to_vec());

        // command ignored, team info applied
        assert_eq!(referee.game_state().state, State::Stop);
        assert_eq!(referee.game_state().yellow.score, 2);
    }

    #[test]
    fn free_kick_advances_once_the_ball_moves() {
        let mut referee = Referee::new(false);
        referee.handle_packet(&packet(Command::DirectFreeYellow, 1).encode_to_vec());
        assert_eq!(referee.game_state().state, State::DirectYellow);

        referee.process(&world_with_ball(1.0, 0.0));
        referee.process(&world_with_ball(1.02, 0.0));
        assert_eq!(referee.game_state().state, State::DirectYellow);

        referee.process(&world_with_ball(1.10, 0.0));
        assert_eq!(referee.game_state().state, State::Game);
    }

    #[test]
    fn malformed_packets_are_dropped() {
        let mut referee = Referee::new(false);
        referee.handle_packet(&[0xff, 0xff, 0x01]);
        assert_eq!(referee.game_state().state, State::Halt);
    }

    #[test]
    fn designated_position_is_converted() {
        let mut referee = Referee::new(false);
        let mut p = packet(Command::BallPlacementYellow, 1);
        p.designated_position = Some(Point { x: 1000.0, y: -2000.0 });
        referee.handle_packet(&p.encode_to_vec());
        let converted = referee.game_state().designated_position.clone().unwrap();
        assert!((converted.x - 2.0).abs() < 1e-6);
        assert!((converted.y - 1.0).abs() < 1e-6);
    }

    #[test]
    fn foul_without_location_has_no_placement_position() {
        let goal = GameEvent::Goal {
            by_team: EventTeam::Blue,
        };
        assert!(Referee::ball_placement_pos_for_foul(&goal).is_none());

        let kick = GameEvent::AimlessKick {
            by_team: EventTeam::Yellow,
            location: Some(Point { x: 0.5, y: 0.5 }),
        };
        assert!(Referee::ball_placement_pos_for_foul(&kick).is_some());
    }
}
