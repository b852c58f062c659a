//! Referee packets and the derived game state exposed to downstream
//! consumers.

use crate::{message, message_enum, Decode, Encode, Point};

message_enum! {
    pub enum Command {
        Halt = 0,
        Stop = 1,
        NormalStart = 2,
        ForceStart = 3,
        PrepareKickoffYellow = 4,
        PrepareKickoffBlue = 5,
        PreparePenaltyYellow = 6,
        PreparePenaltyBlue = 7,
        DirectFreeYellow = 8,
        DirectFreeBlue = 9,
        IndirectFreeYellow = 10,
        IndirectFreeBlue = 11,
        TimeoutYellow = 12,
        TimeoutBlue = 13,
        BallPlacementYellow = 16,
        BallPlacementBlue = 17,
    }
}

impl Default for Command {
    fn default() -> Self {
        Self::Halt
    }
}

message_enum! {
    pub enum Stage {
        NormalFirstHalfPre = 0,
        NormalFirstHalf = 1,
        NormalHalfTime = 2,
        NormalSecondHalfPre = 3,
        NormalSecondHalf = 4,
        ExtraTimeBreak = 5,
        ExtraFirstHalfPre = 6,
        ExtraFirstHalf = 7,
        ExtraHalfTime = 8,
        ExtraSecondHalfPre = 9,
        ExtraSecondHalf = 10,
        PenaltyShootoutBreak = 11,
        PenaltyShootout = 12,
        PostGame = 13,
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::NormalFirstHalfPre
    }
}

message! {
    pub struct TeamInfo {
        pub name: String,
        pub score: u32,
        pub red_cards: u32,
        pub yellow_cards: u32,
        /// Remaining time of active yellow cards, microseconds.
        pub yellow_card_times: Vec<u32>,
        pub timeouts: u32,
        /// Remaining timeout budget, microseconds.
        pub timeout_time: u32,
        pub goalkeeper: u32,
    }
}

/// Which team a game event was called against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventTeam {
    #[default]
    Unknown,
    Yellow,
    Blue,
}

impl crate::Encode for EventTeam {
    fn encode(&self, write: &mut impl std::io::Write) -> crate::Result<()> {
        let value: u8 = match self {
            Self::Unknown => 0,
            Self::Yellow => 1,
            Self::Blue => 2,
        };
        value.encode(write)
    }
}

impl crate::Decode for EventTeam {
    fn decode(read: &mut impl std::io::Read) -> crate::Result<Self> {
        match u8::decode(read)? {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Yellow),
            2 => Ok(Self::Blue),
            other => Err(crate::Error::Discriminant(u64::from(other))),
        }
    }
}

/// The subset of the league's game-event union that tracking and strategy
/// consume. Every variant carries the offending team; location is attached
/// where the league reports one.
#[derive(Debug, Clone, PartialEq)]
pub enum GameEvent {
    BallLeftFieldTouchLine { by_team: EventTeam, location: Option<Point> },
    BallLeftFieldGoalLine { by_team: EventTeam, location: Option<Point> },
    AimlessKick { by_team: EventTeam, location: Option<Point> },
    AttackerTooCloseToDefenseArea { by_team: EventTeam, location: Option<Point> },
    DefenderInDefenseArea { by_team: EventTeam, location: Option<Point> },
    BotCrashUnique { by_team: EventTeam, location: Option<Point> },
    BotPushedBot { by_team: EventTeam, location: Option<Point> },
    BotKickedBallTooFast { by_team: EventTeam, location: Option<Point> },
    BotDribbledBallTooFar { by_team: EventTeam, location: Option<Point> },
    PlacementFailed { by_team: EventTeam },
    PlacementSucceeded { by_team: EventTeam },
    Goal { by_team: EventTeam },
    NoProgressInGame { location: Option<Point> },
}

impl GameEvent {
    /// Folds the event union to the offending team, the visitor downstream
    /// consumers use instead of reflecting over the message.
    pub fn by_team(&self) -> EventTeam {
        match self {
            Self::BallLeftFieldTouchLine { by_team, .. }
            | Self::BallLeftFieldGoalLine { by_team, .. }
            | Self::AimlessKick { by_team, .. }
            | Self::AttackerTooCloseToDefenseArea { by_team, .. }
            | Self::DefenderInDefenseArea { by_team, .. }
            | Self::BotCrashUnique { by_team, .. }
            | Self::BotPushedBot { by_team, .. }
            | Self::BotKickedBallTooFast { by_team, .. }
            | Self::BotDribbledBallTooFar { by_team, .. }
            | Self::PlacementFailed { by_team }
            | Self::PlacementSucceeded { by_team }
            | Self::Goal { by_team } => *by_team,
            Self::NoProgressInGame { .. } => EventTeam::Unknown,
        }
    }

    /// Folds the event union to the reported location, when there is one.
    pub fn location(&self) -> Option<Point> {
        match self {
            Self::BallLeftFieldTouchLine { location, .. }
            | Self::BallLeftFieldGoalLine { location, .. }
            | Self::AimlessKick { location, .. }
            | Self::AttackerTooCloseToDefenseArea { location, .. }
            | Self::DefenderInDefenseArea { location, .. }
            | Self::BotCrashUnique { location, .. }
            | Self::BotPushedBot { location, .. }
            | Self::BotKickedBallTooFast { location, .. }
            | Self::BotDribbledBallTooFar { location, .. }
            | Self::NoProgressInGame { location } => location.clone(),
            Self::PlacementFailed { .. } | Self::PlacementSucceeded { .. } | Self::Goal { .. } => {
                None
            }
        }
    }
}

impl crate::Encode for GameEvent {
    fn encode(&self, write: &mut impl std::io::Write) -> crate::Result<()> {
        macro_rules! team_location {
            ($id:literal, $team:expr, $location:expr) => {{
                ($id as u8).encode(write)?;
                $team.encode(write)?;
                $location.encode(write)
            }};
        }
        match self {
            Self::BallLeftFieldTouchLine { by_team, location } => team_location!(0, by_team, location),
            Self::BallLeftFieldGoalLine { by_team, location } => team_location!(1, by_team, location),
            Self::AimlessKick { by_team, location } => team_location!(2, by_team, location),
            Self::AttackerTooCloseToDefenseArea { by_team, location } => team_location!(3, by_team, location),
            Self::DefenderInDefenseArea { by_team, location } => team_location!(4, by_team, location),
            Self::BotCrashUnique { by_team, location } => team_location!(5, by_team, location),
            Self::BotPushedBot { by_team, location } => team_location!(6, by_team, location),
            Self::BotKickedBallTooFast { by_team, location } => team_location!(7, by_team, location),
            Self::BotDribbledBallTooFar { by_team, location } => team_location!(8, by_team, location),
            Self::PlacementFailed { by_team } => {
                9u8.encode(write)?;
                by_team.encode(write)
            }
            Self::PlacementSucceeded { by_team } => {
                10u8.encode(write)?;
                by_team.encode(write)
            }
            Self::Goal { by_team } => {
                11u8.encode(write)?;
                by_team.encode(write)
            }
            Self::NoProgressInGame { location } => {
                12u8.encode(write)?;
                location.encode(write)
            }
        }
    }
}

impl crate::Decode for GameEvent {
    fn decode(read: &mut impl std::io::Read) -> crate::Result<Self> {
        use crate::Decode;
        let id = u8::decode(read)?;
        let event = match id {
            0 => Self::BallLeftFieldTouchLine { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            1 => Self::BallLeftFieldGoalLine { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            2 => Self::AimlessKick { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            3 => Self::AttackerTooCloseToDefenseArea { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            4 => Self::DefenderInDefenseArea { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            5 => Self::BotCrashUnique { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            6 => Self::BotPushedBot { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            7 => Self::BotKickedBallTooFast { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            8 => Self::BotDribbledBallTooFar { by_team: Decode::decode(read)?, location: Decode::decode(read)? },
            9 => Self::PlacementFailed { by_team: Decode::decode(read)? },
            10 => Self::PlacementSucceeded { by_team: Decode::decode(read)? },
            11 => Self::Goal { by_team: Decode::decode(read)? },
            12 => Self::NoProgressInGame { location: Decode::decode(read)? },
            other => return Err(crate::Error::Discriminant(u64::from(other))),
        };
        Ok(event)
    }
}

message! {
    /// One referee packet as the league referee box sends it.
    pub struct RefereePacket {
        /// Wall time on the referee box, microseconds.
        pub packet_timestamp: u64,
        pub stage: Stage,
        /// Microseconds left in the current stage, negative in overtime.
        pub stage_time_left: Option<i64>,
        pub command: Command,
        /// Increments with every new command.
        pub command_counter: u32,
        /// Wall time the current command was issued, microseconds.
        pub command_timestamp: u64,
        pub yellow: TeamInfo,
        pub blue: TeamInfo,
        /// Ball placement target, millimeters in the vision frame.
        pub designated_position: Option<Point>,
        pub blue_team_on_positive_half: Option<bool>,
        pub game_event: Option<GameEvent>,
    }
}

/// The state machine position derived from the referee command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Halt,
    Stop,
    Game,
    GameForce,
    KickoffYellowPrepare,
    KickoffYellow,
    KickoffBluePrepare,
    KickoffBlue,
    PenaltyYellowPrepare,
    PenaltyYellow,
    PenaltyBluePrepare,
    PenaltyBlue,
    DirectYellow,
    DirectBlue,
    IndirectYellow,
    IndirectBlue,
    BallPlacementYellow,
    BallPlacementBlue,
    TimeoutYellow,
    TimeoutBlue,
}

impl crate::Encode for State {
    fn encode(&self, write: &mut impl std::io::Write) -> crate::Result<()> {
        (*self as u8).encode(write)
    }
}

impl crate::Decode for State {
    fn decode(read: &mut impl std::io::Read) -> crate::Result<Self> {
        const STATES: [State; 20] = [
            State::Halt,
            State::Stop,
            State::Game,
            State::GameForce,
            State::KickoffYellowPrepare,
            State::KickoffYellow,
            State::KickoffBluePrepare,
            State::KickoffBlue,
            State::PenaltyYellowPrepare,
            State::PenaltyYellow,
            State::PenaltyBluePrepare,
            State::PenaltyBlue,
            State::DirectYellow,
            State::DirectBlue,
            State::IndirectYellow,
            State::IndirectBlue,
            State::BallPlacementYellow,
            State::BallPlacementBlue,
            State::TimeoutYellow,
            State::TimeoutBlue,
        ];
        let value = u8::decode(read)?;
        STATES
            .get(value as usize)
            .copied()
            .ok_or(crate::Error::Discriminant(u64::from(value)))
    }
}

message! {
    /// Game state attached to the emitted world status.
    pub struct GameState {
        pub stage: Stage,
        pub stage_time_left: Option<i64>,
        pub state: State,
        pub yellow: TeamInfo,
        pub blue: TeamInfo,
        /// Ball placement target, meters in the internal frame.
        pub designated_position: Option<Point>,
        pub game_event: Option<GameEvent>,
    }
}
