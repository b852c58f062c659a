//! The tagged configuration surface. Every field switches independently;
//! absent fields leave the corresponding subsystem untouched.

use crate::radio::RadioCommand;
use crate::world::TeamRoster;
use crate::message;

message! {
    pub struct TrackingCommand {
        pub aoi_enabled: Option<bool>,
        pub aoi: Option<crate::world::TrackingAoi>,
        /// Assumed delay between field and processing, nanoseconds.
        pub system_delay: Option<i64>,
        pub reset: bool,
    }
}

message! {
    pub struct RefereeControl {
        /// Switch between the network referee and the internal one.
        pub active: Option<bool>,
        /// An encoded referee packet injected into the internal referee.
        pub packet: Option<Vec<u8>>,
        /// Autoref-style remote command, encoded referee packet as well.
        pub autoref_packet: Option<Vec<u8>>,
    }
}

message! {
    pub struct TransceiverCommand {
        pub enable: Option<bool>,
    }
}

message! {
    pub struct SimulatorCommand {
        pub enable: Option<bool>,
    }
}

message! {
    pub struct ControlCommand {
        /// Manual override commands; replaces all previous overrides.
        pub commands: Vec<RadioCommand>,
    }
}

message! {
    /// Top-level command toward the processor.
    pub struct Command {
        pub set_team_blue: Option<TeamRoster>,
        pub set_team_yellow: Option<TeamRoster>,
        pub simulator: Option<SimulatorCommand>,
        pub flip: Option<bool>,
        pub tracking: Option<TrackingCommand>,
        pub referee: Option<RefereeControl>,
        pub control: Option<ControlCommand>,
        pub transceiver: Option<TransceiverCommand>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    #[test]
    fn sparse_command_roundtrip() {
        let command = Command {
            flip: Some(true),
            tracking: Some(TrackingCommand {
                aoi_enabled: Some(true),
                aoi: Some(crate::world::TrackingAoi {
                    x1: -1.0,
                    y1: -1.0,
                    x2: 1.0,
                    y2: 1.0,
                }),
                system_delay: Some(30_000_000),
                reset: false,
            }),
            ..Default::default()
        };
        let decoded = Command::decode_from_slice(&command.encode_to_vec()).unwrap();
        assert_eq!(command, decoded);
        assert!(decoded.set_team_blue.is_none());
    }
}
