// Command types shared by the dispatcher, the hub link and the simulator

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which arm motor a command addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmId {
    Arm1,
    Arm2,
}

/// Canonical operator intent, produced by key input or playback
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Drive { speed: f64, turn_rate: f64 },
    Arm { arm: ArmId, speed: f64 },
    Stop,
}

/// Wire schema consumed by the hub link and the simulator alike:
/// `{"type": "drive"|"arm1"|"arm2", "speed": .., "turn_rate": ..}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireCommand {
    Drive { speed: f64, turn_rate: f64 },
    Arm1 { speed: f64 },
    Arm2 { speed: f64 },
}

impl Command {
    /// Encode for the wire. `Stop` is a zero-velocity drive command.
    pub fn to_wire(&self) -> WireCommand {
        match *self {
            Command::Drive { speed, turn_rate } => WireCommand::Drive { speed, turn_rate },
            Command::Arm { arm: ArmId::Arm1, speed } => WireCommand::Arm1 { speed },
            Command::Arm { arm: ArmId::Arm2, speed } => WireCommand::Arm2 { speed },
            Command::Stop => WireCommand::Drive { speed: 0.0, turn_rate: 0.0 },
        }
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Command::Drive { .. } | Command::Stop => "drive",
            Command::Arm { arm: ArmId::Arm1, .. } => "arm1",
            Command::Arm { arm: ArmId::Arm2, .. } => "arm2",
        }
    }

    fn parameters(&self) -> Map<String, Value> {
        let mut params = Map::new();
        match self.to_wire() {
            WireCommand::Drive { speed, turn_rate } => {
                params.insert("speed".into(), speed.into());
                params.insert("turn_rate".into(), turn_rate.into());
            }
            WireCommand::Arm1 { speed } | WireCommand::Arm2 { speed } => {
                params.insert("speed".into(), speed.into());
            }
        }
        params
    }
}

/// One entry of a recorded run. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedCommand {
    pub timestamp: f64,
    pub command_type: String,
    pub parameters: Map<String, Value>,
}

impl RecordedCommand {
    pub fn new(timestamp: f64, command: &Command) -> Self {
        Self {
            timestamp,
            command_type: command.type_tag().to_string(),
            parameters: command.parameters(),
        }
    }

    /// Rebuild the canonical command for playback. Unknown tags are dropped
    /// by the caller with a warning rather than failing the whole run.
    pub fn to_command(&self) -> Option<Command> {
        let num = |key: &str| self.parameters.get(key).and_then(Value::as_f64).unwrap_or(0.0);
        match self.command_type.as_str() {
            "drive" => Some(Command::Drive { speed: num("speed"), turn_rate: num("turn_rate") }),
            "arm1" => Some(Command::Arm { arm: ArmId::Arm1, speed: num("speed") }),
            "arm2" => Some(Command::Arm { arm: ArmId::Arm2, speed: num("speed") }),
            _ => None,
        }
    }
}
