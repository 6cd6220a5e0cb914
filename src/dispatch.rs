// Command dispatch: normalization, calibration compensation, routing
//
// Every command flows through here, whether it came from the keyboard,
// from playback or from a calibration probe. The compensated command goes
// to the active execution target; the original goes to the recorder, so a
// replayed log is re-compensated under whatever calibration is current.

use std::time::Instant;

use tracing::debug;

use crate::command::Command;
use crate::hub::HubLink;
use crate::recording::Recorder;
use crate::robot_config::RobotConfig;
use crate::sim::{PhysicsEngine, RobotState};

/// Destination of dispatched commands: the simulator or the hub link
pub enum ExecutionTarget {
    Simulated(PhysicsEngine),
    Hardware(Box<dyn HubLink>),
}

impl ExecutionTarget {
    pub fn is_connected(&self) -> bool {
        match self {
            ExecutionTarget::Simulated(_) => true,
            ExecutionTarget::Hardware(link) => link.is_connected(),
        }
    }

    pub fn send(&mut self, command: &Command) {
        let wire = command.to_wire();
        match self {
            ExecutionTarget::Simulated(sim) => sim.apply(&wire),
            ExecutionTarget::Hardware(link) => link.send_command(&wire),
        }
    }

    /// Advance the simulator by one timestep; no-op for hardware
    pub fn tick(&mut self) {
        if let ExecutionTarget::Simulated(sim) = self {
            sim.tick();
        }
    }

    pub fn state(&self) -> Option<RobotState> {
        match self {
            ExecutionTarget::Simulated(sim) => Some(sim.state()),
            ExecutionTarget::Hardware(_) => None,
        }
    }

    pub fn reset(&mut self) {
        if let ExecutionTarget::Simulated(sim) = self {
            sim.reset();
        }
    }
}

pub struct Dispatcher {
    pub config: RobotConfig,
    pub target: ExecutionTarget,
    pub recorder: Recorder,
}

impl Dispatcher {
    pub fn new(config: RobotConfig, target: ExecutionTarget) -> Self {
        Self { config, target, recorder: Recorder::new() }
    }

    /// Send a command to the active target, recording the original
    pub fn dispatch(&mut self, command: Command, now: Instant) {
        let compensated = compensate(&self.config, &command);
        debug!(?compensated, "dispatch");
        self.target.send(&compensated);
        self.recorder.capture(&command, now);
    }
}

/// Apply calibration correction factors to a drive command.
///
/// Arm and stop commands pass through; everything passes through until a
/// calibration has been accepted.
pub fn compensate(config: &RobotConfig, command: &Command) -> Command {
    if !config.is_calibrated {
        return *command;
    }
    match *command {
        Command::Drive { speed, turn_rate } => {
            let balance =
                (config.left_motor_speed_factor + config.right_motor_speed_factor) / 2.0;
            let corrected_turn = if turn_rate != 0.0 {
                turn_rate * config.turn_accuracy_factor
            } else if speed != 0.0 {
                // Driving straight: counter the built-in drift
                config.straight_drift_correction
            } else {
                turn_rate
            };
            Command::Drive { speed: speed * balance, turn_rate: corrected_turn }
        }
        other => other,
    }
}
